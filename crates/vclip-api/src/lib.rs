//! Axum HTTP/WS job orchestrator for the render core.
//!
//! This crate provides:
//! - The five-endpoint export control plane (§6): start, status, queue,
//!   cancel, and a progress websocket
//! - The in-memory job orchestrator that spawns and supervises
//!   `render_worker` subprocesses
//! - Rate limiting, security headers, and Prometheus metrics

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod orchestrator;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use orchestrator::Orchestrator;
pub use routes::create_router;
pub use state::AppState;
