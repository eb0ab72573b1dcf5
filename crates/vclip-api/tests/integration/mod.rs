//! Integration tests for the export control plane.
//!
//! `api_tests` need a reachable Redis instance (the orchestrator's
//! `AppState::new` fails fast otherwise); run with
//! `cargo test --test integration -- --ignored`.

pub mod api_tests;
