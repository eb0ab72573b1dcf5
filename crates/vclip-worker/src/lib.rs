#![deny(unreachable_patterns)]
//! Render worker: a single-export-then-exit binary driven entirely by CLI
//! arguments (§4.6). Given a project name, it loads, validates, runs the
//! export pipeline and reports progress as line-delimited JSON on stdout.

pub mod config;
pub mod error;
pub mod validate;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
