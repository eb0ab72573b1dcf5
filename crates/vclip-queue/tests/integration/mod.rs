//! Integration tests for the progress relay.
//!
//! These require a reachable Redis instance. Run with:
//! `cargo test --test integration -- --ignored`

pub mod progress_tests;
