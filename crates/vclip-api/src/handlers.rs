//! Request handlers.

pub mod export;
pub mod health;

pub use export::*;
pub use health::*;
