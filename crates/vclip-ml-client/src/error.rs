//! Errors surfaced by the external provider HTTP clients.

use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {0} failed: {1}")]
    Request(String, #[source] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("response decode failed: {0}")]
    Decode(#[source] reqwest::Error),
}
