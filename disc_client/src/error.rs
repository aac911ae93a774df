use reqwest::StatusCode;
use thiserror::Error;

/// Errors raised by the attachment client.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{context}: expected status {expected}, received {got}")]
    UnexpectedStatus {
        context: &'static str,
        expected: StatusCode,
        got: StatusCode,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
