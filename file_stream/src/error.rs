use std::sync::Arc;

use disc_client::ClientError;
use thiserror::Error;

/// Errors raised by the chunk writers and reader.
///
/// Clone-able (inner errors behind `Arc`) so a failure recorded by a
/// background upload worker can be returned from every subsequent call.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    #[error("stream is closed")]
    Closed,

    #[error("stream is already closed")]
    AlreadyClosed,

    #[error("read position {pos} is beyond the file size {size}")]
    OutOfRange { pos: u64, size: u64 },

    #[error("client error: {0}")]
    Client(Arc<ClientError>),

    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("background upload task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, StreamError>;

impl From<ClientError> for StreamError {
    fn from(err: ClientError) -> Self {
        StreamError::Client(Arc::new(err))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Io(Arc::new(err))
    }
}

impl From<tokio::task::JoinError> for StreamError {
    fn from(err: tokio::task::JoinError) -> Self {
        StreamError::Task(err.to_string())
    }
}
