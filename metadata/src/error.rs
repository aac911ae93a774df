use thiserror::Error;

/// Error taxonomy shared by every provider implementation.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum MetaError {
    #[error("file does not exist")]
    NotExist,

    #[error("file already exists")]
    Exist,

    #[error("permission denied")]
    Permission,

    #[error("parent does not exist or is not a directory")]
    InvalidParent,

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, MetaError>;
