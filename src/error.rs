//! Error types for semi-supervised training.

use thiserror::Error;

/// Main error type for training operations.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dataset error
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// Distributed coordination error
    #[error("Distributed error: {0}")]
    Distributed(String),

    /// Device error
    #[error("Device error: {0}")]
    Device(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Already exists error
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Specialized Result type for training operations.
pub type Result<T> = std::result::Result<T, Error>;
