use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedwatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FeedwatchError {
    /// Short error code string returned to HTTP clients.
    pub fn code(&self) -> &'static str {
        match self {
            FeedwatchError::Config(_) => "CONFIG_ERROR",
            FeedwatchError::Serialization(_) => "SERIALIZATION_ERROR",
            FeedwatchError::Io(_) => "IO_ERROR",
            FeedwatchError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, FeedwatchError>;
