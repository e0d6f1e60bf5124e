use mailswarm_api::{Namespace, ValidationError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("storage")]
    Storage,
    #[error("sqlite {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("codec {0}")]
    Codec(#[from] serde_json::Error),
    #[error("validation {0}")]
    Validation(String),
    #[error("transport {0}")]
    Transport(String),
    #[error("no swarm available")]
    NoSwarmAvailable,
    #[error("{0} suspended")]
    Suspended(&'static str),
    #[error("cancelled")]
    Cancelled,
    #[error("cursor for {0} changed during poll")]
    CursorMismatch(Namespace),
    #[error("crypto")]
    Crypto,
    #[error("not found")]
    NotFound,
    #[error("job {0}")]
    Job(String),
}

impl CoreError {
    /// Errors the poll loop may retry on its next iteration.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Transport(_) | CoreError::NoSwarmAvailable | CoreError::Storage
        )
    }
}

impl From<ValidationError> for CoreError {
    fn from(err: ValidationError) -> Self {
        CoreError::Validation(err.to_string())
    }
}
