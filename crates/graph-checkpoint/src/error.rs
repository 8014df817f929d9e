//! Errors raised while reading or writing generation state.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CheckpointError>;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("generation '{0}' not found")]
    NotFound(String),

    #[error("generation '{0}' already exists")]
    AlreadyExists(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
