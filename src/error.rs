//! Error types for ephemeral-storage

use thiserror::Error;

/// Reasons an upload is refused before anything is written
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("No file provided")]
    Empty,

    #[error("Payload of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },

    #[error("Content type not allowed: {0}")]
    UnsupportedType(String),

    #[error("TTL of {minutes} minutes is outside {min}..={max}")]
    InvalidTtl { minutes: i64, min: u32, max: u32 },

    #[error("Declared size {declared} does not match received {received} bytes")]
    SizeMismatch { declared: u64, received: u64 },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal tag only; `services::BlobReader::open` reports it as `NotFound`
    #[error("Expired: {0}")]
    Expired(String),

    #[error("Object has no readable expiry stamp: {0}")]
    MissingStamp(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Wrap a backend failure
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        StorageError::StorageUnavailable(err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}
