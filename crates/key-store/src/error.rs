//! Error types for key store operations

/// Errors from key store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key already exists: {0}")]
    Duplicate(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("key store unavailable: {0}")]
    Unavailable(String),
}

/// Result alias for key store operations.
pub type Result<T> = std::result::Result<T, Error>;
