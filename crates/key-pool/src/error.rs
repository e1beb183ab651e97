//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pool exhausted: no keys available")]
    PoolExhausted,

    #[error("key store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("key already exists: {0}")]
    DuplicateValue(String),

    #[error("key not found: {0}")]
    RecordNotFound(String),

    #[error("invalid key value: {0}")]
    InvalidValue(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<key_store::Error> for Error {
    fn from(err: key_store::Error) -> Self {
        match err {
            key_store::Error::Duplicate(v) => Error::DuplicateValue(v),
            key_store::Error::NotFound(v) => Error::RecordNotFound(v),
            other => Error::StoreUnavailable(other.to_string()),
        }
    }
}
