use std::error::Error;
use thiserror::Error;

/// Result alias for shared store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error raised by shared store backends regardless of the underlying engine.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// A key holds a value of a different shape than the operation expects.
    #[error("key `{key}` holds a value of the wrong type")]
    WrongType { key: String },
    /// A stored value could not be encoded or decoded.
    #[error("failed to (de)serialize value at `{key}`")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    /// The lease of a session lock expired and another holder took it.
    #[error("lock `{key}` is no longer held by this caller")]
    LockLost { key: String },
}

impl StoreError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StoreError::Unavailable {
            message,
            source: Box::new(source),
        }
    }
}
