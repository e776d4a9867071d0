//! Error types for s3bd
//!
//! One error enum is shared by every layer of the store. Callers are meant
//! to distinguish on the variant only; messages are for humans.

use thiserror::Error;

/// Common result type for s3bd operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for s3bd
///
/// All payloads are owned strings so errors can be cloned and handed to
/// every waiter of a shared in-flight operation.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Object absent. Never surfaced above the zero cache, which maps it
    /// to an all-zero block.
    #[error("object not found: {key}")]
    NotFound { key: String },

    /// Length mismatch, hash mismatch, HMAC failure, or malformed metadata.
    /// Always surfaced.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Signing or credential failure reported by the object store.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Retriable transport or server failure. Handled inside the HTTP
    /// layer; surfaced only after retries are exhausted, as [`Error::Io`].
    #[error("transient failure: {0}")]
    Transient(String),

    /// Non-retriable transport failure, or a transient one after exhaustion.
    #[error("I/O error: {0}")]
    Io(String),

    /// Incompatible persisted store parameters or invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A resource bound was hit in a non-blocking context.
    #[error("resource limit exceeded: {0}")]
    Overflow(String),

    /// The store was opened read-only and a mutation was attempted.
    #[error("store is read-only")]
    ReadOnly,

    /// The store has been shut down.
    #[error("store is shut down")]
    Shutdown,

    /// Dirty-journal failure (corrupt record, unwritable file).
    #[error("journal error: {0}")]
    Journal(String),

    /// Caller misuse: wrong buffer length, block index out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Not-found error for a block index.
    pub fn not_found_block(index: u64) -> Self {
        Self::NotFound {
            key: format!("block {index}"),
        }
    }

    /// Create an integrity error
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
