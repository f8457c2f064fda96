//! Error types for local persistence, remote propagation and import.

use thiserror::Error;

/// Result type for remote store operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors raised by a [`LocalCache`](crate::cache::LocalCache) backend.
#[derive(Debug, Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing the mirror.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The mirror could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing storage refused the write because it is full.
    #[error("Storage quota exceeded for key {0}")]
    QuotaExceeded(String),
}

/// Errors raised while talking to the remote document service.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// No backend is reachable (offline, or never attached).
    ///
    /// This is normal offline operation, not a fault.
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the credentials of the current identity.
    #[error("remote store rejected credentials: {0}")]
    Unauthenticated(String),

    /// The backend answered with a non-success status.
    #[error("remote store rejected request ({status}): {message}")]
    Rejected {
        /// Status code reported by the backend.
        status: u16,
        /// Message reported by the backend.
        message: String,
    },

    /// The configured backend URL is invalid.
    #[error("invalid remote URL: {0}")]
    InvalidUrl(String),

    /// The HTTP layer failed in a way that is not a connectivity problem.
    #[error("remote HTTP request failed: {0}")]
    Http(String),

    /// A document returned by the backend could not be decoded.
    #[error("failed to decode remote document: {0}")]
    Decode(#[from] serde_json::Error),
}

impl RemoteError {
    /// Returns true when the error only means "offline"; callers skip silently.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Reasons an import payload is rejected. Nothing is merged when any of these occur.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The payload is not valid JSON for the expected snapshot shape.
    #[error("malformed import payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The snapshot version is not one this build understands.
    #[error("unsupported snapshot version: {0}")]
    UnsupportedVersion(String),

    /// A record is keyed by an empty subject id.
    #[error("invalid subject id in import: {0:?}")]
    InvalidSubject(String),

    /// A required section of a combined backup is missing.
    #[error("import payload is missing section: {0}")]
    MissingSection(&'static str),
}
