//! Error types for swarmgrad-store

use thiserror::Error;

/// Errors that can occur in the storage layer.
///
/// Callers above the store rarely see these directly: `ObjectStore::fetch`
/// converts them into `FetchOutcome::Absent` after logging.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem error from the local backend
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote bucket request failed
    #[error("remote request failed: {0}")]
    Remote(String),

    /// Remote bucket answered with an unexpected status
    #[error("remote returned status {status} for {key}")]
    RemoteStatus { status: u16, key: String },

    /// A storage key could not be parsed
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    /// Unknown artifact kind
    #[error("unknown artifact kind: {0}")]
    UnknownKind(String),

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Retried operation gave up
    #[error("{operation} failed after {attempts} attempt(s): {reason}")]
    Exhausted {
        operation: String,
        attempts: u32,
        reason: String,
    },

    /// Backend is not configured
    #[error("backend not configured: {0}")]
    NotConfigured(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Remote(err.to_string())
    }
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;
