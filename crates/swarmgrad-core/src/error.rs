//! Error taxonomy for the gradient exchange protocol.
//!
//! Storage failures become fetch sentinels inside the store and never reach
//! this level as errors during gather. What remains here either excludes a
//! single peer for one round (`Validation`, `Timing`), defers a round
//! (`ProtocolFailure`), or aborts a round without taking the process down.

use swarmgrad_store::StoreError;

use crate::codec::CodecError;

/// Reasons a peer's gradient artifact is rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("artifact is not a valid gradient payload: {0}")]
    Malformed(String),

    #[error("missing parameter {name}")]
    MissingParameter { name: String },

    #[error("unexpected parameter {name}")]
    UnknownParameter { name: String },

    #[error("parameter {name}: {idxs} indices but {vals} values")]
    LengthMismatch {
        name: String,
        idxs: usize,
        vals: usize,
    },

    #[error("parameter {name}: {count} entries exceeds limit {max}")]
    TooManyEntries {
        name: String,
        count: usize,
        max: usize,
    },

    #[error("parameter {name}: {count} entries is not a multiple of {chunks} chunks")]
    ChunkMisaligned {
        name: String,
        count: usize,
        chunks: usize,
    },

    #[error("parameter {name}: index {index} out of range [0, {total_k})")]
    IndexOutOfRange {
        name: String,
        index: u32,
        total_k: usize,
    },

    #[error("parameter {name}: non-finite value")]
    NonFinite { name: String },

    #[error("payload of {size} bytes exceeds limit {max}")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Protocol-level errors.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    /// Network or disk hiccup that outlived the store's own retries.
    #[error("transient io failure: {0}")]
    TransientIo(String),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The window's anchor block never showed up, so its publish window
    /// cannot be placed.
    #[error("timing violation: {0}")]
    Timing(String),

    /// No peer contributed; the round is deferred to the next window.
    #[error("window {window}: {reason}")]
    ProtocolFailure { window: u64, reason: String },

    /// Checkpoint could not be read back.
    #[error("state corruption: {0}")]
    StateCorruption(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("peer {peer} already evaluated in window {window}")]
    DuplicateEvaluation { peer: u16, window: u64 },

    /// Trainer, data source or ledger failed.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for SwarmError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Exhausted { .. } => SwarmError::TransientIo(err.to_string()),
            other => SwarmError::Storage(other),
        }
    }
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, SwarmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display_names_parameter() {
        let err = ValidationError::IndexOutOfRange {
            name: "layers.0.weight".into(),
            index: 4096,
            total_k: 4096,
        };
        let msg = err.to_string();
        assert!(msg.contains("layers.0.weight"));
        assert!(msg.contains("4096"));
    }

    #[test]
    fn protocol_failure_mentions_window() {
        let err = SwarmError::ProtocolFailure {
            window: 42,
            reason: "no valid contributions".into(),
        };
        assert!(err.to_string().contains("window 42"));
    }

    #[test]
    fn store_error_converts() {
        let err: SwarmError = StoreError::InvalidKey("x".into()).into();
        assert!(matches!(err, SwarmError::Storage(_)));
    }

    #[test]
    fn exhausted_retries_are_transient() {
        let err: SwarmError = StoreError::Exhausted {
            operation: "put gradient-3-1-v3.json".into(),
            attempts: 3,
            reason: "connection reset".into(),
        }
        .into();
        assert!(matches!(&err, SwarmError::TransientIo(msg) if msg.contains("connection reset")));
    }

    #[test]
    fn duplicate_evaluation_display() {
        let err = SwarmError::DuplicateEvaluation { peer: 7, window: 3 };
        assert_eq!(err.to_string(), "peer 7 already evaluated in window 3");
    }
}
