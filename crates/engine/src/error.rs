//! Error taxonomy for the convergence core
//!
//! Most anomalies are deliberately *not* errors: unknown payloads are
//! dropped with a warning, duplicate and stale operations are idempotent
//! no-ops. Only failures that require caller intervention surface here,
//! and none of them ever invalidates already-converged state.

use thiserror::Error;

/// Errors originating from the convergence core.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Merkle roots disagree but no leaf diff explains the mismatch,
    /// e.g. a corrupted operation log. Callers fall back to a full-state
    /// snapshot.
    #[error("reconciliation failed for room {room}: {reason}")]
    Reconciliation { room: String, reason: String },

    /// A snapshot's checksum did not match its state.
    #[error("snapshot checksum mismatch: expected {expected}, got {actual}")]
    SnapshotChecksum { expected: String, actual: String },

    /// The requested clock predates the oldest retained operation and no
    /// snapshot is available to bridge the gap.
    #[error("operations before the retained log tail were requested and no snapshot exists")]
    HistoryUnavailable,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
