//! Configuration for room state management and sync
//!
//! Plain value structs with defaults; the embedding process decides where
//! the values come from.

/// Per-room tuning knobs.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Operation-log tail retained after pruning. Memory bound only;
    /// convergence never depends on it.
    pub max_log_len: usize,
    /// Operations per Merkle leaf.
    pub merkle_leaf_size: usize,
    /// Maximum operations per transport batch.
    pub max_batch_ops: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_log_len: 10_000,
            merkle_leaf_size: 8,
            max_batch_ops: 100,
        }
    }
}
