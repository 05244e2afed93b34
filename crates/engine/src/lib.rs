// scenesync-engine library
// Convergence core: CRDT primitives, operational transform, conflict
// resolution, Merkle differential sync, and per-room state management.

// CRDT primitives
pub mod crdt;

// Secondary conflict layer for structured scene operations
pub mod transform;

// Pluggable conflict-resolution strategies
pub mod conflict;

// Differential sync and Merkle reconciliation
pub mod sync;

// Room document model and registry
pub mod room;

// Configuration
pub mod config;

// Error taxonomy
pub mod error;

pub use config::RoomConfig;
pub use error::EngineError;
pub use room::{RoomRegistry, RoomStateManager};

// Re-export the wire types the engine's API is built from.
pub use scenesync_protocol as protocol;
