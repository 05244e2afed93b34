//! Shared protocol types for scenesync
//!
//! Defines the JSON wire structures exchanged between replicas: timestamps
//! and vector clocks for causality, the operation envelope with its tagged
//! payload, and the sync request/response/snapshot envelopes.

pub mod clock;
pub mod operation;
pub mod sync;

pub use clock::*;
pub use operation::*;
pub use sync::*;
