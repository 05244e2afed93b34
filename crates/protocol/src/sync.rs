//! Sync negotiation envelopes
//!
//! A replica opens reconciliation by sending a [`SyncRequest`] with its
//! vector clock (and optionally its Merkle root); the peer answers with a
//! [`SyncResponse`] carrying the operations the requester lacks, or a full
//! checksummed [`Snapshot`] when the requested clock predates what the peer
//! still retains.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::clock::{ClientId, VectorClock};
use crate::operation::Operation;

/// Catch-up request from a (possibly stale) replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub client_id: ClientId,
    pub vector_clock: VectorClock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merkle_root: Option<String>,
}

/// Reply to a [`SyncRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// Operations the requester has not observed, sorted by counter.
    pub operations: Vec<Operation>,
    /// The responder's causal frontier.
    pub vector_clock: VectorClock,
    /// Full-state fallback when operations can no longer be replayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merkle_root: Option<String>,
}

/// Full room state with a content checksum.
///
/// Persistence appends these periodically to bound replay cost; the sync
/// path embeds one when a requester is too far behind for operation-level
/// catch-up. Correctness never depends on snapshot freshness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub state: Value,
    pub vector_clock: VectorClock,
    /// SHA-256 of the serialized state, hex-encoded.
    pub checksum: String,
}

impl Snapshot {
    /// Wrap a state value, computing its checksum.
    pub fn new(state: Value, vector_clock: VectorClock) -> Self {
        let checksum = Self::checksum_of(&state);
        Self {
            state,
            vector_clock,
            checksum,
        }
    }

    /// Recompute and compare the checksum.
    pub fn verify(&self) -> bool {
        Self::checksum_of(&self.state) == self.checksum
    }

    /// SHA-256 digest of a state value, hex-encoded.
    pub fn checksum_of(state: &Value) -> String {
        let mut hasher = Sha256::new();
        // serde_json's Map is ordered, so this serialization is canonical.
        hasher.update(state.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_checksum_round_trips() {
        let snap = Snapshot::new(json!({"objects": {"cube-1": {"color": "red"}}}), VectorClock::new());
        assert!(snap.verify());

        let mut tampered = snap.clone();
        tampered.state = json!({"objects": {}});
        assert!(!tampered.verify());
    }

    #[test]
    fn request_omits_absent_merkle_root() {
        let req = SyncRequest {
            client_id: "alice".into(),
            vector_clock: VectorClock::new(),
            merkle_root: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("merkleRoot").is_none());
        assert_eq!(json["clientId"], "alice");
    }
}
