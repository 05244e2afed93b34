//! Differential synchronization
//!
//! Computes the minimal set of operations two replicas need to exchange to
//! converge, without shipping full history. Eligibility is decided by
//! vector-clock dominance (an operation is missing iff its counter exceeds
//! the receiving clock's entry for its client), so delivery gaps are found
//! even without per-id comparison. The Merkle tree narrows *where* two logs
//! diverge in O(log n) hash comparisons.

mod merkle;

pub use merkle::{MerkleNode, MerkleTree};

use scenesync_protocol::{Operation, VectorClock};

/// Operations from `remote_ops` that the holder of `local_clock` has not
/// observed yet, sorted by `(counter, client_id)`.
pub fn missing_ops(remote_ops: &[Operation], local_clock: &VectorClock) -> Vec<Operation> {
    let mut out: Vec<Operation> = remote_ops
        .iter()
        .filter(|op| op.counter() > local_clock.get(&op.client_id))
        .cloned()
        .collect();
    out.sort_by_key(|op| op.timestamp.clone());
    out
}

/// Local operations a peer holding `remote_clock` is lagging behind on,
/// what a replica pushes to catch that peer up.
pub fn ops_to_push(local_ops: &[Operation], remote_clock: &VectorClock) -> Vec<Operation> {
    missing_ops(local_ops, remote_clock)
}

/// Split an operation list into transport batches of at most `max` ops.
pub fn batch_operations(ops: &[Operation], max: usize) -> Vec<Vec<Operation>> {
    if max == 0 {
        return vec![ops.to_vec()];
    }
    ops.chunks(max).map(<[Operation]>::to_vec).collect()
}

/// Drop operations superseded by a later operation on the same target:
/// an older write of the same type, or anything older than a delete.
///
/// Purely a transport-size optimization. Convergence is the CRDT apply /
/// merge path's job; compressed payloads must never be treated as the
/// authoritative history.
pub fn compress(ops: &[Operation]) -> Vec<Operation> {
    let mut sorted: Vec<&Operation> = ops.iter().collect();
    sorted.sort_by_key(|op| op.timestamp.clone());

    let superseded = |op: &Operation| {
        let Some(target) = op.target() else {
            return false;
        };
        sorted.iter().any(|later| {
            later.timestamp > op.timestamp
                && later.target() == Some(target)
                && (later.payload.is_delete()
                    || later.payload.type_name() == op.payload.type_name())
        })
    };

    sorted
        .iter()
        .filter(|op| !superseded(op))
        .map(|op| (*op).clone())
        .collect()
}
