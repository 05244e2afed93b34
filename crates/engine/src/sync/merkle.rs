//! Merkle tree over operation logs
//!
//! Operations are sorted by `(counter, client_id)` and bucketed into
//! fixed-size leaves; a leaf hashes the concatenated `id:counter` pairs it
//! covers and internal nodes hash their children's hashes. Comparing two
//! trees top-down localizes a divergence to a handful of leaves in
//! O(log n) hash comparisons instead of exchanging whole logs.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use scenesync_protocol::Operation;

/// Default operations per leaf.
pub const DEFAULT_LEAF_SIZE: usize = 8;

/// One tree node; leaves carry the operation ids they cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleNode {
    pub hash: String,
    pub left: Option<Box<MerkleNode>>,
    pub right: Option<Box<MerkleNode>>,
    /// Leaf payload: ids of the operations hashed into this leaf.
    pub op_ids: Vec<String>,
}

impl MerkleNode {
    fn leaf(ops: &[&Operation]) -> Self {
        let mut hasher = Sha256::new();
        for op in ops {
            hasher.update(op.id.as_bytes());
            hasher.update(b":");
            hasher.update(op.counter().to_string().as_bytes());
        }
        Self {
            hash: hex::encode(hasher.finalize()),
            left: None,
            right: None,
            op_ids: ops.iter().map(|op| op.id.clone()).collect(),
        }
    }

    fn parent(left: MerkleNode, right: MerkleNode) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(left.hash.as_bytes());
        hasher.update(right.hash.as_bytes());
        Self {
            hash: hex::encode(hasher.finalize()),
            left: Some(Box::new(left)),
            right: Some(Box::new(right)),
            op_ids: Vec::new(),
        }
    }

    fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    /// All operation ids under this subtree.
    fn collect_ids(&self, out: &mut BTreeSet<String>) {
        out.extend(self.op_ids.iter().cloned());
        if let Some(left) = &self.left {
            left.collect_ids(out);
        }
        if let Some(right) = &self.right {
            right.collect_ids(out);
        }
    }
}

/// Immutable Merkle snapshot of an operation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    root: Option<MerkleNode>,
    leaf_size: usize,
}

impl MerkleTree {
    /// Build a tree over `ops` with `leaf_size` operations per leaf.
    pub fn build(ops: &[Operation], leaf_size: usize) -> Self {
        let leaf_size = leaf_size.max(1);
        let mut sorted: Vec<&Operation> = ops.iter().collect();
        sorted.sort_by_key(|op| op.timestamp.clone());

        let mut level: Vec<MerkleNode> = sorted
            .chunks(leaf_size)
            .map(MerkleNode::leaf)
            .collect();

        // Binary reduction; a lone trailing node is promoted unchanged.
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            let mut iter = level.into_iter();
            while let Some(left) = iter.next() {
                match iter.next() {
                    Some(right) => next.push(MerkleNode::parent(left, right)),
                    None => next.push(left),
                }
            }
            level = next;
        }

        Self {
            root: level.pop(),
            leaf_size,
        }
    }

    pub fn root_hash(&self) -> Option<&str> {
        self.root.as_ref().map(|node| node.hash.as_str())
    }

    pub fn leaf_size(&self) -> usize {
        self.leaf_size
    }

    /// Operation ids present in `remote` but absent locally, found by
    /// walking both trees and descending only where hashes diverge.
    pub fn find_missing(&self, remote: &MerkleTree) -> Vec<String> {
        let mut missing = BTreeSet::new();
        Self::walk(self.root.as_ref(), remote.root.as_ref(), &mut missing);

        // Divergent leaves report every id they cover; drop the ones we
        // already hold anywhere in our own tree.
        let mut local_ids = BTreeSet::new();
        if let Some(root) = &self.root {
            root.collect_ids(&mut local_ids);
        }
        missing.difference(&local_ids).cloned().collect()
    }

    fn walk(local: Option<&MerkleNode>, remote: Option<&MerkleNode>, out: &mut BTreeSet<String>) {
        let Some(remote) = remote else {
            return;
        };
        match local {
            Some(local) if local.hash == remote.hash => {}
            Some(local) if !local.is_leaf() && !remote.is_leaf() => {
                Self::walk(local.left.as_deref(), remote.left.as_deref(), out);
                Self::walk(local.right.as_deref(), remote.right.as_deref(), out);
            }
            // Leaf divergence, shape mismatch, or nothing local at all:
            // every id under the remote subtree is a candidate.
            _ => remote.collect_ids(out),
        }
    }
}
