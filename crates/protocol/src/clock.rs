//! Causality primitives: per-client timestamps and vector clocks
//!
//! A [`Timestamp`] identifies the origin event of an operation; a
//! [`VectorClock`] tracks the highest counter observed per client and
//! establishes happened-before / concurrent relations between events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identifier of a participating client (replica).
///
/// Ties between equal counters are broken by lexicographic comparison of
/// client ids, so the id type must have a stable total order.
pub type ClientId = String;

/// A per-client logical timestamp: `(counter, client_id)`.
///
/// The derived `Ord` compares `counter` first and `client_id` second, which
/// is exactly the total order used for every last-writer-wins tie-break:
/// equal counters are won by the lexicographically larger client id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamp {
    pub counter: u64,
    pub client_id: ClientId,
}

impl Timestamp {
    pub fn new(counter: u64, client_id: impl Into<ClientId>) -> Self {
        Self {
            counter,
            client_id: client_id.into(),
        }
    }

    /// Derive the globally unique operation id for this origin event.
    pub fn op_id(&self) -> String {
        format!("{}-{}", self.client_id, self.counter)
    }
}

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    Equal,
    /// `a` happened before `b` (`b` dominates on every key).
    Before,
    /// `a` happened after `b` (`a` dominates on every key).
    After,
    /// Neither dominates the other.
    Concurrent,
}

/// Mapping from client id to the highest counter observed for that client.
///
/// Entries never decrease; merging takes the pointwise maximum. Missing
/// keys default to 0, so every method is a total function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<ClientId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest counter observed for `client_id` (0 if never seen).
    pub fn get(&self, client_id: &str) -> u64 {
        self.entries.get(client_id).copied().unwrap_or(0)
    }

    /// Advance this client's counter by one and return the new value.
    pub fn increment(&mut self, client_id: &str) -> u64 {
        let entry = self.entries.entry(client_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Record an observed counter for a client, keeping the maximum.
    pub fn observe(&mut self, client_id: &str, counter: u64) {
        let entry = self.entries.entry(client_id.to_string()).or_insert(0);
        *entry = (*entry).max(counter);
    }

    /// Pointwise-maximum merge of `other` into `self`.
    pub fn merge(&mut self, other: &VectorClock) {
        for (client_id, &counter) in &other.entries {
            self.observe(client_id, counter);
        }
    }

    /// Value-returning form of [`merge`](Self::merge).
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// Compare two clocks for causal ordering.
    ///
    /// `Before`/`After` hold iff one clock dominates the other on every
    /// key; otherwise the clocks are `Concurrent`.
    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for client_id in self.entries.keys().chain(other.entries.keys()) {
            let a = self.get(client_id);
            let b = other.get(client_id);
            if a > b {
                self_ahead = true;
            } else if b > a {
                other_ahead = true;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => CausalOrder::Equal,
            (false, true) => CausalOrder::Before,
            (true, false) => CausalOrder::After,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// Entries where `to` has advanced beyond `self`.
    pub fn diff(&self, to: &VectorClock) -> VectorClock {
        let mut out = VectorClock::new();
        for (client_id, &counter) in &to.entries {
            if counter > self.get(client_id) {
                out.observe(client_id, counter);
            }
        }
        out
    }

    /// True when `other` has observed at least everything `self` has.
    pub fn is_subset(&self, other: &VectorClock) -> bool {
        self.entries
            .iter()
            .all(|(client_id, &counter)| other.get(client_id) >= counter)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, u64)> {
        self.entries.iter().map(|(id, &counter)| (id, counter))
    }

    /// Client ids with at least one observed counter.
    pub fn clients(&self) -> impl Iterator<Item = &ClientId> {
        self.entries.keys()
    }
}
