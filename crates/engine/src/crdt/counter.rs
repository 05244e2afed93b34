//! Grow-only and positive-negative counters

use std::collections::BTreeMap;

use scenesync_protocol::{ClientId, VectorClock};

use super::Crdt;

/// Grow-only counter: each client accumulates its own increments locally;
/// merge takes the pointwise **maximum** per client, never the sum, since
/// a client's entry already carries everything it has contributed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GCounter {
    clock: VectorClock,
    counts: BTreeMap<ClientId, u64>,
}

impl GCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local increment. Returns the client's new accumulated total, which
    /// is what gets broadcast.
    pub fn increment(&mut self, client_id: &str, amount: u64) -> u64 {
        self.clock.increment(client_id);
        let entry = self.counts.entry(client_id.to_string()).or_insert(0);
        *entry += amount;
        *entry
    }

    /// Remote apply: record a client's accumulated total. Idempotent and
    /// commutative because stale totals are dominated by the max.
    pub fn apply(&mut self, client_id: &str, total: u64) -> bool {
        let entry = self.counts.entry(client_id.to_string()).or_insert(0);
        if total > *entry {
            *entry = total;
            true
        } else {
            false
        }
    }

    /// Sum of every client's contribution.
    pub fn value(&self) -> u64 {
        self.counts.values().sum()
    }

    /// A single client's accumulated total.
    pub fn get(&self, client_id: &str) -> u64 {
        self.counts.get(client_id).copied().unwrap_or(0)
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }
}

impl Crdt for GCounter {
    fn merge(&mut self, other: &Self) {
        for (client_id, &total) in &other.counts {
            self.apply(client_id, total);
        }
        self.clock.merge(&other.clock);
    }
}

/// Counter supporting decrements: a pair of grow-only counters, with
/// `value = positive - negative`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PnCounter {
    positive: GCounter,
    negative: GCounter,
}

impl PnCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, client_id: &str, amount: u64) -> u64 {
        self.positive.increment(client_id, amount)
    }

    pub fn decrement(&mut self, client_id: &str, amount: u64) -> u64 {
        self.negative.increment(client_id, amount)
    }

    /// Remote apply of a client's accumulated `(positive, negative)` pair.
    pub fn apply(&mut self, client_id: &str, positive: u64, negative: u64) -> bool {
        let p = self.positive.apply(client_id, positive);
        let n = self.negative.apply(client_id, negative);
        p || n
    }

    /// Net value. Totals beyond `i64::MAX` saturate instead of wrapping.
    pub fn value(&self) -> i64 {
        let positive = i64::try_from(self.positive.value()).unwrap_or(i64::MAX);
        let negative = i64::try_from(self.negative.value()).unwrap_or(i64::MAX);
        positive.saturating_sub(negative)
    }

    pub fn positive(&self) -> &GCounter {
        &self.positive
    }

    pub fn negative(&self) -> &GCounter {
        &self.negative
    }
}

impl Crdt for PnCounter {
    fn merge(&mut self, other: &Self) {
        self.positive.merge(&other.positive);
        self.negative.merge(&other.negative);
    }
}
