//! Last-writer-wins map with tombstones

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use scenesync_protocol::{Timestamp, VectorClock};

use super::Crdt;

/// Per-key record. Deleted keys keep a tombstone rather than being removed
/// physically, so a late-arriving delete is never resurrected by an earlier
/// concurrent set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<V> {
    pub value: Option<V>,
    pub timestamp: Timestamp,
    pub deleted: bool,
}

/// Map CRDT with per-key LWW semantics keyed on `(counter, client_id)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LwwMap<V> {
    clock: VectorClock,
    entries: BTreeMap<String, Entry<V>>,
}

impl<V: Clone> LwwMap<V> {
    pub fn new() -> Self {
        Self {
            clock: VectorClock::new(),
            entries: BTreeMap::new(),
        }
    }

    /// Local set. Returns the timestamp to broadcast.
    pub fn set(&mut self, client_id: &str, key: impl Into<String>, value: V) -> Timestamp {
        let counter = self.clock.increment(client_id);
        let ts = Timestamp::new(counter, client_id);
        self.apply_set(key.into(), value, ts.clone());
        ts
    }

    /// Local delete (tombstone). Returns the timestamp to broadcast.
    pub fn delete(&mut self, client_id: &str, key: impl Into<String>) -> Timestamp {
        let counter = self.clock.increment(client_id);
        let ts = Timestamp::new(counter, client_id);
        self.apply_delete(key.into(), ts.clone());
        ts
    }

    /// Remote set; keeps whichever proposal has the higher timestamp.
    /// Returns whether the entry changed.
    pub fn apply_set(&mut self, key: String, value: V, timestamp: Timestamp) -> bool {
        self.apply_entry(
            key,
            Entry {
                value: Some(value),
                timestamp,
                deleted: false,
            },
        )
    }

    /// Remote delete; tombstones the key if the delete is the latest write.
    pub fn apply_delete(&mut self, key: String, timestamp: Timestamp) -> bool {
        self.apply_entry(
            key,
            Entry {
                value: None,
                timestamp,
                deleted: true,
            },
        )
    }

    fn apply_entry(&mut self, key: String, entry: Entry<V>) -> bool {
        self.clock
            .observe(&entry.timestamp.client_id, entry.timestamp.counter);
        match self.entries.get(&key) {
            Some(existing) if existing.timestamp >= entry.timestamp => false,
            _ => {
                self.entries.insert(key, entry);
                true
            }
        }
    }

    /// Live value for a key; tombstoned keys read as absent.
    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|entry| !entry.deleted)
            .and_then(|entry| entry.value.as_ref())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Raw entry including tombstones, for merge and diff machinery.
    pub fn entry(&self, key: &str) -> Option<&Entry<V>> {
        self.entries.get(key)
    }

    /// All live `(key, value)` pairs in key order.
    pub fn live_entries(&self) -> impl Iterator<Item = (&String, &V)> {
        self.entries.iter().filter_map(|(key, entry)| {
            if entry.deleted {
                None
            } else {
                entry.value.as_ref().map(|value| (key, value))
            }
        })
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.live_entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }
}

impl<V: Clone> Crdt for LwwMap<V> {
    fn merge(&mut self, other: &Self) {
        for (key, entry) in &other.entries {
            self.apply_entry(key.clone(), entry.clone());
        }
        self.clock.merge(&other.clock);
    }
}
