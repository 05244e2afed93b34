//! Observed-remove set with unconditional remove
//!
//! Each add carries a unique tag (the add's timestamp); an element is
//! present iff its tag set is non-empty. Remove clears the *whole* tag set
//! for the key, deliberately looser than the textbook observed-remove
//! semantics that ship the observed tags with the remove. The consequence,
//! which downstream code depends on: an add whose tag a remove never
//! observed wins, so re-adding after a stale remove resurrects the element.

use std::collections::{BTreeMap, BTreeSet};

use scenesync_protocol::{Timestamp, VectorClock};

use super::Crdt;

/// Broadcastable OR-Set operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOp<T> {
    Add { value: T, tag: Timestamp },
    Remove { value: T },
}

/// Set CRDT keyed by add-tags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrSet<T: Ord> {
    clock: VectorClock,
    /// Element -> live add-tags. Cleared (not removed) keys stay around so
    /// re-adds are cheap; presence is "tag set non-empty".
    elements: BTreeMap<T, BTreeSet<Timestamp>>,
}

impl<T: Ord + Clone> OrSet<T> {
    pub fn new() -> Self {
        Self {
            clock: VectorClock::new(),
            elements: BTreeMap::new(),
        }
    }

    /// Local add: tag the element with a fresh timestamp and return the
    /// operation to broadcast.
    pub fn add(&mut self, client_id: &str, value: T) -> SetOp<T> {
        let counter = self.clock.increment(client_id);
        let tag = Timestamp::new(counter, client_id);
        self.apply_add(value.clone(), tag.clone());
        SetOp::Add { value, tag }
    }

    /// Local remove: clear every tag for the element.
    pub fn remove(&mut self, value: &T) -> SetOp<T> {
        self.apply_remove(value);
        SetOp::Remove {
            value: value.clone(),
        }
    }

    /// Remote apply. Returns whether the set changed.
    pub fn apply(&mut self, op: &SetOp<T>) -> bool {
        match op {
            SetOp::Add { value, tag } => self.apply_add(value.clone(), tag.clone()),
            SetOp::Remove { value } => self.apply_remove(value),
        }
    }

    fn apply_add(&mut self, value: T, tag: Timestamp) -> bool {
        self.clock.observe(&tag.client_id, tag.counter);
        self.elements.entry(value).or_default().insert(tag)
    }

    fn apply_remove(&mut self, value: &T) -> bool {
        match self.elements.get_mut(value) {
            Some(tags) if !tags.is_empty() => {
                tags.clear();
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, value: &T) -> bool {
        self.elements
            .get(value)
            .is_some_and(|tags| !tags.is_empty())
    }

    /// Present elements in order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.elements
            .iter()
            .filter(|(_, tags)| !tags.is_empty())
            .map(|(value, _)| value)
    }

    pub fn len(&self) -> usize {
        self.values().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }
}

impl<T: Ord + Clone> Crdt for OrSet<T> {
    /// Anti-entropy merge: union of tag sets. Equivalent to replaying the
    /// other replica's add operations; removes only travel as operations,
    /// which is exactly what gives adds the upper hand over stale removes.
    fn merge(&mut self, other: &Self) {
        for (value, tags) in &other.elements {
            for tag in tags {
                self.apply_add(value.clone(), tag.clone());
            }
        }
        self.clock.merge(&other.clock);
    }
}
