//! Replicated growable array
//!
//! Sequence CRDT for ordered scene lists. Every element carries a unique
//! `(counter, client_id)` identity and a reference to the element it was
//! inserted after. Concurrent inserts after the same predecessor are
//! ordered by ascending `(counter, client_id)` (the higher counter sorts
//! later), which yields one global total order no matter the order ops
//! arrive in. Deletes are tombstone-only.

use std::collections::{BTreeMap, BTreeSet};

use scenesync_protocol::{Timestamp, VectorClock};

use super::Crdt;

/// Broadcastable RGA operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RgaOp<T> {
    Insert {
        id: Timestamp,
        /// Identity of the predecessor; `None` inserts at the list head.
        after: Option<Timestamp>,
        value: T,
    },
    Delete {
        id: Timestamp,
    },
}

/// One sequence slot, tombstoned on delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgaElement<T> {
    pub id: Timestamp,
    /// Original insertion predecessor, retained so state merges replay the
    /// same placement decision remote applies make.
    pub origin: Option<Timestamp>,
    pub value: T,
    pub deleted: bool,
}

/// Ordered list CRDT.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rga<T> {
    clock: VectorClock,
    /// Document order, tombstones inline.
    elements: Vec<RgaElement<T>>,
    /// Inserts that arrived before their predecessor, keyed by the missing
    /// predecessor id. Parked elements are invisible until the gap closes,
    /// then placed through the normal sibling ordering.
    pending: BTreeMap<Timestamp, Vec<(Timestamp, T)>>,
    /// Deletes that arrived while their target was still parked.
    deferred_deletes: BTreeSet<Timestamp>,
}

impl<T: Clone + PartialEq> Rga<T> {
    pub fn new() -> Self {
        Self {
            clock: VectorClock::new(),
            elements: Vec::new(),
            pending: BTreeMap::new(),
            deferred_deletes: BTreeSet::new(),
        }
    }

    /// Local insert after the element with identity `after` (or at the
    /// head). Returns the operation to broadcast.
    pub fn insert_after(
        &mut self,
        client_id: &str,
        after: Option<Timestamp>,
        value: T,
    ) -> RgaOp<T> {
        let counter = self.clock.increment(client_id);
        let id = Timestamp::new(counter, client_id);
        let op = RgaOp::Insert {
            id,
            after,
            value,
        };
        self.apply(&op);
        op
    }

    /// Local insert by visible index: 0 prepends, `i` inserts after the
    /// i-th visible element.
    pub fn insert_at(&mut self, client_id: &str, index: usize, value: T) -> RgaOp<T> {
        let after = if index == 0 {
            None
        } else {
            self.visible_ids().nth(index - 1).cloned()
        };
        self.insert_after(client_id, after, value)
    }

    /// Local tombstone delete of the element with identity `id`.
    pub fn delete(&mut self, id: &Timestamp) -> Option<RgaOp<T>> {
        let op = RgaOp::Delete { id: id.clone() };
        if self.apply(&op) {
            Some(op)
        } else {
            None
        }
    }

    /// Remote apply. Idempotent: re-inserting a known id and re-deleting a
    /// tombstone are no-ops. Returns whether the list changed.
    pub fn apply(&mut self, op: &RgaOp<T>) -> bool {
        match op {
            RgaOp::Insert { id, after, value } => {
                self.apply_insert(id.clone(), after.clone(), value.clone())
            }
            RgaOp::Delete { id } => self.apply_delete(id),
        }
    }

    fn apply_insert(&mut self, id: Timestamp, after: Option<Timestamp>, value: T) -> bool {
        if self.position_of(&id).is_some() || self.is_parked(&id) {
            return false;
        }
        self.clock.observe(&id.client_id, id.counter);

        // Out-of-order delivery with a gap: park the element until its
        // predecessor arrives, otherwise head- and gap-delivered replicas
        // would disagree on placement.
        if let Some(pred) = &after {
            if self.position_of(pred).is_none() {
                self.pending.entry(pred.clone()).or_default().push((id, value));
                return true;
            }
        }

        self.place(id.clone(), after, value);
        self.flush_pending(id);
        true
    }

    /// Insert directly after the (already present) predecessor, then skip
    /// past concurrent siblings that carry a lower identity so the higher
    /// (counter, client_id) lands later.
    fn place(&mut self, id: Timestamp, after: Option<Timestamp>, value: T) {
        let mut index = match &after {
            Some(pred) => self.position_of(pred).map_or(0, |pos| pos + 1),
            None => 0,
        };
        while let Some(next) = self.elements.get(index) {
            if next.id < id {
                index += 1;
            } else {
                break;
            }
        }

        let deleted = self.deferred_deletes.remove(&id);
        self.elements.insert(
            index,
            RgaElement {
                id,
                origin: after,
                value,
                deleted,
            },
        );
    }

    /// Place every parked element whose gap `inserted` just closed,
    /// cascading through chains of parked descendants.
    fn flush_pending(&mut self, inserted: Timestamp) {
        let mut ready = vec![inserted];
        while let Some(pred) = ready.pop() {
            let Some(children) = self.pending.remove(&pred) else {
                continue;
            };
            for (id, value) in children {
                self.place(id.clone(), Some(pred.clone()), value);
                ready.push(id);
            }
        }
    }

    fn is_parked(&self, id: &Timestamp) -> bool {
        self.pending
            .values()
            .any(|queued| queued.iter().any(|(parked, _)| parked == id))
    }

    fn apply_delete(&mut self, id: &Timestamp) -> bool {
        if let Some(pos) = self.position_of(id) {
            if self.elements[pos].deleted {
                return false;
            }
            self.elements[pos].deleted = true;
            return true;
        }
        // Target still parked: remember the tombstone for placement time.
        if self.is_parked(id) {
            return self.deferred_deletes.insert(id.clone());
        }
        false
    }

    fn position_of(&self, id: &Timestamp) -> Option<usize> {
        self.elements.iter().position(|el| &el.id == id)
    }

    fn visible_ids(&self) -> impl Iterator<Item = &Timestamp> {
        self.elements
            .iter()
            .filter(|el| !el.deleted)
            .map(|el| &el.id)
    }

    /// Visible values in document order.
    pub fn values(&self) -> Vec<&T> {
        self.elements
            .iter()
            .filter(|el| !el.deleted)
            .map(|el| &el.value)
            .collect()
    }

    /// Identity of the element at a visible index.
    pub fn id_at(&self, index: usize) -> Option<&Timestamp> {
        self.visible_ids().nth(index)
    }

    /// Visible length.
    pub fn len(&self) -> usize {
        self.elements.iter().filter(|el| !el.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// All slots including tombstones, in document order.
    pub fn elements(&self) -> &[RgaElement<T>] {
        &self.elements
    }
}

impl<T: Clone + PartialEq> Crdt for Rga<T> {
    fn merge(&mut self, other: &Self) {
        // Replay the other replica's inserts through the same placement
        // logic remote applies use, then union tombstones. The other
        // side's parked elements and deferred deletes are replayed too;
        // our copy may already hold the predecessors they are waiting on.
        for el in &other.elements {
            self.apply_insert(el.id.clone(), el.origin.clone(), el.value.clone());
        }
        for (pred, children) in &other.pending {
            for (id, value) in children {
                self.apply_insert(id.clone(), Some(pred.clone()), value.clone());
            }
        }
        for el in &other.elements {
            if el.deleted {
                self.apply_delete(&el.id);
            }
        }
        for id in &other.deferred_deletes {
            self.apply_delete(id);
        }
        self.clock.merge(&other.clock);
    }
}
