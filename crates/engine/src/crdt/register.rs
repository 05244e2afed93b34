//! Last-writer-wins register

use scenesync_protocol::{Timestamp, VectorClock};

use super::Crdt;

/// Single replicated value, replaced by exactly the proposal with the
/// highest `(counter, client_id)` timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LwwRegister<T> {
    clock: VectorClock,
    value: Option<T>,
    timestamp: Option<Timestamp>,
}

impl<T: Clone> LwwRegister<T> {
    pub fn new() -> Self {
        Self {
            clock: VectorClock::new(),
            value: None,
            timestamp: None,
        }
    }

    /// Local write: advance this client's counter and install the value.
    /// Returns the timestamp to broadcast alongside the value.
    pub fn set(&mut self, client_id: &str, value: T) -> Timestamp {
        let counter = self.clock.increment(client_id);
        let ts = Timestamp::new(counter, client_id);
        self.apply_set(value, ts.clone());
        ts
    }

    /// Remote write. Idempotent: re-applying the winning proposal is a
    /// no-op, and a proposal older than the current value is ignored.
    /// Returns whether the register changed.
    pub fn apply_set(&mut self, value: T, timestamp: Timestamp) -> bool {
        self.clock.observe(&timestamp.client_id, timestamp.counter);
        if Some(&timestamp) > self.timestamp.as_ref() {
            self.value = Some(value);
            self.timestamp = Some(timestamp);
            true
        } else {
            false
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn timestamp(&self) -> Option<&Timestamp> {
        self.timestamp.as_ref()
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }
}

impl<T: Clone> Crdt for LwwRegister<T> {
    fn merge(&mut self, other: &Self) {
        if let (Some(value), Some(ts)) = (&other.value, &other.timestamp) {
            self.apply_set(value.clone(), ts.clone());
        }
        self.clock.merge(&other.clock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_writes_advance_the_counter() {
        let mut reg = LwwRegister::new();
        let t1 = reg.set("a", 1);
        let t2 = reg.set("a", 2);
        assert_eq!(t1.counter, 1);
        assert_eq!(t2.counter, 2);
        assert_eq!(reg.get(), Some(&2));
    }

    #[test]
    fn higher_counter_wins() {
        let mut reg = LwwRegister::new();
        reg.apply_set("new", Timestamp::new(5, "a"));
        assert!(!reg.apply_set("old", Timestamp::new(3, "b")));
        assert_eq!(reg.get(), Some(&"new"));
    }

    #[test]
    fn equal_counters_break_on_client_id() {
        let mut reg1 = LwwRegister::new();
        reg1.apply_set(1, Timestamp::new(1, "alice"));
        reg1.apply_set(2, Timestamp::new(1, "bob"));

        let mut reg2 = LwwRegister::new();
        reg2.apply_set(2, Timestamp::new(1, "bob"));
        reg2.apply_set(1, Timestamp::new(1, "alice"));

        // Lexicographically larger client id wins on both replicas.
        assert_eq!(reg1.get(), Some(&2));
        assert_eq!(reg1, reg2);
    }

    #[test]
    fn apply_is_idempotent() {
        let mut reg = LwwRegister::new();
        assert!(reg.apply_set("x", Timestamp::new(1, "a")));
        assert!(!reg.apply_set("x", Timestamp::new(1, "a")));
        assert_eq!(reg.get(), Some(&"x"));
    }

    #[test]
    fn merge_matches_apply() {
        let mut a = LwwRegister::new();
        a.set("alice", "from-a");
        let mut b = LwwRegister::new();
        b.apply_set("from-b", Timestamp::new(2, "bob"));

        a.merge(&b);
        assert_eq!(a.get(), Some(&"from-b"));
        assert_eq!(a.clock().get("bob"), 2);
    }
}
