//! Conflict detection and pluggable resolution strategies
//!
//! When two concurrent operations target the same entity, one side has to
//! lose deterministically. Detection is causal: a pair conflicts iff the
//! operations come from different clients and neither emitter had observed
//! the other's operation. Resolution picks the survivor per strategy.

use std::fmt;
use std::sync::Arc;

use scenesync_protocol::{EntityKind, Operation, Payload};

/// Caller-supplied resolution function: given both sides, return the
/// operation to keep.
pub type CustomResolver = Arc<dyn Fn(&Operation, &Operation) -> Operation + Send + Sync>;

/// How to pick a survivor among concurrent edits of one entity.
#[derive(Clone)]
pub enum ResolutionStrategy {
    /// Highest `(counter, client_id)` wins.
    LastWriteWins,
    /// Lowest `(counter, client_id)` wins.
    FirstWriteWins,
    /// Shallow field union; the later operand wins key collisions. Falls
    /// back to last-write-wins for payloads without property bags.
    Merge,
    Custom(CustomResolver),
}

impl fmt::Debug for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LastWriteWins => write!(f, "LastWriteWins"),
            Self::FirstWriteWins => write!(f, "FirstWriteWins"),
            Self::Merge => write!(f, "Merge"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// A detected pair of concurrent operations on one entity.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub target: (EntityKind, String),
    pub op_a: Operation,
    pub op_b: Operation,
}

/// True when neither emitter had observed the other's operation.
fn concurrent(a: &Operation, b: &Operation) -> bool {
    a.vector_clock.get(&b.client_id) < b.counter()
        && b.vector_clock.get(&a.client_id) < a.counter()
}

/// Applies a [`ResolutionStrategy`] to concurrent operation pairs.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    strategy: ResolutionStrategy,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ResolutionStrategy::LastWriteWins)
    }
}

impl ConflictResolver {
    pub fn new(strategy: ResolutionStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &ResolutionStrategy {
        &self.strategy
    }

    /// Group operations by target entity and flag every concurrent
    /// cross-client pair. Same-client pairs are never conflicts: a single
    /// client's stream is causally ordered by its own counter.
    pub fn detect(&self, ops: &[Operation]) -> Vec<Conflict> {
        use std::collections::BTreeMap;

        let mut by_target: BTreeMap<(EntityKind, String), Vec<&Operation>> = BTreeMap::new();
        for op in ops {
            if let Some((kind, key)) = op.target() {
                by_target
                    .entry((kind, key.to_string()))
                    .or_default()
                    .push(op);
            }
        }

        let mut conflicts = Vec::new();
        for (target, group) in by_target {
            for (i, op_a) in group.iter().enumerate() {
                for op_b in &group[i + 1..] {
                    if op_a.client_id != op_b.client_id && concurrent(op_a, op_b) {
                        conflicts.push(Conflict {
                            target: target.clone(),
                            op_a: (*op_a).clone(),
                            op_b: (*op_b).clone(),
                        });
                    }
                }
            }
        }
        conflicts
    }

    /// Pick the survivor of a conflicting pair.
    pub fn resolve(&self, conflict: &Conflict) -> Operation {
        let (earlier, later) = if conflict.op_a.timestamp <= conflict.op_b.timestamp {
            (&conflict.op_a, &conflict.op_b)
        } else {
            (&conflict.op_b, &conflict.op_a)
        };

        match &self.strategy {
            ResolutionStrategy::LastWriteWins => later.clone(),
            ResolutionStrategy::FirstWriteWins => earlier.clone(),
            ResolutionStrategy::Merge => Self::merge_pair(earlier, later),
            ResolutionStrategy::Custom(resolve) => resolve(&conflict.op_a, &conflict.op_b),
        }
    }

    fn merge_pair(earlier: &Operation, later: &Operation) -> Operation {
        let (Some(earlier_props), Some(later_props)) =
            (earlier.payload.properties(), later.payload.properties())
        else {
            return later.clone();
        };
        let Some((kind, entity_id)) = later.target() else {
            return later.clone();
        };

        let mut properties = earlier_props.clone();
        for (key, value) in later_props {
            properties.insert(key.clone(), value.clone());
        }

        let mut merged = later.clone();
        let payload = if earlier.payload.is_create() || later.payload.is_create() {
            Payload::create(kind, entity_id, properties)
        } else {
            Payload::update(kind, entity_id, properties)
        };
        if let Some(payload) = payload {
            merged.payload = payload;
        }
        merged
    }

    /// Resolve every detected conflict by discarding the losing side.
    /// Operations already discarded by an earlier pair are skipped so
    /// transitively related conflicts are not re-resolved.
    pub fn resolve_all(&self, ops: &[Operation]) -> Vec<Operation> {
        use std::collections::HashSet;

        let mut discarded: HashSet<String> = HashSet::new();
        for conflict in self.detect(ops) {
            if discarded.contains(&conflict.op_a.id) || discarded.contains(&conflict.op_b.id) {
                continue;
            }
            let winner = self.resolve(&conflict);
            let loser = if winner.id == conflict.op_a.id {
                &conflict.op_b
            } else {
                &conflict.op_a
            };
            discarded.insert(loser.id.clone());
        }

        ops.iter()
            .filter(|op| !discarded.contains(&op.id))
            .cloned()
            .collect()
    }
}
