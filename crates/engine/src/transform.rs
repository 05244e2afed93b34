//! Operational transform and operation composition
//!
//! Secondary conflict layer for structured scene operations that are not
//! merged field-by-field by a CRDT. [`transform`] rewrites one operation so
//! it can be applied after another concurrent operation on the same entity;
//! [`compose`]/[`optimize`] collapse same-client operation chains to shrink
//! logs before persistence or transmission.

use serde_json::{Map, Value};

use scenesync_protocol::{CustomData, Operation, Payload};

/// Union of two property bags; `overlay` wins on key collisions.
fn merged_properties(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut out = base.clone();
    for (key, value) in overlay {
        out.insert(key.clone(), value.clone());
    }
    out
}

/// Downgrade an operation to a no-op record, keeping its identity.
fn downgrade(mut op: Operation, against: &Operation) -> Operation {
    op.payload = Payload::Custom(CustomData {
        original_type: Some(op.payload.type_name().to_string()),
        target: op.payload.target().map(|(_, key)| key.to_string()),
        note: Some("target deleted concurrently".to_string()),
    });
    op.transformed_against.push(against.id.clone());
    op
}

/// Transform `op_a` so it is safe to apply after `op_b`.
///
/// Only pairs from different clients targeting the same entity interact;
/// a single client's own operations are causally ordered by construction,
/// so same-client pairs come back untouched.
pub fn transform(op_a: &Operation, op_b: &Operation) -> Operation {
    if op_a.client_id == op_b.client_id {
        return op_a.clone();
    }
    let (Some(target_a), Some(target_b)) = (op_a.target(), op_b.target()) else {
        return op_a.clone();
    };
    if target_a != target_b {
        return op_a.clone();
    }

    // Delete dominates: anything applied after a delete of its target
    // becomes a recorded no-op rather than being discarded.
    if op_b.payload.is_delete() {
        return downgrade(op_a.clone(), op_b);
    }

    let (kind, entity_id) = target_a;
    let mut out = op_a.clone();

    match (op_a.payload.properties(), op_b.payload.properties()) {
        // An update landing after the create it races with folds into a
        // single create carrying the union; the update's fields win.
        (Some(update_props), Some(create_props))
            if op_a.payload.is_update() && op_b.payload.is_create() =>
        {
            let properties = merged_properties(create_props, update_props);
            if let Some(payload) = Payload::create(kind, entity_id, properties) {
                out.payload = payload;
            }
        }
        // The mirror image: a create racing an already-applied update also
        // folds into one create, the update's fields still winning.
        (Some(create_props), Some(update_props))
            if op_a.payload.is_create() && op_b.payload.is_update() =>
        {
            let properties = merged_properties(create_props, update_props);
            if let Some(payload) = Payload::create(kind, entity_id, properties) {
                out.payload = payload;
            }
        }
        // Concurrent updates merge, op_a's fields taking precedence.
        (Some(props_a), Some(props_b))
            if op_a.payload.is_update() && op_b.payload.is_update() =>
        {
            let properties = merged_properties(props_b, props_a);
            if let Some(payload) = Payload::update(kind, entity_id, properties) {
                out.payload = payload;
            }
        }
        // Moves, transforms and the remaining pairs keep op_a's intent;
        // only the fact that a transform occurred is recorded.
        _ => {}
    }

    out.transformed_against.push(op_b.id.clone());
    out
}

/// Compose two *sequential* operations from the same client on the same
/// target into one, or `None` when the pair does not collapse.
pub fn compose(op_a: &Operation, op_b: &Operation) -> Option<Operation> {
    if op_a.client_id != op_b.client_id {
        return None;
    }
    let (target_a, target_b) = (op_a.target()?, op_b.target()?);
    if target_a != target_b {
        return None;
    }
    let (kind, entity_id) = target_a;

    // The later operation's envelope carries the composite, so downstream
    // LWW comparisons see the later timestamp.
    let mut out = op_b.clone();

    if op_b.payload.is_delete() {
        // Everything before a delete of the same target is moot.
        return Some(out);
    }

    match (&op_a.payload, &op_b.payload) {
        _ if op_a.payload.is_create() && op_b.payload.is_update() => {
            let properties = merged_properties(
                op_a.payload.properties()?,
                op_b.payload.properties()?,
            );
            out.payload = Payload::create(kind, entity_id, properties)?;
            Some(out)
        }
        _ if op_a.payload.is_update() && op_b.payload.is_update() => {
            let properties = merged_properties(
                op_a.payload.properties()?,
                op_b.payload.properties()?,
            );
            out.payload = Payload::update(kind, entity_id, properties)?;
            Some(out)
        }
        // A later move/transform/property write supersedes an earlier one
        // of the same shape outright.
        (Payload::ObjectMove(_), Payload::ObjectMove(_))
        | (Payload::ObjectTransform(_), Payload::ObjectTransform(_))
        | (Payload::PropertySet(_), Payload::PropertySet(_)) => Some(out),
        _ => None,
    }
}

/// Compact an operation log: group by `(client, target)`, sort each group
/// by counter, compose greedily left-to-right, and return the survivors in
/// timestamp order.
pub fn optimize(ops: &[Operation]) -> Vec<Operation> {
    use std::collections::BTreeMap;

    let mut groups: BTreeMap<(String, scenesync_protocol::EntityKind, String), Vec<&Operation>> =
        BTreeMap::new();
    let mut passthrough: Vec<Operation> = Vec::new();

    for op in ops {
        match op.target() {
            Some((kind, key)) => groups
                .entry((op.client_id.clone(), kind, key.to_string()))
                .or_default()
                .push(op),
            None => passthrough.push(op.clone()),
        }
    }

    let mut out = passthrough;
    for (_, mut group) in groups {
        group.sort_by_key(|op| op.timestamp.clone());
        let mut acc = group[0].clone();
        for op in &group[1..] {
            match compose(&acc, op) {
                Some(composed) => acc = composed,
                None => {
                    out.push(acc);
                    acc = (*op).clone();
                }
            }
        }
        out.push(acc);
    }

    out.sort_by_key(|op| op.timestamp.clone());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenesync_protocol::{
        EntityProps, EntityRef, MoveData, Position, Timestamp, VectorClock,
    };
    use serde_json::json;

    fn props(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn op(client: &str, counter: u64, payload: Payload) -> Operation {
        let mut clock = VectorClock::new();
        clock.observe(client, counter);
        Operation::new(payload, Timestamp::new(counter, client), clock)
    }

    fn create(client: &str, counter: u64, id: &str, properties: Map<String, Value>) -> Operation {
        op(
            client,
            counter,
            Payload::ObjectCreate(EntityProps {
                id: id.into(),
                properties,
            }),
        )
    }

    fn update(client: &str, counter: u64, id: &str, properties: Map<String, Value>) -> Operation {
        op(
            client,
            counter,
            Payload::ObjectUpdate(EntityProps {
                id: id.into(),
                properties,
            }),
        )
    }

    fn delete(client: &str, counter: u64, id: &str) -> Operation {
        op(client, counter, Payload::ObjectDelete(EntityRef { id: id.into() }))
    }

    #[test]
    fn delete_downgrades_to_custom_noop() {
        let upd = update("a", 2, "cube", props(&[("color", json!("red"))]));
        let del = delete("b", 2, "cube");

        let transformed = transform(&upd, &del);
        let Payload::Custom(record) = &transformed.payload else {
            panic!("expected custom no-op, got {:?}", transformed.payload);
        };
        assert_eq!(record.original_type.as_deref(), Some("object.update"));
        assert_eq!(record.target.as_deref(), Some("cube"));
        // Identity is preserved, and the transform is recorded.
        assert_eq!(transformed.id, upd.id);
        assert_eq!(transformed.transformed_against, vec![del.id]);
    }

    #[test]
    fn update_after_create_becomes_create_with_union() {
        let upd = update("a", 3, "cube", props(&[("color", json!("blue"))]));
        let crt = create(
            "b",
            3,
            "cube",
            props(&[("color", json!("red")), ("size", json!(2))]),
        );

        let transformed = transform(&upd, &crt);
        assert!(transformed.payload.is_create());
        let properties = transformed.payload.properties().unwrap();
        // Update's fields win the collision; create's other fields survive.
        assert_eq!(properties["color"], json!("blue"));
        assert_eq!(properties["size"], json!(2));
    }

    #[test]
    fn create_after_update_also_folds_to_create() {
        let crt = create("a", 3, "cube", props(&[("color", json!("red"))]));
        let upd = update("b", 3, "cube", props(&[("color", json!("blue"))]));

        let transformed = transform(&crt, &upd);
        assert!(transformed.payload.is_create());
        let properties = transformed.payload.properties().unwrap();
        assert_eq!(properties["color"], json!("blue"));
    }

    #[test]
    fn concurrent_updates_merge_with_op_a_precedence() {
        let a = update("a", 4, "cube", props(&[("color", json!("blue"))]));
        let b = update(
            "b",
            4,
            "cube",
            props(&[("color", json!("red")), ("label", json!("box"))]),
        );

        let transformed = transform(&a, &b);
        let properties = transformed.payload.properties().unwrap();
        assert_eq!(properties["color"], json!("blue"));
        assert_eq!(properties["label"], json!("box"));
    }

    #[test]
    fn moves_keep_intent_and_record_transform() {
        let mv_a = op(
            "a",
            5,
            Payload::ObjectMove(MoveData {
                id: "cube".into(),
                position: Position { x: 1.0, y: 0.0, z: 0.0 },
            }),
        );
        let mv_b = op(
            "b",
            5,
            Payload::ObjectMove(MoveData {
                id: "cube".into(),
                position: Position { x: 9.0, y: 0.0, z: 0.0 },
            }),
        );

        let transformed = transform(&mv_a, &mv_b);
        assert_eq!(transformed.payload, mv_a.payload);
        assert_eq!(transformed.transformed_against, vec![mv_b.id]);
    }

    #[test]
    fn same_client_pairs_never_interact() {
        let a = update("a", 1, "cube", props(&[("x", json!(1))]));
        let b = delete("a", 2, "cube");
        let transformed = transform(&a, &b);
        assert_eq!(transformed, a);
    }

    #[test]
    fn compose_create_update() {
        let crt = create("a", 1, "cube", props(&[("color", json!("red"))]));
        let upd = update("a", 2, "cube", props(&[("size", json!(3))]));

        let composed = compose(&crt, &upd).unwrap();
        assert!(composed.payload.is_create());
        let properties = composed.payload.properties().unwrap();
        assert_eq!(properties["color"], json!("red"));
        assert_eq!(properties["size"], json!(3));
        // The later envelope carries the composite.
        assert_eq!(composed.id, upd.id);
    }

    #[test]
    fn compose_refuses_cross_client_pairs() {
        let crt = create("a", 1, "cube", props(&[]));
        let upd = update("b", 2, "cube", props(&[]));
        assert!(compose(&crt, &upd).is_none());
    }

    #[test]
    fn optimize_collapses_per_target_chains() {
        let ops = vec![
            create("a", 1, "cube", props(&[("color", json!("red"))])),
            update("a", 2, "cube", props(&[("size", json!(1))])),
            update("a", 3, "cube", props(&[("size", json!(2))])),
            create("a", 4, "sphere", props(&[])),
        ];

        let optimized = optimize(&ops);
        assert_eq!(optimized.len(), 2);
        assert!(optimized.iter().all(|op| op.payload.is_create()));

        let cube = optimized
            .iter()
            .find(|op| op.target().unwrap().1 == "cube")
            .unwrap();
        let properties = cube.payload.properties().unwrap();
        assert_eq!(properties["color"], json!("red"));
        assert_eq!(properties["size"], json!(2));
    }
}
