//! Operation envelope and typed payloads
//!
//! Every mutation travels as an [`Operation`]: a globally unique id derived
//! from `(client_id, counter)`, the origin timestamp, a full snapshot of the
//! emitting client's vector clock, and a tagged [`Payload`]. The payload is
//! a sum type keyed by the wire `type` string so dispatch is exhaustive;
//! the serialized shape stays `{id, type, clientId, timestamp, vectorClock,
//! data, transformedAgainst?}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::{ClientId, Timestamp, VectorClock};

/// Which scene map an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    Object,
    Annotation,
    Measurement,
    Property,
}

/// A 3D position used by move operations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Decomposed spatial transform carried by `object.transform`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TransformData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<Position>,
}

/// Entity id plus an open property bag (create/update payloads).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityProps {
    pub id: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// Entity id only (delete payloads).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: String,
}

/// Move payload: entity id and its new position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveData {
    pub id: String,
    pub position: Position,
}

/// Transform payload: entity id and the applied transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformOp {
    pub id: String,
    pub transform: TransformData,
}

/// Scene-level property write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyData {
    pub key: String,
    pub value: Value,
}

/// Scene-level property removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRef {
    pub key: String,
}

/// Record left behind when a transform downgrades an operation to a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CustomData {
    /// Type string of the operation before the downgrade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_type: Option<String>,
    /// Entity the original operation targeted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Tagged operation payload.
///
/// Adjacent tagging keeps the wire form `{"type": ..., "data": {...}}`
/// that clients already speak, while giving each variant strongly typed
/// fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    #[serde(rename = "object.create")]
    ObjectCreate(EntityProps),
    #[serde(rename = "object.update")]
    ObjectUpdate(EntityProps),
    #[serde(rename = "object.delete")]
    ObjectDelete(EntityRef),
    #[serde(rename = "object.move")]
    ObjectMove(MoveData),
    #[serde(rename = "object.transform")]
    ObjectTransform(TransformOp),

    #[serde(rename = "annotation.create")]
    AnnotationCreate(EntityProps),
    #[serde(rename = "annotation.update")]
    AnnotationUpdate(EntityProps),
    #[serde(rename = "annotation.delete")]
    AnnotationDelete(EntityRef),

    #[serde(rename = "measurement.create")]
    MeasurementCreate(EntityProps),
    #[serde(rename = "measurement.update")]
    MeasurementUpdate(EntityProps),
    #[serde(rename = "measurement.delete")]
    MeasurementDelete(EntityRef),

    #[serde(rename = "scene.set-property")]
    PropertySet(PropertyData),
    #[serde(rename = "scene.delete-property")]
    PropertyDelete(PropertyRef),

    /// No-op carrier, produced when a transform downgrades an operation
    /// whose target was concurrently deleted.
    #[serde(rename = "custom")]
    Custom(CustomData),
}

impl Payload {
    /// The wire `type` string for this payload.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ObjectCreate(_) => "object.create",
            Self::ObjectUpdate(_) => "object.update",
            Self::ObjectDelete(_) => "object.delete",
            Self::ObjectMove(_) => "object.move",
            Self::ObjectTransform(_) => "object.transform",
            Self::AnnotationCreate(_) => "annotation.create",
            Self::AnnotationUpdate(_) => "annotation.update",
            Self::AnnotationDelete(_) => "annotation.delete",
            Self::MeasurementCreate(_) => "measurement.create",
            Self::MeasurementUpdate(_) => "measurement.update",
            Self::MeasurementDelete(_) => "measurement.delete",
            Self::PropertySet(_) => "scene.set-property",
            Self::PropertyDelete(_) => "scene.delete-property",
            Self::Custom(_) => "custom",
        }
    }

    /// The `(map, key)` pair this payload targets, if any.
    ///
    /// `Custom` no-ops have no live target and never participate in
    /// dispatch or conflict grouping.
    pub fn target(&self) -> Option<(EntityKind, &str)> {
        match self {
            Self::ObjectCreate(p) | Self::ObjectUpdate(p) => Some((EntityKind::Object, &p.id)),
            Self::ObjectDelete(r) => Some((EntityKind::Object, &r.id)),
            Self::ObjectMove(m) => Some((EntityKind::Object, &m.id)),
            Self::ObjectTransform(t) => Some((EntityKind::Object, &t.id)),
            Self::AnnotationCreate(p) | Self::AnnotationUpdate(p) => {
                Some((EntityKind::Annotation, &p.id))
            }
            Self::AnnotationDelete(r) => Some((EntityKind::Annotation, &r.id)),
            Self::MeasurementCreate(p) | Self::MeasurementUpdate(p) => {
                Some((EntityKind::Measurement, &p.id))
            }
            Self::MeasurementDelete(r) => Some((EntityKind::Measurement, &r.id)),
            Self::PropertySet(p) => Some((EntityKind::Property, &p.key)),
            Self::PropertyDelete(r) => Some((EntityKind::Property, &r.key)),
            Self::Custom(_) => None,
        }
    }

    /// The open property bag, for create/update payloads.
    pub fn properties(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::ObjectCreate(p)
            | Self::ObjectUpdate(p)
            | Self::AnnotationCreate(p)
            | Self::AnnotationUpdate(p)
            | Self::MeasurementCreate(p)
            | Self::MeasurementUpdate(p) => Some(&p.properties),
            _ => None,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(
            self,
            Self::ObjectCreate(_) | Self::AnnotationCreate(_) | Self::MeasurementCreate(_)
        )
    }

    pub fn is_update(&self) -> bool {
        matches!(
            self,
            Self::ObjectUpdate(_) | Self::AnnotationUpdate(_) | Self::MeasurementUpdate(_)
        )
    }

    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            Self::ObjectDelete(_)
                | Self::AnnotationDelete(_)
                | Self::MeasurementDelete(_)
                | Self::PropertyDelete(_)
        )
    }

    /// Build a create payload for an entity map.
    ///
    /// Returns `None` for [`EntityKind::Property`], which has no create
    /// form (scene properties are plain key/value writes).
    pub fn create(kind: EntityKind, id: impl Into<String>, properties: Map<String, Value>) -> Option<Self> {
        let props = EntityProps {
            id: id.into(),
            properties,
        };
        match kind {
            EntityKind::Object => Some(Self::ObjectCreate(props)),
            EntityKind::Annotation => Some(Self::AnnotationCreate(props)),
            EntityKind::Measurement => Some(Self::MeasurementCreate(props)),
            EntityKind::Property => None,
        }
    }

    /// Build an update payload for an entity map (see [`Payload::create`]).
    pub fn update(kind: EntityKind, id: impl Into<String>, properties: Map<String, Value>) -> Option<Self> {
        let props = EntityProps {
            id: id.into(),
            properties,
        };
        match kind {
            EntityKind::Object => Some(Self::ObjectUpdate(props)),
            EntityKind::Annotation => Some(Self::AnnotationUpdate(props)),
            EntityKind::Measurement => Some(Self::MeasurementUpdate(props)),
            EntityKind::Property => None,
        }
    }
}

/// A single replicated mutation, ready for broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Globally unique under the assumption a client never reuses a counter.
    pub id: String,
    #[serde(flatten)]
    pub payload: Payload,
    pub client_id: ClientId,
    pub timestamp: Timestamp,
    /// Snapshot of the emitting client's clock at creation time.
    pub vector_clock: VectorClock,
    /// Ids of operations this one has been transformed against.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transformed_against: Vec<String>,
}

impl Operation {
    /// Build an operation from an origin timestamp and clock snapshot.
    pub fn new(payload: Payload, timestamp: Timestamp, vector_clock: VectorClock) -> Self {
        Self {
            id: timestamp.op_id(),
            client_id: timestamp.client_id.clone(),
            payload,
            timestamp,
            vector_clock,
            transformed_against: Vec::new(),
        }
    }

    /// The `(map, key)` pair this operation targets, if any.
    pub fn target(&self) -> Option<(EntityKind, &str)> {
        self.payload.target()
    }

    /// Origin counter, the primary LWW sort key.
    pub fn counter(&self) -> u64 {
        self.timestamp.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_op() -> Operation {
        let mut vc = VectorClock::new();
        vc.observe("alice", 3);
        Operation::new(
            Payload::ObjectCreate(EntityProps {
                id: "cube-1".into(),
                properties: [("color".to_string(), json!("red"))].into_iter().collect(),
            }),
            Timestamp::new(3, "alice"),
            vc,
        )
    }

    #[test]
    fn id_derives_from_client_and_counter() {
        let op = sample_op();
        assert_eq!(op.id, "alice-3");
        assert_eq!(op.client_id, "alice");
    }

    #[test]
    fn wire_shape_matches_protocol() {
        let op = sample_op();
        let json = serde_json::to_value(&op).unwrap();

        assert_eq!(json["id"], "alice-3");
        assert_eq!(json["type"], "object.create");
        assert_eq!(json["clientId"], "alice");
        assert_eq!(json["timestamp"]["counter"], 3);
        assert_eq!(json["vectorClock"]["alice"], 3);
        assert_eq!(json["data"]["id"], "cube-1");
        assert_eq!(json["data"]["properties"]["color"], "red");
        // Empty transformedAgainst is omitted entirely.
        assert!(json.get("transformedAgainst").is_none());

        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn target_resolves_kind_and_key() {
        let op = sample_op();
        assert_eq!(op.target(), Some((EntityKind::Object, "cube-1")));

        let del = Payload::AnnotationDelete(EntityRef { id: "note-9".into() });
        assert_eq!(del.target(), Some((EntityKind::Annotation, "note-9")));
        assert!(del.is_delete());

        let noop = Payload::Custom(CustomData::default());
        assert_eq!(noop.target(), None);
    }

    #[test]
    fn unknown_type_fails_deserialization() {
        let raw = json!({
            "id": "a-1",
            "type": "object.explode",
            "clientId": "a",
            "timestamp": {"counter": 1, "clientId": "a"},
            "vectorClock": {"a": 1},
            "data": {"id": "x"}
        });
        assert!(serde_json::from_value::<Operation>(raw).is_err());
    }
}
