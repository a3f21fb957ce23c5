//! Node and edge value types.
//!
//! DESIGN
//! ======
//! Entities are plain values. The replica never stores them directly; it
//! stores a flat field map produced by [`Entity::to_fields`], one LWW
//! register per field, and rebuilds entities with [`Entity::from_fields`]
//! at read time. Node data keys are flattened into `data.<key>` fields so
//! concurrent edits to different keys of the same node both survive.
//!
//! `selected` is a local overlay flag. It is never part of the field map
//! and never serialized, so it cannot reach the replica or the wire.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of a node or edge, unique within its own collection.
pub type EntityId = String;

/// Opaque node payload (label, category, provider, status, owner, ...).
pub type NodeData = serde_json::Map<String, Value>;

/// Flat field map: the replicated shape of one entity.
pub type Fields = BTreeMap<String, Value>;

const FIELD_TYPE: &str = "type";
const FIELD_POSITION: &str = "position";
const FIELD_SIZE: &str = "size";
const FIELD_SOURCE: &str = "source";
const FIELD_TARGET: &str = "target";
const DATA_PREFIX: &str = "data.";

// =============================================================================
// GEOMETRY
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub w: f64,
    pub h: f64,
}

// =============================================================================
// COLLECTIONS
// =============================================================================

/// Which entity collection inside a document variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Nodes,
    Edges,
}

impl CollectionKind {
    /// Whether `name` is a replicated field of this collection's entities.
    /// Local-only state such as `selected` is never one.
    #[must_use]
    pub fn accepts_field(self, name: &str) -> bool {
        match self {
            Self::Nodes => {
                matches!(name, FIELD_TYPE | FIELD_POSITION | FIELD_SIZE) || name.starts_with(DATA_PREFIX)
            }
            Self::Edges => matches!(name, FIELD_SOURCE | FIELD_TARGET),
        }
    }
}

// =============================================================================
// ENTITY TRAIT
// =============================================================================

/// Behaviour shared by nodes and edges so one reducer and one replica type
/// serve both collections.
///
/// Mutators return `true` when the entity supports the change. Entities
/// that do not (an edge has no position) keep the default `false`, and the
/// reducer treats the change as a no-op.
pub trait Entity: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: CollectionKind;

    fn id(&self) -> &str;

    fn to_fields(&self) -> Fields;

    /// Rebuild from visible fields. `None` when a required field is missing
    /// or has the wrong shape.
    fn from_fields(id: &str, fields: &Fields) -> Option<Self>;

    fn is_selected(&self) -> bool;

    fn set_selected(&mut self, selected: bool);

    fn move_to(&mut self, _position: Position) -> bool {
        false
    }

    fn resize(&mut self, _size: Size) -> bool {
        false
    }

    fn patch_data(&mut self, _patch: &NodeData) -> bool {
        false
    }

    /// Build the entity a `connect` change produces, if this kind has one.
    fn connect(_source: &str, _target: &str) -> Option<Self> {
        None
    }

    fn endpoints(&self) -> Option<(&str, &str)> {
        None
    }
}

// =============================================================================
// NODE
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    Standard,
    Annotation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: EntityId,
    #[serde(rename = "type", default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(default)]
    pub data: NodeData,
    #[serde(default, skip_serializing)]
    pub selected: bool,
}

impl Node {
    #[must_use]
    pub fn new(id: impl Into<EntityId>, kind: NodeKind, position: Position) -> Self {
        Self { id: id.into(), kind, position, size: None, data: NodeData::new(), selected: false }
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: Size) -> Self {
        self.size = Some(size);
        self
    }

    /// String value of a data key. Empty strings count as absent.
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Display label, falling back to the id.
    #[must_use]
    pub fn label(&self) -> &str {
        self.data_str("label").unwrap_or(&self.id)
    }
}

impl Entity for Node {
    const COLLECTION: CollectionKind = CollectionKind::Nodes;

    fn id(&self) -> &str {
        &self.id
    }

    fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(FIELD_TYPE.into(), serde_json::to_value(self.kind).unwrap_or(Value::Null));
        fields.insert(FIELD_POSITION.into(), serde_json::to_value(self.position).unwrap_or(Value::Null));
        fields.insert(
            FIELD_SIZE.into(),
            self.size
                .and_then(|s| serde_json::to_value(s).ok())
                .unwrap_or(Value::Null),
        );
        for (key, value) in &self.data {
            // A null data value means "no value" in a patch; never store it as data.
            if !value.is_null() {
                fields.insert(format!("{DATA_PREFIX}{key}"), value.clone());
            }
        }
        fields
    }

    fn from_fields(id: &str, fields: &Fields) -> Option<Self> {
        let kind = serde_json::from_value(fields.get(FIELD_TYPE)?.clone()).ok()?;
        let position = serde_json::from_value(fields.get(FIELD_POSITION)?.clone()).ok()?;
        let size = fields
            .get(FIELD_SIZE)
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let data = fields
            .iter()
            .filter(|(_, v)| !v.is_null())
            .filter_map(|(k, v)| k.strip_prefix(DATA_PREFIX).map(|key| (key.to_string(), v.clone())))
            .collect();
        Some(Self { id: id.to_string(), kind, position, size, data, selected: false })
    }

    fn is_selected(&self) -> bool {
        self.selected
    }

    fn set_selected(&mut self, selected: bool) {
        self.selected = selected;
    }

    fn move_to(&mut self, position: Position) -> bool {
        self.position = position;
        true
    }

    fn resize(&mut self, size: Size) -> bool {
        self.size = Some(size);
        true
    }

    fn patch_data(&mut self, patch: &NodeData) -> bool {
        for (key, value) in patch {
            if value.is_null() {
                self.data.remove(key);
            } else {
                self.data.insert(key.clone(), value.clone());
            }
        }
        true
    }
}

// =============================================================================
// EDGE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EntityId,
    pub source: EntityId,
    pub target: EntityId,
    #[serde(default, skip_serializing)]
    pub selected: bool,
}

impl Edge {
    #[must_use]
    pub fn new(id: impl Into<EntityId>, source: impl Into<EntityId>, target: impl Into<EntityId>) -> Self {
        Self { id: id.into(), source: source.into(), target: target.into(), selected: false }
    }

    /// Deterministic id for a connection, so two writers connecting the same
    /// pair produce the same edge.
    #[must_use]
    pub fn connection_id(source: &str, target: &str) -> EntityId {
        format!("edge-{source}-{target}")
    }
}

impl Entity for Edge {
    const COLLECTION: CollectionKind = CollectionKind::Edges;

    fn id(&self) -> &str {
        &self.id
    }

    fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(FIELD_SOURCE.into(), Value::String(self.source.clone()));
        fields.insert(FIELD_TARGET.into(), Value::String(self.target.clone()));
        fields
    }

    fn from_fields(id: &str, fields: &Fields) -> Option<Self> {
        let source = fields.get(FIELD_SOURCE)?.as_str()?;
        let target = fields.get(FIELD_TARGET)?.as_str()?;
        Some(Self::new(id, source, target))
    }

    fn is_selected(&self) -> bool {
        self.selected
    }

    fn set_selected(&mut self, selected: bool) {
        self.selected = selected;
    }

    fn connect(source: &str, target: &str) -> Option<Self> {
        Some(Self::new(Self::connection_id(source, target), source, target))
    }

    fn endpoints(&self) -> Option<(&str, &str)> {
        Some((&self.source, &self.target))
    }
}

#[cfg(test)]
#[path = "entity_test.rs"]
mod tests;
