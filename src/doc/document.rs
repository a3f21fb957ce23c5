//! The replicated document: four independent collections.
//!
//! `current` and `future` are structurally identical variants, each with a
//! node and an edge collection. Every collection has its own id space; a
//! node and its future counterpart share an id so the roadmap diff can
//! correlate them. Ops are addressed to one collection by [`DocOp`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::change::ChangeError;
use super::entity::{CollectionKind, Edge, Entity, Node};
use super::replica::{ReplicaOp, ReplicatedCollection, Stamp};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Current,
    Future,
}

/// A replica op addressed to one collection of one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocOp {
    pub variant: Variant,
    pub collection: CollectionKind,
    pub op: ReplicaOp,
}

impl DocOp {
    /// Fields the op writes that are not part of its collection's schema.
    #[must_use]
    pub fn foreign_fields(&self) -> Vec<&str> {
        self.op
            .field_names()
            .filter(|name| !self.collection.accepts_field(name))
            .collect()
    }
}

/// Full replicated state. This is what is persisted and sent on join.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState {
    #[serde(default)]
    pub nodes: ReplicatedCollection,
    #[serde(default)]
    pub edges: ReplicatedCollection,
    #[serde(default)]
    pub future_nodes: ReplicatedCollection,
    #[serde(default)]
    pub future_edges: ReplicatedCollection,
}

impl DocumentState {
    #[must_use]
    pub fn collection(&self, variant: Variant, kind: CollectionKind) -> &ReplicatedCollection {
        match (variant, kind) {
            (Variant::Current, CollectionKind::Nodes) => &self.nodes,
            (Variant::Current, CollectionKind::Edges) => &self.edges,
            (Variant::Future, CollectionKind::Nodes) => &self.future_nodes,
            (Variant::Future, CollectionKind::Edges) => &self.future_edges,
        }
    }

    pub fn collection_mut(&mut self, variant: Variant, kind: CollectionKind) -> &mut ReplicatedCollection {
        match (variant, kind) {
            (Variant::Current, CollectionKind::Nodes) => &mut self.nodes,
            (Variant::Current, CollectionKind::Edges) => &mut self.edges,
            (Variant::Future, CollectionKind::Nodes) => &mut self.future_nodes,
            (Variant::Future, CollectionKind::Edges) => &mut self.future_edges,
        }
    }

    /// Live entities of one collection, in insertion order.
    #[must_use]
    pub fn entities<E: Entity>(&self, variant: Variant) -> Vec<E> {
        self.collection(variant, E::COLLECTION).materialize()
    }

    /// Apply one op. Fields outside the collection schema never land.
    pub fn apply(&mut self, op: &DocOp) {
        let foreign = op.foreign_fields();
        if foreign.is_empty() {
            self.collection_mut(op.variant, op.collection).apply(&op.op);
            return;
        }

        warn!(id = op.op.id(), fields = ?foreign, "stripping non-replicated fields from doc op");
        let kind = op.collection;
        let mut inner = op.op.clone();
        inner.retain_fields(|name| kind.accepts_field(name));
        self.collection_mut(op.variant, kind).apply(&inner);
    }

    /// Merge another replica, stripping its non-replicated fields first.
    pub fn merge(&mut self, other: &DocumentState) {
        let mut other = other.clone();
        other.sanitize();
        self.nodes.merge(&other.nodes);
        self.edges.merge(&other.edges);
        self.future_nodes.merge(&other.future_nodes);
        self.future_edges.merge(&other.future_edges);
    }

    /// Drop every field register outside its collection schema. Returns how
    /// many were dropped.
    pub fn sanitize(&mut self) -> usize {
        let dropped: usize = [
            (&mut self.nodes, CollectionKind::Nodes),
            (&mut self.edges, CollectionKind::Edges),
            (&mut self.future_nodes, CollectionKind::Nodes),
            (&mut self.future_edges, CollectionKind::Edges),
        ]
        .into_iter()
        .map(|(collection, kind)| collection.retain_fields(|name| kind.accepts_field(name)))
        .sum();
        if dropped > 0 {
            warn!(dropped, "stripped non-replicated fields from document state");
        }
        dropped
    }

    #[must_use]
    pub fn max_stamp(&self) -> Option<Stamp> {
        [&self.nodes, &self.edges, &self.future_nodes, &self.future_edges]
            .into_iter()
            .filter_map(ReplicatedCollection::max_stamp)
            .max()
    }

    #[must_use]
    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            current: Scene { nodes: self.entities(Variant::Current), edges: self.entities(Variant::Current) },
            future: Scene { nodes: self.entities(Variant::Future), edges: self.entities(Variant::Future) },
        }
    }
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// Materialized entities of one variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// What subscribers observe: both variants, fully materialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub current: Scene,
    pub future: Scene,
}

impl DocumentSnapshot {
    #[must_use]
    pub fn scene(&self, variant: Variant) -> &Scene {
        match variant {
            Variant::Current => &self.current,
            Variant::Future => &self.future,
        }
    }
}

pub type SharedSnapshot = Arc<DocumentSnapshot>;

// =============================================================================
// WIRE DECODING
// =============================================================================

/// Decode a JSON array of doc ops, keeping the good ones.
pub fn parse_ops(raw: &Value) -> (Vec<DocOp>, Vec<ChangeError>) {
    let Some(entries) = raw.as_array() else {
        return (Vec::new(), vec![ChangeError::InvalidOperation { index: 0, reason: "ops must be an array".into() }]);
    };

    let mut ops = Vec::with_capacity(entries.len());
    let mut errors = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        match serde_json::from_value::<DocOp>(entry.clone()) {
            Ok(op) => {
                let foreign = op.foreign_fields().join(", ");
                if foreign.is_empty() {
                    ops.push(op);
                } else {
                    let reason = format!("non-replicated fields: {foreign}");
                    warn!(index, %reason, "doc op rejected");
                    errors.push(ChangeError::InvalidOperation { index, reason });
                }
            }
            Err(e) => {
                warn!(index, error = %e, "doc op rejected: malformed");
                errors.push(ChangeError::InvalidOperation { index, reason: e.to_string() });
            }
        }
    }
    (ops, errors)
}
