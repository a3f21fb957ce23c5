//! Convergent replicated collection.
//!
//! DESIGN
//! ======
//! A collection is a map of records keyed by entity id. Each record holds:
//! - `created`: stamp of the latest insert
//! - `removed`: stamp of the latest remove
//! - one last-writer-wins register per field
//!
//! Stamps are Lamport clocks `(counter, writer)`, totally ordered. Every
//! merge is a per-component max, so applying ops or merging whole states
//! commutes, associates, and is idempotent: replicas that have seen the
//! same ops hold the same state regardless of delivery order.
//!
//! Visibility rules at read time:
//! - a record is live iff `created > removed`; a concurrent remove
//!   therefore dominates any mutation, and a re-insert only wins with a
//!   newer stamp
//! - a field is visible iff its stamp is not older than `created`, so a
//!   re-inserted entity does not inherit fields of its earlier life
//! - live records materialize in `(created, id)` order, which keeps
//!   insertion order stable across replicas

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::entity::{Entity, EntityId, Fields};

// =============================================================================
// CLOCK
// =============================================================================

/// Lamport timestamp. Ordered by counter, ties broken by writer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub counter: u64,
    pub writer: Uuid,
}

#[derive(Debug, Clone)]
pub struct Clock {
    writer: Uuid,
    counter: u64,
}

impl Clock {
    #[must_use]
    pub fn new(writer: Uuid) -> Self {
        Self { writer, counter: 0 }
    }

    #[must_use]
    pub fn writer(&self) -> Uuid {
        self.writer
    }

    pub fn tick(&mut self) -> Stamp {
        self.counter += 1;
        Stamp { counter: self.counter, writer: self.writer }
    }

    /// Advance past a stamp seen from another writer.
    pub fn observe(&mut self, stamp: Stamp) {
        self.counter = self.counter.max(stamp.counter);
    }
}

// =============================================================================
// RECORD
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub stamp: Stamp,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<Stamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<Stamp>,
    #[serde(default)]
    pub fields: BTreeMap<String, Register>,
}

impl Record {
    fn write(&mut self, name: &str, stamp: Stamp, value: &Value) {
        match self.fields.get(name) {
            Some(existing) if existing.stamp >= stamp => {}
            _ => {
                self.fields.insert(name.to_string(), Register { stamp, value: value.clone() });
            }
        }
    }

    fn write_all(&mut self, stamp: Stamp, fields: &Fields) {
        for (name, value) in fields {
            self.write(name, stamp, value);
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        match (self.created, self.removed) {
            (Some(created), Some(removed)) => created > removed,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Fields written at or after the latest insert.
    #[must_use]
    pub fn visible_fields(&self) -> Fields {
        let Some(created) = self.created else {
            return Fields::new();
        };
        self.fields
            .iter()
            .filter(|(_, reg)| reg.stamp >= created)
            .map(|(name, reg)| (name.clone(), reg.value.clone()))
            .collect()
    }

    pub fn merge(&mut self, other: &Record) {
        self.created = self.created.max(other.created);
        self.removed = self.removed.max(other.removed);
        for (name, reg) in &other.fields {
            self.write(name, reg.stamp, &reg.value);
        }
    }

    fn max_stamp(&self) -> Option<Stamp> {
        self.fields
            .values()
            .map(|reg| reg.stamp)
            .chain(self.created)
            .chain(self.removed)
            .max()
    }
}

// =============================================================================
// OPS
// =============================================================================

/// One replicated mutation of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ReplicaOp {
    Insert { id: EntityId, stamp: Stamp, fields: Fields },
    Update { id: EntityId, stamp: Stamp, fields: Fields },
    Remove { id: EntityId, stamp: Stamp },
}

impl ReplicaOp {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Insert { id, .. } | Self::Update { id, .. } | Self::Remove { id, .. } => id,
        }
    }

    #[must_use]
    pub fn stamp(&self) -> Stamp {
        match self {
            Self::Insert { stamp, .. } | Self::Update { stamp, .. } | Self::Remove { stamp, .. } => *stamp,
        }
    }

    /// Field names this op writes. Removes write none.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        let fields = match self {
            Self::Insert { fields, .. } | Self::Update { fields, .. } => Some(fields),
            Self::Remove { .. } => None,
        };
        fields.into_iter().flat_map(|f| f.keys().map(String::as_str))
    }

    /// Drop written fields that `keep` rejects.
    pub fn retain_fields(&mut self, keep: impl Fn(&str) -> bool) {
        if let Self::Insert { fields, .. } | Self::Update { fields, .. } = self {
            fields.retain(|name, _| keep(name));
        }
    }
}

// =============================================================================
// COLLECTION
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicatedCollection {
    records: BTreeMap<EntityId, Record>,
}

impl ReplicatedCollection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, op: &ReplicaOp) {
        let record = self.records.entry(op.id().to_string()).or_default();
        match op {
            ReplicaOp::Insert { stamp, fields, .. } => {
                record.created = record.created.max(Some(*stamp));
                record.write_all(*stamp, fields);
            }
            ReplicaOp::Update { stamp, fields, .. } => record.write_all(*stamp, fields),
            ReplicaOp::Remove { stamp, .. } => {
                record.removed = record.removed.max(Some(*stamp));
            }
        }
    }

    pub fn merge(&mut self, other: &ReplicatedCollection) {
        for (id, record) in &other.records {
            self.records.entry(id.clone()).or_default().merge(record);
        }
    }

    /// Drop field registers that `keep` rejects. Returns how many went.
    pub fn retain_fields(&mut self, keep: impl Fn(&str) -> bool) -> usize {
        let mut dropped = 0;
        for record in self.records.values_mut() {
            let before = record.fields.len();
            record.fields.retain(|name, _| keep(name));
            dropped += before - record.fields.len();
        }
        dropped
    }

    #[must_use]
    pub fn is_live(&self, id: &str) -> bool {
        self.records.get(id).is_some_and(Record::is_live)
    }

    #[must_use]
    pub fn record(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    #[must_use]
    pub fn live_len(&self) -> usize {
        self.records.values().filter(|r| r.is_live()).count()
    }

    #[must_use]
    pub fn max_stamp(&self) -> Option<Stamp> {
        self.records.values().filter_map(Record::max_stamp).max()
    }

    /// Live entities in insertion order.
    #[must_use]
    pub fn materialize<E: Entity>(&self) -> Vec<E> {
        let mut live: Vec<(Stamp, &EntityId, &Record)> = self
            .records
            .iter()
            .filter_map(|(id, record)| match record.created {
                Some(created) if record.is_live() => Some((created, id, record)),
                _ => None,
            })
            .collect();
        live.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        live.into_iter()
            .filter_map(|(_, id, record)| {
                let entity = E::from_fields(id, &record.visible_fields());
                if entity.is_none() {
                    debug!(%id, "live record has incomplete fields; skipped");
                }
                entity
            })
            .collect()
    }
}

// =============================================================================
// DIFF TO OPS
// =============================================================================

/// Ops that turn `prev` into `next`, stamped from `clock`.
///
/// New ids become inserts, ids missing from `next` become removes, and ids
/// present in both become an update carrying only the changed fields (a
/// null value for each field that disappeared). Repeated ids in `next`
/// after the first are ignored.
pub fn diff_ops<E: Entity>(prev: &[E], next: &[E], clock: &mut Clock) -> Vec<ReplicaOp> {
    let before: HashMap<&str, Fields> = prev
        .iter()
        .map(|item| (item.id(), item.to_fields()))
        .collect();
    let mut seen: HashSet<&str> = HashSet::with_capacity(next.len());
    let mut ops = Vec::new();

    for item in next {
        let id = item.id();
        if !seen.insert(id) {
            debug!(%id, "duplicate id in replacement set ignored");
            continue;
        }
        let fields = item.to_fields();
        match before.get(id) {
            None => ops.push(ReplicaOp::Insert { id: id.to_string(), stamp: clock.tick(), fields }),
            Some(old) => {
                let mut changed: Fields = fields
                    .iter()
                    .filter(|(name, value)| old.get(*name) != Some(*value))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                for name in old.keys() {
                    if !fields.contains_key(name) {
                        changed.insert(name.clone(), Value::Null);
                    }
                }
                if !changed.is_empty() {
                    ops.push(ReplicaOp::Update { id: id.to_string(), stamp: clock.tick(), fields: changed });
                }
            }
        }
    }

    for item in prev {
        if !seen.contains(item.id()) {
            ops.push(ReplicaOp::Remove { id: item.id().to_string(), stamp: clock.tick() });
        }
    }

    ops
}

#[cfg(test)]
#[path = "replica_test.rs"]
mod tests;
