//! Replicated document store: the single write path into a replica.
//!
//! DESIGN
//! ======
//! The store owns one [`DocumentState`], the local Lamport clock, and a
//! `watch` channel of materialized snapshots. Local writes go:
//!
//! ```text
//! batch -> reducer (on the materialized collection) -> strip selection
//!       -> diff against previous -> stamped ops -> apply -> publish
//! ```
//!
//! and the stamped ops are returned for the caller to ship to peers.
//! Remote ops and whole remote states are merged in directly. Subscribers
//! are notified only when the materialized view actually changes, so a
//! replayed batch produces no notification.

use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use super::change::Change;
use super::document::{DocOp, DocumentSnapshot, DocumentState, SharedSnapshot, Variant};
use super::entity::{Edge, Entity, Node};
use super::reducer;
use super::replica::{Clock, diff_ops};

pub struct DocumentStore {
    state: DocumentState,
    clock: Clock,
    snapshot_tx: watch::Sender<SharedSnapshot>,
}

impl DocumentStore {
    #[must_use]
    pub fn new(writer: Uuid) -> Self {
        Self::from_state(writer, DocumentState::default())
    }

    /// Wrap an existing replica, advancing the clock past everything in it.
    #[must_use]
    pub fn from_state(writer: Uuid, state: DocumentState) -> Self {
        let mut clock = Clock::new(writer);
        if let Some(stamp) = state.max_stamp() {
            clock.observe(stamp);
        }
        let (snapshot_tx, _) = watch::channel(Arc::new(state.snapshot()));
        Self { state, clock, snapshot_tx }
    }

    #[must_use]
    pub fn writer(&self) -> Uuid {
        self.clock.writer()
    }

    #[must_use]
    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    /// Latest materialized snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SharedSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Receiver that observes every change, local or remote.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SharedSnapshot> {
        self.snapshot_tx.subscribe()
    }

    // =========================================================================
    // LOCAL WRITES
    // =========================================================================

    /// Run `batch` through the reducer against one variant.
    ///
    /// Selection changes are skipped here; callers route them to the overlay
    /// first. A batch with nothing structural writes nothing.
    pub fn apply_changes<E: Entity>(&mut self, variant: Variant, batch: &[Change<E>]) -> Vec<DocOp> {
        if !batch.iter().any(Change::is_structural) {
            return Vec::new();
        }
        let prev: Vec<E> = self.state.entities(variant);
        let next = reducer::apply_changes(&prev, batch);
        self.write(variant, &prev, next)
    }

    pub fn apply_node_changes(&mut self, variant: Variant, batch: &[Change<Node>]) -> Vec<DocOp> {
        self.apply_changes(variant, batch)
    }

    pub fn apply_edge_changes(&mut self, variant: Variant, batch: &[Change<Edge>]) -> Vec<DocOp> {
        self.apply_changes(variant, batch)
    }

    /// Replace a variant's collection wholesale. Existing ids keep their
    /// position; new ids are appended in the given order.
    pub fn set_entities<E: Entity>(&mut self, variant: Variant, items: Vec<E>) -> Vec<DocOp> {
        let prev: Vec<E> = self.state.entities(variant);
        self.write(variant, &prev, items)
    }

    pub fn set_nodes(&mut self, variant: Variant, nodes: Vec<Node>) -> Vec<DocOp> {
        self.set_entities(variant, nodes)
    }

    pub fn set_edges(&mut self, variant: Variant, edges: Vec<Edge>) -> Vec<DocOp> {
        self.set_entities(variant, edges)
    }

    /// Replace `future` with an independent copy of `current`, ids preserved.
    pub fn copy_current_to_future(&mut self) -> Vec<DocOp> {
        let nodes: Vec<Node> = self.state.entities(Variant::Current);
        let edges: Vec<Edge> = self.state.entities(Variant::Current);
        let mut ops = self.set_entities(Variant::Future, nodes);
        ops.extend(self.set_entities(Variant::Future, edges));
        ops
    }

    // =========================================================================
    // REMOTE MERGES
    // =========================================================================

    /// Apply ops produced by another writer. Returns whether the view changed.
    pub fn merge_remote(&mut self, ops: &[DocOp]) -> bool {
        for op in ops {
            self.clock.observe(op.op.stamp());
            self.state.apply(op);
        }
        self.publish()
    }

    /// Merge a whole remote replica. Returns whether the view changed.
    pub fn merge_state(&mut self, other: &DocumentState) -> bool {
        self.state.merge(other);
        if let Some(stamp) = other.max_stamp() {
            self.clock.observe(stamp);
        }
        self.publish()
    }

    /// Replace local state with an authoritative replica, discarding any
    /// writes that never reached it.
    pub fn reset(&mut self, mut state: DocumentState) -> bool {
        state.sanitize();
        if let Some(stamp) = state.max_stamp() {
            self.clock.observe(stamp);
        }
        self.state = state;
        self.publish()
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn write<E: Entity>(&mut self, variant: Variant, prev: &[E], mut next: Vec<E>) -> Vec<DocOp> {
        for item in &mut next {
            item.set_selected(false);
        }
        let ops: Vec<DocOp> = diff_ops(prev, &next, &mut self.clock)
            .into_iter()
            .map(|op| DocOp { variant, collection: E::COLLECTION, op })
            .collect();
        if ops.is_empty() {
            return ops;
        }
        for op in &ops {
            self.state.apply(op);
        }
        self.publish();
        ops
    }

    fn publish(&self) -> bool {
        let next: DocumentSnapshot = self.state.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if **current == next {
                false
            } else {
                *current = Arc::new(next);
                true
            }
        })
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
