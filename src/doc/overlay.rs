//! Local selection overlay.
//!
//! Selection is per-client state. It is kept beside the replica, never in
//! it: a mixed batch is split by [`Selection::absorb`], which keeps the
//! `select` changes and hands back the structural remainder. Rendering is a
//! read-time join of replicated entities with the selected id set.

use std::collections::BTreeSet;

use super::change::Change;
use super::entity::{Entity, EntityId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    ids: BTreeSet<EntityId>,
}

impl Selection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&mut self, id: impl Into<EntityId>) {
        self.ids.insert(id.into());
    }

    pub fn deselect(&mut self, id: &str) {
        self.ids.remove(id);
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    #[must_use]
    pub fn is_selected(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Route selection state out of `batch`; return what the replica should see.
    ///
    /// `select` changes are consumed. An added item that arrives already
    /// selected is selected here and forwarded with the flag cleared.
    /// Removed ids are deselected.
    pub fn absorb<E: Entity>(&mut self, batch: &[Change<E>]) -> Vec<Change<E>> {
        let mut structural = Vec::with_capacity(batch.len());
        for change in batch {
            match change {
                Change::Select { id, selected: true } => self.select(id.clone()),
                Change::Select { id, selected: false } => self.deselect(id),
                Change::Add { item } if item.is_selected() => {
                    self.select(item.id());
                    let mut item = item.clone();
                    item.set_selected(false);
                    structural.push(Change::Add { item });
                }
                Change::Remove { id } => {
                    self.deselect(id);
                    structural.push(change.clone());
                }
                _ => structural.push(change.clone()),
            }
        }
        structural
    }

    /// Join `items` with this selection for display.
    #[must_use]
    pub fn render<E: Entity>(&self, items: &[E]) -> Vec<E> {
        items
            .iter()
            .cloned()
            .map(|mut item| {
                let selected = self.is_selected(item.id());
                item.set_selected(selected);
                item
            })
            .collect()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::entity::{Node, NodeKind, Position};

    fn node(id: &str) -> Node {
        Node::new(id, NodeKind::Standard, Position::default())
    }

    #[test]
    fn select_deselect_clear() {
        let mut selection = Selection::new();
        selection.select("a");
        selection.select("b");
        assert!(selection.is_selected("a"));
        selection.deselect("a");
        assert!(!selection.is_selected("a"));
        assert_eq!(selection.len(), 1);
        selection.clear();
        assert!(selection.is_empty());
    }

    #[test]
    fn absorb_splits_mixed_batch() {
        let mut selection = Selection::new();
        let batch: Vec<Change<Node>> = vec![
            Change::Select { id: "a".into(), selected: true },
            Change::Move { id: "a".into(), position: Position::new(1.0, 1.0) },
            Change::Select { id: "b".into(), selected: true },
            Change::Select { id: "b".into(), selected: false },
        ];
        let rest = selection.absorb(&batch);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].kind(), "move");
        assert_eq!(selection.ids().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn absorb_of_selection_only_batch_is_empty() {
        let mut selection = Selection::new();
        let batch: Vec<Change<Node>> = vec![Change::Select { id: "a".into(), selected: true }];
        assert!(selection.absorb(&batch).is_empty());
    }

    #[test]
    fn absorb_strips_selected_flag_from_added_items() {
        let mut selection = Selection::new();
        let mut item = node("n1");
        item.selected = true;
        let rest = selection.absorb(&[Change::Add { item }]);
        let Some(Change::Add { item }) = rest.first() else {
            panic!("add should be forwarded");
        };
        assert!(!item.selected);
        assert!(selection.is_selected("n1"));
    }

    #[test]
    fn absorb_deselects_removed_ids() {
        let mut selection = Selection::new();
        selection.select("a");
        let rest = selection.absorb::<Node>(&[Change::Remove { id: "a".into() }]);
        assert_eq!(rest.len(), 1);
        assert!(!selection.is_selected("a"));
    }

    #[test]
    fn render_joins_selection_at_read_time() {
        let mut selection = Selection::new();
        selection.select("b");
        let items = vec![node("a"), node("b")];
        let rendered = selection.render(&items);
        assert!(!rendered[0].selected);
        assert!(rendered[1].selected);
        assert!(!items[1].selected);
    }
}
