//! Change reducer: pure application of a batch to one collection.
//!
//! DESIGN
//! ======
//! `apply_changes` clones the input into slots, applies the batch in array
//! order against an id index, and compacts the slots at the end. The input
//! is never mutated, so the caller can diff the result against it.
//!
//! - `add` with an id already present is skipped.
//! - `remove`, `move`, `resize` and `data` on a missing id are no-ops.
//! - `connect` drops self-loops and duplicate connections.
//! - `select` is ignored; selection belongs to the overlay.
//!
//! Replaying the same batch on its own output yields the same output.

use std::collections::HashMap;

use tracing::debug;

use super::change::Change;
use super::entity::Entity;

/// Apply `changes` to `items`, returning the new collection.
#[must_use]
pub fn apply_changes<E: Entity>(items: &[E], changes: &[Change<E>]) -> Vec<E> {
    let mut slots: Vec<Option<E>> = items.iter().cloned().map(Some).collect();
    let mut index: HashMap<String, usize> = items
        .iter()
        .enumerate()
        .map(|(i, item)| (item.id().to_string(), i))
        .collect();

    for change in changes {
        match change {
            Change::Move { id, position } => {
                if let Some(item) = slot_mut(&mut slots, &index, id) {
                    item.move_to(*position);
                } else {
                    debug!(%id, "move on missing entity ignored");
                }
            }
            Change::Resize { id, size } => {
                if let Some(item) = slot_mut(&mut slots, &index, id) {
                    item.resize(*size);
                } else {
                    debug!(%id, "resize on missing entity ignored");
                }
            }
            Change::Data { id, data } => {
                if let Some(item) = slot_mut(&mut slots, &index, id) {
                    item.patch_data(data);
                } else {
                    debug!(%id, "data patch on missing entity ignored");
                }
            }
            Change::Remove { id } => {
                if let Some(i) = index.remove(id) {
                    slots[i] = None;
                } else {
                    debug!(%id, "remove of missing entity ignored");
                }
            }
            Change::Add { item } => {
                if index.contains_key(item.id()) {
                    debug!(id = item.id(), "add of existing entity ignored");
                    continue;
                }
                index.insert(item.id().to_string(), slots.len());
                slots.push(Some(item.clone()));
            }
            Change::Connect { source, target } => {
                if source == target {
                    debug!(%source, "self-loop connection dropped");
                    continue;
                }
                let Some(created) = E::connect(source, target) else {
                    continue;
                };
                let duplicate = index.contains_key(created.id())
                    || slots
                        .iter()
                        .flatten()
                        .any(|existing| existing.endpoints() == Some((source.as_str(), target.as_str())));
                if duplicate {
                    debug!(%source, %target, "duplicate connection ignored");
                    continue;
                }
                index.insert(created.id().to_string(), slots.len());
                slots.push(Some(created));
            }
            Change::Select { .. } => {}
        }
    }

    slots.into_iter().flatten().collect()
}

fn slot_mut<'a, E>(slots: &'a mut [Option<E>], index: &HashMap<String, usize>, id: &str) -> Option<&'a mut E> {
    let i = *index.get(id)?;
    slots.get_mut(i)?.as_mut()
}

#[cfg(test)]
#[path = "reducer_test.rs"]
mod tests;
