//! Presence: ephemeral per-connection state.
//!
//! DESIGN
//! ======
//! Presence never touches the document. The server keeps one roster per
//! room; connection ids are small integers allocated lowest-free, so ids
//! are reused after a disconnect. A freshly joined entry always starts
//! with no cursor: a reconnect under any id can never show a stale cursor.
//! Clients keep a mirror of the roster built from `presence:*` pushes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type ConnectionId = u32;

/// Display palette for peer cursors, picked by `connection_id % len`.
pub const PRESENCE_PALETTE: [&str; 5] = ["#dc2626", "#d97706", "#059669", "#2563eb", "#db2777"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub connection_id: ConnectionId,
    #[serde(default)]
    pub cursor: Option<Cursor>,
}

impl Presence {
    #[must_use]
    pub fn new(connection_id: ConnectionId) -> Self {
        Self { connection_id, cursor: None }
    }

    #[must_use]
    pub fn color(&self) -> &'static str {
        PRESENCE_PALETTE[self.connection_id as usize % PRESENCE_PALETTE.len()]
    }

    #[must_use]
    pub fn label(&self) -> String {
        format!("User {}", self.connection_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceRoster {
    entries: BTreeMap<ConnectionId, Presence>,
}

impl PresenceRoster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the lowest free connection id and register it with no cursor.
    pub fn join(&mut self) -> ConnectionId {
        let mut id: ConnectionId = 1;
        for taken in self.entries.keys() {
            if *taken != id {
                break;
            }
            id += 1;
        }
        self.entries.insert(id, Presence::new(id));
        id
    }

    /// Move a registered connection's cursor. Unknown ids are ignored.
    pub fn update(&mut self, connection_id: ConnectionId, cursor: Option<Cursor>) -> Option<&Presence> {
        let entry = self.entries.get_mut(&connection_id)?;
        entry.cursor = cursor;
        Some(&*entry)
    }

    /// Insert or replace an entry as reported by the server.
    pub fn upsert(&mut self, presence: Presence) {
        self.entries.insert(presence.connection_id, presence);
    }

    pub fn leave(&mut self, connection_id: ConnectionId) -> Option<Presence> {
        self.entries.remove(&connection_id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn get(&self, connection_id: ConnectionId) -> Option<&Presence> {
        self.entries.get(&connection_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Everyone except `me`, keyed by connection id.
    #[must_use]
    pub fn others(&self, me: ConnectionId) -> BTreeMap<ConnectionId, Presence> {
        self.entries
            .iter()
            .filter(|(id, _)| **id != me)
            .map(|(id, p)| (*id, p.clone()))
            .collect()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<Presence> {
        self.entries.values().cloned().collect()
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
