//! Change batches: the input language of the reducer.
//!
//! DESIGN
//! ======
//! A change is a tagged sum type keyed by `type`, matched exhaustively by
//! the reducer and the selection overlay. Batches arrive from UI code as
//! raw JSON arrays; [`parse_batch`] decodes them one entry at a time so a
//! single malformed entry never poisons the rest of the batch.
//!
//! ERROR HANDLING
//! ==============
//! Unknown change kinds are ignored (logged at debug). Known kinds with a
//! bad shape are dropped and reported as [`ChangeError::InvalidOperation`];
//! callers log them and carry on. Nothing here fails the whole batch.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::entity::{EntityId, NodeData, Position, Size};
use crate::frame::ErrorCode;

/// Every `type` tag the reducer understands.
pub const CHANGE_KINDS: &[&str] = &["move", "resize", "remove", "add", "connect", "select", "data"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change<E> {
    Move { id: EntityId, position: Position },
    Resize { id: EntityId, size: Size },
    Remove { id: EntityId },
    Add { item: E },
    Connect { source: EntityId, target: EntityId },
    /// Local-only. Routed to the selection overlay, never to the replica.
    Select { id: EntityId, selected: bool },
    /// Merge keys into a node's data; a null value deletes the key.
    Data { id: EntityId, data: NodeData },
}

impl<E> Change<E> {
    /// Selection changes are the only non-structural kind.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        !matches!(self, Self::Select { .. })
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Move { .. } => "move",
            Self::Resize { .. } => "resize",
            Self::Remove { .. } => "remove",
            Self::Add { .. } => "add",
            Self::Connect { .. } => "connect",
            Self::Select { .. } => "select",
            Self::Data { .. } => "data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChangeError {
    #[error("invalid operation at index {index}: {reason}")]
    InvalidOperation { index: usize, reason: String },
}

impl ErrorCode for ChangeError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidOperation { .. } => "E_INVALID_OPERATION",
        }
    }
}

/// Decode a raw JSON batch. Returns the decoded changes in order plus one
/// error per rejected entry.
pub fn parse_batch<E: DeserializeOwned>(raw: &[Value]) -> (Vec<Change<E>>, Vec<ChangeError>) {
    let mut changes = Vec::with_capacity(raw.len());
    let mut errors = Vec::new();

    for (index, entry) in raw.iter().enumerate() {
        let Some(kind) = entry.get("type").and_then(Value::as_str) else {
            warn!(index, "change rejected: missing type");
            errors.push(ChangeError::InvalidOperation { index, reason: "missing type".into() });
            continue;
        };
        if !CHANGE_KINDS.contains(&kind) {
            debug!(index, kind, "ignoring unknown change kind");
            continue;
        }
        match serde_json::from_value::<Change<E>>(entry.clone()) {
            Ok(change) => changes.push(change),
            Err(e) => {
                warn!(index, kind, error = %e, "change rejected: malformed");
                errors.push(ChangeError::InvalidOperation { index, reason: e.to_string() });
            }
        }
    }

    (changes, errors)
}

// =============================================================================
// TESTS
// =============================================================================
