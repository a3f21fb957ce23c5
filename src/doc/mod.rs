//! Document engine: replicated board state and everything derived from it.
//!
//! ARCHITECTURE
//! ============
//! Leaves first:
//! - `entity`   node/edge value types and their flat field shape
//! - `change`   the change-batch sum type and its JSON decoding
//! - `reducer`  pure batch application to one collection
//! - `overlay`  local-only selection state
//! - `replica`  convergent record collection (Lamport LWW per field)
//! - `document` the four collections and materialized snapshots
//! - `store`    the write path: reducer, selection strip, diff to ops
//! - `diff`     roadmap report between current and future
//! - `presence` per-connection cursors and connection id allocation
//!
//! Nothing in here does I/O. The server hub and the client session both
//! drive these types; only they know about transports and persistence.

pub mod change;
pub mod diff;
pub mod document;
pub mod entity;
pub mod overlay;
pub mod presence;
pub mod reducer;
pub mod replica;
pub mod store;

pub use change::{Change, ChangeError, parse_batch};
pub use diff::{CategoryGroup, ChangeKind, DiffOptions, RoadmapItem, RoadmapReport, diff_scenes};
pub use document::{DocOp, DocumentSnapshot, DocumentState, Scene, SharedSnapshot, Variant, parse_ops};
pub use entity::{CollectionKind, Edge, Entity, EntityId, NodeData, Node, NodeKind, Position, Size};
pub use overlay::Selection;
pub use presence::{ConnectionId, Cursor, Presence, PresenceRoster};
pub use replica::{Clock, ReplicaOp, ReplicatedCollection, Stamp};
pub use store::DocumentStore;
