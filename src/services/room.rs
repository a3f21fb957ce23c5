//! Room service: join/part, op acceptance, presence, and fan-out.
//!
//! DESIGN
//! ======
//! A room is hydrated from the snapshot store on first join and kept in
//! memory while any client is connected. Joining is gated by the access
//! collaborator. The joiner's `room:snapshot` frame is queued while the
//! room lock is held and before the joiner is registered for fan-out, so
//! it always precedes any relayed op on that client's channel.
//!
//! Fan-out never blocks on a slow client:
//! - `Reliable` frames (document ops, presence leave) that do not fit in a
//!   client's channel drop that client from fan-out. Its connection then
//!   closes and the client resynchronizes from a fresh snapshot.
//! - `BestEffort` frames (cursor moves) are simply dropped for full channels.
//!
//! A dropped client keeps its connection id until its connection parts, so
//! the id is never handed to someone else while the old owner is alive.
//!
//! ERROR HANDLING
//! ==============
//! On last-client part, a dirty room is flushed before eviction. If that
//! flush fails, the room is kept in memory with its dirty flag intact so
//! the persistence task can retry instead of losing edits.

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, info, warn};

use crate::doc::{ConnectionId, Cursor, DocOp, DocumentState, Presence, RoadmapReport, diff_scenes};
use crate::frame::{Data, ErrorCode, Frame, SYSCALL_PRESENCE_LEAVE, SYSCALL_PRESENCE_UPDATE, SYSCALL_SNAPSHOT};
use crate::services::access::{AccessError, Principal};
use crate::services::persistence::{SnapshotError, clear_if_unchanged};
use crate::state::{AppState, RoomState};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Must arrive; a client that cannot take it is dropped from fan-out.
    Reliable,
    /// May be dropped under pressure.
    BestEffort,
}

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("not authorized for room {0}")]
    AuthorizationDenied(String),
    #[error("room not loaded: {0}")]
    NotLoaded(String),
    #[error("client channel unavailable")]
    ClientUnavailable,
    #[error("access check failed: {0}")]
    Access(#[from] AccessError),
    #[error("snapshot load failed: {0}")]
    Snapshot(#[from] SnapshotError),
}

impl ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::AuthorizationDenied(_) => "E_AUTHORIZATION_DENIED",
            Self::NotLoaded(_) => "E_ROOM_NOT_LOADED",
            Self::ClientUnavailable => "E_CLIENT_UNAVAILABLE",
            Self::Access(_) => "E_ACCESS",
            Self::Snapshot(_) => "E_SNAPSHOT",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::ClientUnavailable | Self::Access(_) | Self::Snapshot(_))
    }
}

/// What a joiner receives: its connection id, the replica, and the peers
/// already present.
#[derive(Debug, Clone)]
pub struct Joined {
    pub connection_id: ConnectionId,
    pub document: DocumentState,
    pub peers: Vec<Presence>,
}

impl Joined {
    #[must_use]
    pub fn to_data(&self) -> Data {
        let mut data = Data::new();
        data.insert("connection_id".into(), serde_json::json!(self.connection_id));
        data.insert("document".into(), serde_json::to_value(&self.document).unwrap_or_default());
        data.insert("peers".into(), serde_json::to_value(&self.peers).unwrap_or_default());
        data
    }
}

// =============================================================================
// JOIN / PART
// =============================================================================

/// Join a room. Hydrates from the snapshot store if not already in memory.
///
/// # Errors
///
/// `AuthorizationDenied` if the principal may not enter, `Access` or
/// `Snapshot` if a collaborator fails, `ClientUnavailable` if the client's
/// channel cannot take the initial snapshot.
pub async fn join_room(
    state: &AppState,
    room_id: &str,
    principal: &Principal,
    tx: mpsc::Sender<Frame>,
) -> Result<Joined, RoomError> {
    let role = state.access.role(room_id, principal).await?;
    if !role.can_enter() {
        info!(%room_id, principal = %principal.id, "room join denied");
        return Err(RoomError::AuthorizationDenied(room_id.to_string()));
    }

    // PHASE: HYDRATE
    // WHY: the "already live" decision is made under the same write lock
    // that attaches the client, so a concurrent eviction cannot leave us
    // with an unhydrated room. Loading happens outside the lock; merging a
    // snapshot twice is harmless.
    let mut hydration = None;
    let mut attempted_load = false;
    let mut rooms = loop {
        let rooms = state.rooms.write().await;
        if attempted_load || rooms.contains_key(room_id) {
            break rooms;
        }
        drop(rooms);
        hydration = state.snapshots.load(room_id).await?;
        attempted_load = true;
    };
    let room = rooms.entry(room_id.to_string()).or_insert_with(RoomState::new);
    if let Some(document) = hydration {
        room.document.merge(&document);
        info!(%room_id, nodes = room.document.nodes.live_len(), "hydrated room from snapshot");
    }

    let connection_id = room.presence.join();
    let joined = Joined {
        connection_id,
        document: room.document.clone(),
        peers: room.presence.others(connection_id).into_values().collect(),
    };

    let snapshot = Frame::request(SYSCALL_SNAPSHOT, joined.to_data()).with_room_id(room_id);
    if tx.try_send(snapshot).is_err() {
        room.presence.leave(connection_id);
        if room.clients.is_empty() && !room.dirty {
            rooms.remove(room_id);
        }
        return Err(RoomError::ClientUnavailable);
    }
    room.clients.insert(connection_id, tx);
    info!(%room_id, connection_id, principal = %principal.id, clients = room.clients.len(), "client joined room");

    let update = presence_frame(room_id, SYSCALL_PRESENCE_UPDATE, &Presence::new(connection_id));
    fan_out(room_id, room, &update, Some(connection_id), Delivery::Reliable);

    Ok(joined)
}

/// Leave a room. Removes the client and its presence. If it was the last
/// client, flushes a dirty replica and evicts the room from memory.
pub async fn part_room(state: &AppState, room_id: &str, connection_id: ConnectionId) {
    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get_mut(room_id) else {
        return;
    };

    room.clients.remove(&connection_id);
    if room.presence.leave(connection_id).is_some() {
        let mut data = Data::new();
        data.insert("connection_id".into(), serde_json::json!(connection_id));
        let leave = Frame::request(SYSCALL_PRESENCE_LEAVE, data).with_room_id(room_id);
        fan_out(room_id, room, &leave, None, Delivery::Reliable);
    }
    info!(%room_id, connection_id, remaining = room.clients.len(), "client left room");

    if !room.clients.is_empty() {
        return;
    }

    // PHASE: HANDLE CLEAN EVICTION FAST PATH
    // WHY: avoid unnecessary I/O when the room has no pending edits.
    if !room.dirty {
        rooms.remove(room_id);
        info!(%room_id, "evicted room from memory");
        return;
    }

    // PHASE: SNAPSHOT FOR FINAL FLUSH
    // WHY: perform I/O outside the lock and keep the dirty flag until the
    // write has actually succeeded.
    let document = room.document.clone();
    let version = room.version;
    drop(rooms);
    let flush_result = state.snapshots.save(room_id, &document).await;

    // PHASE: ACK OR RETAIN
    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get_mut(room_id) else {
        return;
    };
    if !room.clients.is_empty() {
        return;
    }

    match flush_result {
        Ok(()) => {
            clear_if_unchanged(room, version);
            if room.dirty {
                warn!(%room_id, "retaining room after final flush because newer edits exist");
            } else {
                rooms.remove(room_id);
                info!(%room_id, "evicted room from memory");
            }
        }
        Err(e) => {
            error!(error = %e, %room_id, "final flush failed; room retained for retry");
        }
    }
}

// =============================================================================
// DOCUMENT + PRESENCE
// =============================================================================

/// Merge accepted ops into the authoritative replica and mark it dirty.
///
/// # Errors
///
/// `NotLoaded` if no client holds the room open.
pub async fn apply_ops(state: &AppState, room_id: &str, ops: &[DocOp]) -> Result<(), RoomError> {
    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get_mut(room_id) else {
        return Err(RoomError::NotLoaded(room_id.to_string()));
    };
    if ops.is_empty() {
        return Ok(());
    }
    for op in ops {
        room.document.apply(op);
    }
    room.dirty = true;
    room.version += 1;
    Ok(())
}

/// Record a cursor move. `None` if the connection is not in the room.
pub async fn update_cursor(
    state: &AppState,
    room_id: &str,
    connection_id: ConnectionId,
    cursor: Option<Cursor>,
) -> Option<Presence> {
    let mut rooms = state.rooms.write().await;
    let room = rooms.get_mut(room_id)?;
    room.presence.update(connection_id, cursor).cloned()
}

/// Roadmap report computed from the authoritative replica.
///
/// # Errors
///
/// `NotLoaded` if the room is not in memory.
pub async fn roadmap(state: &AppState, room_id: &str) -> Result<RoadmapReport, RoomError> {
    let rooms = state.rooms.read().await;
    let Some(room) = rooms.get(room_id) else {
        return Err(RoomError::NotLoaded(room_id.to_string()));
    };
    let snapshot = room.document.snapshot();
    Ok(diff_scenes(&snapshot.current.nodes, &snapshot.future.nodes, &state.config.diff))
}

/// Presence entries of everyone currently in a room.
pub async fn list_peers(state: &AppState, room_id: &str) -> Vec<Presence> {
    let rooms = state.rooms.read().await;
    rooms
        .get(room_id)
        .map(|room| room.presence.entries())
        .unwrap_or_default()
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Broadcast a frame to all clients in a room, optionally excluding one.
pub async fn broadcast(
    state: &AppState,
    room_id: &str,
    frame: &Frame,
    exclude: Option<ConnectionId>,
    delivery: Delivery,
) {
    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get_mut(room_id) else {
        return;
    };
    fan_out(room_id, room, frame, exclude, delivery);
}

fn fan_out(room_id: &str, room: &mut RoomState, frame: &Frame, exclude: Option<ConnectionId>, delivery: Delivery) {
    let mut dropped = Vec::new();
    for (connection_id, tx) in &room.clients {
        if exclude == Some(*connection_id) {
            continue;
        }
        match tx.try_send(frame.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) if delivery == Delivery::BestEffort => {}
            Err(TrySendError::Full(_) | TrySendError::Closed(_)) => dropped.push(*connection_id),
        }
    }
    for connection_id in dropped {
        room.clients.remove(&connection_id);
        warn!(%room_id, connection_id, syscall = %frame.syscall, "client dropped from fan-out; it must resync");
    }
}

/// Frame announcing one presence entry.
#[must_use]
pub fn presence_frame(room_id: &str, syscall: &str, presence: &Presence) -> Frame {
    let mut data = Data::new();
    data.insert("connection_id".into(), serde_json::json!(presence.connection_id));
    data.insert("cursor".into(), serde_json::to_value(presence.cursor).unwrap_or_default());
    Frame::request(syscall, data).with_room_id(room_id)
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
