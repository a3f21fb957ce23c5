//! Room session: the client side of one room.
//!
//! DESIGN
//! ======
//! A `RoomSession` owns everything a client holds for a room: the local
//! replica store, the selection overlay, a mirror of peer presence, and the
//! link to the hub. There is no process-wide state; two sessions in one
//! process are two independent clients.
//!
//! Writes are applied locally first, then the stamped ops are queued to the
//! hub without waiting. Remote frames are handled when the owner calls
//! [`RoomSession::next_remote`] or [`RoomSession::poll_remote`], so a
//! session is single-threaded and cooperative.
//!
//! ERROR HANDLING
//! ==============
//! Denied entry fails `enter` and no session exists. A lost link does not
//! fail anything: the session goes degraded, keeps its last snapshot and
//! keeps accepting local edits. `reconnect` replaces local state with the
//! authoritative snapshot, so edits made while offline may be discarded.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::doc::{
    Change, ConnectionId, Cursor, DiffOptions, DocOp, DocumentState, DocumentStore, Edge, Node, Presence,
    PresenceRoster, RoadmapReport, Selection, SharedSnapshot, Variant, diff_scenes, parse_batch, parse_ops,
};
use crate::frame::{
    Data, ErrorCode, FRAME_MESSAGE, Frame, SYSCALL_DOC_OPS, SYSCALL_PART, SYSCALL_PRESENCE_CURSOR,
    SYSCALL_PRESENCE_LEAVE, SYSCALL_PRESENCE_UPDATE, SYSCALL_SNAPSHOT, Status,
};
use crate::services::access::Principal;
use crate::services::room::RoomError;
use crate::transport::{RoomLink, RoomTransport};

const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Peers by connection id, never including this session.
pub type PeerMap = BTreeMap<ConnectionId, Presence>;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not authorized for room {0}")]
    AuthorizationDenied(String),
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
}

impl ErrorCode for SessionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::AuthorizationDenied(_) => "E_AUTHORIZATION_DENIED",
            Self::TransportUnavailable(_) => "E_TRANSPORT_UNAVAILABLE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::TransportUnavailable(_))
    }
}

impl From<RoomError> for SessionError {
    fn from(err: RoomError) -> Self {
        match err {
            RoomError::AuthorizationDenied(room_id) => Self::AuthorizationDenied(room_id),
            other => Self::TransportUnavailable(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How long `enter` waits for the initial snapshot.
    pub join_timeout: Duration,
    pub diff: DiffOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { join_timeout: DEFAULT_JOIN_TIMEOUT, diff: DiffOptions::default() }
    }
}

impl SessionOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self { join_timeout: config.join_timeout, diff: config.diff.clone() }
    }
}

/// Which variant the local view edits by default. Never replicated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ViewMode {
    #[default]
    Current,
    Future,
}

impl ViewMode {
    #[must_use]
    pub fn variant(self) -> Variant {
        match self {
            Self::Current => Variant::Current,
            Self::Future => Variant::Future,
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

pub struct RoomSession {
    room_id: String,
    principal: Principal,
    transport: Arc<dyn RoomTransport>,
    options: SessionOptions,
    /// `None` while degraded or after leave.
    link: Option<RoomLink>,
    connection_id: Option<ConnectionId>,
    store: DocumentStore,
    selection: Selection,
    peers: PresenceRoster,
    peers_tx: watch::Sender<PeerMap>,
    view: ViewMode,
    /// Next snapshot replaces local state instead of merging into it.
    resync: bool,
}

impl RoomSession {
    /// Connect to a room and wait (bounded) for its snapshot.
    ///
    /// If the snapshot does not arrive within the join timeout the session
    /// starts empty and reconciles once it does.
    ///
    /// # Errors
    ///
    /// `AuthorizationDenied` if the principal may not enter,
    /// `TransportUnavailable` if no link could be established.
    pub async fn enter(
        transport: Arc<dyn RoomTransport>,
        room_id: impl Into<String>,
        principal: Principal,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let room_id = room_id.into();
        let link = transport.connect(&room_id, &principal).await?;
        let (peers_tx, _) = watch::channel(PeerMap::new());

        let mut session = Self {
            room_id,
            principal,
            transport,
            options,
            connection_id: Some(link.connection_id),
            link: Some(link),
            store: DocumentStore::new(Uuid::new_v4()),
            selection: Selection::new(),
            peers: PresenceRoster::new(),
            peers_tx,
            view: ViewMode::default(),
            resync: false,
        };
        session.await_snapshot().await;
        info!(room_id = %session.room_id, connection_id = ?session.connection_id, "session: entered room");
        Ok(session)
    }

    /// Part the room. Nothing is sent after this.
    pub fn leave(mut self) {
        if let Some(link) = self.link.take() {
            let part = Frame::request(SYSCALL_PART, Data::new()).with_room_id(self.room_id.clone());
            // EDGE: a closed link already parted on the hub side.
            let _ = link.outbound.send(part);
        }
        info!(room_id = %self.room_id, "session: left room");
    }

    /// Drop the current link and resync from a fresh authoritative snapshot.
    ///
    /// # Errors
    ///
    /// Same as [`RoomSession::enter`]; the session stays degraded on error.
    pub async fn reconnect(&mut self) -> Result<(), SessionError> {
        self.link = None;
        let link = self.transport.connect(&self.room_id, &self.principal).await?;
        self.connection_id = Some(link.connection_id);
        self.link = Some(link);
        self.resync = true;
        self.await_snapshot().await;
        info!(room_id = %self.room_id, connection_id = ?self.connection_id, "session: reconnected");
        Ok(())
    }

    /// Treat the link as lost. Local state is kept; peers are forgotten.
    pub fn mark_degraded(&mut self) {
        if self.link.take().is_some() {
            warn!(room_id = %self.room_id, "session: transport lost; working offline until reconnect");
        }
        self.peers.clear();
        self.publish_peers();
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    #[must_use]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.link.is_none()
    }

    #[must_use]
    pub fn document(&self) -> &DocumentState {
        self.store.state()
    }

    #[must_use]
    pub fn snapshot(&self) -> SharedSnapshot {
        self.store.snapshot()
    }

    /// Materialized snapshots, local and remote changes alike.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SharedSnapshot> {
        self.store.subscribe()
    }

    /// Live peer presence, excluding this session.
    #[must_use]
    pub fn subscribe_presence(&self) -> watch::Receiver<PeerMap> {
        self.peers_tx.subscribe()
    }

    #[must_use]
    pub fn peers(&self) -> PeerMap {
        self.peers_tx.borrow().clone()
    }

    #[must_use]
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    #[must_use]
    pub fn view_mode(&self) -> ViewMode {
        self.view
    }

    pub fn set_view_mode(&mut self, view: ViewMode) {
        self.view = view;
    }

    /// Nodes of the active view with `selected` joined in from the overlay.
    #[must_use]
    pub fn rendered_nodes(&self) -> Vec<Node> {
        self.selection.render(&self.snapshot().scene(self.view.variant()).nodes)
    }

    #[must_use]
    pub fn rendered_edges(&self) -> Vec<Edge> {
        self.selection.render(&self.snapshot().scene(self.view.variant()).edges)
    }

    /// Roadmap between the local `current` and `future` node sets.
    #[must_use]
    pub fn roadmap(&self) -> RoadmapReport {
        let snapshot = self.snapshot();
        diff_scenes(&snapshot.current.nodes, &snapshot.future.nodes, &self.options.diff)
    }

    // =========================================================================
    // LOCAL WRITES
    // =========================================================================

    pub fn apply_node_changes(&mut self, variant: Variant, batch: &[Change<Node>]) {
        let structural = self.selection.absorb(batch);
        let ops = self.store.apply_node_changes(variant, &structural);
        self.send_ops(ops);
    }

    pub fn apply_edge_changes(&mut self, variant: Variant, batch: &[Change<Edge>]) {
        let structural = self.selection.absorb(batch);
        let ops = self.store.apply_edge_changes(variant, &structural);
        self.send_ops(ops);
    }

    /// Node changes against the variant the view mode points at.
    pub fn apply_view_changes(&mut self, batch: &[Change<Node>]) {
        self.apply_node_changes(self.view.variant(), batch);
    }

    /// Decode a raw JSON batch from UI code and apply what is valid.
    pub fn apply_raw_node_changes(&mut self, variant: Variant, raw: &[Value]) {
        let (batch, errors) = parse_batch::<Node>(raw);
        if !errors.is_empty() {
            warn!(room_id = %self.room_id, rejected = errors.len(), "session: dropped invalid changes");
        }
        self.apply_node_changes(variant, &batch);
    }

    pub fn set_nodes(&mut self, variant: Variant, nodes: Vec<Node>) {
        let ops = self.store.set_nodes(variant, nodes);
        self.send_ops(ops);
    }

    pub fn set_edges(&mut self, variant: Variant, edges: Vec<Edge>) {
        let ops = self.store.set_edges(variant, edges);
        self.send_ops(ops);
    }

    /// Remove every current node. `future` is untouched.
    pub fn clear_board(&mut self) {
        let ops = self.store.set_nodes(Variant::Current, Vec::new());
        self.selection.clear();
        self.send_ops(ops);
    }

    pub fn copy_current_to_future(&mut self) {
        let ops = self.store.copy_current_to_future();
        self.send_ops(ops);
    }

    /// Fire-and-forget cursor publish. `None` clears the cursor.
    pub fn publish_cursor(&mut self, cursor: Option<Cursor>) {
        let mut data = Data::new();
        if let Some(cursor) = cursor {
            data.insert("x".into(), serde_json::json!(cursor.x));
            data.insert("y".into(), serde_json::json!(cursor.y));
        }
        let frame = Frame::request(SYSCALL_PRESENCE_CURSOR, data).with_room_id(self.room_id.clone());
        self.send(frame);
    }

    fn send_ops(&mut self, ops: Vec<DocOp>) {
        if ops.is_empty() {
            return;
        }
        let mut data = Data::new();
        data.insert("ops".into(), serde_json::to_value(&ops).unwrap_or_default());
        let frame = Frame::request(SYSCALL_DOC_OPS, data).with_room_id(self.room_id.clone());
        self.send(frame);
    }

    fn send(&mut self, frame: Frame) {
        let Some(link) = &self.link else {
            debug!(room_id = %self.room_id, syscall = %frame.syscall, "session: offline; not sent");
            return;
        };
        if link.outbound.send(frame).is_err() {
            self.mark_degraded();
        }
    }

    // =========================================================================
    // REMOTE FRAMES
    // =========================================================================

    /// Wait for and handle one remote frame. `false` once the link is gone.
    pub async fn next_remote(&mut self) -> bool {
        let Some(frame) = self.recv_frame().await else {
            return false;
        };
        self.handle_frame(frame);
        true
    }

    /// Handle every frame already queued, without waiting.
    pub fn poll_remote(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let Some(link) = self.link.as_mut() else {
                break;
            };
            match link.inbound.try_recv() {
                Ok(frame) => {
                    self.handle_frame(frame);
                    handled += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.mark_degraded();
                    break;
                }
            }
        }
        handled
    }

    /// Apply one frame pushed by the hub.
    pub fn handle_frame(&mut self, frame: Frame) {
        if frame.status != Status::Request {
            if frame.status == Status::Error {
                let message = frame.data.get(FRAME_MESSAGE).and_then(Value::as_str).unwrap_or("-");
                warn!(room_id = %self.room_id, syscall = %frame.syscall, message, "session: hub reported error");
            }
            return;
        }

        match frame.syscall.as_str() {
            SYSCALL_SNAPSHOT => self.on_snapshot(&frame),
            SYSCALL_DOC_OPS => self.on_ops(&frame),
            SYSCALL_PRESENCE_UPDATE => self.on_presence_update(&frame),
            SYSCALL_PRESENCE_LEAVE => self.on_presence_leave(&frame),
            other => debug!(syscall = other, "session: ignoring frame"),
        }
    }

    async fn await_snapshot(&mut self) {
        let limit = self.options.join_timeout;
        let wait = async {
            while let Some(frame) = self.recv_frame().await {
                let is_snapshot = frame.syscall == SYSCALL_SNAPSHOT;
                self.handle_frame(frame);
                if is_snapshot {
                    return;
                }
            }
        };
        if timeout(limit, wait).await.is_err() {
            warn!(room_id = %self.room_id, timeout = ?limit, "session: no snapshot yet; starting empty");
        }
    }

    async fn recv_frame(&mut self) -> Option<Frame> {
        let link = self.link.as_mut()?;
        let frame = link.inbound.recv().await;
        if frame.is_none() {
            self.mark_degraded();
        }
        frame
    }

    fn on_snapshot(&mut self, frame: &Frame) {
        let Some(document) = frame
            .data
            .get("document")
            .and_then(|v| serde_json::from_value::<DocumentState>(v.clone()).ok())
        else {
            warn!(room_id = %self.room_id, "session: snapshot without a document");
            return;
        };
        if let Some(connection_id) = connection_id_of(frame) {
            self.connection_id = Some(connection_id);
        }

        // PHASE: RECONCILE DOCUMENT
        // WHY: a first snapshot merges with anything edited while waiting; a
        // resync snapshot is authoritative.
        if std::mem::take(&mut self.resync) {
            self.store.reset(document);
        } else {
            self.store.merge_state(&document);
        }

        // PHASE: REBUILD PEER MIRROR
        let peers: Vec<Presence> = frame
            .data
            .get("peers")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        self.peers.clear();
        for presence in peers {
            if Some(presence.connection_id) != self.connection_id {
                self.peers.upsert(presence);
            }
        }
        self.publish_peers();
    }

    fn on_ops(&mut self, frame: &Frame) {
        let (ops, errors) = parse_ops(frame.data.get("ops").unwrap_or(&Value::Null));
        if !errors.is_empty() {
            warn!(room_id = %self.room_id, rejected = errors.len(), "session: dropped invalid remote ops");
        }
        self.store.merge_remote(&ops);
    }

    fn on_presence_update(&mut self, frame: &Frame) {
        let Some(connection_id) = connection_id_of(frame) else {
            return;
        };
        if Some(connection_id) == self.connection_id {
            return;
        }
        let cursor = frame
            .data
            .get("cursor")
            .and_then(|v| serde_json::from_value::<Cursor>(v.clone()).ok());
        self.peers.upsert(Presence { connection_id, cursor });
        self.publish_peers();
    }

    fn on_presence_leave(&mut self, frame: &Frame) {
        if let Some(connection_id) = connection_id_of(frame) {
            if self.peers.leave(connection_id).is_some() {
                self.publish_peers();
            }
        }
    }

    fn publish_peers(&self) {
        let next: PeerMap = self.peers.entries().into_iter().map(|p| (p.connection_id, p)).collect();
        self.peers_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

fn connection_id_of(frame: &Frame) -> Option<ConnectionId> {
    frame
        .data
        .get("connection_id")
        .and_then(Value::as_u64)
        .and_then(|id| ConnectionId::try_from(id).ok())
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
