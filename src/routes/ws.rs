//! WebSocket handler: bidirectional frame relay.
//!
//! DESIGN
//! ======
//! On upgrade, the connection enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Frames pushed by the room hub → forward to client
//!
//! Handler functions are pure business logic. They validate, mutate state,
//! and return an `Outcome`. The dispatch layer owns all outbound concerns:
//! reply to sender and fan-out to peers. The same dispatch serves the
//! in-process transport, so both paths behave identically.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade with `?user=<id>[&email=<addr>]`
//! 2. `room:join` → hub queues `room:snapshot` on the room channel
//! 3. Client frames → dispatch → handler returns Outcome
//! 4. Room channel closes (client too slow) or socket closes → part room
//!
//! A client dropped from fan-out sees its room channel close. The
//! connection then ends so the client reconnects and resyncs from a fresh
//! snapshot instead of silently missing ops.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::doc::{ConnectionId, Cursor, parse_ops};
use crate::frame::{
    Data, FRAME_CODE, FRAME_MESSAGE, Frame, SYSCALL_DOC_OPS, SYSCALL_PRESENCE_UPDATE, Status,
};
use crate::services::access::Principal;
use crate::services::room::{self, Delivery};
use crate::state::AppState;

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide who receives what. Handlers never send frames directly.
enum Outcome {
    /// Reply done+data to sender, relay `frame` to peers (reliable).
    Relay { reply: Data, frame: Frame },
    /// Push `frame` to peers excluding sender, best effort. No reply.
    Ephemeral(Frame),
    /// Send done+data to sender only.
    Reply(Data),
    /// Send empty done to sender only.
    Done,
}

// =============================================================================
// CONNECTION CONTEXT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JoinedRoom {
    pub(crate) room_id: String,
    pub(crate) connection_id: ConnectionId,
}

/// Per-connection dispatch state.
pub(crate) struct ConnectionContext {
    pub(crate) principal: Principal,
    pub(crate) room: Option<JoinedRoom>,
    /// Hub pushes for the joined room. `None` when the receiving end lives
    /// elsewhere (in-process transport) or no room is joined.
    pub(crate) room_rx: Option<mpsc::Receiver<Frame>>,
}

impl ConnectionContext {
    pub(crate) fn new(principal: Principal) -> Self {
        Self { principal, room: None, room_rx: None }
    }

    /// Context for a connection whose join already happened out of band.
    pub(crate) fn attached(principal: Principal, room_id: impl Into<String>, connection_id: ConnectionId) -> Self {
        Self { principal, room: Some(JoinedRoom { room_id: room_id.into(), connection_id }), room_rx: None }
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(user) = params.get("user").map(|u| u.trim()).filter(|u| !u.is_empty()) else {
        return (StatusCode::UNAUTHORIZED, "user required").into_response();
    };

    let mut principal = Principal::new(user);
    if let Some(email) = params.get("email").map(|e| e.trim()).filter(|e| !e.is_empty()) {
        principal = principal.with_email(email);
    }

    ws.on_upgrade(move |socket| run_ws(socket, state, principal))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, principal: Principal) {
    let mut ctx = ConnectionContext::new(principal);
    info!(principal = %ctx.principal.id, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, &mut ctx, &text).await;
                        if !send_all(&mut socket, &replies).await {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            pushed = recv_room(&mut ctx.room_rx) => {
                let Some(frame) = pushed else {
                    warn!(principal = %ctx.principal.id, "ws: dropped from room fan-out; closing for resync");
                    break;
                };
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    leave_current(&state, &mut ctx).await;
    info!(principal = %ctx.principal.id, "ws: client disconnected");
}

/// Next hub push, or pending forever when no room is joined.
async fn recv_room(rx: &mut Option<mpsc::Receiver<Frame>>) -> Option<Frame> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn leave_current(state: &AppState, ctx: &mut ConnectionContext) {
    ctx.room_rx = None;
    if let Some(joined) = ctx.room.take() {
        room::part_room(state, &joined.room_id, joined.connection_id).await;
    }
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse one inbound text frame and return frames for the sender.
async fn process_inbound_text(state: &AppState, ctx: &mut ConnectionContext, text: &str) -> Vec<Frame> {
    match serde_json::from_str::<Frame>(text) {
        Ok(req) => process_frame(state, ctx, req).await,
        Err(e) => {
            warn!(principal = %ctx.principal.id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data(FRAME_MESSAGE, format!("invalid json: {e}"));
            vec![err]
        }
    }
}

/// Dispatch one request frame, apply its outcome, and return frames for the
/// sender.
pub(crate) async fn process_frame(state: &AppState, ctx: &mut ConnectionContext, mut req: Frame) -> Vec<Frame> {
    // Stamp the connected principal as `from`.
    req.from = Some(ctx.principal.id.clone());

    let is_presence = req.prefix() == "presence";
    if !is_presence {
        info!(id = %req.id, syscall = %req.syscall, status = ?req.status, "ws: recv frame");
    }

    let result = match req.prefix() {
        "room" => handle_room(state, ctx, &req).await,
        "doc" => handle_doc(state, ctx, &req).await,
        "presence" => handle_presence(state, ctx, &req).await,
        "roadmap" => handle_roadmap(state, ctx, &req).await,
        prefix => Err(req.error(format!("unknown prefix: {prefix}"))),
    };

    // Apply outcome. The dispatch layer owns all outbound logic.
    match result {
        Ok(Outcome::Relay { reply, frame }) => {
            if let Some(joined) = &ctx.room {
                room::broadcast(state, &joined.room_id, &frame, Some(joined.connection_id), Delivery::Reliable).await;
            }
            vec![req.done_with(reply)]
        }
        Ok(Outcome::Ephemeral(frame)) => {
            if let Some(joined) = &ctx.room {
                room::broadcast(state, &joined.room_id, &frame, Some(joined.connection_id), Delivery::BestEffort).await;
            }
            vec![]
        }
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// ROOM HANDLERS
// =============================================================================

async fn handle_room(state: &AppState, ctx: &mut ConnectionContext, req: &Frame) -> Result<Outcome, Frame> {
    match req.op() {
        "join" => {
            let Some(room_id) = req
                .room_id
                .clone()
                .or_else(|| req.data.get("room_id").and_then(Value::as_str).map(str::to_string))
            else {
                return Err(req.error("room_id required"));
            };

            // Part current room if already joined.
            leave_current(state, ctx).await;

            let (tx, rx) = mpsc::channel(state.config.client_channel_capacity);
            match room::join_room(state, &room_id, &ctx.principal, tx).await {
                Ok(joined) => {
                    ctx.room = Some(JoinedRoom { room_id, connection_id: joined.connection_id });
                    ctx.room_rx = Some(rx);

                    let mut reply = Data::new();
                    reply.insert("connection_id".into(), serde_json::json!(joined.connection_id));
                    Ok(Outcome::Reply(reply))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "part" => {
            leave_current(state, ctx).await;
            Ok(Outcome::Done)
        }
        op => Err(req.error(format!("unknown room op: {op}"))),
    }
}

// =============================================================================
// DOCUMENT HANDLERS
// =============================================================================

async fn handle_doc(state: &AppState, ctx: &ConnectionContext, req: &Frame) -> Result<Outcome, Frame> {
    let Some(joined) = &ctx.room else {
        return Err(req.error("must join a room first"));
    };

    match req.op() {
        "ops" => {
            let raw = req.data.get("ops").cloned().unwrap_or(Value::Null);
            let (ops, errors) = parse_ops(&raw);

            // EDGE: rejected entries are reported to the sender only.
            if ops.is_empty() {
                return match errors.first() {
                    Some(err) => Err(req.error_from(err)),
                    None => Ok(Outcome::Done),
                };
            }

            room::apply_ops(state, &joined.room_id, &ops)
                .await
                .map_err(|e| req.error_from(&e))?;

            let mut relay = Data::new();
            relay.insert("ops".into(), serde_json::to_value(&ops).unwrap_or_default());
            let frame = Frame::request(SYSCALL_DOC_OPS, relay)
                .with_room_id(joined.room_id.clone())
                .with_from(ctx.principal.id.clone());

            let mut reply = Data::new();
            reply.insert("accepted".into(), serde_json::json!(ops.len()));
            reply.insert("rejected".into(), serde_json::json!(errors.len()));
            Ok(Outcome::Relay { reply, frame })
        }
        op => Err(req.error(format!("unknown doc op: {op}"))),
    }
}

// =============================================================================
// PRESENCE HANDLERS
// =============================================================================

async fn handle_presence(state: &AppState, ctx: &ConnectionContext, req: &Frame) -> Result<Outcome, Frame> {
    let Some(joined) = &ctx.room else {
        // Silently ignore cursor moves before joining.
        return Ok(Outcome::Done);
    };

    match req.op() {
        "cursor" => {
            let x = req.data.get("x").and_then(Value::as_f64);
            let y = req.data.get("y").and_then(Value::as_f64);
            // Missing coordinates clear the cursor (pointer left the canvas).
            let cursor = x.zip(y).map(|(x, y)| Cursor { x, y });

            let Some(presence) = room::update_cursor(state, &joined.room_id, joined.connection_id, cursor).await else {
                return Ok(Outcome::Done);
            };
            Ok(Outcome::Ephemeral(room::presence_frame(&joined.room_id, SYSCALL_PRESENCE_UPDATE, &presence)))
        }
        op => Err(req.error(format!("unknown presence op: {op}"))),
    }
}

// =============================================================================
// ROADMAP HANDLERS
// =============================================================================

async fn handle_roadmap(state: &AppState, ctx: &ConnectionContext, req: &Frame) -> Result<Outcome, Frame> {
    let Some(joined) = &ctx.room else {
        return Err(req.error("must join a room first"));
    };

    match req.op() {
        "diff" => {
            let report = room::roadmap(state, &joined.room_id)
                .await
                .map_err(|e| req.error_from(&e))?;
            let mut data = Data::new();
            data.insert("items".into(), serde_json::json!(report.len()));
            data.insert("groups".into(), serde_json::to_value(&report.groups).unwrap_or_default());
            Ok(Outcome::Reply(data))
        }
        op => Err(req.error(format!("unknown roadmap op: {op}"))),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_all(socket: &mut WebSocket, frames: &[Frame]) -> bool {
    for frame in frames {
        if send_frame(socket, frame).await.is_err() {
            return false;
        }
    }
    true
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if !frame.syscall.starts_with("presence:") {
        log_outbound(frame);
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

pub(crate) fn log_outbound(frame: &Frame) {
    if frame.status == Status::Error {
        let code = frame.data.get(FRAME_CODE).and_then(|v| v.as_str()).unwrap_or("-");
        let message = frame.data.get(FRAME_MESSAGE).and_then(|v| v.as_str()).unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
