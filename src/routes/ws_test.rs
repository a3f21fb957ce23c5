use super::*;
use crate::doc::{DocumentState, Variant};
use crate::frame::{SYSCALL_JOIN, SYSCALL_PART, SYSCALL_PRESENCE_CURSOR, SYSCALL_PRESENCE_LEAVE, SYSCALL_ROADMAP, SYSCALL_SNAPSHOT};
use crate::services::access::StaticAccess;
use crate::services::persistence::MemorySnapshotStore;
use crate::state::test_helpers;
use serde_json::json;
use std::sync::Arc;
use tokio::time::{Duration, timeout};

async fn recv_room_push(ctx: &mut ConnectionContext) -> Frame {
    let rx = ctx.room_rx.as_mut().expect("room channel should be attached");
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("room push timed out")
        .expect("room channel closed unexpectedly")
}

async fn assert_no_room_push(ctx: &mut ConnectionContext) {
    let rx = ctx.room_rx.as_mut().expect("room channel should be attached");
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected no room push"
    );
}

/// Join `room_id` as `user`, drain the snapshot push, and return the context.
async fn joined_ctx(state: &AppState, room_id: &str, user: &str) -> ConnectionContext {
    let mut ctx = ConnectionContext::new(Principal::new(user));
    let req = Frame::request(SYSCALL_JOIN, Data::new()).with_room_id(room_id);
    let replies = process_frame(state, &mut ctx, req).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].status, Status::Done);
    let snapshot = recv_room_push(&mut ctx).await;
    assert_eq!(snapshot.syscall, SYSCALL_SNAPSHOT);
    ctx
}

fn ops_request(room_id: &str, ops: Value) -> Frame {
    let mut data = Data::new();
    data.insert("ops".into(), ops);
    Frame::request(SYSCALL_DOC_OPS, data).with_room_id(room_id)
}

// =============================================================================
// room:*
// =============================================================================

#[tokio::test]
async fn join_replies_with_connection_id_and_pushes_snapshot() {
    let state = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state, test_helpers::document_with_nodes(&["a"])).await;
    let mut ctx = ConnectionContext::new(Principal::new("alice"));

    let mut data = Data::new();
    data.insert("room_id".into(), json!(room_id));
    let replies = process_frame(&state, &mut ctx, Frame::request(SYSCALL_JOIN, data)).await;

    assert_eq!(replies[0].status, Status::Done);
    assert_eq!(replies[0].data["connection_id"], 1);
    assert_eq!(ctx.room.as_ref().map(|r| r.connection_id), Some(1));

    let snapshot = recv_room_push(&mut ctx).await;
    assert_eq!(snapshot.syscall, SYSCALL_SNAPSHOT);
    let document: DocumentState = serde_json::from_value(snapshot.data["document"].clone()).expect("document");
    assert!(document.nodes.is_live("a"));
}

#[tokio::test]
async fn join_without_room_id_is_an_error() {
    let state = test_helpers::test_app_state();
    let mut ctx = ConnectionContext::new(Principal::new("alice"));

    let replies = process_frame(&state, &mut ctx, Frame::request(SYSCALL_JOIN, Data::new())).await;

    assert_eq!(replies[0].status, Status::Error);
    assert!(ctx.room.is_none());
}

#[tokio::test]
async fn denied_join_returns_structured_error() {
    let state = test_helpers::test_app_state_with(Arc::new(StaticAccess::closed()), Arc::new(MemorySnapshotStore::new()));
    let mut ctx = ConnectionContext::new(Principal::new("mallory"));

    let req = Frame::request(SYSCALL_JOIN, Data::new()).with_room_id("private");
    let replies = process_frame(&state, &mut ctx, req).await;

    assert_eq!(replies[0].status, Status::Error);
    assert_eq!(replies[0].data[FRAME_CODE], "E_AUTHORIZATION_DENIED");
    assert!(ctx.room.is_none());
    assert!(ctx.room_rx.is_none());
}

#[tokio::test]
async fn part_notifies_peers_and_detaches() {
    let state = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state, DocumentState::default()).await;
    let mut alice = joined_ctx(&state, &room_id, "alice").await;
    let mut bob = joined_ctx(&state, &room_id, "bob").await;
    let _join_notice = recv_room_push(&mut alice).await;

    let req = Frame::request(SYSCALL_PART, Data::new()).with_room_id(room_id.as_str());
    let replies = process_frame(&state, &mut bob, req).await;

    assert_eq!(replies[0].status, Status::Done);
    assert!(bob.room.is_none());
    let leave = recv_room_push(&mut alice).await;
    assert_eq!(leave.syscall, SYSCALL_PRESENCE_LEAVE);
    assert_eq!(leave.data["connection_id"], 2);
}

// =============================================================================
// doc:ops
// =============================================================================

#[tokio::test]
async fn doc_ops_apply_and_relay_to_peers_only() {
    let state = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state, DocumentState::default()).await;
    let mut alice = joined_ctx(&state, &room_id, "alice").await;
    let mut bob = joined_ctx(&state, &room_id, "bob").await;
    let _join_notice = recv_room_push(&mut alice).await;

    let ops = serde_json::to_value(test_helpers::add_node_ops("n1")).expect("ops");
    let replies = process_frame(&state, &mut alice, ops_request(&room_id, ops)).await;

    assert_eq!(replies[0].status, Status::Done);
    assert_eq!(replies[0].data["accepted"], 1);
    let relayed = recv_room_push(&mut bob).await;
    assert_eq!(relayed.syscall, SYSCALL_DOC_OPS);
    assert_eq!(relayed.from.as_deref(), Some("alice"));
    assert!(relayed.parent_id.is_none());
    assert_no_room_push(&mut alice).await;

    let rooms = state.rooms.read().await;
    assert!(rooms[&room_id].document.nodes.is_live("n1"));
    assert!(rooms[&room_id].dirty);
}

#[tokio::test]
async fn malformed_ops_error_to_sender_and_never_relay() {
    let state = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state, DocumentState::default()).await;
    let mut alice = joined_ctx(&state, &room_id, "alice").await;
    let mut bob = joined_ctx(&state, &room_id, "bob").await;
    let _join_notice = recv_room_push(&mut alice).await;

    let replies = process_frame(&state, &mut alice, ops_request(&room_id, json!([{"bogus": true}]))).await;

    assert_eq!(replies[0].status, Status::Error);
    assert_eq!(replies[0].data[FRAME_CODE], "E_INVALID_OPERATION");
    assert_no_room_push(&mut bob).await;
    assert!(!state.rooms.read().await[&room_id].dirty);
}

#[tokio::test]
async fn mixed_batch_keeps_valid_ops() {
    let state = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state, DocumentState::default()).await;
    let mut alice = joined_ctx(&state, &room_id, "alice").await;

    let mut ops = serde_json::to_value(test_helpers::add_node_ops("n1")).expect("ops");
    ops.as_array_mut().expect("array").push(json!("garbage"));
    let replies = process_frame(&state, &mut alice, ops_request(&room_id, ops)).await;

    assert_eq!(replies[0].data["accepted"], 1);
    assert_eq!(replies[0].data["rejected"], 1);
}

#[tokio::test]
async fn ops_carrying_selection_are_rejected_and_never_replicated() {
    let state = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state, DocumentState::default()).await;
    let mut alice = joined_ctx(&state, &room_id, "alice").await;
    let mut bob = joined_ctx(&state, &room_id, "bob").await;
    let _join_notice = recv_room_push(&mut alice).await;

    let mut ops = serde_json::to_value(test_helpers::add_node_ops("n1")).expect("ops");
    ops[0]["op"]["fields"]["selected"] = json!(true);
    let clean = serde_json::to_value(test_helpers::add_node_ops("n2")).expect("ops");
    ops.as_array_mut().expect("array").push(clean[0].clone());

    let replies = process_frame(&state, &mut alice, ops_request(&room_id, ops)).await;

    assert_eq!(replies[0].status, Status::Done);
    assert_eq!(replies[0].data["accepted"], 1);
    assert_eq!(replies[0].data["rejected"], 1);

    let relayed = recv_room_push(&mut bob).await;
    assert!(!relayed.data["ops"].to_string().contains("selected"));

    let rooms = state.rooms.read().await;
    let document = &rooms[&room_id].document;
    assert!(!document.nodes.is_live("n1"));
    assert!(document.nodes.is_live("n2"));
    let json = serde_json::to_string(document).expect("serialize");
    assert!(!json.contains("\"selected\""), "selected leaked: {json}");
}

#[tokio::test]
async fn doc_ops_before_join_is_an_error() {
    let state = test_helpers::test_app_state();
    let mut ctx = ConnectionContext::new(Principal::new("alice"));
    let replies = process_frame(&state, &mut ctx, ops_request("room", json!([]))).await;
    assert_eq!(replies[0].status, Status::Error);
}

// =============================================================================
// presence:cursor
// =============================================================================

#[tokio::test]
async fn cursor_is_pushed_to_peers_without_reply() {
    let state = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state, DocumentState::default()).await;
    let mut alice = joined_ctx(&state, &room_id, "alice").await;
    let mut bob = joined_ctx(&state, &room_id, "bob").await;
    let _join_notice = recv_room_push(&mut alice).await;

    let mut data = Data::new();
    data.insert("x".into(), json!(10.0));
    data.insert("y".into(), json!(20.0));
    let req = Frame::request(SYSCALL_PRESENCE_CURSOR, data).with_room_id(room_id.as_str());
    let replies = process_frame(&state, &mut alice, req).await;

    assert!(replies.is_empty());
    let update = recv_room_push(&mut bob).await;
    assert_eq!(update.syscall, SYSCALL_PRESENCE_UPDATE);
    assert_eq!(update.data["connection_id"], 1);
    assert_eq!(update.data["cursor"], json!({"x": 10.0, "y": 20.0}));
    assert_no_room_push(&mut alice).await;
}

#[tokio::test]
async fn cursor_without_coordinates_clears_it() {
    let state = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state, DocumentState::default()).await;
    let mut alice = joined_ctx(&state, &room_id, "alice").await;
    let mut bob = joined_ctx(&state, &room_id, "bob").await;
    let _join_notice = recv_room_push(&mut alice).await;

    let req = Frame::request(SYSCALL_PRESENCE_CURSOR, Data::new()).with_room_id(room_id.as_str());
    let _ = process_frame(&state, &mut alice, req).await;

    let update = recv_room_push(&mut bob).await;
    assert!(update.data["cursor"].is_null());
}

#[tokio::test]
async fn cursor_before_join_is_ignored() {
    let state = test_helpers::test_app_state();
    let mut ctx = ConnectionContext::new(Principal::new("alice"));
    let replies = process_frame(&state, &mut ctx, Frame::request(SYSCALL_PRESENCE_CURSOR, Data::new())).await;
    assert_eq!(replies[0].status, Status::Done);
}

// =============================================================================
// roadmap:diff
// =============================================================================

#[tokio::test]
async fn roadmap_diff_replies_with_groups() {
    let state = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state, test_helpers::document_with_nodes(&["a", "b"])).await;
    let mut alice = joined_ctx(&state, &room_id, "alice").await;

    let req = Frame::request(SYSCALL_ROADMAP, Data::new()).with_room_id(room_id.as_str());
    let replies = process_frame(&state, &mut alice, req).await;

    assert_eq!(replies[0].status, Status::Done);
    assert_eq!(replies[0].data["items"], 2);
    assert_eq!(replies[0].data["groups"][0]["category"], "General");
    assert_eq!(replies[0].data["groups"][0]["items"][0]["type"], "removed");
}

// =============================================================================
// parsing + routing
// =============================================================================

#[tokio::test]
async fn invalid_json_returns_gateway_error() {
    let state = test_helpers::test_app_state();
    let mut ctx = ConnectionContext::new(Principal::new("alice"));
    let replies = process_inbound_text(&state, &mut ctx, "{not json").await;
    assert_eq!(replies[0].syscall, "gateway:error");
}

#[tokio::test]
async fn unknown_prefix_is_an_error() {
    let state = test_helpers::test_app_state();
    let mut ctx = ConnectionContext::new(Principal::new("alice"));
    let replies = process_frame(&state, &mut ctx, Frame::request("bogus:thing", Data::new())).await;
    assert_eq!(replies[0].status, Status::Error);
    assert_eq!(replies[0].data[FRAME_MESSAGE], "unknown prefix: bogus");
}

#[tokio::test]
async fn inbound_text_frames_are_stamped_with_principal() {
    let state = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state, DocumentState::default()).await;
    let mut alice = joined_ctx(&state, &room_id, "alice").await;
    let mut bob = joined_ctx(&state, &room_id, "bob").await;
    let _join_notice = recv_room_push(&mut alice).await;

    let mut req = ops_request(&room_id, serde_json::to_value(test_helpers::add_node_ops("n1")).expect("ops"));
    req.from = Some("spoofed".into());
    let text = serde_json::to_string(&req).expect("serialize");
    let _ = process_inbound_text(&state, &mut alice, &text).await;

    let relayed = recv_room_push(&mut bob).await;
    assert_eq!(relayed.from.as_deref(), Some("alice"));
    let ops = parse_ops(&relayed.data["ops"]).0;
    assert_eq!(ops[0].variant, Variant::Current);
}
