use super::*;

#[test]
fn room_state_new_is_empty() {
    let room = RoomState::new();
    assert_eq!(room.document, DocumentState::default());
    assert!(room.clients.is_empty());
    assert!(room.presence.is_empty());
    assert!(!room.dirty);
    assert_eq!(room.version, 0);
}

#[test]
fn room_state_default_equals_new() {
    let a = RoomState::new();
    let b = RoomState::default();
    assert_eq!(a.document, b.document);
    assert_eq!(a.clients.len(), b.clients.len());
    assert_eq!(a.dirty, b.dirty);
}

#[tokio::test]
async fn seed_room_registers_document() {
    let state = test_helpers::test_app_state();
    let document = test_helpers::document_with_nodes(&["a", "b"]);
    let room_id = test_helpers::seed_room(&state, document.clone()).await;

    let rooms = state.rooms.read().await;
    let room = rooms.get(&room_id).expect("room should be seeded");
    assert_eq!(room.document, document);
    assert_eq!(room.document.snapshot().current.nodes.len(), 2);
}

#[test]
fn app_state_clones_share_rooms() {
    let state = test_helpers::test_app_state();
    let clone = state.clone();
    assert!(Arc::ptr_eq(&state.rooms, &clone.rooms));
    assert!(Arc::ptr_eq(&state.config, &clone.config));
}
