use super::*;
use crate::doc::entity::{NodeData, NodeKind, Position};
use serde_json::json;

fn node(id: &str, label: &str) -> Node {
    Node::new(id, NodeKind::Standard, Position::new(0.0, 0.0)).with_data("label", label)
}

fn store(n: u128) -> DocumentStore {
    DocumentStore::new(Uuid::from_u128(n))
}

fn add(item: Node) -> Change<Node> {
    Change::Add { item }
}

#[test]
fn apply_changes_writes_target_variant_only() {
    let mut store = store(1);
    let ops = store.apply_node_changes(Variant::Future, &[add(node("a", "A"))]);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].variant, Variant::Future);

    let snapshot = store.snapshot();
    assert!(snapshot.current.nodes.is_empty());
    assert_eq!(snapshot.future.nodes.len(), 1);
}

#[test]
fn selection_only_batch_short_circuits() {
    let mut store = store(1);
    store.apply_node_changes(Variant::Current, &[add(node("a", "A"))]);
    let mut rx = store.subscribe();
    rx.mark_unchanged();

    let ops = store.apply_node_changes(Variant::Current, &[Change::Select { id: "a".into(), selected: true }]);
    assert!(ops.is_empty());
    assert!(!rx.has_changed().expect("sender alive"));
}

#[test]
fn selected_flag_is_stripped_on_every_write_path() {
    let mut store = store(1);
    let mut selected = node("a", "A");
    selected.selected = true;
    store.apply_node_changes(Variant::Current, &[add(selected.clone())]);

    let mut other = node("b", "B");
    other.selected = true;
    store.set_nodes(Variant::Future, vec![selected, other]);

    let snapshot = store.snapshot();
    assert!(snapshot.current.nodes.iter().chain(&snapshot.future.nodes).all(|n| !n.selected));
    let wire = serde_json::to_string(&*snapshot).expect("serialize");
    assert!(!wire.contains("selected"));
    let state = serde_json::to_string(store.state()).expect("serialize");
    assert!(!state.contains("selected"));
}

#[test]
fn replaying_a_batch_produces_no_new_ops() {
    let mut store = store(1);
    let batch = vec![add(node("a", "A")), Change::Move { id: "a".into(), position: Position::new(4.0, 2.0) }];
    assert!(!store.apply_node_changes(Variant::Current, &batch).is_empty());
    let before = store.state().clone();
    assert!(store.apply_node_changes(Variant::Current, &batch).is_empty());
    assert_eq!(store.state(), &before);
}

#[test]
fn remove_is_idempotent() {
    let mut store = store(1);
    store.apply_node_changes(Variant::Current, &[add(node("a", "A"))]);
    let remove = vec![Change::Remove { id: "a".into() }];
    assert_eq!(store.apply_node_changes(Variant::Current, &remove).len(), 1);
    assert!(store.apply_node_changes(Variant::Current, &remove).is_empty());
    assert!(store.snapshot().current.nodes.is_empty());
}

#[test]
fn data_patch_merges_into_node() {
    let mut store = store(1);
    store.apply_node_changes(Variant::Current, &[add(node("a", "A").with_data("provider", "other"))]);
    let mut patch = NodeData::new();
    patch.insert("provider".into(), json!("posthog"));
    let ops = store.apply_node_changes(Variant::Current, &[Change::Data { id: "a".into(), data: patch }]);
    assert_eq!(ops.len(), 1);

    let snapshot = store.snapshot();
    assert_eq!(snapshot.current.nodes[0].data_str("provider"), Some("posthog"));
    assert_eq!(snapshot.current.nodes[0].label(), "A");
}

#[test]
fn copy_current_to_future_is_an_independent_snapshot() {
    let mut store = store(1);
    store.apply_node_changes(Variant::Current, &[add(node("a", "A")), add(node("b", "B"))]);
    store.apply_edge_changes(Variant::Current, &[Change::Connect { source: "a".into(), target: "b".into() }]);
    store.copy_current_to_future();

    let snapshot = store.snapshot();
    assert_eq!(snapshot.future, snapshot.current);

    store.apply_node_changes(Variant::Current, &[Change::Move { id: "a".into(), position: Position::new(50.0, 50.0) }]);
    let snapshot = store.snapshot();
    assert_eq!(snapshot.future.nodes[0].position, Position::new(0.0, 0.0));
    assert_eq!(snapshot.current.nodes[0].position, Position::new(50.0, 50.0));
}

#[test]
fn clearing_current_leaves_future_untouched() {
    let mut store = store(1);
    store.apply_node_changes(Variant::Current, &[add(node("a", "A"))]);
    store.copy_current_to_future();
    store.set_nodes(Variant::Current, Vec::new());

    let snapshot = store.snapshot();
    assert!(snapshot.current.nodes.is_empty());
    assert_eq!(snapshot.future.nodes.len(), 1);
}

#[test]
fn set_entities_keeps_existing_order_and_appends_new_ids() {
    let mut store = store(1);
    store.set_nodes(Variant::Current, vec![node("a", "A"), node("b", "B")]);
    store.set_nodes(Variant::Current, vec![node("c", "C"), node("b", "B2"), node("a", "A")]);

    let ids: Vec<_> = store
        .snapshot()
        .current
        .nodes
        .iter()
        .map(|n| n.id.clone())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[test]
fn two_stores_converge_when_exchanging_ops() {
    let mut alice = store(1);
    let mut bob = store(2);

    let seed = alice.apply_node_changes(Variant::Current, &[add(node("a", "A")), add(node("b", "B"))]);
    assert!(bob.merge_remote(&seed));

    let from_alice =
        alice.apply_node_changes(Variant::Current, &[Change::Move { id: "a".into(), position: Position::new(1.0, 1.0) }]);
    let from_bob = bob.apply_node_changes(Variant::Current, &[Change::Remove { id: "b".into() }]);

    alice.merge_remote(&from_bob);
    bob.merge_remote(&from_alice);

    assert_eq!(alice.state(), bob.state());
    assert_eq!(alice.snapshot(), bob.snapshot());
    assert_eq!(alice.snapshot().current.nodes.len(), 1);
}

#[test]
fn merge_remote_replay_does_not_notify() {
    let mut alice = store(1);
    let mut bob = store(2);
    let ops = alice.apply_node_changes(Variant::Current, &[add(node("a", "A"))]);

    let mut rx = bob.subscribe();
    assert!(bob.merge_remote(&ops));
    assert!(rx.has_changed().expect("sender alive"));
    rx.mark_unchanged();

    assert!(!bob.merge_remote(&ops));
    assert!(!rx.has_changed().expect("sender alive"));
}

#[test]
fn local_writes_after_merge_outrank_observed_stamps() {
    let mut alice = store(1);
    let mut bob = store(2);
    for i in 0..5 {
        let ops = alice.apply_node_changes(Variant::Current, &[add(node(&format!("n{i}"), "x"))]);
        bob.merge_remote(&ops);
    }
    let ops = bob.apply_node_changes(Variant::Current, &[Change::Remove { id: "n0".into() }]);
    assert!(ops[0].op.stamp().counter > 5);
}

#[test]
fn reset_discards_unsynced_local_writes() {
    let mut authority = store(1);
    authority.apply_node_changes(Variant::Current, &[add(node("a", "A"))]);

    let mut offline = DocumentStore::from_state(Uuid::from_u128(2), authority.state().clone());
    offline.apply_node_changes(Variant::Current, &[add(node("speculative", "S"))]);
    assert_eq!(offline.snapshot().current.nodes.len(), 2);

    offline.reset(authority.state().clone());
    let snapshot = offline.snapshot();
    assert_eq!(snapshot.current.nodes.len(), 1);
    assert_eq!(snapshot.current.nodes[0].id, "a");
}

#[test]
fn remote_writes_never_carry_selection_into_the_replica() {
    let mut alice = store(1);
    let mut ops = alice.apply_node_changes(Variant::Current, &[add(node("a", "A"))]);
    if let crate::doc::replica::ReplicaOp::Insert { fields, .. } = &mut ops[0].op {
        fields.insert("selected".into(), json!(true));
    }

    let mut bob = store(2);
    assert!(bob.merge_remote(&ops));
    let mut carol = store(3);
    carol.reset(bob.state().clone());

    for replica in [&bob, &carol] {
        let json = serde_json::to_string(replica.state()).expect("serialize");
        assert!(!json.contains("\"selected\""), "selected leaked: {json}");
        assert_eq!(replica.snapshot().current.nodes[0].id, "a");
    }
}
