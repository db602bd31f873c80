use super::*;
use crate::config::Config;
use crate::event::ActionInput;
use crate::services::relay::{self, RelayError};
use crate::services::{presence, room};
use crate::state::test_helpers::{
    TEST_SECRET, TEST_WHITEBOARD, assert_no_event, drain, join_user, recv_event, seed_room, test_app_state,
    test_app_state_with, wait_for_actions,
};
use crate::store::Role;

fn forward(kind: ActionKind, n: i64) -> ActionInput {
    ActionInput { kind, data: Some(json!({ "n": n })), client_token: Some(format!("t{n}")), extra: serde_json::Map::new() }
}

fn entry(n: i64) -> DrawingAction {
    DrawingAction {
        id: Uuid::new_v4(),
        kind: ActionKind::Draw,
        user_id: "u".into(),
        user_name: "U".into(),
        data: json!({ "n": n }),
        timestamp: n,
        client_token: None,
        target_id: None,
        extra: serde_json::Map::new(),
    }
}

/// Log entry of `kind` pointing at `target`, as the coordinator writes it.
fn effect_on(kind: ActionKind, target: &DrawingAction) -> DrawingAction {
    DrawingAction { kind, target_id: Some(target.id), data: serde_json::Value::Null, ..entry(0) }
}

async fn applied(state: &AppState, room_id: &str) -> Vec<Uuid> {
    let handle = crate::services::room::lookup(state, room_id).await.expect("room should be live");
    handle.lock().await.history.applied_ids()
}

#[test]
fn stack_record_undo_redo() {
    let mut history = History::default();
    let (one, two) = (entry(1), entry(2));
    history.record(one.clone());
    history.record(two.clone());

    assert_eq!(history.undo().map(|a| a.id), Some(two.id));
    assert_eq!(history.redo_len(), 1);
    assert_eq!(history.redo().map(|a| a.id), Some(two.id));
    assert_eq!(history.applied_ids(), vec![one.id, two.id]);
    assert!(history.redo().is_none());
}

#[test]
fn new_action_invalidates_redo() {
    let mut history = History::default();
    history.record(entry(1));
    history.undo();
    history.record(entry(2));
    assert_eq!(history.redo_len(), 0);
    assert!(history.redo().is_none());
}

#[test]
fn reset_clears_both_stacks() {
    let mut history = History::default();
    history.record(entry(1));
    history.record(entry(2));
    history.undo();
    history.reset();
    assert_eq!((history.undo_len(), history.redo_len()), (0, 0));
}

#[test]
fn undo_stack_is_capped_at_max_depth() {
    let mut history = History::new(3);
    let entries: Vec<DrawingAction> = (0..5).map(entry).collect();
    for e in &entries {
        history.record(e.clone());
    }
    let newest: Vec<Uuid> = entries[2..].iter().map(|a| a.id).collect();
    assert_eq!(history.undo_len(), 3);
    assert_eq!(history.applied_ids(), newest);

    history.undo();
    history.redo();
    assert_eq!(history.applied_ids(), newest);
}

#[test]
fn replay_rebuilds_stacks_from_log() {
    let (one, two) = (entry(1), entry(2));
    let log = vec![
        one.clone(),
        two.clone(),
        effect_on(ActionKind::Undo, &two),
        effect_on(ActionKind::Redo, &two),
        effect_on(ActionKind::Undo, &two),
    ];
    let mut history = History::replay(&log, 10);
    assert_eq!(history.applied_ids(), vec![one.id]);
    assert_eq!(history.redo().map(|a| a.id), Some(two.id));

    let cleared = vec![one.clone(), entry(3), entry(4)];
    let mut log = vec![entry(5)];
    log.push(DrawingAction { kind: ActionKind::Clear, ..entry(6) });
    log.extend(cleared.iter().cloned());
    let history = History::replay(&log, 2);
    assert_eq!(history.applied_ids(), vec![cleared[1].id, cleared[2].id]);
    assert_eq!(history.redo_len(), 0);
}

#[tokio::test]
async fn submits_beyond_depth_drop_oldest() {
    let mut config = Config::with_secret(TEST_SECRET);
    config.max_history_depth = 3;
    let (state, store) = test_app_state_with(config);
    seed_room(&store, "R1", 4, None, &[("a", Role::Editor)]);
    let (conn, _rx) = join_user(&state, "R1", "a").await;

    let mut ids = Vec::new();
    for n in 0..10 {
        let accepted = relay::submit(&state, conn.id, "R1", forward(ActionKind::Draw, n)).await.unwrap().unwrap();
        ids.push(accepted.id);
    }
    assert_eq!(applied(&state, "R1").await, ids[7..].to_vec());
}

#[tokio::test]
async fn history_survives_room_reactivation() {
    let (state, store) = test_app_state();
    seed_room(&store, "R1", 4, None, &[("a", Role::Editor)]);
    let (conn, _rx) = join_user(&state, "R1", "a").await;
    let first = relay::submit(&state, conn.id, "R1", forward(ActionKind::Draw, 1)).await.unwrap().unwrap();
    let second = relay::submit(&state, conn.id, "R1", forward(ActionKind::Draw, 2)).await.unwrap().unwrap();
    undo(&state, conn.id, "R1").await.unwrap();

    presence::leave(&state, conn.id, "a", "R1").await;
    assert!(room::lookup(&state, "R1").await.is_none());
    assert_eq!(wait_for_actions(&store, TEST_WHITEBOARD, 3).await.len(), 3);

    let (conn, _rx) = join_user(&state, "R1", "a").await;
    assert_eq!(applied(&state, "R1").await, vec![first.id]);
    let redone = redo(&state, conn.id, "R1").await.unwrap().unwrap();
    assert_eq!(redone.target_id, Some(second.id));
}

#[tokio::test]
async fn undo_then_redo_restores_state_for_everyone() {
    let (state, store) = test_app_state();
    seed_room(&store, "R1", 4, None, &[("a", Role::Editor), ("b", Role::Editor)]);
    let (conn_a, mut rx_a) = join_user(&state, "R1", "a").await;
    let (conn_b, mut rx_b) = join_user(&state, "R1", "b").await;

    let first = relay::submit(&state, conn_a.id, "R1", forward(ActionKind::Draw, 1)).await.unwrap().unwrap();
    let second = relay::submit(&state, conn_a.id, "R1", forward(ActionKind::Draw, 2)).await.unwrap().unwrap();
    let before = applied(&state, "R1").await;
    assert_eq!(before, vec![first.id, second.id]);
    drain(&mut rx_a);
    drain(&mut rx_b);

    // Any drawing member may undo the room's latest action.
    let undo_effect = undo(&state, conn_b.id, "R1").await.unwrap().unwrap();
    assert_eq!(undo_effect.kind, ActionKind::Undo);
    assert_eq!(undo_effect.target_id, Some(second.id));
    assert_eq!(undo_effect.data["clientToken"], json!("t2"));
    for rx in [&mut rx_a, &mut rx_b] {
        match recv_event(rx).await {
            ServerEvent::DrawingAction { action, .. } => assert_eq!(action.id, undo_effect.id),
            other => panic!("expected drawing-action, got {other:?}"),
        }
    }
    assert_eq!(applied(&state, "R1").await, vec![first.id]);

    let redo_effect = redo(&state, conn_a.id, "R1").await.unwrap().unwrap();
    assert_eq!(redo_effect.target_id, Some(second.id));
    assert_eq!(redo_effect.data["action"]["id"], json!(second.id));
    assert!(matches!(recv_event(&mut rx_a).await, ServerEvent::DrawingAction { .. }));
    assert!(matches!(recv_event(&mut rx_b).await, ServerEvent::DrawingAction { .. }));
    assert_eq!(applied(&state, "R1").await, before);

    // Undo/redo are logged as entries that point at the reversed action.
    let log = wait_for_actions(&store, TEST_WHITEBOARD, 4).await;
    let kinds: Vec<ActionKind> = log.iter().map(|a| a.kind).collect();
    assert_eq!(kinds, vec![ActionKind::Draw, ActionKind::Draw, ActionKind::Undo, ActionKind::Redo]);
    assert_eq!(log[2].target_id, Some(second.id));
}

#[tokio::test]
async fn redo_after_forward_action_is_noop() {
    let (state, store) = test_app_state();
    seed_room(&store, "R1", 4, None, &[("a", Role::Editor), ("b", Role::Editor)]);
    let (conn_a, _rx_a) = join_user(&state, "R1", "a").await;
    let (_conn_b, mut rx_b) = join_user(&state, "R1", "b").await;

    relay::submit(&state, conn_a.id, "R1", forward(ActionKind::Draw, 1)).await.unwrap();
    undo(&state, conn_a.id, "R1").await.unwrap();
    relay::submit(&state, conn_a.id, "R1", forward(ActionKind::Draw, 2)).await.unwrap();
    let before = applied(&state, "R1").await;
    drain(&mut rx_b);

    assert!(redo(&state, conn_a.id, "R1").await.unwrap().is_none());
    assert_no_event(&mut rx_b).await;
    assert_eq!(applied(&state, "R1").await, before);
}

#[tokio::test]
async fn clear_resets_history() {
    let (state, store) = test_app_state();
    seed_room(&store, "R1", 4, None, &[("owner", Role::Owner)]);
    let (conn, _rx) = join_user(&state, "R1", "owner").await;

    relay::submit(&state, conn.id, "R1", forward(ActionKind::Draw, 1)).await.unwrap();
    relay::submit(&state, conn.id, "R1", forward(ActionKind::Draw, 2)).await.unwrap();
    undo(&state, conn.id, "R1").await.unwrap();
    relay::submit(&state, conn.id, "R1", forward(ActionKind::Clear, 3)).await.unwrap();

    assert!(applied(&state, "R1").await.is_empty());
    assert!(redo(&state, conn.id, "R1").await.unwrap().is_none());
    assert!(undo(&state, conn.id, "R1").await.unwrap().is_none());
}

#[tokio::test]
async fn drawing_action_kind_undo_routes_to_history() {
    let (state, store) = test_app_state();
    seed_room(&store, "R1", 4, None, &[("a", Role::Editor)]);
    let (conn, _rx) = join_user(&state, "R1", "a").await;

    let drawn = relay::submit(&state, conn.id, "R1", forward(ActionKind::Draw, 1)).await.unwrap().unwrap();
    let effect = relay::submit(&state, conn.id, "R1", ActionInput { kind: ActionKind::Undo, data: None, client_token: None, extra: serde_json::Map::new() })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(effect.target_id, Some(drawn.id));
}

#[tokio::test]
async fn viewer_cannot_undo() {
    let (state, store) = test_app_state();
    seed_room(&store, "R1", 4, None, &[("a", Role::Editor), ("v", Role::Viewer)]);
    let (editor, _rx_e) = join_user(&state, "R1", "a").await;
    let (viewer, _rx_v) = join_user(&state, "R1", "v").await;
    relay::submit(&state, editor.id, "R1", forward(ActionKind::Draw, 1)).await.unwrap();

    let err = undo(&state, viewer.id, "R1").await.unwrap_err();
    assert!(matches!(err, RelayError::PermissionDenied { kind: ActionKind::Undo }));
    assert_eq!(applied(&state, "R1").await.len(), 1);
}

#[tokio::test]
async fn concurrent_undos_pop_distinct_entries() {
    let (state, store) = test_app_state();
    seed_room(&store, "R1", 4, None, &[("a", Role::Editor), ("b", Role::Editor)]);
    let (conn_a, _rx_a) = join_user(&state, "R1", "a").await;
    let (conn_b, _rx_b) = join_user(&state, "R1", "b").await;
    relay::submit(&state, conn_a.id, "R1", forward(ActionKind::Draw, 1)).await.unwrap();
    relay::submit(&state, conn_a.id, "R1", forward(ActionKind::Draw, 2)).await.unwrap();

    let (left, right) = tokio::join!(undo(&state, conn_a.id, "R1"), undo(&state, conn_b.id, "R1"));
    let (left, right) = (left.unwrap().unwrap(), right.unwrap().unwrap());
    assert_ne!(left.target_id, right.target_id);
    assert!(applied(&state, "R1").await.is_empty());
}
