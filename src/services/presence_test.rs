use super::*;
use crate::event::ErrorCode;
use crate::services::relay;
use crate::state::test_helpers::{
    TEST_WHITEBOARD, assert_no_event, drain, identity, join_user, recv_event, seed_room, test_app_state, test_conn,
};
use crate::store::{Role, RoomStore};
use std::sync::Arc;

fn user_ids(list: &[ParticipantView]) -> Vec<&str> {
    list.iter().map(|p| p.user_id.as_str()).collect()
}

#[tokio::test]
async fn capacity_two_room_scenario() {
    let (state, store) = test_app_state();
    seed_room(&store, "R1", 2, None, &[("a", Role::Editor), ("b", Role::Editor), ("c", Role::Editor)]);

    let (conn_a, mut rx_a) = test_conn();
    join(&state, &conn_a, &identity("a", "A"), "R1", None).await.unwrap();
    match recv_event(&mut rx_a).await {
        ServerEvent::RoomParticipants { room_id, participants } => {
            assert_eq!(room_id, "R1");
            assert!(participants.is_empty());
        }
        other => panic!("expected room-participants, got {other:?}"),
    }

    let (conn_b, mut rx_b) = test_conn();
    join(&state, &conn_b, &identity("b", "B"), "R1", None).await.unwrap();
    match recv_event(&mut rx_b).await {
        ServerEvent::RoomParticipants { participants, .. } => assert_eq!(user_ids(&participants), vec!["a"]),
        other => panic!("expected room-participants, got {other:?}"),
    }
    match recv_event(&mut rx_a).await {
        ServerEvent::UserJoined { user_id, user_name, .. } => {
            assert_eq!(user_id, "b");
            assert_eq!(user_name, "B");
        }
        other => panic!("expected user-joined, got {other:?}"),
    }

    let (conn_c, mut rx_c) = test_conn();
    let err = join(&state, &conn_c, &identity("c", "C"), "R1", None).await.unwrap_err();
    assert!(matches!(err, JoinError::RoomFull { max: 2, .. }));
    assert_no_event(&mut rx_c).await;
    assert_no_event(&mut rx_a).await;

    let handle = room::lookup(&state, "R1").await.unwrap();
    let room = handle.lock().await;
    assert_eq!(user_ids(&room.snapshot(None)), vec!["a", "b"]);
}

#[tokio::test]
async fn rejoin_while_active_rebinds_without_duplicating() {
    let (state, store) = test_app_state();
    seed_room(&store, "R1", 1, None, &[("a", Role::Owner)]);

    let (first, _rx1) = join_user(&state, "R1", "a").await;
    let (second, _rx2) = test_conn();
    let outcome = join(&state, &second, &identity("a", "A"), "R1", None).await.unwrap();
    assert!(outcome.reconnected);

    let handle = room::lookup(&state, "R1").await.unwrap();
    {
        let room = handle.lock().await;
        assert_eq!(room.participants.len(), 1);
        assert_eq!(room.active_count(), 1);
        assert!(room.member_by_conn(second.id).is_some());
        assert!(room.member_by_conn(first.id).is_none());
    }

    // The superseded connection can no longer act or leave.
    let err = relay::typing(&state, first.id, "R1", true).await.unwrap_err();
    assert!(matches!(err, relay::RelayError::NotAMember(_)));
    assert!(!leave(&state, first.id, "a", "R1").await);
    assert_eq!(handle.lock().await.active_count(), 1);
}

#[tokio::test]
async fn color_survives_reconnect() {
    let (state, store) = test_app_state();
    seed_room(&store, "R1", 4, None, &[("a", Role::Editor), ("b", Role::Editor)]);

    let (conn, _rx) = test_conn();
    let first = join(&state, &conn, &identity("a", "A"), "R1", None).await.unwrap();
    assert!(PALETTE.contains(&first.color.as_str()));
    // Keep the room alive so the record survives the leave.
    let (_b, _rx_b) = join_user(&state, "R1", "b").await;
    assert!(leave(&state, conn.id, "a", "R1").await);

    let (again, _rx2) = test_conn();
    let second = join(&state, &again, &identity("a", "A"), "R1", None).await.unwrap();
    assert!(!second.reconnected);
    assert_eq!(first.color, second.color);
}

#[tokio::test]
async fn concurrent_join_storm_never_exceeds_capacity() {
    let (state, store) = test_app_state();
    let users: Vec<String> = (0..24).map(|i| format!("u{i}")).collect();
    let collaborators: Vec<(&str, Role)> = users.iter().map(|u| (u.as_str(), Role::Editor)).collect();
    seed_room(&store, "R1", 5, None, &collaborators);

    let state = Arc::new(state);
    let mut tasks = Vec::new();
    for user in users {
        let state = state.clone();
        tasks.push(tokio::spawn(async move {
            let (conn, rx) = test_conn();
            let result = join(&state, &conn, &identity(&user, &user), "R1", None).await;
            (result.is_ok(), rx)
        }));
    }

    let mut admitted = 0;
    let mut receivers = Vec::new();
    for task in tasks {
        let (ok, rx) = task.await.unwrap();
        if ok {
            admitted += 1;
        }
        receivers.push(rx);
    }
    assert_eq!(admitted, 5);
    let handle = room::lookup(&state, "R1").await.unwrap();
    assert_eq!(handle.lock().await.active_count(), 5);
}

#[tokio::test]
async fn stranger_without_secret_is_denied() {
    let (state, store) = test_app_state();
    seed_room(&store, "R1", 4, Some("hunter2"), &[("owner", Role::Owner)]);

    let (conn, mut rx) = test_conn();
    let err = join(&state, &conn, &identity("x", "X"), "R1", None).await.unwrap_err();
    assert!(matches!(err, JoinError::AccessDenied(_)));
    let err = join(&state, &conn, &identity("x", "X"), "R1", Some("wrong")).await.unwrap_err();
    assert_eq!(err.error_code(), "ACCESS_DENIED");
    assert_no_event(&mut rx).await;
    assert!(room::lookup(&state, "R1").await.is_none());
}

#[tokio::test]
async fn secret_admits_guest_with_guest_permissions() {
    let (state, store) = test_app_state();
    seed_room(&store, "R1", 4, Some("hunter2"), &[]);

    let (conn, _rx) = test_conn();
    let outcome = join(&state, &conn, &identity("x", "X"), "R1", Some("hunter2")).await.unwrap();
    assert_eq!(outcome.permissions, Permissions::guest());
    assert!(!outcome.permissions.can_clear);
}

#[tokio::test]
async fn viewer_role_joins_without_draw_rights() {
    let (state, store) = test_app_state();
    seed_room(&store, "R1", 4, None, &[("v", Role::Viewer)]);

    let (conn, _rx) = test_conn();
    let outcome = join(&state, &conn, &identity("v", "V"), "R1", None).await.unwrap();
    assert!(!outcome.permissions.can_draw);
}

#[tokio::test]
async fn deactivated_room_rejects_join_immediately() {
    let (state, store) = test_app_state();
    seed_room(&store, "R1", 4, None, &[("a", Role::Editor), ("b", Role::Editor)]);
    let (_a, _rx) = join_user(&state, "R1", "a").await;

    store.deactivate_room("R1");
    let (conn, _rx_b) = test_conn();
    let err = join(&state, &conn, &identity("b", "B"), "R1", None).await.unwrap_err();
    assert!(matches!(err, JoinError::RoomNotFound(_)));
}

#[tokio::test]
async fn leave_broadcasts_and_keeps_record() {
    let (state, store) = test_app_state();
    seed_room(&store, "R1", 4, None, &[("a", Role::Editor), ("b", Role::Editor)]);
    let (conn_a, _rx_a) = join_user(&state, "R1", "a").await;
    let (_conn_b, mut rx_b) = join_user(&state, "R1", "b").await;
    drain(&mut rx_b);

    assert!(leave(&state, conn_a.id, "a", "R1").await);
    assert!(matches!(recv_event(&mut rx_b).await, ServerEvent::UserLeft { ref user_id, .. } if user_id == "a"));
    assert!(matches!(recv_event(&mut rx_b).await, ServerEvent::CursorRemove { ref user_id, .. } if user_id == "a"));

    let handle = room::lookup(&state, "R1").await.unwrap();
    let room = handle.lock().await;
    assert!(!room.participants["a"].active);
    assert_eq!(room.active_count(), 1);
}

#[tokio::test]
async fn last_leave_prunes_room_and_persists_inactive() {
    let (state, store) = test_app_state();
    seed_room(&store, "R1", 4, None, &[("a", Role::Editor)]);
    let (conn, _rx) = join_user(&state, "R1", "a").await;

    assert!(leave(&state, conn.id, "a", "R1").await);
    assert!(room::lookup(&state, "R1").await.is_none());
    assert!(!leave(&state, conn.id, "a", "R1").await);

    for _ in 0..50 {
        if store.participant("R1", "a").is_some_and(|p| !p.is_active) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let record = store.participant("R1", "a").expect("participant persisted");
    assert!(!record.is_active);
    assert_eq!(record.user_name, "A");
    assert_eq!(store.get_collaborators(TEST_WHITEBOARD).await.unwrap().len(), 1);
}

#[test]
fn pick_color_prefers_unused_palette_entries() {
    let in_use: Vec<String> = PALETTE[..PALETTE.len() - 1].iter().map(|c| (*c).to_string()).collect();
    assert_eq!(pick_color(&in_use), PALETTE[PALETTE.len() - 1]);
    let all: Vec<String> = PALETTE.iter().map(|c| (*c).to_string()).collect();
    assert!(PALETTE.contains(&pick_color(&all).as_str()));
}
