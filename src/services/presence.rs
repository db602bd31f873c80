//! Presence service — join, reconnect and leave for one participant.
//!
//! DESIGN
//! ======
//! A participant moves `Absent -> Active -> Inactive -> Active ...`. The
//! record for a (room, user) pair is created once and never removed by the
//! engine; leaving only clears `active` and the connection binding.
//!
//! Capacity check, record mutation, snapshot delivery and the `user-joined`
//! broadcast all happen under the room mutex. Concurrent joins therefore
//! see each other's effects, and the joiner's snapshot is queued before
//! any later broadcast can reach its connection.
//!
//! RECONNECT
//! =========
//! Joining while already active rebinds the record to the new connection
//! without a capacity check. The old connection is superseded: its sends
//! fail `NotAMember` and its eventual leave is a no-op.

use rand::Rng;
use tracing::{debug, info};
use uuid::Uuid;

use super::room::{self, JoinError};
use crate::event::{ParticipantView, ServerEvent, now_ms};
use crate::services::auth::Identity;
use crate::services::persistence;
use crate::state::{AppState, ConnHandle, Participant, Permissions, RoomMeta};
use crate::store::RoomRecord;

/// Presence colors handed out on first join.
pub const PALETTE: [&str; 12] = [
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6", "#bcf60c", "#008080", "#9a6324",
    "#800000", "#000075",
];

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// True when an already-active record was rebound.
    pub reconnected: bool,
    pub color: String,
    pub permissions: Permissions,
    /// Other active participants, as sent to the joiner.
    pub participants: Vec<ParticipantView>,
}

/// Admit `identity` into `room_id` on connection `conn`.
///
/// On success the joiner's queue already holds the `room-participants`
/// snapshot and every other active member has been sent `user-joined`.
///
/// # Errors
///
/// `RoomNotFound`, `AccessDenied`, `RoomFull`, or `Store` if the room record
/// cannot be read.
pub async fn join(
    state: &AppState,
    conn: &ConnHandle,
    identity: &Identity,
    room_id: &str,
    secret: Option<&str>,
) -> Result<JoinOutcome, JoinError> {
    let record = room::resolve(state, room_id).await?;
    let permissions = authorize(state, &record, identity, secret).await?;
    let user_id = identity.user_id.as_str();

    loop {
        let handle = room::room_entry(state, &record).await;
        let mut room = handle.lock().await;
        if room.evicted {
            // Pruned between registry lookup and lock; take the fresh entry.
            continue;
        }
        room.meta = RoomMeta::from_record(&record, state.config.default_max_participants);

        let reconnected = room.participants.get(user_id).is_some_and(|p| p.active);
        if !reconnected && room.active_count() >= room.meta.max_participants as usize {
            info!(%room_id, %user_id, max = room.meta.max_participants, "presence: room full");
            return Err(JoinError::RoomFull { room_id: room_id.to_string(), max: room.meta.max_participants });
        }

        let now = now_ms();
        let in_use: Vec<String> = room.participants.values().filter(|p| p.active).map(|p| p.color.clone()).collect();
        let participant = room.participants.entry(user_id.to_string()).or_insert_with(|| Participant {
            user_id: user_id.to_string(),
            user_name: identity.user_name.clone(),
            color: pick_color(&in_use),
            joined_at: now,
            active: false,
            permissions,
            conn: None,
        });
        if !participant.active {
            participant.joined_at = now;
        }
        participant.active = true;
        participant.user_name.clone_from(&identity.user_name);
        participant.permissions = permissions;
        let superseded = participant.conn.replace(conn.clone()).filter(|old| old.id != conn.id);
        let color = participant.color.clone();
        let persisted = participant.record();

        let participants = room.snapshot(Some(user_id));
        conn.deliver(ServerEvent::RoomParticipants { room_id: room_id.to_string(), participants: participants.clone() });
        room.broadcast(
            &ServerEvent::UserJoined {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
                user_name: identity.user_name.clone(),
                color: color.clone(),
            },
            Some(user_id),
        );
        room.touch();
        persistence::enqueue_participant(state, room_id, persisted);

        if let Some(old) = superseded {
            debug!(%room_id, %user_id, old_conn = %old.id, new_conn = %conn.id, "presence: connection superseded");
        }
        info!(
            room_id = %room.room_id,
            %user_id,
            conn_id = %conn.id,
            reconnected,
            active = room.active_count(),
            "presence: joined"
        );
        return Ok(JoinOutcome { reconnected, color, permissions, participants });
    }
}

/// Decide whether `identity` may join and with which permissions.
///
/// Collaborators get role permissions. Anyone else needs the private room's secret.
async fn authorize(
    state: &AppState,
    record: &RoomRecord,
    identity: &Identity,
    secret: Option<&str>,
) -> Result<Permissions, JoinError> {
    let collaborators = state.store.get_collaborators(&record.whiteboard_id).await?;
    if let Some(entry) = collaborators.iter().find(|c| c.user_id == identity.user_id) {
        return Ok(Permissions::for_role(entry.role));
    }

    match (record.secret.as_deref(), secret) {
        (Some(expected), Some(given)) if !expected.is_empty() && expected == given => Ok(Permissions::guest()),
        _ => {
            info!(room_id = %record.room_id, user_id = %identity.user_id, "presence: access denied");
            Err(JoinError::AccessDenied(record.room_id.clone()))
        }
    }
}

fn pick_color(in_use: &[String]) -> String {
    let free: Vec<&str> = PALETTE.iter().copied().filter(|c| !in_use.iter().any(|u| u == c)).collect();
    let pool: &[&str] = if free.is_empty() { &PALETTE } else { &free };
    pool[rand::rng().random_range(0..pool.len())].to_string()
}

/// Mark the participant inactive if `conn_id` is still its binding.
///
/// Returns false for superseded connections and unknown rooms. Prunes the
/// room when it becomes empty.
pub async fn leave(state: &AppState, conn_id: Uuid, user_id: &str, room_id: &str) -> bool {
    let Some(handle) = room::lookup(state, room_id).await else {
        return false;
    };

    let now_empty = {
        let mut room = handle.lock().await;
        let Some(participant) = room.participants.get_mut(user_id) else {
            return false;
        };
        if !participant.bound_to(conn_id) {
            debug!(%room_id, %user_id, %conn_id, "presence: stale leave ignored");
            return false;
        }
        participant.active = false;
        participant.conn = None;
        let user_name = participant.user_name.clone();
        let persisted = participant.record();

        room.broadcast(
            &ServerEvent::UserLeft { room_id: room_id.to_string(), user_id: user_id.to_string(), user_name },
            None,
        );
        room.broadcast(&ServerEvent::CursorRemove { room_id: room_id.to_string(), user_id: user_id.to_string() }, None);
        room.touch();
        persistence::enqueue_participant(state, room_id, persisted);
        info!(%room_id, %user_id, %conn_id, active = room.active_count(), "presence: left");
        room.active_count() == 0
    };

    if now_empty {
        room::prune_if_empty(state, room_id, &handle).await;
    }
    true
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
