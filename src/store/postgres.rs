//! Postgres-backed `RoomStore`.
//!
//! DESIGN
//! ======
//! Plain `sqlx::query` with runtime binding, no compile-time checked macros,
//! so the crate builds without a live database. The whiteboard owner is
//! folded into the collaborator list as role `owner`.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{Collaborator, ParticipantRecord, Role, RoomRecord, RoomStore, StoreError};
use crate::event::ActionKind;
use crate::state::{DrawingAction, Permissions};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomStore for PgStore {
    async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        let Some(row) = sqlx::query(
            r"SELECT r.room_id, r.whiteboard_id, r.max_participants,
                     CASE WHEN r.is_private THEN r.password END AS secret,
                     r.is_active AND w.is_active AS is_active,
                     r.last_activity
              FROM rooms r
              JOIN whiteboards w ON w.id = r.whiteboard_id
              WHERE r.room_id = $1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let max: i32 = row.get("max_participants");
        let max_participants =
            u32::try_from(max).map_err(|_| StoreError::Corrupt(format!("room {room_id} has max_participants {max}")))?;

        let participants = sqlx::query(
            r"SELECT user_id, user_name, color, joined_at, is_active, can_draw, can_erase, can_clear
              FROM room_participants
              WHERE room_id = $1
              ORDER BY joined_at ASC",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| ParticipantRecord {
            user_id: r.get("user_id"),
            user_name: r.get("user_name"),
            color: r.get("color"),
            joined_at: r.get("joined_at"),
            is_active: r.get("is_active"),
            permissions: Permissions {
                can_draw: r.get("can_draw"),
                can_erase: r.get("can_erase"),
                can_clear: r.get("can_clear"),
            },
        })
        .collect();

        Ok(Some(RoomRecord {
            room_id: row.get("room_id"),
            whiteboard_id: row.get("whiteboard_id"),
            max_participants,
            secret: row.get("secret"),
            is_active: row.get("is_active"),
            last_activity: row.get("last_activity"),
            participants,
        }))
    }

    async fn get_collaborators(&self, whiteboard_id: &str) -> Result<Vec<Collaborator>, StoreError> {
        let rows = sqlx::query(
            r"SELECT created_by AS user_id, 'owner' AS role FROM whiteboards WHERE id = $1
              UNION
              SELECT user_id, role FROM whiteboard_collaborators WHERE whiteboard_id = $1",
        )
        .bind(whiteboard_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out: Vec<Collaborator> = Vec::with_capacity(rows.len());
        for row in rows {
            let user_id: String = row.get("user_id");
            let raw_role: String = row.get("role");
            let Some(role) = Role::from_str(&raw_role) else {
                return Err(StoreError::Corrupt(format!("unknown role {raw_role:?} for {user_id}")));
            };
            // Owner row wins over a duplicate collaborator row.
            match out.iter_mut().find(|c| c.user_id == user_id) {
                Some(existing) if role == Role::Owner => existing.role = Role::Owner,
                Some(_) => {}
                None => out.push(Collaborator { user_id, role }),
            }
        }
        Ok(out)
    }

    async fn append_action(&self, whiteboard_id: &str, action: &DrawingAction) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO drawing_actions
                  (id, whiteboard_id, kind, user_id, user_name, data, extra, client_token, target_id, ts)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(action.id)
        .bind(whiteboard_id)
        .bind(action.kind.as_str())
        .bind(&action.user_id)
        .bind(&action.user_name)
        .bind(&action.data)
        .bind(Json(&action.extra))
        .bind(&action.client_token)
        .bind(action.target_id)
        .bind(action.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_participant(&self, room_id: &str, participant: &ParticipantRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r"INSERT INTO room_participants
                  (room_id, user_id, user_name, color, joined_at, is_active, can_draw, can_erase, can_clear)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
              ON CONFLICT (room_id, user_id) DO UPDATE SET
                  user_name = EXCLUDED.user_name,
                  color = EXCLUDED.color,
                  is_active = EXCLUDED.is_active,
                  can_draw = EXCLUDED.can_draw,
                  can_erase = EXCLUDED.can_erase,
                  can_clear = EXCLUDED.can_clear",
        )
        .bind(room_id)
        .bind(&participant.user_id)
        .bind(&participant.user_name)
        .bind(&participant.color)
        .bind(participant.joined_at)
        .bind(participant.is_active)
        .bind(participant.permissions.can_draw)
        .bind(participant.permissions.can_erase)
        .bind(participant.permissions.can_clear)
        .execute(tx.as_mut())
        .await?;

        sqlx::query("UPDATE rooms SET last_activity = $2 WHERE room_id = $1")
            .bind(room_id)
            .bind(crate::event::now_ms())
            .execute(tx.as_mut())
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_actions(&self, whiteboard_id: &str) -> Result<Vec<DrawingAction>, StoreError> {
        let rows = sqlx::query(
            r"SELECT id, kind, user_id, user_name, data, extra, client_token, target_id, ts
              FROM drawing_actions
              WHERE whiteboard_id = $1
              ORDER BY seq ASC",
        )
        .bind(whiteboard_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let raw_kind: String = r.get("kind");
                let kind = ActionKind::from_str(&raw_kind)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown action kind {raw_kind:?}")))?;
                Ok(DrawingAction {
                    id: r.get::<Uuid, _>("id"),
                    kind,
                    user_id: r.get("user_id"),
                    user_name: r.get("user_name"),
                    data: r.get("data"),
                    timestamp: r.get("ts"),
                    client_token: r.get("client_token"),
                    target_id: r.get("target_id"),
                    extra: r.get::<Json<serde_json::Map<String, serde_json::Value>>, _>("extra").0,
                })
            })
            .collect()
    }
}

#[cfg(all(test, feature = "live-db-tests"))]
#[path = "postgres_test.rs"]
mod tests;
