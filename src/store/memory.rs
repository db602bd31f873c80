//! In-memory `RoomStore`, used by tests and by local runs without `DATABASE_URL`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::{Collaborator, ParticipantRecord, RoomRecord, RoomStore, StoreError};
use crate::state::DrawingAction;

#[derive(Default)]
struct Inner {
    rooms: HashMap<String, RoomRecord>,
    collaborators: HashMap<String, Vec<Collaborator>>,
    actions: HashMap<String, Vec<DrawingAction>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn insert_whiteboard(&self, whiteboard_id: &str, collaborators: Vec<Collaborator>) {
        self.lock().collaborators.insert(whiteboard_id.to_string(), collaborators);
    }

    #[cfg(test)]
    pub fn insert_room(&self, record: RoomRecord) {
        self.lock().rooms.insert(record.room_id.clone(), record);
    }

    /// Mark a room inactive, as the external owner would on delete.
    #[cfg(test)]
    pub fn deactivate_room(&self, room_id: &str) {
        if let Some(room) = self.lock().rooms.get_mut(room_id) {
            room.is_active = false;
        }
    }

    /// Make every write fail until reset.
    #[cfg(test)]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every read fail until reset.
    #[cfg(test)]
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn actions(&self, whiteboard_id: &str) -> Vec<DrawingAction> {
        self.lock().actions.get(whiteboard_id).cloned().unwrap_or_default()
    }

    #[cfg(test)]
    #[must_use]
    pub fn participant(&self, room_id: &str, user_id: &str) -> Option<ParticipantRecord> {
        self.lock()
            .rooms
            .get(room_id)
            .and_then(|r| r.participants.iter().find(|p| p.user_id == user_id).cloned())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a test panicked mid-write; the data is still usable.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store reads disabled".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store writes disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        self.check_read()?;
        Ok(self.lock().rooms.get(room_id).cloned())
    }

    async fn get_collaborators(&self, whiteboard_id: &str) -> Result<Vec<Collaborator>, StoreError> {
        self.check_read()?;
        Ok(self.lock().collaborators.get(whiteboard_id).cloned().unwrap_or_default())
    }

    async fn append_action(&self, whiteboard_id: &str, action: &DrawingAction) -> Result<(), StoreError> {
        self.check_write()?;
        self.lock()
            .actions
            .entry(whiteboard_id.to_string())
            .or_default()
            .push(action.clone());
        Ok(())
    }

    async fn set_participant(&self, room_id: &str, participant: &ParticipantRecord) -> Result<(), StoreError> {
        self.check_write()?;
        let mut inner = self.lock();
        let Some(room) = inner.rooms.get_mut(room_id) else {
            return Err(StoreError::Corrupt(format!("room {room_id} does not exist")));
        };
        match room.participants.iter_mut().find(|p| p.user_id == participant.user_id) {
            Some(existing) => *existing = participant.clone(),
            None => room.participants.push(participant.clone()),
        }
        room.last_activity = crate::event::now_ms();
        Ok(())
    }

    async fn list_actions(&self, whiteboard_id: &str) -> Result<Vec<DrawingAction>, StoreError> {
        self.check_read()?;
        Ok(self.actions(whiteboard_id))
    }
}
