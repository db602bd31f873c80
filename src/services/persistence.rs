//! Persistence service — ordered background writer for the action log and
//! participant records.
//!
//! DESIGN
//! ======
//! All writes flow through one bounded queue drained by one worker, so the
//! store sees them in exactly the order they were enqueued. Callers enqueue
//! while still holding the room lock, which makes log order equal to the
//! order the room applied and broadcast the actions.
//!
//! Room handling never awaits store I/O for writes: `try_send` either queues
//! the job or fails immediately.
//!
//! ERROR HANDLING
//! ==============
//! Each job is retried with linear back-off. When retries are exhausted (or
//! the queue rejects the job) the write is dropped, `persist_failures` is
//! bumped, an error is logged, and the originating connection, when known,
//! receives a `PERSISTENCE_FAILED` error event. The broadcast that already
//! happened is not rolled back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::event::{ErrorCode, ServerEvent};
use crate::state::{AppState, ConnHandle, DrawingAction};
use crate::store::{ParticipantRecord, RoomStore, StoreError};

/// One unit of work for the persistence worker.
#[derive(Debug)]
pub enum PersistJob {
    AppendAction {
        room_id: String,
        whiteboard_id: String,
        action: DrawingAction,
        /// Connection to notify if the write is ultimately dropped.
        origin: Option<ConnHandle>,
    },
    SetParticipant {
        room_id: String,
        record: ParticipantRecord,
    },
}

impl PersistJob {
    fn room_id(&self) -> &str {
        match self {
            Self::AppendAction { room_id, .. } | Self::SetParticipant { room_id, .. } => room_id,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::AppendAction { .. } => "append_action",
            Self::SetParticipant { .. } => "set_participant",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to persist {what} after {attempts} attempts: {source}")]
    Store {
        what: &'static str,
        attempts: usize,
        #[source]
        source: StoreError,
    },
    #[error("persistence queue unavailable; {0} dropped")]
    QueueFull(&'static str),
}

impl ErrorCode for PersistError {
    fn error_code(&self) -> &'static str {
        "PERSISTENCE_FAILED"
    }
}

#[derive(Clone, Copy)]
struct RetryPolicy {
    retries: usize,
    base: Duration,
}

/// Spawn the ordered persistence worker and return its queue sender.
///
/// The worker exits once every sender is dropped and the queue is drained.
#[must_use]
pub fn spawn_persistence_worker(
    config: &Config,
    store: Arc<dyn RoomStore>,
    failures: Arc<AtomicU64>,
) -> mpsc::Sender<PersistJob> {
    let (tx, mut rx) = mpsc::channel::<PersistJob>(config.persist_queue_capacity);
    let policy = RetryPolicy { retries: config.persist_retries.max(1), base: config.persist_retry_base };

    info!(
        queue_capacity = config.persist_queue_capacity,
        retries = policy.retries,
        retry_base_ms = u64::try_from(policy.base.as_millis()).unwrap_or(u64::MAX),
        "persistence worker configured"
    );

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            if let Err(e) = run_with_retry(store.as_ref(), &job, policy).await {
                report_failure(&failures, &job, &e);
            }
        }
        debug!("persistence worker stopped");
    });

    tx
}

/// Queue an action-log append. Non-blocking.
pub fn enqueue_action(
    state: &AppState,
    room_id: &str,
    whiteboard_id: &str,
    action: &DrawingAction,
    origin: Option<ConnHandle>,
) {
    enqueue(
        state,
        PersistJob::AppendAction {
            room_id: room_id.to_string(),
            whiteboard_id: whiteboard_id.to_string(),
            action: action.clone(),
            origin,
        },
    );
}

/// Queue a participant upsert. Non-blocking.
pub fn enqueue_participant(state: &AppState, room_id: &str, record: ParticipantRecord) {
    enqueue(state, PersistJob::SetParticipant { room_id: room_id.to_string(), record });
}

fn enqueue(state: &AppState, job: PersistJob) {
    match state.persist_tx.try_send(job) {
        Ok(()) => {}
        Err(TrySendError::Full(job) | TrySendError::Closed(job)) => {
            let err = PersistError::QueueFull(job.label());
            report_failure(&state.persist_failures, &job, &err);
        }
    }
}

async fn run_with_retry(store: &dyn RoomStore, job: &PersistJob, policy: RetryPolicy) -> Result<(), PersistError> {
    let mut attempt = 1;
    loop {
        match execute(store, job).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < policy.retries => {
                warn!(
                    error = %e,
                    attempt,
                    total = policy.retries,
                    job = job.label(),
                    room_id = job.room_id(),
                    "persist failed; retrying"
                );
                tokio::time::sleep(policy.base.saturating_mul(u32::try_from(attempt).unwrap_or(u32::MAX))).await;
                attempt += 1;
            }
            Err(source) => return Err(PersistError::Store { what: job.label(), attempts: attempt, source }),
        }
    }
}

async fn execute(store: &dyn RoomStore, job: &PersistJob) -> Result<(), StoreError> {
    match job {
        PersistJob::AppendAction { whiteboard_id, action, .. } => store.append_action(whiteboard_id, action).await,
        PersistJob::SetParticipant { room_id, record } => store.set_participant(room_id, record).await,
    }
}

fn report_failure(failures: &AtomicU64, job: &PersistJob, err: &PersistError) {
    failures.fetch_add(1, Ordering::Relaxed);
    error!(error = %err, job = job.label(), room_id = job.room_id(), "persistence dropped write");

    if let PersistJob::AppendAction { room_id, origin: Some(conn), .. } = job {
        conn.deliver(ServerEvent::error_from(Some(room_id), err));
    }
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
