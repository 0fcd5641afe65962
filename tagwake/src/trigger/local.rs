//! In-process trigger service driven by tokio timers.
//!
//! Triggers only fire while this process runs, so this is no substitute for
//! a platform alarm service across restarts. It serves hosts without one,
//! the demo CLI, and time-controlled tests (`tokio::time::pause`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    TriggerError, TriggerHandle, TriggerId, TriggerPayload, TriggerPhase, TriggerService,
    TriggerSnapshot, TriggerUpdate,
};
use crate::clock::Clock;
use crate::tracing::prelude::*;

const UPDATE_CHANNEL_CAPACITY: usize = 64;

struct Entry {
    snapshot: TriggerSnapshot,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    entries: Mutex<HashMap<TriggerId, Entry>>,
    updates_tx: mpsc::Sender<TriggerUpdate>,
    authorized: Mutex<bool>,
    capacity: usize,
}

pub struct LocalTriggerService {
    inner: Arc<Inner>,
    clock: Arc<dyn Clock>,
    updates_rx: Mutex<Option<mpsc::Receiver<TriggerUpdate>>>,
}

impl LocalTriggerService {
    /// `capacity` bounds the number of triggers that are scheduled or firing
    /// at once; requests beyond it fail with
    /// [`TriggerError::ScheduleFailed`].
    pub fn new(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                updates_tx,
                authorized: Mutex::new(true),
                capacity,
            }),
            clock,
            updates_rx: Mutex::new(Some(updates_rx)),
        }
    }

    /// Grant or revoke permission to schedule.
    pub fn set_authorized(&self, authorized: bool) {
        *self.inner.authorized.lock() = authorized;
    }
}

impl Inner {
    async fn fire(self: Arc<Self>, id: TriggerId) {
        let update = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&id) else {
                return;
            };
            if entry.snapshot.phase != TriggerPhase::Scheduled {
                return;
            }
            entry.snapshot.phase = TriggerPhase::Firing;
            entry.timer = None;
            TriggerUpdate {
                id,
                phase: TriggerPhase::Firing,
                payload: entry.snapshot.payload.clone(),
            }
        };

        debug!(trigger_id = %id, "Local trigger fired");
        if self.updates_tx.send(update).await.is_err() {
            debug!(trigger_id = %id, "Trigger update channel closed");
        }
    }

    fn live_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.snapshot.phase != TriggerPhase::Cancelled)
            .count()
    }
}

#[async_trait]
impl TriggerService for LocalTriggerService {
    async fn schedule_trigger(
        &self,
        id: TriggerId,
        fire_at: OffsetDateTime,
        payload: TriggerPayload,
    ) -> Result<TriggerHandle, TriggerError> {
        if !*self.inner.authorized.lock() {
            return Err(TriggerError::AuthorizationDenied);
        }
        if self.inner.live_count() >= self.inner.capacity {
            return Err(TriggerError::ScheduleFailed(format!(
                "capacity of {} triggers reached",
                self.inner.capacity
            )));
        }

        let delay: Duration = (fire_at - self.clock.now()).try_into().unwrap_or_default();
        let inner = self.inner.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire(id).await;
        });

        let snapshot = TriggerSnapshot {
            id,
            phase: TriggerPhase::Scheduled,
            fire_at,
            payload: payload.clone(),
        };
        let previous = self.inner.entries.lock().insert(
            id,
            Entry {
                snapshot,
                timer: Some(timer),
            },
        );
        if let Some(Entry {
            timer: Some(old), ..
        }) = previous
        {
            old.abort();
        }

        let update = TriggerUpdate {
            id,
            phase: TriggerPhase::Scheduled,
            payload,
        };
        if self.inner.updates_tx.try_send(update).is_err() {
            trace!(trigger_id = %id, "Scheduled update dropped");
        }

        debug!(trigger_id = %id, delay_ms = delay.as_millis() as u64, "Local trigger scheduled");
        Ok(TriggerHandle { id, fire_at })
    }

    async fn cancel_trigger(&self, id: TriggerId) -> Result<(), TriggerError> {
        let update = {
            let mut entries = self.inner.entries.lock();
            let entry = entries.get_mut(&id).ok_or(TriggerError::NotFound(id))?;
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry.snapshot.phase = TriggerPhase::Cancelled;
            TriggerUpdate {
                id,
                phase: TriggerPhase::Cancelled,
                payload: entry.snapshot.payload.clone(),
            }
        };

        if self.inner.updates_tx.try_send(update).is_err() {
            trace!(trigger_id = %id, "Cancelled update dropped");
        }
        Ok(())
    }

    async fn list_triggers(&self) -> Result<Vec<TriggerSnapshot>, TriggerError> {
        Ok(self
            .inner
            .entries
            .lock()
            .values()
            .filter(|e| e.snapshot.phase != TriggerPhase::Cancelled)
            .map(|e| e.snapshot.clone())
            .collect())
    }

    fn take_update_receiver(&self) -> Option<mpsc::Receiver<TriggerUpdate>> {
        self.updates_rx.lock().take()
    }
}
