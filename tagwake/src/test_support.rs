//! Test doubles shared by the unit tests.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;
use time::macros::datetime;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::config::AlarmConfig;
use crate::episode::EpisodeId;
use crate::feedback::FeedbackSink;
use crate::machine::{Collaborators, EpisodeStateMachine, FireOutcome};
use crate::store::{MemoryBackend, StoreBackend};
use crate::trigger::{
    TriggerError, TriggerHandle, TriggerId, TriggerPayload, TriggerPhase, TriggerService,
    TriggerSnapshot, TriggerUpdate,
};

pub const TAG: &str = "0455B45F396180";

pub const START: OffsetDateTime = datetime!(2026-10-16 06:30:00 UTC);

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn at(now: OffsetDateTime) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now),
        })
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

/// Memory backend whose first `n` writes (sets or deletes) fail.
#[derive(Debug, Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    failures_left: Mutex<u32>,
}

impl FlakyBackend {
    pub fn failing_writes(n: u32) -> Self {
        Self {
            inner: MemoryBackend::new(),
            failures_left: Mutex::new(n),
        }
    }

    fn check(&self) -> io::Result<()> {
        let mut left = self.failures_left.lock();
        if *left > 0 {
            *left -= 1;
            return Err(io::Error::other("disk full"));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for FlakyBackend {
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> io::Result<()> {
        self.check()?;
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> io::Result<()> {
        self.check()?;
        self.inner.delete(key).await
    }
}

/// Trigger service that records requests and never fires on its own.
pub struct FakeTriggerService {
    triggers: Mutex<Vec<TriggerSnapshot>>,
    scheduled: Mutex<Vec<TriggerId>>,
    cancelled: Mutex<Vec<TriggerId>>,
    schedule_error: Mutex<Option<TriggerError>>,
    list_error: Mutex<Option<TriggerError>>,
    updates_tx: mpsc::Sender<TriggerUpdate>,
    updates_rx: Mutex<Option<mpsc::Receiver<TriggerUpdate>>>,
}

impl FakeTriggerService {
    pub fn new() -> Self {
        let (updates_tx, updates_rx) = mpsc::channel(64);
        Self {
            triggers: Mutex::new(Vec::new()),
            scheduled: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            schedule_error: Mutex::new(None),
            list_error: Mutex::new(None),
            updates_tx,
            updates_rx: Mutex::new(Some(updates_rx)),
        }
    }

    pub fn fail_schedules_with(&self, error: TriggerError) {
        *self.schedule_error.lock() = Some(error);
    }

    pub fn fail_lists_with(&self, error: TriggerError) {
        *self.list_error.lock() = Some(error);
    }

    /// Add a trigger as if an earlier process had scheduled it.
    pub fn insert(&self, phase: TriggerPhase, payload: TriggerPayload) -> TriggerId {
        self.insert_at(phase, payload, START)
    }

    pub fn insert_at(
        &self,
        phase: TriggerPhase,
        payload: TriggerPayload,
        fire_at: OffsetDateTime,
    ) -> TriggerId {
        let id = TriggerId::new();
        self.triggers.lock().push(TriggerSnapshot {
            id,
            phase,
            fire_at,
            payload,
        });
        id
    }

    /// Mark `id` as alerting and return the update the service would emit.
    pub fn fire(&self, id: TriggerId) -> TriggerUpdate {
        let mut triggers = self.triggers.lock();
        let snapshot = triggers
            .iter_mut()
            .find(|s| s.id == id)
            .expect("unknown trigger");
        snapshot.phase = TriggerPhase::Firing;
        TriggerUpdate {
            id,
            phase: TriggerPhase::Firing,
            payload: snapshot.payload.clone(),
        }
    }

    /// Fire `id` through the update stream.
    pub async fn fire_on_stream(&self, id: TriggerId) {
        let update = self.fire(id);
        self.updates_tx.send(update).await.expect("update stream closed");
    }

    pub fn snapshot(&self, id: TriggerId) -> Option<TriggerSnapshot> {
        self.triggers.lock().iter().find(|s| s.id == id).cloned()
    }

    /// Triggers accepted through `schedule_trigger`, in order.
    pub fn scheduled_ids(&self) -> Vec<TriggerId> {
        self.scheduled.lock().clone()
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduled.lock().len()
    }

    pub fn cancelled(&self) -> Vec<TriggerId> {
        self.cancelled.lock().clone()
    }

    /// Triggers not cancelled.
    pub fn live(&self) -> Vec<TriggerSnapshot> {
        self.triggers
            .lock()
            .iter()
            .filter(|s| s.phase != TriggerPhase::Cancelled)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TriggerService for FakeTriggerService {
    async fn schedule_trigger(
        &self,
        id: TriggerId,
        fire_at: OffsetDateTime,
        payload: TriggerPayload,
    ) -> Result<TriggerHandle, TriggerError> {
        if let Some(error) = self.schedule_error.lock().clone() {
            return Err(error);
        }
        self.triggers.lock().push(TriggerSnapshot {
            id,
            phase: TriggerPhase::Scheduled,
            fire_at,
            payload,
        });
        self.scheduled.lock().push(id);
        Ok(TriggerHandle { id, fire_at })
    }

    async fn cancel_trigger(&self, id: TriggerId) -> Result<(), TriggerError> {
        let mut triggers = self.triggers.lock();
        let snapshot = triggers
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(TriggerError::NotFound(id))?;
        snapshot.phase = TriggerPhase::Cancelled;
        self.cancelled.lock().push(id);
        Ok(())
    }

    async fn list_triggers(&self) -> Result<Vec<TriggerSnapshot>, TriggerError> {
        if let Some(error) = self.list_error.lock().clone() {
            return Err(error);
        }
        Ok(self.live())
    }

    fn take_update_receiver(&self) -> Option<mpsc::Receiver<TriggerUpdate>> {
        self.updates_rx.lock().take()
    }
}

/// Feedback sink that records every signal.
#[derive(Debug, Default)]
pub struct RecordingFeedback {
    starts: Mutex<Vec<EpisodeId>>,
    stops: Mutex<usize>,
}

impl RecordingFeedback {
    pub fn starts(&self) -> Vec<EpisodeId> {
        self.starts.lock().clone()
    }

    pub fn stops(&self) -> usize {
        *self.stops.lock()
    }

    pub fn reset(&self) {
        self.starts.lock().clear();
        *self.stops.lock() = 0;
    }
}

impl FeedbackSink for RecordingFeedback {
    fn start_feedback(&self, episode: EpisodeId) {
        self.starts.lock().push(episode);
    }

    fn stop_feedback(&self) {
        *self.stops.lock() += 1;
    }
}

/// Shared fakes. Each [`machine`](Self::machine) call builds a fresh state
/// machine over the same store, which is how a process restart looks.
pub struct Harness {
    pub config: AlarmConfig,
    pub clock: Arc<ManualClock>,
    pub backend: Arc<dyn StoreBackend>,
    pub triggers: Arc<FakeTriggerService>,
    pub feedback: Arc<RecordingFeedback>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()))
    }

    /// Harness whose store fails its first `n` writes.
    pub fn flaky(n: u32) -> Self {
        Self::with_backend(Arc::new(FlakyBackend::failing_writes(n)))
    }

    fn with_backend(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            config: AlarmConfig::default(),
            clock: ManualClock::at(START),
            backend,
            triggers: Arc::new(FakeTriggerService::new()),
            feedback: Arc::new(RecordingFeedback::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            backend: self.backend.clone(),
            triggers: self.triggers.clone(),
            feedback: self.feedback.clone(),
            clock: self.clock.clone(),
        }
    }

    pub fn machine(&self) -> EpisodeStateMachine {
        EpisodeStateMachine::new(&self.config, self.collaborators())
    }

    /// A primary alarm for [`TAG`] starts alerting and is delivered.
    pub async fn fire_primary(&self, machine: &mut EpisodeStateMachine) -> FireOutcome {
        let payload = TriggerPayload::primary(TAG.into());
        let id = self.triggers.insert(TriggerPhase::Firing, payload.clone());
        machine.trigger_fired(id, payload).await.unwrap()
    }
}
