//! Boundary to the platform's alarm trigger service.
//!
//! The trigger service owns wall-clock scheduling: it fires at a requested
//! time even if this process is not running, and reports state changes on an
//! update stream when it is. Each trigger carries a [`TriggerPayload`] so a
//! firing can be correlated to the episode that armed it.

pub mod local;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::credential::Credential;
use crate::episode::EpisodeId;

pub use local::LocalTriggerService;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(Uuid);

impl TriggerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TriggerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Data attached to a trigger and handed back when it fires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPayload {
    /// The episode a fallback belongs to. `None` for a primary alarm,
    /// which creates its episode when it fires.
    pub episode_id: Option<EpisodeId>,
    pub expected_credential: Credential,
}

impl TriggerPayload {
    pub fn primary(expected_credential: Credential) -> Self {
        Self {
            episode_id: None,
            expected_credential,
        }
    }

    pub fn fallback(episode_id: EpisodeId, expected_credential: Credential) -> Self {
        Self {
            episode_id: Some(episode_id),
            expected_credential,
        }
    }
}

/// An accepted schedule request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerHandle {
    pub id: TriggerId,
    pub fire_at: OffsetDateTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum TriggerPhase {
    /// Waiting for its fire time.
    Scheduled,
    /// Fired and still alerting.
    Firing,
    /// Cancelled before or after firing.
    Cancelled,
}

/// A trigger as reported by [`TriggerService::list_triggers`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerSnapshot {
    pub id: TriggerId,
    pub phase: TriggerPhase,
    pub fire_at: OffsetDateTime,
    pub payload: TriggerPayload,
}

/// A state change delivered on the update stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerUpdate {
    pub id: TriggerId,
    pub phase: TriggerPhase,
    pub payload: TriggerPayload,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TriggerError {
    /// The user has not granted permission to schedule alarms. Not retried;
    /// a human must grant it.
    #[error("not authorized to schedule alarms")]
    AuthorizationDenied,

    /// Transient failure such as resource exhaustion. The caller may retry.
    #[error("schedule failed: {0}")]
    ScheduleFailed(String),

    #[error("no trigger with id {0}")]
    NotFound(TriggerId),

    #[error("trigger service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TriggerService: Send + Sync {
    /// Ask the service to fire at `fire_at`, carrying `payload`.
    async fn schedule_trigger(
        &self,
        id: TriggerId,
        fire_at: OffsetDateTime,
        payload: TriggerPayload,
    ) -> Result<TriggerHandle, TriggerError>;

    /// Cancel a scheduled trigger, or silence a firing one.
    async fn cancel_trigger(&self, id: TriggerId) -> Result<(), TriggerError>;

    /// Every trigger the service currently knows about.
    async fn list_triggers(&self) -> Result<Vec<TriggerSnapshot>, TriggerError>;

    /// Take the update stream. Returns `None` once taken.
    fn take_update_receiver(&self) -> Option<mpsc::Receiver<TriggerUpdate>>;
}

/// Schedule a primary alarm that will open a new episode when it fires.
pub async fn schedule_alarm(
    service: &dyn TriggerService,
    fire_at: OffsetDateTime,
    expected_credential: Credential,
) -> Result<TriggerHandle, TriggerError> {
    service
        .schedule_trigger(
            TriggerId::new(),
            fire_at,
            TriggerPayload::primary(expected_credential),
        )
        .await
}
