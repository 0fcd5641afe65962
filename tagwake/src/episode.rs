//! The alarm episode: one continuous alarm-to-dismissal lifecycle.
//!
//! # State Machine
//!
//! ```text
//!              fire                 stop
//!  Idle ───────────────► Ringing ──────────► AwaitingDismissal
//!                          ▲  │                 │   │
//!                          │  │  fallback fires │   │
//!                          └──┼─────────────────┘   │
//!                             │                     │
//!            valid scan /     ▼                     ▼
//!            staleness     Resolved / Expired  (terminal)
//! ```
//!
//! An episode only moves forward, except for the fallback wraparound
//! `AwaitingDismissal → Ringing`. Terminal states are never left; a
//! terminal episode is removed from the store rather than persisted.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credential::Credential;

/// Opaque episode identifier, stable across fallback re-arms.
///
/// Generated as a UUID v4 and persisted in its hyphenated string form.
/// Only UUID strings are accepted back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpisodeId(Uuid);

impl EpisodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EpisodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EpisodeState {
    /// No episode.
    Idle,
    /// Trigger fired, not yet acknowledged.
    Ringing,
    /// Acknowledged with "stop"; feedback continues and a fallback is armed.
    AwaitingDismissal,
    /// Dismissed with a valid credential.
    Resolved,
    /// Outlived the staleness window without being dismissed.
    Expired,
}

impl EpisodeState {
    /// Whether the episode still requires dismissal.
    pub fn is_open(self) -> bool {
        match self {
            EpisodeState::Ringing | EpisodeState::AwaitingDismissal => true,
            EpisodeState::Idle | EpisodeState::Resolved | EpisodeState::Expired => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        match self {
            EpisodeState::Resolved | EpisodeState::Expired => true,
            EpisodeState::Idle | EpisodeState::Ringing | EpisodeState::AwaitingDismissal => false,
        }
    }

    /// Whether `self → next` is a legal edge.
    pub fn can_transition_to(self, next: EpisodeState) -> bool {
        use EpisodeState::*;
        matches!(
            (self, next),
            (Idle, Ringing)
                | (Ringing, AwaitingDismissal)
                | (AwaitingDismissal, Ringing)
                | (Ringing | AwaitingDismissal, Resolved | Expired)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal episode transition {from} -> {to}")]
pub struct TransitionError {
    pub from: EpisodeState,
    pub to: EpisodeState,
}

/// An alarm that must eventually be dismissed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmEpisode {
    id: EpisodeId,
    expected_credential: Credential,
    created_at: OffsetDateTime,
    state: EpisodeState,
    fallback_count: u32,
}

impl AlarmEpisode {
    /// Start a new episode in `Ringing`.
    ///
    /// The creation time is truncated to whole seconds, the precision of the
    /// persisted record, so a stored and reloaded episode compares equal.
    pub fn new(expected_credential: Credential, now: OffsetDateTime) -> Self {
        Self {
            id: EpisodeId::new(),
            expected_credential,
            created_at: now.replace_nanosecond(0).unwrap_or(now),
            state: EpisodeState::Ringing,
            fallback_count: 0,
        }
    }

    pub fn id(&self) -> EpisodeId {
        self.id
    }

    pub fn expected_credential(&self) -> &Credential {
        &self.expected_credential
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn state(&self) -> EpisodeState {
        self.state
    }

    pub fn fallback_count(&self) -> u32 {
        self.fallback_count
    }

    /// Time elapsed since the first trigger. Zero if the clock went
    /// backwards.
    pub fn age(&self, now: OffsetDateTime) -> std::time::Duration {
        (now - self.created_at).try_into().unwrap_or_default()
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&mut self, next: EpisodeState) -> Result<EpisodeState, TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    pub(crate) fn record_fallback(&mut self) {
        self.fallback_count = self.fallback_count.saturating_add(1);
    }
}

/// Non-terminal states that may appear in a persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PersistedState {
    #[default]
    Ringing,
    AwaitingDismissal,
}

/// Durable form of an [`AlarmEpisode`].
///
/// Serialized as a self-describing JSON object. Unknown fields are ignored
/// so records written by newer versions still load. `state` is optional and
/// defaults to `ringing` for records that predate it.
///
/// `episodeID` must be a UUID string, which is all this crate writes. A
/// record carrying any other id fails to decode and the store discards it
/// as corrupt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeRecord {
    #[serde(rename = "episodeID")]
    pub episode_id: EpisodeId,
    pub expected_credential: Credential,
    pub created_at_epoch_seconds: i64,
    pub fallback_count: u32,
    #[serde(default)]
    pub state: PersistedState,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("episode in state {0} cannot be persisted")]
    NotPersistable(EpisodeState),

    #[error("timestamp {0} out of range")]
    Timestamp(i64),
}

impl TryFrom<&AlarmEpisode> for EpisodeRecord {
    type Error = RecordError;

    fn try_from(episode: &AlarmEpisode) -> Result<Self, Self::Error> {
        let state = match episode.state {
            EpisodeState::Ringing => PersistedState::Ringing,
            EpisodeState::AwaitingDismissal => PersistedState::AwaitingDismissal,
            other @ (EpisodeState::Idle | EpisodeState::Resolved | EpisodeState::Expired) => {
                return Err(RecordError::NotPersistable(other));
            }
        };

        Ok(Self {
            episode_id: episode.id,
            expected_credential: episode.expected_credential.clone(),
            created_at_epoch_seconds: episode.created_at.unix_timestamp(),
            fallback_count: episode.fallback_count,
            state,
        })
    }
}

impl TryFrom<EpisodeRecord> for AlarmEpisode {
    type Error = RecordError;

    fn try_from(record: EpisodeRecord) -> Result<Self, Self::Error> {
        let created_at = OffsetDateTime::from_unix_timestamp(record.created_at_epoch_seconds)
            .map_err(|_| RecordError::Timestamp(record.created_at_epoch_seconds))?;

        Ok(Self {
            id: record.episode_id,
            expected_credential: record.expected_credential,
            created_at,
            state: match record.state {
                PersistedState::Ringing => EpisodeState::Ringing,
                PersistedState::AwaitingDismissal => EpisodeState::AwaitingDismissal,
            },
            fallback_count: record.fallback_count,
        })
    }
}
