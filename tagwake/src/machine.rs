//! The episode state machine.
//!
//! Consumes trigger firings, "stop" acknowledgements and scanned
//! credentials, and turns them into episode transitions plus side effects
//! on the store, the fallback scheduler, the trigger service and the
//! feedback loop. See [`crate::episode`] for the state diagram.
//!
//! The machine is not shared: it is owned by a single actor (see
//! [`crate::actor`]) that processes one event to completion before the
//! next, so transitions are serialized without locking.
//!
//! Persistence failures are the only errors returned. Everything else a
//! caller can expect to happen is an outcome variant.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::clock::Clock;
use crate::config::AlarmConfig;
use crate::credential::{Credential, validate};
use crate::episode::{AlarmEpisode, EpisodeId, EpisodeState};
use crate::error::{Error, Result};
use crate::fallback::{ArmOutcome, FallbackScheduler, cancel_quietly};
use crate::feedback::FeedbackSink;
use crate::store::{EpisodeStore, Loaded, StoreBackend, StoreError};
use crate::tracing::prelude::*;
use crate::trigger::{TriggerId, TriggerPayload, TriggerService};

/// External services the machine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn StoreBackend>,
    pub triggers: Arc<dyn TriggerService>,
    pub feedback: Arc<dyn FeedbackSink>,
    pub clock: Arc<dyn Clock>,
}

/// Result of a trigger firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// A new episode was opened and feedback started.
    Started(EpisodeId),
    /// A fallback re-opened an acknowledged episode (`AwaitingDismissal →
    /// Ringing`).
    Reopened(EpisodeId),
    /// A fallback fired while its episode was already ringing.
    AlreadyRinging(EpisodeId),
    /// Another alarm fired while an episode was open. The open episode is
    /// kept; no second episode is created.
    Coalesced(EpisodeId),
    /// A fallback for an episode that is no longer open. Cancelled.
    StaleFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// The episode is awaiting dismissal; `fallback` reports whether a
    /// fallback was armed.
    Acknowledged {
        episode_id: EpisodeId,
        fallback: ArmOutcome,
    },
    NoActiveEpisode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    /// The credential matched and the episode is over.
    Resolved(EpisodeId),
    /// Wrong tag. Nothing changed; prompt for another scan.
    InvalidCredential,
    NoActiveEpisode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingWrite {
    Save,
    Clear,
}

pub struct EpisodeStateMachine {
    store: EpisodeStore,
    fallbacks: FallbackScheduler,
    triggers: Arc<dyn TriggerService>,
    feedback: Arc<dyn FeedbackSink>,
    clock: Arc<dyn Clock>,
    store_write_attempts: u32,
    current: Option<AlarmEpisode>,
    /// Triggers that fired for the open episode and may still be alerting.
    firing: Vec<TriggerId>,
    /// A write the store has not yet accepted.
    pending_write: Option<PendingWrite>,
}

impl EpisodeStateMachine {
    pub fn new(config: &AlarmConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            backend,
            triggers,
            feedback,
            clock,
        } = collaborators;

        Self {
            store: EpisodeStore::new(backend, clock.clone(), config.staleness_window),
            fallbacks: FallbackScheduler::new(
                config.fallback.clone(),
                config.cancel_superseded_fallbacks,
                triggers.clone(),
                clock.clone(),
            ),
            triggers,
            feedback,
            clock,
            store_write_attempts: config.store_write_attempts.max(1),
            current: None,
            firing: Vec::new(),
            pending_write: None,
        }
    }

    pub fn state(&self) -> EpisodeState {
        self.current
            .as_ref()
            .map_or(EpisodeState::Idle, AlarmEpisode::state)
    }

    pub fn episode(&self) -> Option<&AlarmEpisode> {
        self.current.as_ref()
    }

    /// Whether the in-memory episode matches what the store holds.
    pub fn is_persisted(&self) -> bool {
        self.pending_write.is_none()
    }

    pub fn store(&self) -> &EpisodeStore {
        &self.store
    }

    pub(crate) fn triggers(&self) -> &Arc<dyn TriggerService> {
        &self.triggers
    }

    pub(crate) fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Handle a trigger firing. `Idle → Ringing` for a primary alarm,
    /// `AwaitingDismissal → Ringing` for a fallback of the open episode.
    ///
    /// With no episode in memory, an open episode in the store is loaded
    /// first and the firing is applied to it.
    pub async fn trigger_fired(
        &mut self,
        trigger: TriggerId,
        payload: TriggerPayload,
    ) -> Result<FireOutcome> {
        self.fallbacks.fired(trigger);
        let loaded = self.current.is_none() && self.load_open_episode().await;

        let Some((episode_id, state)) = self.current.as_ref().map(|e| (e.id(), e.state())) else {
            if payload.episode_id.is_some() {
                return Ok(self.stale_fallback(trigger, &payload).await);
            }

            let episode = AlarmEpisode::new(payload.expected_credential, self.clock.now());
            let episode_id = episode.id();
            info!(
                %episode_id,
                trigger_id = %trigger,
                from = %EpisodeState::Idle,
                to = %EpisodeState::Ringing,
                "Alarm episode started"
            );
            self.current = Some(episode);
            self.firing.push(trigger);
            self.feedback.start_feedback(episode_id);
            self.persist().await?;
            return Ok(FireOutcome::Started(episode_id));
        };

        match payload.episode_id {
            Some(id) if id == episode_id => {
                self.firing.push(trigger);
                match state {
                    EpisodeState::AwaitingDismissal => {
                        self.transition(EpisodeState::Ringing)?;
                        if !loaded {
                            self.feedback.start_feedback(episode_id);
                        }
                        self.persist().await?;
                        Ok(FireOutcome::Reopened(episode_id))
                    }
                    EpisodeState::Ringing => {
                        debug!(%episode_id, trigger_id = %trigger, "Fallback fired while ringing");
                        Ok(FireOutcome::AlreadyRinging(episode_id))
                    }
                    EpisodeState::Idle | EpisodeState::Resolved | EpisodeState::Expired => {
                        // Terminal episodes are never held in `current`.
                        warn!(%episode_id, %state, "Fallback fired for closed episode");
                        Ok(self.stale_fallback(trigger, &payload).await)
                    }
                }
            }
            Some(_) => Ok(self.stale_fallback(trigger, &payload).await),
            None => {
                info!(
                    %episode_id,
                    trigger_id = %trigger,
                    "Alarm fired while an episode is open; keeping the open episode"
                );
                self.firing.push(trigger);
                Ok(FireOutcome::Coalesced(episode_id))
            }
        }
    }

    /// Acknowledge the alarm without dismissing it.
    ///
    /// `Ringing → AwaitingDismissal`. Arms a fallback and silences the
    /// triggers that are alerting, but leaves the feedback loop running.
    /// Acknowledging again while awaiting dismissal arms another fallback.
    pub async fn stop(&mut self) -> Result<StopOutcome> {
        let Some(state) = self.current.as_ref().map(AlarmEpisode::state) else {
            debug!("Stop requested with no active episode");
            return Ok(StopOutcome::NoActiveEpisode);
        };

        if state == EpisodeState::Ringing {
            self.transition(EpisodeState::AwaitingDismissal)?;
        }

        for trigger in std::mem::take(&mut self.firing) {
            cancel_quietly(self.triggers.as_ref(), trigger).await;
        }

        let Some(episode) = self.current.as_mut() else {
            return Ok(StopOutcome::NoActiveEpisode);
        };
        let episode_id = episode.id();
        let fallback = self.fallbacks.arm(episode).await;

        self.persist().await?;
        Ok(StopOutcome::Acknowledged {
            episode_id,
            fallback,
        })
    }

    /// Check a scanned credential against the open episode.
    ///
    /// On a match the episode is resolved: feedback stops, the store is
    /// cleared and every trigger belonging to the episode is cancelled. A
    /// mismatch changes nothing.
    pub async fn submit_credential(&mut self, scanned: &Credential) -> Result<ScanVerdict> {
        let Some(episode) = self.current.as_ref() else {
            return Ok(ScanVerdict::NoActiveEpisode);
        };
        let episode_id = episode.id();

        if !validate(scanned, episode.expected_credential()) {
            info!(%episode_id, state = %episode.state(), "Scanned tag does not match");
            self.retry_pending_write().await;
            return Ok(ScanVerdict::InvalidCredential);
        }

        self.transition(EpisodeState::Resolved)?;
        self.feedback.stop_feedback();

        let firing = std::mem::take(&mut self.firing);
        for trigger in &firing {
            cancel_quietly(self.triggers.as_ref(), *trigger).await;
        }
        let cancelled = self.fallbacks.cancel_all(episode_id).await;
        debug!(
            %episode_id,
            firing = firing.len(),
            fallbacks = cancelled.len(),
            "Episode triggers cancelled"
        );

        self.current = None;
        self.persist().await?;
        Ok(ScanVerdict::Resolved(episode_id))
    }

    /// Re-enter a persisted episode after a restart or on return to the
    /// foreground, and restart its feedback loop.
    ///
    /// When `fallback_fired` is set, one of the episode's fallbacks is
    /// already alerting and an acknowledged episode goes back to ringing.
    /// No episode is created and no fallback is armed.
    pub(crate) async fn resume(
        &mut self,
        persisted: AlarmEpisode,
        fallback_fired: &[TriggerId],
    ) -> Result<()> {
        let episode_id = persisted.id();
        match self.current.as_ref().map(AlarmEpisode::id) {
            Some(current) if current == episode_id => {}
            Some(current) => {
                warn!(
                    replaced = %current,
                    %episode_id,
                    "In-memory episode differs from store; adopting stored episode"
                );
                self.firing.clear();
                self.current = Some(persisted);
            }
            None => self.current = Some(persisted),
        }

        for trigger in fallback_fired {
            self.fallbacks.fired(*trigger);
            if !self.firing.contains(trigger) {
                self.firing.push(*trigger);
            }
        }

        let reopen = !fallback_fired.is_empty() && self.state() == EpisodeState::AwaitingDismissal;
        if reopen {
            self.transition(EpisodeState::Ringing)?;
        }

        info!(%episode_id, state = %self.state(), "Resuming alarm episode");
        self.feedback.start_feedback(episode_id);

        if reopen {
            self.persist().await?;
        } else {
            self.retry_pending_write().await;
        }
        Ok(())
    }

    /// Record that `expired` outlived the staleness window. The store has
    /// already dropped it.
    ///
    /// If this process was still holding the episode its feedback loop is
    /// stopped, and the triggers that were alerting for it are returned.
    pub(crate) fn expire(&mut self, mut expired: AlarmEpisode) -> Vec<TriggerId> {
        let episode_id = expired.id();
        let from = expired.state();
        if let Err(e) = expired.transition(EpisodeState::Expired) {
            warn!(%episode_id, error = %e, "Unexpected state for expired episode");
        }
        info!(%episode_id, %from, to = %EpisodeState::Expired, "Alarm episode expired");

        if !self.current.as_ref().is_some_and(|c| c.id() == episode_id) {
            return Vec::new();
        }
        self.current = None;
        self.pending_write = None;
        self.feedback.stop_feedback();
        std::mem::take(&mut self.firing)
    }

    /// Forget an in-memory episode whose stored copy was removed by another
    /// process. Returns the triggers that were alerting for it.
    pub(crate) fn abandon(&mut self) -> Vec<TriggerId> {
        let Some(episode) = self.current.take() else {
            return Vec::new();
        };
        warn!(episode_id = %episode.id(), "Episode removed from store externally");
        self.pending_write = None;
        self.feedback.stop_feedback();
        std::mem::take(&mut self.firing)
    }

    /// Retry a write that previously failed. Failures are logged; the next
    /// state change reports them.
    pub(crate) async fn retry_pending_write(&mut self) {
        if self.pending_write.is_some() {
            if let Err(e) = self.flush().await {
                warn!(error = %e, "Episode still not persisted");
            }
        }
    }

    /// With no episode in memory, pick up an open episode from the store so
    /// a firing is never judged against an empty machine. Starts feedback
    /// for it and returns whether one was loaded.
    ///
    /// Skipped while a write is pending: the store is then behind memory.
    async fn load_open_episode(&mut self) -> bool {
        if self.pending_write.is_some() {
            return false;
        }
        match self.store.inspect().await {
            Ok(Loaded::Active(episode)) => {
                let episode_id = episode.id();
                info!(%episode_id, state = %episode.state(), "Loaded open episode from store");
                self.current = Some(episode);
                self.feedback.start_feedback(episode_id);
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(error = %e, "Could not read store; treating as idle");
                false
            }
        }
    }

    async fn stale_fallback(&mut self, trigger: TriggerId, payload: &TriggerPayload) -> FireOutcome {
        info!(
            trigger_id = %trigger,
            episode_id = ?payload.episode_id,
            "Fallback fired for an episode that is no longer open; cancelling"
        );
        cancel_quietly(self.triggers.as_ref(), trigger).await;
        FireOutcome::StaleFallback
    }

    fn transition(&mut self, next: EpisodeState) -> Result<()> {
        let Some(episode) = self.current.as_mut() else {
            return Ok(());
        };
        let episode_id = episode.id();
        let from = episode.transition(next).inspect_err(|e| {
            error!(%episode_id, error = %e, "Rejected transition");
        })?;
        info!(%episode_id, %from, to = %next, "Episode transition");
        Ok(())
    }

    /// Bring the store in line with `current`: save an open episode, clear
    /// the slot otherwise.
    async fn persist(&mut self) -> Result<()> {
        self.pending_write = Some(match &self.current {
            Some(episode) if episode.state().is_open() => PendingWrite::Save,
            _ => PendingWrite::Clear,
        });
        self.flush().await
    }

    async fn flush(&mut self) -> Result<()> {
        let Some(write) = self.pending_write else {
            return Ok(());
        };

        let mut attempt = 1;
        loop {
            match self.write(write).await {
                Ok(()) => {
                    self.pending_write = None;
                    return Ok(());
                }
                Err(source) if attempt >= self.store_write_attempts => {
                    error!(attempts = attempt, error = %source, ?write, "Store write failed");
                    return Err(Error::StoreWriteFailed {
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    warn!(attempt, error = %e, ?write, "Store write failed; retrying");
                    attempt += 1;
                }
            }
        }
    }

    async fn write(&self, write: PendingWrite) -> std::result::Result<(), StoreError> {
        match (write, &self.current) {
            (PendingWrite::Save, Some(episode)) => self.store.save(episode).await,
            (PendingWrite::Save, None) | (PendingWrite::Clear, _) => self.store.clear().await,
        }
    }
}
