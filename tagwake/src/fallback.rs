//! Fallback triggers.
//!
//! Acknowledging an alarm with "stop" does not end it. Instead a secondary
//! trigger is armed a short while later, carrying the same episode id and
//! expected credential, so the alarm re-opens if the feedback loop is killed
//! before the tag is scanned.
//!
//! Arming is best-effort: if the trigger service refuses, the failure is
//! logged and the episode stays resolvable by scanning.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::DEFAULT_FALLBACK_OFFSET;
use crate::episode::{AlarmEpisode, EpisodeId};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::trigger::{
    TriggerError, TriggerHandle, TriggerId, TriggerPayload, TriggerPhase, TriggerService,
};

/// When fallbacks fire, and how many an episode may have.
///
/// The n-th fallback (zero-based) fires `offsets[n]` after the
/// acknowledgement that armed it; once the list is exhausted its last
/// offset repeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackSchedule {
    offsets: Vec<Duration>,
    max_count: Option<u32>,
}

impl FallbackSchedule {
    /// `max_count: None` places no bound on fallbacks per episode.
    pub fn new(offsets: Vec<Duration>, max_count: Option<u32>) -> Result<Self> {
        if offsets.is_empty() {
            return Err(Error::Config(
                "fallback schedule needs at least one offset".into(),
            ));
        }
        Ok(Self { offsets, max_count })
    }

    pub fn offsets(&self) -> &[Duration] {
        &self.offsets
    }

    pub fn max_count(&self) -> Option<u32> {
        self.max_count
    }

    /// Offset for the fallback armed after `armed` earlier ones.
    pub fn offset_for(&self, armed: u32) -> Duration {
        let index = (armed as usize).min(self.offsets.len() - 1);
        self.offsets[index]
    }

    /// Whether another fallback may be armed after `armed` earlier ones.
    pub fn allows(&self, armed: u32) -> bool {
        self.max_count.is_none_or(|max| armed < max)
    }
}

impl Default for FallbackSchedule {
    fn default() -> Self {
        Self {
            offsets: vec![DEFAULT_FALLBACK_OFFSET],
            max_count: None,
        }
    }
}

/// A fallback accepted by the trigger service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackHandle {
    pub episode_id: EpisodeId,
    pub trigger: TriggerHandle,
    /// One-based position among this episode's fallbacks.
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArmOutcome {
    Armed(FallbackHandle),
    /// The schedule's `max_count` has been reached; nothing was armed.
    LimitReached,
    /// The trigger service refused. Logged and otherwise ignored.
    Failed(TriggerError),
}

pub struct FallbackScheduler {
    schedule: FallbackSchedule,
    cancel_superseded: bool,
    triggers: Arc<dyn TriggerService>,
    clock: Arc<dyn Clock>,
    /// Fallbacks armed by this process that have not fired or been
    /// cancelled.
    pending: Vec<FallbackHandle>,
}

impl FallbackScheduler {
    pub fn new(
        schedule: FallbackSchedule,
        cancel_superseded: bool,
        triggers: Arc<dyn TriggerService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            schedule,
            cancel_superseded,
            triggers,
            clock,
            pending: Vec::new(),
        }
    }

    pub fn pending(&self) -> &[FallbackHandle] {
        &self.pending
    }

    /// Arm the next fallback for `episode`, incrementing its fallback count
    /// if the trigger service accepts it.
    pub async fn arm(&mut self, episode: &mut AlarmEpisode) -> ArmOutcome {
        let armed = episode.fallback_count();
        if !self.schedule.allows(armed) {
            info!(
                episode_id = %episode.id(),
                fallback_count = armed,
                "Fallback limit reached; not arming"
            );
            return ArmOutcome::LimitReached;
        }

        if self.cancel_superseded {
            self.cancel_pending(episode.id()).await;
        }

        let fire_at = self.clock.now() + self.schedule.offset_for(armed);
        let payload = TriggerPayload::fallback(episode.id(), episode.expected_credential().clone());

        match self
            .triggers
            .schedule_trigger(TriggerId::new(), fire_at, payload)
            .await
        {
            Ok(trigger) => {
                episode.record_fallback();
                let handle = FallbackHandle {
                    episode_id: episode.id(),
                    trigger,
                    sequence: episode.fallback_count(),
                };
                info!(
                    episode_id = %episode.id(),
                    trigger_id = %handle.trigger.id,
                    sequence = handle.sequence,
                    fire_at = %handle.trigger.fire_at,
                    "Fallback armed"
                );
                self.pending.push(handle.clone());
                ArmOutcome::Armed(handle)
            }
            Err(e) => {
                warn!(episode_id = %episode.id(), error = %e, "Failed to arm fallback");
                ArmOutcome::Failed(e)
            }
        }
    }

    /// Note that `trigger` fired; it is no longer pending.
    pub fn fired(&mut self, trigger: TriggerId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|h| h.trigger.id != trigger);
        self.pending.len() != before
    }

    /// Cancel every trigger belonging to `episode`, including ones armed by
    /// an earlier process that only the trigger service knows about.
    /// Returns the ids cancelled.
    pub async fn cancel_all(&mut self, episode: EpisodeId) -> Vec<TriggerId> {
        let mut cancelled = self.cancel_pending(episode).await;

        match self.triggers.list_triggers().await {
            Ok(snapshots) => {
                for snapshot in snapshots {
                    if snapshot.payload.episode_id != Some(episode)
                        || snapshot.phase == TriggerPhase::Cancelled
                        || cancelled.contains(&snapshot.id)
                    {
                        continue;
                    }
                    if cancel_quietly(self.triggers.as_ref(), snapshot.id).await {
                        cancelled.push(snapshot.id);
                    }
                }
            }
            Err(e) => {
                warn!(episode_id = %episode, error = %e, "Could not list triggers to cancel fallbacks");
            }
        }

        cancelled
    }

    async fn cancel_pending(&mut self, episode: EpisodeId) -> Vec<TriggerId> {
        let (mine, others): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|h| h.episode_id == episode);
        self.pending = others;

        let mut cancelled = Vec::with_capacity(mine.len());
        for handle in mine {
            if cancel_quietly(self.triggers.as_ref(), handle.trigger.id).await {
                debug!(episode_id = %episode, trigger_id = %handle.trigger.id, "Fallback cancelled");
            }
            // Counted even if the service no longer knew it.
            cancelled.push(handle.trigger.id);
        }
        cancelled
    }
}

/// Cancel `id`, logging instead of failing. A trigger the service no
/// longer knows about counts as cancelled.
pub(crate) async fn cancel_quietly(triggers: &dyn TriggerService, id: TriggerId) -> bool {
    match triggers.cancel_trigger(id).await {
        Ok(()) | Err(TriggerError::NotFound(_)) => true,
        Err(e) => {
            warn!(trigger_id = %id, error = %e, "Failed to cancel trigger");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::test_support::{FakeTriggerService, ManualClock};

    const NOW: time::OffsetDateTime = datetime!(2026-10-16 06:30:00 UTC);

    fn scheduler(
        schedule: FallbackSchedule,
        cancel_superseded: bool,
    ) -> (FallbackScheduler, Arc<FakeTriggerService>) {
        let triggers = Arc::new(FakeTriggerService::new());
        let scheduler = FallbackScheduler::new(
            schedule,
            cancel_superseded,
            triggers.clone(),
            ManualClock::at(NOW),
        );
        (scheduler, triggers)
    }

    fn episode() -> AlarmEpisode {
        AlarmEpisode::new("0455B45F396180".into(), NOW)
    }

    #[test]
    fn offsets_repeat_last_entry() {
        let schedule = FallbackSchedule::new(
            vec![Duration::from_secs(5), Duration::from_secs(30)],
            None,
        )
        .unwrap();
        assert_eq!(schedule.offset_for(0), Duration::from_secs(5));
        assert_eq!(schedule.offset_for(1), Duration::from_secs(30));
        assert_eq!(schedule.offset_for(7), Duration::from_secs(30));
    }

    #[test]
    fn empty_schedule_is_rejected() {
        assert!(FallbackSchedule::new(vec![], None).is_err());
    }

    #[test]
    fn unbounded_by_default() {
        assert!(FallbackSchedule::default().allows(u32::MAX - 1));
    }

    #[tokio::test]
    async fn arm_schedules_five_seconds_out_with_episode_payload() {
        let (mut scheduler, triggers) = scheduler(FallbackSchedule::default(), false);
        let mut episode = episode();

        let ArmOutcome::Armed(handle) = scheduler.arm(&mut episode).await else {
            panic!("fallback not armed");
        };

        assert_eq!(episode.fallback_count(), 1);
        assert_eq!(handle.sequence, 1);
        assert_eq!(handle.trigger.fire_at, datetime!(2026-10-16 06:30:05 UTC));

        let scheduled = triggers.snapshot(handle.trigger.id).unwrap();
        assert_eq!(scheduled.payload.episode_id, Some(episode.id()));
        assert_eq!(
            scheduled.payload.expected_credential,
            *episode.expected_credential()
        );
        assert_eq!(scheduler.pending(), &[handle]);
    }

    #[tokio::test]
    async fn failure_is_swallowed_and_not_counted() {
        let (mut scheduler, triggers) = scheduler(FallbackSchedule::default(), false);
        triggers.fail_schedules_with(TriggerError::AuthorizationDenied);
        let mut episode = episode();

        assert_eq!(
            scheduler.arm(&mut episode).await,
            ArmOutcome::Failed(TriggerError::AuthorizationDenied)
        );
        assert_eq!(episode.fallback_count(), 0);
        assert!(scheduler.pending().is_empty());
    }

    #[tokio::test]
    async fn limit_stops_arming() {
        let schedule = FallbackSchedule::new(vec![Duration::from_secs(5)], Some(2)).unwrap();
        let (mut scheduler, triggers) = scheduler(schedule, false);
        let mut episode = episode();

        assert!(matches!(scheduler.arm(&mut episode).await, ArmOutcome::Armed(_)));
        assert!(matches!(scheduler.arm(&mut episode).await, ArmOutcome::Armed(_)));
        assert_eq!(scheduler.arm(&mut episode).await, ArmOutcome::LimitReached);
        assert_eq!(episode.fallback_count(), 2);
        assert_eq!(triggers.scheduled_count(), 2);
    }

    #[tokio::test]
    async fn repeated_arming_keeps_older_fallbacks_by_default() {
        let (mut scheduler, triggers) = scheduler(FallbackSchedule::default(), false);
        let mut episode = episode();

        scheduler.arm(&mut episode).await;
        scheduler.arm(&mut episode).await;

        assert_eq!(scheduler.pending().len(), 2);
        assert!(triggers.cancelled().is_empty());
    }

    #[tokio::test]
    async fn superseding_cancels_older_fallback() {
        let (mut scheduler, triggers) = scheduler(FallbackSchedule::default(), true);
        let mut episode = episode();

        let ArmOutcome::Armed(first) = scheduler.arm(&mut episode).await else {
            panic!("fallback not armed");
        };
        scheduler.arm(&mut episode).await;

        assert_eq!(scheduler.pending().len(), 1);
        assert_eq!(triggers.cancelled(), vec![first.trigger.id]);
    }

    #[tokio::test]
    async fn cancel_all_covers_triggers_from_earlier_process() {
        let (mut scheduler, triggers) = scheduler(FallbackSchedule::default(), false);
        let mut episode = episode();
        let ArmOutcome::Armed(mine) = scheduler.arm(&mut episode).await else {
            panic!("fallback not armed");
        };
        let inherited = triggers.insert(
            TriggerPhase::Scheduled,
            TriggerPayload::fallback(episode.id(), episode.expected_credential().clone()),
        );
        let unrelated = triggers.insert(
            TriggerPhase::Scheduled,
            TriggerPayload::primary("AAAA".into()),
        );

        let cancelled = scheduler.cancel_all(episode.id()).await;

        assert_eq!(cancelled, vec![mine.trigger.id, inherited]);
        assert!(scheduler.pending().is_empty());
        assert!(!triggers.cancelled().contains(&unrelated));
    }

    #[tokio::test]
    async fn fired_fallback_is_no_longer_pending() {
        let (mut scheduler, _triggers) = scheduler(FallbackSchedule::default(), false);
        let mut episode = episode();
        let ArmOutcome::Armed(handle) = scheduler.arm(&mut episode).await else {
            panic!("fallback not armed");
        };

        assert!(scheduler.fired(handle.trigger.id));
        assert!(!scheduler.fired(handle.trigger.id));
        assert!(scheduler.pending().is_empty());
    }
}
