//! Resumption after a restart or on return to the foreground.
//!
//! The process may have been killed at any point of an episode. On cold
//! start and whenever the app comes back to the foreground, the persisted
//! slot and the trigger service's view are re-read and the state machine is
//! brought back in line:
//!
//! 1. Load the persisted episode. A stale one is expired, and its feedback
//!    is stopped if this process was still running it.
//! 2. A resumable episode gets its feedback loop restarted. No episode is
//!    created and no fallback is armed. If one of its fallbacks is already
//!    alerting, an acknowledged episode goes back to ringing.
//! 3. Alerting triggers that do not belong to the episode are orphans and
//!    are cancelled, so historical fallbacks cannot start duplicate feedback
//!    loops. With no open episode, the first recent alerting primary alarm
//!    is adopted as a new episode instead.
//!
//! Failing to query the trigger service degrades to steps 1 and 2 only; it
//! never blocks startup.

use strum::Display;

use crate::episode::{EpisodeId, EpisodeState};
use crate::error::Result;
use crate::fallback::cancel_quietly;
use crate::machine::{EpisodeStateMachine, FireOutcome};
use crate::store::Loaded;
use crate::tracing::prelude::*;
use crate::trigger::{TriggerId, TriggerPhase, TriggerSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ReconcileReason {
    ColdStart,
    Foreground,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Nothing persisted.
    Idle,
    /// The persisted episode was resumed in `state`.
    Resumed {
        episode_id: EpisodeId,
        state: EpisodeState,
    },
    /// The persisted episode was too old and has been dropped.
    Expired(EpisodeId),
    /// No episode was persisted but a primary alarm was alerting; it
    /// opened a new episode.
    Adopted(EpisodeId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub outcome: ResumeOutcome,
    pub orphans_cancelled: Vec<TriggerId>,
    /// The trigger service could not be queried; only the store was used.
    pub triggers_unavailable: bool,
}

pub async fn reconcile(
    machine: &mut EpisodeStateMachine,
    reason: ReconcileReason,
) -> Result<ReconcileReport> {
    debug!(%reason, "Reconciling alarm state");

    machine.retry_pending_write().await;
    let loaded = if machine.is_persisted() {
        machine.store().inspect().await?
    } else {
        // The store is behind this process; what is in memory is newer.
        warn!("Store write still pending; reconciling from in-memory episode");
        machine
            .episode()
            .cloned()
            .map_or(Loaded::Empty, Loaded::Active)
    };

    let (firing, triggers_unavailable) = match machine.triggers().list_triggers().await {
        Ok(snapshots) => (
            snapshots
                .into_iter()
                .filter(|s| s.phase == TriggerPhase::Firing)
                .collect::<Vec<_>>(),
            false,
        ),
        Err(e) => {
            warn!(error = %e, "Trigger service query failed; reconciling from store only");
            (Vec::new(), true)
        }
    };

    let (outcome, orphans) = match loaded {
        Loaded::Active(episode) => {
            let episode_id = episode.id();
            let (own, orphans): (Vec<TriggerSnapshot>, Vec<TriggerSnapshot>) = firing
                .into_iter()
                .partition(|s| s.payload.episode_id == Some(episode_id));
            let own: Vec<TriggerId> = own.iter().map(|s| s.id).collect();

            machine.resume(episode, &own).await?;
            (
                ResumeOutcome::Resumed {
                    episode_id,
                    state: machine.state(),
                },
                orphans,
            )
        }
        Loaded::Expired(episode) => {
            let episode_id = episode.id();
            let released = machine.expire(episode);
            let (outcome, orphans) = adopt_primary(machine, firing, &released).await?;
            let outcome = match outcome {
                ResumeOutcome::Idle => ResumeOutcome::Expired(episode_id),
                adopted => adopted,
            };
            (outcome, orphans)
        }
        Loaded::Empty | Loaded::Corrupt => {
            let abandoned = machine.abandon();
            adopt_primary(machine, firing, &abandoned).await?
        }
    };

    let mut orphans_cancelled = Vec::with_capacity(orphans.len());
    for orphan in orphans {
        info!(
            trigger_id = %orphan.id,
            episode_id = ?orphan.payload.episode_id,
            "Cancelling orphaned trigger"
        );
        if cancel_quietly(machine.triggers().as_ref(), orphan.id).await {
            orphans_cancelled.push(orphan.id);
        }
    }

    info!(
        %reason,
        outcome = ?outcome,
        orphans = orphans_cancelled.len(),
        triggers_unavailable,
        "Reconciliation complete"
    );

    Ok(ReconcileReport {
        outcome,
        orphans_cancelled,
        triggers_unavailable,
    })
}

/// With no open episode, open one for the first alerting primary alarm.
///
/// Triggers in `released` belonged to an episode this process just let go
/// of, and primaries that fired longer ago than the staleness window are
/// too old to open a new episode. They, fallbacks and every alerting
/// trigger after the adopted one are returned as orphans.
async fn adopt_primary(
    machine: &mut EpisodeStateMachine,
    firing: Vec<TriggerSnapshot>,
    released: &[TriggerId],
) -> Result<(ResumeOutcome, Vec<TriggerSnapshot>)> {
    let mut outcome = ResumeOutcome::Idle;
    let mut orphans = Vec::new();
    let oldest = machine.now() - machine.store().staleness_window();

    for snapshot in firing {
        if outcome != ResumeOutcome::Idle
            || released.contains(&snapshot.id)
            || snapshot.payload.episode_id.is_some()
            || snapshot.fire_at < oldest
        {
            orphans.push(snapshot);
            continue;
        }

        if let FireOutcome::Started(episode_id) = machine
            .trigger_fired(snapshot.id, snapshot.payload.clone())
            .await?
        {
            outcome = ResumeOutcome::Adopted(episode_id);
        }
    }

    Ok((outcome, orphans))
}
