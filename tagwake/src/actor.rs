//! The alarm actor.
//!
//! All episode mutations happen here, one event at a time. Three
//! asynchronous sources feed it: the trigger service's update stream, scan
//! completions, and commands from the UI via [`AlarmHandle`]. Each event is
//! processed to completion before the next is taken, so the state machine
//! never sees concurrent writes.
//!
//! Scans run outside the actor. Starting one hands a reply channel to the
//! [`ScanCapability`]; a small forwarding task waits for the result and
//! posts it back into the actor's queue tagged with its session id.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::credential::Credential;
use crate::episode::{AlarmEpisode, EpisodeState};
use crate::error::{Error, Result};
use crate::machine::{EpisodeStateMachine, ScanVerdict, StopOutcome};
use crate::reconcile::{ReconcileReason, ReconcileReport, reconcile};
use crate::scan::{ScanCapability, ScanError, ScanSessionId, ScanSessions};
use crate::tracing::prelude::*;
use crate::trigger::{TriggerPhase, TriggerUpdate};

const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// How a scan request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanAttempt {
    /// A tag was read and checked.
    Verdict(ScanVerdict),
    /// No tag was read.
    Failed(ScanError),
}

/// Commands from the UI to the actor. Each carries a oneshot reply.
#[derive(Debug)]
pub enum AlarmCommand {
    /// Acknowledge the ringing alarm.
    Stop {
        reply: oneshot::Sender<Result<StopOutcome>>,
    },

    /// Read a tag and check it. Replaces any scan in progress.
    Scan {
        reply: oneshot::Sender<Result<ScanAttempt>>,
    },

    /// Abandon the scan in progress.
    CancelScan { reply: oneshot::Sender<bool> },

    /// Check a credential obtained some other way.
    SubmitCredential {
        credential: Credential,
        reply: oneshot::Sender<Result<ScanVerdict>>,
    },

    /// The app returned to the foreground.
    Foregrounded {
        reply: oneshot::Sender<Result<ReconcileReport>>,
    },

    /// The current episode, if any.
    Snapshot {
        reply: oneshot::Sender<Option<AlarmEpisode>>,
    },
}

#[derive(Debug)]
struct ScanCompleted {
    session: ScanSessionId,
    result: std::result::Result<Credential, ScanError>,
}

type ScanWaiter = oneshot::Sender<Result<ScanAttempt>>;

pub struct AlarmActor {
    machine: EpisodeStateMachine,
    scanner: Arc<dyn ScanCapability>,
    commands: mpsc::Receiver<AlarmCommand>,
    trigger_updates: Option<mpsc::Receiver<TriggerUpdate>>,
    scans_tx: mpsc::Sender<ScanCompleted>,
    scans_rx: mpsc::Receiver<ScanCompleted>,
    sessions: ScanSessions<ScanWaiter>,
    state_tx: watch::Sender<EpisodeState>,
}

impl AlarmActor {
    /// Build the actor and the handle used to talk to it.
    ///
    /// Takes the trigger service's update stream; nothing else should
    /// consume it.
    pub fn new(
        machine: EpisodeStateMachine,
        scanner: Arc<dyn ScanCapability>,
    ) -> (Self, AlarmHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (scans_tx, scans_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(machine.state());

        let trigger_updates = machine.triggers().take_update_receiver();
        if trigger_updates.is_none() {
            warn!("Trigger update stream already taken; firings will only be seen on reconcile");
        }

        let actor = Self {
            machine,
            scanner,
            commands,
            trigger_updates,
            scans_tx,
            scans_rx,
            sessions: ScanSessions::new(),
            state_tx,
        };
        let handle = AlarmHandle {
            commands: commands_tx,
            state_rx,
        };
        (actor, handle)
    }

    /// Build the actor and run it on a new task.
    pub fn spawn(
        machine: EpisodeStateMachine,
        scanner: Arc<dyn ScanCapability>,
        cancellation: CancellationToken,
    ) -> (AlarmHandle, JoinHandle<()>) {
        let (actor, handle) = Self::new(machine, scanner);
        let task = tokio::spawn(actor.run(cancellation));
        (handle, task)
    }

    /// Reconcile as a cold start, then process events until cancelled or
    /// until every [`AlarmHandle`] is dropped.
    pub async fn run(mut self, cancellation: CancellationToken) {
        trace!("Alarm actor started.");

        match reconcile(&mut self.machine, ReconcileReason::ColdStart).await {
            Ok(report) => debug!(?report, "Startup reconciliation"),
            Err(e) => error!(error = %e, "Startup reconciliation failed"),
        }
        self.publish_state();

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    info!("Alarm actor shutdown requested");
                    break;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("All alarm handles dropped");
                        break;
                    };
                    self.handle_command(command).await;
                }
                update = next_update(&mut self.trigger_updates) => {
                    match update {
                        Some(update) => self.handle_trigger_update(update).await,
                        None => {
                            warn!("Trigger update stream closed");
                            self.trigger_updates = None;
                        }
                    }
                }
                Some(completed) = self.scans_rx.recv() => {
                    self.handle_scan_completed(completed).await;
                }
            }
            self.publish_state();
        }

        if let Some((session, waiter)) = self.sessions.cancel() {
            self.scanner.cancel_scan(session);
            let _ = waiter.send(Err(Error::ActorGone));
        }
        trace!("Alarm actor stopped.");
    }

    async fn handle_command(&mut self, command: AlarmCommand) {
        match command {
            AlarmCommand::Stop { reply } => {
                let _ = reply.send(self.machine.stop().await);
            }
            AlarmCommand::Scan { reply } => self.start_scan(reply),
            AlarmCommand::CancelScan { reply } => {
                let cancelled = match self.sessions.cancel() {
                    Some((session, waiter)) => {
                        self.scanner.cancel_scan(session);
                        let _ = waiter.send(Ok(ScanAttempt::Failed(ScanError::Cancelled)));
                        true
                    }
                    None => false,
                };
                let _ = reply.send(cancelled);
            }
            AlarmCommand::SubmitCredential { credential, reply } => {
                let _ = reply.send(self.machine.submit_credential(&credential).await);
            }
            AlarmCommand::Foregrounded { reply } => {
                let _ = reply.send(reconcile(&mut self.machine, ReconcileReason::Foreground).await);
            }
            AlarmCommand::Snapshot { reply } => {
                let _ = reply.send(self.machine.episode().cloned());
            }
        }
    }

    async fn handle_trigger_update(&mut self, update: TriggerUpdate) {
        match update.phase {
            TriggerPhase::Firing => {
                match self.machine.trigger_fired(update.id, update.payload).await {
                    Ok(outcome) => debug!(trigger_id = %update.id, ?outcome, "Trigger handled"),
                    Err(e) => error!(trigger_id = %update.id, error = %e, "Failed to handle trigger"),
                }
            }
            TriggerPhase::Scheduled | TriggerPhase::Cancelled => {
                trace!(trigger_id = %update.id, phase = %update.phase, "Trigger update");
            }
        }
    }

    fn start_scan(&mut self, reply: ScanWaiter) {
        if !self.machine.state().is_open() {
            let _ = reply.send(Ok(ScanAttempt::Verdict(ScanVerdict::NoActiveEpisode)));
            return;
        }

        let (session, superseded) = self.sessions.begin(reply);
        if let Some((old, waiter)) = superseded {
            debug!(session = %old, "Scan superseded by a new request");
            self.scanner.cancel_scan(old);
            let _ = waiter.send(Ok(ScanAttempt::Failed(ScanError::Cancelled)));
        }

        let (tx, rx) = oneshot::channel();
        self.scanner.start_scan(session, tx);

        let scans_tx = self.scans_tx.clone();
        tokio::spawn(async move {
            let result = rx.await.unwrap_or(Err(ScanError::Cancelled));
            if scans_tx.send(ScanCompleted { session, result }).await.is_err() {
                trace!(%session, "Scan finished after actor stopped");
            }
        });
        debug!(%session, "Scan started");
    }

    async fn handle_scan_completed(&mut self, completed: ScanCompleted) {
        let ScanCompleted { session, result } = completed;
        let Some(waiter) = self.sessions.complete(session) else {
            debug!(%session, "Dropping result of superseded scan");
            return;
        };

        let attempt = match result {
            Ok(credential) => self
                .machine
                .submit_credential(&credential)
                .await
                .map(ScanAttempt::Verdict),
            Err(e) => {
                info!(%session, error = %e, "Scan failed");
                Ok(ScanAttempt::Failed(e))
            }
        };
        let _ = waiter.send(attempt);
    }

    fn publish_state(&self) {
        self.state_tx.send_if_modified(|state| {
            let next = self.machine.state();
            let changed = *state != next;
            *state = next;
            changed
        });
    }
}

async fn next_update(updates: &mut Option<mpsc::Receiver<TriggerUpdate>>) -> Option<TriggerUpdate> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Cloneable handle for talking to a running [`AlarmActor`].
#[derive(Clone, Debug)]
pub struct AlarmHandle {
    commands: mpsc::Sender<AlarmCommand>,
    state_rx: watch::Receiver<EpisodeState>,
}

impl AlarmHandle {
    pub async fn stop(&self) -> Result<StopOutcome> {
        self.request(|reply| AlarmCommand::Stop { reply }).await?
    }

    /// Scan a tag and check it against the open episode. Resolves when a
    /// tag is read or the scan fails, is cancelled or is superseded.
    pub async fn scan(&self) -> Result<ScanAttempt> {
        self.request(|reply| AlarmCommand::Scan { reply }).await?
    }

    /// Returns whether a scan was in progress.
    pub async fn cancel_scan(&self) -> Result<bool> {
        self.request(|reply| AlarmCommand::CancelScan { reply }).await
    }

    pub async fn submit_credential(&self, credential: Credential) -> Result<ScanVerdict> {
        self.request(|reply| AlarmCommand::SubmitCredential { credential, reply })
            .await?
    }

    pub async fn foregrounded(&self) -> Result<ReconcileReport> {
        self.request(|reply| AlarmCommand::Foregrounded { reply }).await?
    }

    pub async fn snapshot(&self) -> Result<Option<AlarmEpisode>> {
        self.request(|reply| AlarmCommand::Snapshot { reply }).await
    }

    /// Watch the episode state as the actor publishes it.
    pub fn subscribe(&self) -> watch::Receiver<EpisodeState> {
        self.state_rx.clone()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> AlarmCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| Error::ActorGone)?;
        rx.await.map_err(|_| Error::ActorGone)
    }
}
