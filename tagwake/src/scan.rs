//! Boundary to the tag reader, and scan session bookkeeping.
//!
//! A scan yields exactly one credential or an explicit failure. Only one
//! session may be outstanding: starting a new one cancels the previous, and
//! any late result for a superseded session is dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::credential::Credential;
use crate::tracing::prelude::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScanSessionId(u64);

impl fmt::Display for ScanSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scan#{}", self.0)
    }
}

/// Scan failures, reported to the UI verbatim and never retried by the core.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("tag reading is not available on this device")]
    Unavailable,

    #[error("scan cancelled")]
    Cancelled,

    #[error("scan timed out")]
    TimedOut,
}

pub type ScanReply = oneshot::Sender<Result<Credential, ScanError>>;

pub trait ScanCapability: Send + Sync {
    /// Begin reading. Exactly one result must be sent on `reply`; dropping it
    /// unsent counts as [`ScanError::Cancelled`].
    fn start_scan(&self, session: ScanSessionId, reply: ScanReply);

    /// Abort `session` if it is still outstanding.
    fn cancel_scan(&self, session: ScanSessionId);
}

/// Tracks the single outstanding scan session and whoever is waiting on it.
#[derive(Debug)]
pub(crate) struct ScanSessions<W> {
    next: u64,
    outstanding: Option<(ScanSessionId, W)>,
}

impl<W> ScanSessions<W> {
    pub(crate) fn new() -> Self {
        Self {
            next: 1,
            outstanding: None,
        }
    }

    /// Open a new session. Returns its id and the superseded session, if
    /// one was still outstanding.
    pub(crate) fn begin(&mut self, waiter: W) -> (ScanSessionId, Option<(ScanSessionId, W)>) {
        let id = ScanSessionId(self.next);
        self.next += 1;
        let superseded = self.outstanding.replace((id, waiter));
        (id, superseded)
    }

    /// Claim the waiter for `session` if it is the current one.
    pub(crate) fn complete(&mut self, session: ScanSessionId) -> Option<W> {
        match &self.outstanding {
            Some((current, _)) if *current == session => self.outstanding.take().map(|(_, w)| w),
            _ => None,
        }
    }

    /// Drop the outstanding session, returning it.
    pub(crate) fn cancel(&mut self) -> Option<(ScanSessionId, W)> {
        self.outstanding.take()
    }
}

/// Scanner fed by an external tag source.
///
/// Whatever reads tags (an NFC reader thread, a serial device, stdin in the
/// demo) calls [`present_tag`](Self::present_tag); the tag is delivered to
/// the outstanding session, if any.
pub struct ChannelScanner {
    pending: Arc<Mutex<Option<(ScanSessionId, ScanReply)>>>,
    available: bool,
    timeout: Option<Duration>,
}

impl ChannelScanner {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(None)),
            available: true,
            timeout: None,
        }
    }

    /// A scanner on a device without a tag reader; every scan fails with
    /// [`ScanError::Unavailable`].
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// Fail sessions that see no tag within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Deliver a tag read. Returns `false` if no session was waiting.
    pub fn present_tag(&self, credential: Credential) -> bool {
        match self.pending.lock().take() {
            Some((session, reply)) => {
                debug!(%session, "Tag presented");
                let _ = reply.send(Ok(credential));
                true
            }
            None => {
                debug!("Tag presented with no scan in progress");
                false
            }
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.pending.lock().is_some()
    }
}

impl Default for ChannelScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanCapability for ChannelScanner {
    fn start_scan(&self, session: ScanSessionId, reply: ScanReply) {
        if !self.available {
            let _ = reply.send(Err(ScanError::Unavailable));
            return;
        }

        if let Some((old, old_reply)) = self.pending.lock().replace((session, reply)) {
            debug!(session = %old, "Scan superseded");
            let _ = old_reply.send(Err(ScanError::Cancelled));
        }

        if let Some(timeout) = self.timeout {
            let pending = self.pending.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let mut slot = pending.lock();
                if matches!(&*slot, Some((current, _)) if *current == session) {
                    if let Some((_, reply)) = slot.take() {
                        let _ = reply.send(Err(ScanError::TimedOut));
                    }
                }
            });
        }
    }

    fn cancel_scan(&self, session: ScanSessionId) {
        let mut slot = self.pending.lock();
        if matches!(&*slot, Some((current, _)) if *current == session) {
            if let Some((_, reply)) = slot.take() {
                let _ = reply.send(Err(ScanError::Cancelled));
            }
        }
    }
}
