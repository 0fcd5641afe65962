//! Boundary to the audio/haptic feedback loop.
//!
//! Signals are fire-and-forget: the core never waits on or inspects the
//! result. Implementations should tolerate a repeated `start_feedback` for
//! the episode that is already signaling.

use parking_lot::Mutex;

use crate::episode::EpisodeId;
use crate::tracing::prelude::*;

pub trait FeedbackSink: Send + Sync {
    fn start_feedback(&self, episode: EpisodeId);

    fn stop_feedback(&self);
}

/// Feedback sink that only logs, for headless hosts and the demo CLI.
#[derive(Debug, Default)]
pub struct LogFeedback {
    active: Mutex<Option<EpisodeId>>,
}

impl LogFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    /// The episode currently signaling, if any.
    pub fn active(&self) -> Option<EpisodeId> {
        *self.active.lock()
    }
}

impl FeedbackSink for LogFeedback {
    fn start_feedback(&self, episode: EpisodeId) {
        let previous = self.active.lock().replace(episode);
        if previous == Some(episode) {
            debug!(episode_id = %episode, "Feedback already running");
        } else {
            info!(episode_id = %episode, "Feedback started");
        }
    }

    fn stop_feedback(&self) {
        match self.active.lock().take() {
            Some(episode) => info!(episode_id = %episode, "Feedback stopped"),
            None => debug!("Feedback stop requested while idle"),
        }
    }
}
