//! Crate-level error type.
//!
//! Each component has its own error enum; this one aggregates them for
//! callers that drive the whole core. Expected, recoverable conditions
//! (wrong tag, no active episode, scan cancelled) are not errors and are
//! modeled as outcome variants instead.

use thiserror::Error;

use crate::episode::TransitionError;
use crate::store::StoreError;
use crate::trigger::TriggerError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The episode could not be persisted after every configured attempt.
    /// The in-memory episode is marked dirty and saving is retried on the
    /// next event, but the caller must not assume it would survive a crash.
    #[error("store write failed after {attempts} attempt(s): {source}")]
    StoreWriteFailed {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("trigger service error: {0}")]
    Trigger(#[from] TriggerError),

    /// An event asked for an edge the episode state machine does not have.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The alarm actor has shut down and no longer accepts commands.
    #[error("alarm actor is not running")]
    ActorGone,
}
