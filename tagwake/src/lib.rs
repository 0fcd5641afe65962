//! Alarm episode persistence and resumption core.
//!
//! An alarm that fires stays "open" until a configured tag is scanned. The
//! crate decides, across process restarts, acknowledgements and unexpected
//! terminations, whether an alarm episode is still active, when to arm a
//! fallback trigger that re-opens it, and whether a scanned tag ends it.
//!
//! Platform services (the alarm trigger service, audio/haptic feedback and
//! the NFC radio) are reached only through the traits in [`trigger`],
//! [`feedback`] and [`scan`].

pub mod actor;
pub mod clock;
pub mod config;
pub mod credential;
pub mod episode;
pub mod error;
pub mod fallback;
pub mod feedback;
pub mod machine;
pub mod reconcile;
pub mod scan;
pub mod store;
pub mod tracing;
pub mod trigger;

#[cfg(test)]
pub(crate) mod test_support;
