//! The single "active episode" slot.
//!
//! At most one episode is persisted at a time, under a fixed key. The store
//! is a codec (episode ⇄ JSON record) plus staleness: a record older than
//! the staleness window is reported as expired and removed when it is next
//! loaded. Nothing reaps it proactively.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::backend::StoreBackend;
use crate::clock::Clock;
use crate::episode::{AlarmEpisode, EpisodeRecord, RecordError};
use crate::tracing::prelude::*;

pub const ACTIVE_EPISODE_KEY: &str = "active_episode";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend I/O: {0}")]
    Backend(#[from] io::Error),

    #[error("record encoding: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("record: {0}")]
    Record(#[from] RecordError),
}

/// What the slot held when it was inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Loaded {
    Empty,
    /// A resumable episode.
    Active(AlarmEpisode),
    /// An episode older than the staleness window. Already removed.
    Expired(AlarmEpisode),
    /// An unreadable record. Already removed.
    Corrupt,
}

pub struct EpisodeStore {
    backend: Arc<dyn StoreBackend>,
    clock: Arc<dyn Clock>,
    staleness_window: Duration,
}

impl EpisodeStore {
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        clock: Arc<dyn Clock>,
        staleness_window: Duration,
    ) -> Self {
        Self {
            backend,
            clock,
            staleness_window,
        }
    }

    pub fn staleness_window(&self) -> Duration {
        self.staleness_window
    }

    /// Overwrite the slot with `episode`.
    pub async fn save(&self, episode: &AlarmEpisode) -> Result<(), StoreError> {
        let record = EpisodeRecord::try_from(episode)?;
        let bytes = serde_json::to_vec(&record)?;
        self.backend.set(ACTIVE_EPISODE_KEY, &bytes).await?;
        trace!(episode_id = %episode.id(), state = %episode.state(), "Episode saved");
        Ok(())
    }

    /// The resumable episode, if any.
    ///
    /// Returns `None` when the slot is empty, holds an expired episode, or
    /// holds an unreadable record; the latter two are cleared.
    pub async fn load(&self) -> Result<Option<AlarmEpisode>, StoreError> {
        match self.inspect().await? {
            Loaded::Active(episode) => Ok(Some(episode)),
            Loaded::Empty | Loaded::Expired(_) | Loaded::Corrupt => Ok(None),
        }
    }

    /// Like [`load`](Self::load), but says why nothing is resumable.
    pub async fn inspect(&self) -> Result<Loaded, StoreError> {
        let Some(bytes) = self.backend.get(ACTIVE_EPISODE_KEY).await? else {
            return Ok(Loaded::Empty);
        };

        let episode = match decode(&bytes) {
            Ok(episode) => episode,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable episode record");
                self.clear_implicitly().await;
                return Ok(Loaded::Corrupt);
            }
        };

        let age = episode.age(self.clock.now());
        if age > self.staleness_window {
            debug!(
                episode_id = %episode.id(),
                age_secs = age.as_secs(),
                window_secs = self.staleness_window.as_secs(),
                "Persisted episode is stale"
            );
            self.clear_implicitly().await;
            return Ok(Loaded::Expired(episode));
        }

        Ok(Loaded::Active(episode))
    }

    /// Empty the slot. Clearing an empty slot is not an error.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.backend.delete(ACTIVE_EPISODE_KEY).await?;
        trace!("Episode slot cleared");
        Ok(())
    }

    // The record is already reported as gone; a failed delete only means it
    // will be found stale again on the next load.
    async fn clear_implicitly(&self) {
        if let Err(e) = self.clear().await {
            warn!(error = %e, "Failed to clear episode slot");
        }
    }
}

fn decode(bytes: &[u8]) -> Result<AlarmEpisode, StoreError> {
    let record: EpisodeRecord = serde_json::from_slice(bytes)?;
    Ok(AlarmEpisode::try_from(record)?)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::config::DEFAULT_STALENESS_WINDOW;
    use crate::episode::EpisodeState;
    use crate::store::MemoryBackend;
    use crate::test_support::{FlakyBackend, ManualClock};

    const CREATED: time::OffsetDateTime = datetime!(2026-10-16 06:30:00 UTC);

    fn store_with(backend: Arc<dyn StoreBackend>, clock: Arc<ManualClock>) -> EpisodeStore {
        EpisodeStore::new(backend, clock, DEFAULT_STALENESS_WINDOW)
    }

    fn episode() -> AlarmEpisode {
        AlarmEpisode::new("0455B45F396180".into(), CREATED)
    }

    #[tokio::test]
    async fn empty_slot_loads_none() {
        let store = store_with(Arc::new(MemoryBackend::new()), ManualClock::at(CREATED));
        assert_eq!(store.load().await.unwrap(), None);
        assert_eq!(store.inspect().await.unwrap(), Loaded::Empty);
    }

    #[tokio::test]
    async fn saved_episode_loads_intact() {
        let clock = ManualClock::at(CREATED);
        let store = store_with(Arc::new(MemoryBackend::new()), clock.clone());

        let mut episode = episode();
        episode.transition(EpisodeState::AwaitingDismissal).unwrap();
        episode.record_fallback();
        store.save(&episode).await.unwrap();

        clock.advance(Duration::from_secs(30));
        assert_eq!(store.load().await.unwrap(), Some(episode));
    }

    #[tokio::test]
    async fn episode_just_inside_window_is_returned() {
        let clock = ManualClock::at(CREATED);
        let store = store_with(Arc::new(MemoryBackend::new()), clock.clone());
        let episode = episode();
        store.save(&episode).await.unwrap();

        clock.advance(Duration::from_secs(599));
        assert_eq!(store.load().await.unwrap(), Some(episode));
    }

    #[tokio::test]
    async fn episode_exactly_at_window_is_still_active() {
        let clock = ManualClock::at(CREATED);
        let store = store_with(Arc::new(MemoryBackend::new()), clock.clone());
        store.save(&episode()).await.unwrap();

        clock.advance(Duration::from_secs(600));
        assert!(store.load().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_episode_is_expired_and_cleared() {
        let clock = ManualClock::at(CREATED);
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(backend.clone(), clock.clone());
        let episode = episode();
        store.save(&episode).await.unwrap();

        clock.advance(Duration::from_secs(601));
        assert_eq!(store.inspect().await.unwrap(), Loaded::Expired(episode));
        assert_eq!(backend.get(ACTIVE_EPISODE_KEY).await.unwrap(), None);
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_episode_load_reports_none() {
        let clock = ManualClock::at(CREATED);
        let store = store_with(Arc::new(MemoryBackend::new()), clock.clone());
        store.save(&episode()).await.unwrap();

        clock.advance(Duration::from_secs(601));
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn clear_twice_is_same_as_once() {
        let store = store_with(Arc::new(MemoryBackend::new()), ManualClock::at(CREATED));
        store.save(&episode()).await.unwrap();

        store.clear().await.unwrap();
        assert_eq!(store.inspect().await.unwrap(), Loaded::Empty);
        store.clear().await.unwrap();
        assert_eq!(store.inspect().await.unwrap(), Loaded::Empty);
    }

    #[tokio::test]
    async fn corrupt_record_is_discarded() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set(ACTIVE_EPISODE_KEY, b"{not json").await.unwrap();
        let store = store_with(backend.clone(), ManualClock::at(CREATED));

        assert_eq!(store.inspect().await.unwrap(), Loaded::Corrupt);
        assert_eq!(backend.get(ACTIVE_EPISODE_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn record_with_non_uuid_id_is_discarded() {
        let backend = Arc::new(MemoryBackend::new());
        let record = br#"{
            "episodeID": "morning-alarm-1",
            "expectedCredential": "0455B45F396180",
            "createdAtEpochSeconds": 1792132200,
            "fallbackCount": 0
        }"#;
        backend.set(ACTIVE_EPISODE_KEY, record).await.unwrap();
        let store = store_with(backend.clone(), ManualClock::at(CREATED));

        assert_eq!(store.inspect().await.unwrap(), Loaded::Corrupt);
        assert_eq!(backend.get(ACTIVE_EPISODE_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_failure_is_surfaced() {
        let backend = Arc::new(FlakyBackend::failing_writes(1));
        let store = store_with(backend, ManualClock::at(CREATED));

        let err = store.save(&episode()).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn terminal_episode_is_refused() {
        let store = store_with(Arc::new(MemoryBackend::new()), ManualClock::at(CREATED));
        let mut episode = episode();
        episode.transition(EpisodeState::Resolved).unwrap();

        assert!(matches!(
            store.save(&episode).await,
            Err(StoreError::Record(_))
        ));
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(CREATED);
        let episode = episode();

        let first = store_with(Arc::new(crate::store::FileBackend::new(dir.path())), clock.clone());
        first.save(&episode).await.unwrap();
        drop(first);

        let second = store_with(Arc::new(crate::store::FileBackend::new(dir.path())), clock);
        assert_eq!(second.load().await.unwrap(), Some(episode));
    }
}
