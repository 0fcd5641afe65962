//! Durable single-slot storage for the in-flight alarm episode.

mod backend;
mod episode_store;

pub use backend::{FileBackend, MemoryBackend, StoreBackend};
pub use episode_store::{ACTIVE_EPISODE_KEY, EpisodeStore, Loaded, StoreError};
