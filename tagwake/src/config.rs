use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::fallback::FallbackSchedule;

/// Age past which a persisted episode is treated as expired instead of
/// resumable.
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Delay between an acknowledgement ("stop") and the fallback trigger.
pub const DEFAULT_FALLBACK_OFFSET: Duration = Duration::from_secs(5);

const DEFAULT_STORE_WRITE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct AlarmConfig {
    /// Maximum age of a persisted episode. Evaluated lazily at load time.
    pub staleness_window: Duration,

    /// When fallback triggers fire relative to each "stop", and how many may
    /// be armed per episode.
    pub fallback: FallbackSchedule,

    /// Cancel the previously armed fallback before arming a new one. Off by
    /// default: every acknowledgement leaves its fallback in place.
    pub cancel_superseded_fallbacks: bool,

    /// Attempts made to persist an episode before reporting
    /// [`Error::StoreWriteFailed`].
    pub store_write_attempts: u32,

    /// Directory holding the file-backed store.
    pub state_dir: PathBuf,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            staleness_window: DEFAULT_STALENESS_WINDOW,
            fallback: FallbackSchedule::default(),
            cancel_superseded_fallbacks: false,
            store_write_attempts: DEFAULT_STORE_WRITE_ATTEMPTS,
            state_dir: default_state_dir(),
        }
    }
}

impl AlarmConfig {
    /// Defaults, overridden by `TAGWAKE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup("TAGWAKE_STALENESS_SECS") {
            config.staleness_window = Duration::from_secs(parse("TAGWAKE_STALENESS_SECS", &value)?);
        }

        if let Some(value) = lookup("TAGWAKE_FALLBACK_OFFSETS_SECS") {
            let offsets = value
                .split(',')
                .map(|part| parse::<u64>("TAGWAKE_FALLBACK_OFFSETS_SECS", part).map(Duration::from_secs))
                .collect::<Result<Vec<_>>>()?;
            config.fallback = FallbackSchedule::new(offsets, config.fallback.max_count())?;
        }

        if let Some(value) = lookup("TAGWAKE_MAX_FALLBACKS") {
            let max = parse("TAGWAKE_MAX_FALLBACKS", &value)?;
            config.fallback = FallbackSchedule::new(config.fallback.offsets().to_vec(), Some(max))?;
        }

        if let Some(value) = lookup("TAGWAKE_CANCEL_SUPERSEDED") {
            config.cancel_superseded_fallbacks = parse("TAGWAKE_CANCEL_SUPERSEDED", &value)?;
        }

        if let Some(value) = lookup("TAGWAKE_STORE_WRITE_ATTEMPTS") {
            let attempts: u32 = parse("TAGWAKE_STORE_WRITE_ATTEMPTS", &value)?;
            if attempts == 0 {
                return Err(Error::Config(
                    "TAGWAKE_STORE_WRITE_ATTEMPTS must be at least 1".into(),
                ));
            }
            config.store_write_attempts = attempts;
        }

        if let Some(value) = lookup("TAGWAKE_STATE_DIR") {
            config.state_dir = PathBuf::from(value);
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: cannot parse {value:?}")))
}

fn default_state_dir() -> PathBuf {
    match std::env::var_os("XDG_STATE_HOME") {
        Some(dir) => PathBuf::from(dir).join("tagwake"),
        None => PathBuf::from(".tagwake"),
    }
}
