//! Wall-clock source.
//!
//! Episode ages and trigger fire times are wall-clock quantities: they must
//! survive a process restart, so a monotonic `Instant` is not usable here.

use time::OffsetDateTime;

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// The system's real-time clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}
