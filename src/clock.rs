//! Time source for batch ages and object keys
//!
//! The orchestrator never reads the system time directly, so flush triggers
//! can be driven from tests with a [`SimulatedClock`].

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1_000))
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time from `earlier` to `self`; zero if `earlier` is later.
    pub fn saturating_sub(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// Calendar time in UTC, used for object key layout
    pub fn to_utc(&self) -> DateTime<Utc> {
        i64::try_from(self.0)
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_default()
    }
}

pub trait Clock: Send + Sync + Clone + 'static {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        // Before 1970 reads as the epoch
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Timestamp(ms)
    }
}

/// Virtual time that only moves on `advance_secs`. Clones share the same time.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    time_ms: Arc<AtomicU64>,
}

impl SimulatedClock {
    pub fn new(start_ms: u64) -> Self {
        SimulatedClock {
            time_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance_secs(&self, secs: u64) {
        self.time_ms.fetch_add(secs.saturating_mul(1_000), Ordering::SeqCst);
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.time_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_system_clock_is_wall_time() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now() > Timestamp::from_secs(1_577_836_800));
    }

    #[test]
    fn test_simulated_clock_moves_only_when_advanced() {
        let clock = SimulatedClock::new(1_000);
        let shared = clock.clone();
        assert_eq!(clock.now(), clock.now());

        clock.advance_secs(2);
        assert_eq!(shared.now(), Timestamp::from_millis(3_000));
    }

    #[test]
    fn test_timestamp_to_utc() {
        // 2024-03-05T07:09:00Z
        let utc = Timestamp::from_secs(1_709_622_540).to_utc();
        assert_eq!((utc.year(), utc.month(), utc.day()), (2024, 3, 5));
        assert_eq!((utc.hour(), utc.minute()), (7, 9));
    }

    #[test]
    fn test_saturating_sub_never_negative() {
        let early = Timestamp::from_millis(1_000);
        let late = Timestamp::from_millis(1_500);
        assert_eq!(late.saturating_sub(early), Duration::from_millis(500));
        assert_eq!(early.saturating_sub(late), Duration::ZERO);
    }
}
