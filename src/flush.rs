//! Flush trigger
//!
//! A pure predicate over a batch snapshot, the active policy and the current
//! time. The orchestrator evaluates it after every append and from the
//! periodic timer; both paths call the same function.

use crate::clock::Timestamp;
use crate::config::FlushPolicy;
use std::time::Duration;

/// Point-in-time view of the open batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSnapshot {
    /// Buffered messages
    pub count: u64,
    /// Buffered messages whose handles are still unsettled
    pub in_flight: u64,
    pub opened_at: Timestamp,
    /// Receipt time of the oldest unsettled message
    pub oldest_in_flight: Option<Timestamp>,
}

impl BatchSnapshot {
    pub fn empty(opened_at: Timestamp) -> Self {
        BatchSnapshot {
            count: 0,
            in_flight: 0,
            opened_at,
            oldest_in_flight: None,
        }
    }

    pub fn age(&self, now: Timestamp) -> Duration {
        now.saturating_sub(self.opened_at)
    }

    pub fn oldest_age(&self, now: Timestamp) -> Option<Duration> {
        self.oldest_in_flight.map(|t| now.saturating_sub(t))
    }
}

/// Which threshold closed a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    MaxMessages,
    MaxAge,
    MaxInFlight,
    MaxInFlightAge,
    Shutdown,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::MaxMessages => "max_messages",
            FlushReason::MaxAge => "max_seconds",
            FlushReason::MaxInFlight => "max_in_flight",
            FlushReason::MaxInFlightAge => "max_in_flight_seconds",
            FlushReason::Shutdown => "shutdown",
        }
    }
}

/// Decide whether the open batch must close now.
///
/// An empty batch never closes. Thresholds are checked count-first, so the
/// reported reason is the cheapest one that fired.
pub fn should_flush(
    snapshot: &BatchSnapshot,
    policy: &FlushPolicy,
    now: Timestamp,
) -> Option<FlushReason> {
    if snapshot.count == 0 {
        return None;
    }

    if policy.max_messages > 0 && snapshot.count >= policy.max_messages {
        return Some(FlushReason::MaxMessages);
    }

    if policy.max_in_flight > 0 && snapshot.in_flight >= policy.max_in_flight {
        return Some(FlushReason::MaxInFlight);
    }

    if policy.max_seconds > 0 && snapshot.age(now) >= Duration::from_secs(policy.max_seconds) {
        return Some(FlushReason::MaxAge);
    }

    if policy.max_in_flight_seconds > 0 {
        if let Some(age) = snapshot.oldest_age(now) {
            if age >= Duration::from_secs(policy.max_in_flight_seconds) {
                return Some(FlushReason::MaxInFlightAge);
            }
        }
    }

    None
}
