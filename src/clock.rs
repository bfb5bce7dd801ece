//! Clock sources for heartbeat timestamps
//!
//! Heartbeat timestamps are written into the shared ring and compared by
//! every peer's failure detector, so the local source must never go
//! backward. Tests drive the failure detector with [`ManualClock`].

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of wall-clock time for the lifecycle manager
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// A clock that never returns a timestamp earlier than one it already returned.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    /// Largest timestamp handed out so far (nanos)
    high_water_ns: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a monotonically increasing nanosecond timestamp.
    ///
    /// If the wall clock steps backward (NTP adjustment), the previous
    /// high-water mark + 1ns is returned instead.
    pub fn now_nanos(&self) -> i64 {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        loop {
            let prev = self.high_water_ns.load(Ordering::Acquire);
            let ts = wall.max(prev + 1);
            match self.high_water_ns.compare_exchange_weak(
                prev,
                ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts,
                Err(_) => continue,
            }
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.now_nanos())
    }
}

/// Manually advanced clock for deterministic tests
pub struct ManualClock {
    now_ns: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now_ns: AtomicI64::new(start.timestamp_nanos_opt().unwrap_or(0)),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        self.now_ns
            .fetch_add(by.as_nanos() as i64, Ordering::AcqRel);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.now_ns
            .store(to.timestamp_nanos_opt().unwrap_or(0), Ordering::Release);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock").field("now", &self.now()).finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.now_ns.load(Ordering::Acquire))
    }
}

/// Convert a std duration into a chrono duration, saturating on overflow.
pub(crate) fn to_chrono(d: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::weeks(52 * 100))
}
