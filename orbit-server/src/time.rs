use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Split-second timestamp as carried by every sample and snapshot.
///
/// The derived ordering matches the packed [`key`](Timestamp::key) ordering
/// because nanoseconds are always below 10^9.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub sec: u32,
    pub nsec: u32,
}

impl Timestamp {
    pub const fn new(sec: u32, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    /// Packs the timestamp into the 64-bit snapshot-table key,
    /// `(seconds << 32) | nanoseconds`.
    pub const fn key(self) -> u64 {
        ((self.sec as u64) << 32) | self.nsec as u64
    }

    pub const fn from_key(key: u64) -> Self {
        Self {
            sec: (key >> 32) as u32,
            nsec: key as u32,
        }
    }
}

/// Wall-clock seam. The aggregator worker reads the clock once per pass;
/// sources read it only to stamp disconnect sentinels.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

/// System clock backed by `chrono::Utc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let now = Utc::now();
        Timestamp {
            sec: now.timestamp() as u32,
            nsec: now.timestamp_subsec_nanos(),
        }
    }
}

/// Manually stepped clock for deterministic age-out behavior in tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    key: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Arc<Self> {
        Arc::new(Self {
            key: AtomicU64::new(start.key()),
        })
    }

    pub fn set(&self, ts: Timestamp) {
        self.key.store(ts.key(), Ordering::Relaxed);
    }

    pub fn advance_secs(&self, secs: u32) {
        let ts = Timestamp::from_key(self.key.load(Ordering::Relaxed));
        self.set(Timestamp::new(ts.sec + secs, ts.nsec));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_key(self.key.load(Ordering::Relaxed))
    }
}
