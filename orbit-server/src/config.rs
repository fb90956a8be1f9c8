use std::time::Duration;

/// Queue capacity a source starts with; the first connect callback drops it
/// to [`OrbitConfig::source_queue_limit`].
pub const TRANSIENT_QUEUE_LIMIT: usize = 10;

/// Samples kept per source when the snapshot table overflows and every
/// source queue is truncated.
pub const OVERFLOW_TRUNCATE_KEEP: usize = 4;

/// Snapshot-table entries kept after each harvest pass.
pub const SNAPSHOT_SOFT_CAP: usize = 10;

/// Poll interval for `wait_for_connection`, in milliseconds.
pub const CONNECT_POLL_MS: u64 = 10;

/// Tuning knobs for the orbit aggregator.
#[derive(Debug, Clone)]
pub struct OrbitConfig {
    /// Partial snapshots older than this many seconds are evicted without
    /// publication. Fractional values are honored to nanosecond precision.
    pub max_event_age: f64,
    /// Holdoff after delivering a snapshot to receivers; bounds output rate.
    pub flush_period_ms: u64,
    /// Expected upstream event rate in Hz; sizes the pending-snapshot cap.
    pub max_event_rate: f64,
    /// Steady-state per-source FIFO capacity.
    pub source_queue_limit: usize,
}

impl Default for OrbitConfig {
    fn default() -> Self {
        Self {
            max_event_age: 1.0,
            flush_period_ms: 4,
            max_event_rate: 20.0,
            source_queue_limit: 4,
        }
    }
}

impl OrbitConfig {
    /// Number of in-flight snapshots the drain pass may accumulate before
    /// the aggregator declares overload.
    pub fn max_pending(&self) -> usize {
        (self.max_event_rate * self.flush_period_ms as f64).clamp(10.0, 1000.0) as usize
    }

    /// `max_event_age` packed into key64 units for age comparisons.
    pub fn max_age_key(&self) -> u64 {
        let secs = self.max_event_age.trunc() as u64;
        let nanos = (self.max_event_age.fract() * 1e9) as u64;
        (secs << 32) | nanos
    }

    pub fn flush_period(&self) -> Duration {
        Duration::from_millis(self.flush_period_ms)
    }
}
