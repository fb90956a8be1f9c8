use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use metrics::counter;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::time::{Clock, Timestamp};
use crate::transport::Subscription;

/// Severity value marking a sample as invalid; also the published severity
/// for cells with no valid sample in a snapshot.
pub const SEVERITY_INVALID: u16 = 4;

/// Alarm status carried by disconnect sentinels.
pub const STATUS_LINK_ALARM: u16 = 14;

/// One timestamped measurement as delivered by a monitor callback.
///
/// The payload buffer is reference counted so moving a sample into a
/// snapshot and publishing it never copies payload bytes.
#[derive(Debug, Clone)]
pub struct SampleValue {
    pub ts: Timestamp,
    pub severity: u16,
    pub status: u16,
    pub count: u32,
    pub buffer: Option<Arc<[f64]>>,
}

impl SampleValue {
    /// Single-element sample, the common case for BPM channels.
    pub fn scalar(ts: Timestamp, value: f64, severity: u16, status: u16) -> Self {
        Self {
            ts,
            severity,
            status,
            count: 1,
            buffer: Some(Arc::from([value])),
        }
    }

    /// Sentinel enqueued when a channel drops its connection.
    pub fn disconnected(ts: Timestamp) -> Self {
        Self {
            ts,
            severity: SEVERITY_INVALID,
            status: STATUS_LINK_ALARM,
            count: 1,
            buffer: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.severity != SEVERITY_INVALID && self.buffer.is_some()
    }

    pub fn first(&self) -> Option<f64> {
        self.buffer.as_ref().and_then(|b| b.first().copied())
    }

    pub fn key(&self) -> u64 {
        self.ts.key()
    }
}

/// Capability a source uses to wake the aggregator worker. A clone of the
/// shared wakeup latch, handed down at construction so sources never hold a
/// reference back to the aggregator.
#[derive(Clone)]
pub struct WakeHandle {
    notify: Arc<Notify>,
}

impl WakeHandle {
    pub(crate) fn new(notify: Arc<Notify>) -> Self {
        Self { notify }
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

struct SourceState {
    queue: VecDeque<SampleValue>,
    limit: usize,
    last_event_key: u64,
}

/// One measurement channel: a bounded FIFO fed by transport callbacks and
/// drained by the aggregator worker.
///
/// The queue mutex is the only synchronization between the two sides; the
/// `connected`/`ready` flags are advisory and read without it.
pub struct SampleSource {
    name: String,
    wake: WakeHandle,
    clock: Arc<dyn Clock>,
    steady_limit: usize,
    connected: AtomicBool,
    ready: AtomicBool,
    closed: AtomicBool,
    overflow_drops: AtomicU64,
    state: Mutex<SourceState>,
    subscription: Mutex<Option<Box<dyn Subscription>>>,
}

impl SampleSource {
    pub(crate) fn new(
        name: String,
        wake: WakeHandle,
        clock: Arc<dyn Clock>,
        transient_limit: usize,
        steady_limit: usize,
    ) -> Self {
        Self {
            name,
            wake,
            clock,
            steady_limit,
            connected: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            overflow_drops: AtomicU64::new(0),
            state: Mutex::new(SourceState {
                queue: VecDeque::new(),
                limit: transient_limit,
                last_event_key: 0,
            }),
            subscription: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn attach_subscription(&self, subscription: Box<dyn Subscription>) {
        *self.subscription.lock().unwrap() = Some(subscription);
    }

    /// Monitor callback: append one sample.
    ///
    /// Samples at or before the newest accepted timestamp are dropped, so the
    /// queue is monotonic by `ts`. On overflow the oldest entries are dropped
    /// down to the configured limit. The aggregator is woken only on the
    /// empty-to-non-empty transition.
    pub fn push(&self, sample: SampleValue) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let wake;
        {
            let mut state = self.state.lock().unwrap();
            let key = sample.key();
            if key <= state.last_event_key {
                trace!(source = %self.name, "dropping non-monotonic sample");
                return;
            }
            state.last_event_key = key;
            wake = state.queue.is_empty();
            self.enqueue(&mut state, sample);
        }
        if wake {
            self.ready.store(true, Ordering::Relaxed);
            self.wake.wake();
        }
    }

    fn enqueue(&self, state: &mut SourceState, sample: SampleValue) {
        while state.queue.len() > state.limit {
            state.queue.pop_front();
            self.overflow_drops.fetch_add(1, Ordering::Relaxed);
            counter!("orbit_source_overflow_total", 1);
            debug!(source = %self.name, "queue overflow, dropping oldest sample");
        }
        state.queue.push_back(sample);
    }

    /// Aggregator side: remove and return the oldest queued sample.
    pub fn pop(&self) -> Option<SampleValue> {
        self.state.lock().unwrap().queue.pop_front()
    }

    /// Truncates the FIFO to at most `remain` samples, oldest dropped first.
    pub fn clear(&self, remain: usize) {
        let mut state = self.state.lock().unwrap();
        while state.queue.len() > remain {
            state.queue.pop_front();
        }
    }

    /// Releases the upstream subscription; later pushes are no-ops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(mut subscription) = self.subscription.lock().unwrap().take() {
            subscription.unsubscribe();
        }
    }

    /// Connection-established callback.
    pub fn on_connect(&self) {
        let mut state = self.state.lock().unwrap();
        state.last_event_key = 0;
        state.limit = self.steady_limit;
        drop(state);
        self.connected.store(true, Ordering::Relaxed);
    }

    /// Connection-lost callback: enqueue an invalid-severity sentinel stamped
    /// with the current wall clock and wake the aggregator.
    pub fn on_disconnect(&self) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let sentinel = SampleValue::disconnected(self.clock.now());
        {
            let mut state = self.state.lock().unwrap();
            self.connected.store(false, Ordering::Relaxed);
            self.enqueue(&mut state, sentinel);
        }
        self.ready.store(true, Ordering::Relaxed);
        self.wake.wake();
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Drain hint: cleared by the worker when a pop comes up empty so quiet
    /// sources are skipped on later scans.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Samples dropped by FIFO overflow since construction.
    pub fn overflow_drops(&self) -> u64 {
        self.overflow_drops.load(Ordering::Relaxed)
    }
}
