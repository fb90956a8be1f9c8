use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future;
use metrics::counter;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::receiver::OrbitReceiver;
use super::snapshot::{Ingest, SnapshotTable};
use super::source::{SampleSource, WakeHandle};
use super::{Axis, SourceSpec};
use crate::config::{OrbitConfig, CONNECT_POLL_MS, OVERFLOW_TRUNCATE_KEEP, TRANSIENT_QUEUE_LIMIT};
use crate::error::OrbitError;
use crate::time::{Clock, SystemClock};
use crate::transport::ChannelTransport;

/// Handle returned by [`Orbit::add_receiver`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverId(u64);

/// Monotonic counters describing aggregator behavior since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrbitStats {
    /// Snapshots delivered to receivers.
    pub published: u64,
    /// Complete snapshots erased in favor of a newer one in the same pass.
    pub skipped_complete: u64,
    /// Partial snapshots evicted past `max_event_age`.
    pub aged_out: u64,
    /// Partial snapshots dropped by the table soft cap.
    pub trimmed: u64,
    /// Samples rejected because their cell was already filled.
    pub duplicate_cells: u64,
    /// Drain passes that hit the pending-snapshot cap.
    pub table_overflows: u64,
    /// Samples dropped by source FIFO overflow, summed over sources.
    pub source_overflow_drops: u64,
}

#[derive(Default)]
struct StatsCells {
    published: AtomicU64,
    skipped_complete: AtomicU64,
    aged_out: AtomicU64,
    trimmed: AtomicU64,
    duplicate_cells: AtomicU64,
    table_overflows: AtomicU64,
}

struct Registry {
    next_id: u64,
    entries: Vec<(ReceiverId, Arc<dyn OrbitReceiver>)>,
    changed: bool,
}

struct Shared {
    config: OrbitConfig,
    names: Vec<String>,
    zs: Vec<f64>,
    sources: Vec<[Arc<SampleSource>; 3]>,
    wakeup: Arc<Notify>,
    run: AtomicBool,
    registry: Mutex<Registry>,
    stats: StatsCells,
    clock: Arc<dyn Clock>,
}

/// The orbit aggregator: owns one `SampleSource` per `(bpm, axis)` channel
/// and a single worker task that correlates samples into snapshots and fans
/// completed snapshots out to registered receivers.
pub struct Orbit {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Orbit {
    /// Builds the source grid, subscribes every channel, and spawns the
    /// worker. Returns without waiting for connections to establish; a
    /// failed subscription is fatal and tears down the ones already made.
    pub async fn new(
        transport: Arc<dyn ChannelTransport>,
        spec: SourceSpec,
        config: OrbitConfig,
    ) -> Result<Self, OrbitError> {
        Self::with_clock(transport, spec, config, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(
        transport: Arc<dyn ChannelTransport>,
        spec: SourceSpec,
        config: OrbitConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, OrbitError> {
        let wakeup = Arc::new(Notify::new());
        let mut sources: Vec<[Arc<SampleSource>; 3]> = Vec::with_capacity(spec.num_bpms());
        for bpm in 0..spec.num_bpms() {
            sources.push(Axis::ALL.map(|axis| {
                Arc::new(SampleSource::new(
                    spec.channel_name(bpm, axis),
                    WakeHandle::new(wakeup.clone()),
                    clock.clone(),
                    TRANSIENT_QUEUE_LIMIT,
                    config.source_queue_limit,
                ))
            }));
        }

        let flat: Vec<Arc<SampleSource>> = sources
            .iter()
            .flat_map(|row| row.iter().cloned())
            .collect();
        let results = future::join_all(flat.iter().map(|source| {
            let transport = transport.clone();
            let source = source.clone();
            async move { transport.subscribe(source.name(), source.clone()).await }
        }))
        .await;
        for (source, result) in flat.iter().zip(results) {
            match result {
                Ok(subscription) => source.attach_subscription(subscription),
                Err(err) => {
                    for closing in &flat {
                        closing.close();
                    }
                    return Err(OrbitError::Subscription {
                        channel: source.name().to_string(),
                        source: err,
                    });
                }
            }
        }
        info!(bpms = spec.num_bpms(), "orbit aggregator subscribed");

        let shared = Arc::new(Shared {
            config,
            names: spec.names,
            zs: spec.zs,
            sources,
            wakeup,
            run: AtomicBool::new(true),
            registry: Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
                changed: false,
            }),
            stats: StatsCells::default(),
            clock,
        });
        let worker = tokio::spawn(worker_loop(shared.clone()));
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn names(&self) -> &[String] {
        &self.shared.names
    }

    pub fn zs(&self) -> &[f64] {
        &self.shared.zs
    }

    /// True once every source channel has connected.
    pub fn connected(&self) -> bool {
        self.shared
            .sources
            .iter()
            .flat_map(|row| row.iter())
            .all(|source| source.connected())
    }

    /// Polls until every source is connected or the timeout elapses.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.connected() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(CONNECT_POLL_MS)).await;
        }
        true
    }

    /// Registers a receiver and primes it with the name and position
    /// vectors. The priming calls happen outside the registry lock.
    pub fn add_receiver(&self, receiver: Arc<dyn OrbitReceiver>) -> ReceiverId {
        let id;
        let (names, zs);
        {
            let mut registry = self.shared.registry.lock().unwrap();
            registry.next_id += 1;
            id = ReceiverId(registry.next_id);
            registry.entries.push((id, receiver.clone()));
            registry.changed = true;
            names = self.shared.names.clone();
            zs = self.shared.zs.clone();
        }
        if let Err(err) = receiver.set_names(&names) {
            warn!(error = %err, "receiver rejected names");
        }
        if let Err(err) = receiver.set_zs(&zs) {
            warn!(error = %err, "receiver rejected z positions");
        }
        id
    }

    /// Unregisters a receiver. Deliveries that start after this returns will
    /// not include it; a delivery already in flight may still reach it.
    pub fn remove_receiver(&self, id: ReceiverId) {
        let mut registry = self.shared.registry.lock().unwrap();
        registry.entries.retain(|(entry_id, _)| *entry_id != id);
        registry.changed = true;
    }

    pub fn stats(&self) -> OrbitStats {
        let cells = &self.shared.stats;
        OrbitStats {
            published: cells.published.load(Ordering::Relaxed),
            skipped_complete: cells.skipped_complete.load(Ordering::Relaxed),
            aged_out: cells.aged_out.load(Ordering::Relaxed),
            trimmed: cells.trimmed.load(Ordering::Relaxed),
            duplicate_cells: cells.duplicate_cells.load(Ordering::Relaxed),
            table_overflows: cells.table_overflows.load(Ordering::Relaxed),
            source_overflow_drops: self
                .shared
                .sources
                .iter()
                .flat_map(|row| row.iter())
                .map(|source| source.overflow_drops())
                .sum(),
        }
    }

    /// Closes every source, wakes the worker, and joins it. Idempotent.
    pub async fn close(&self) {
        if self.shared.run.swap(false, Ordering::Relaxed) {
            for source in self.shared.sources.iter().flat_map(|row| row.iter()) {
                source.close();
            }
            self.shared.wakeup.notify_one();
            info!("orbit aggregator closing");
        }
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for Orbit {
    fn drop(&mut self) {
        if self.shared.run.swap(false, Ordering::Relaxed) {
            for source in self.shared.sources.iter().flat_map(|row| row.iter()) {
                source.close();
            }
            self.shared.wakeup.notify_one();
            if let Some(handle) = self.worker.lock().unwrap().take() {
                handle.abort();
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainOutcome {
    /// A full scan popped nothing and nothing was popped earlier.
    Idle,
    /// Samples were ingested and the queues ran dry.
    Progress,
    /// The pending-snapshot cap stopped the drain; queues may still be full.
    Overflow,
}

/// One scan-until-dry pass over the source grid.
///
/// The `ready` hint lets quiet sources be skipped, but is ignored for BPM
/// index 0 so the drain always makes forward progress when higher-index
/// sources sit idle.
fn drain(shared: &Shared, table: &mut SnapshotTable, max_pending: usize) -> DrainOutcome {
    let mut popped_any = false;
    loop {
        let mut nothing = true;
        for (bpm, row) in shared.sources.iter().enumerate() {
            for (axis, source) in Axis::ALL.into_iter().zip(row.iter()) {
                if !source.connected() || (bpm != 0 && !source.is_ready()) {
                    continue;
                }
                match source.pop() {
                    Some(sample) => {
                        source.set_ready(true);
                        nothing = false;
                        popped_any = true;
                        if table.ingest(bpm, axis, sample) == Ingest::Duplicate {
                            shared.stats.duplicate_cells.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    None => source.set_ready(false),
                }
            }
        }
        if nothing {
            return if popped_any {
                DrainOutcome::Progress
            } else {
                DrainOutcome::Idle
            };
        }
        if table.len() >= max_pending {
            return DrainOutcome::Overflow;
        }
    }
}

async fn worker_loop(shared: Arc<Shared>) {
    let mut table = SnapshotTable::new(shared.sources.len());
    let mut shadow: Vec<Arc<dyn OrbitReceiver>> = Vec::new();
    let max_pending = shared.config.max_pending();
    let max_age_key = shared.config.max_age_key();
    let flush_period = shared.config.flush_period();

    while shared.run.load(Ordering::Relaxed) {
        let now_key = shared.clock.now().key();

        let outcome = drain(&shared, &mut table, max_pending);
        if outcome == DrainOutcome::Overflow {
            shared.stats.table_overflows.fetch_add(1, Ordering::Relaxed);
            counter!("orbit_table_overflow_total", 1);
            warn!("snapshot table overflow, truncating source queues");
            for source in shared.sources.iter().flat_map(|row| row.iter()) {
                source.clear(OVERFLOW_TRUNCATE_KEEP);
            }
        }

        let aged = table.mark_complete(now_key, max_age_key, |bpm, axis| {
            shared.sources[bpm][axis.index()].connected()
        });
        if aged > 0 {
            shared
                .stats
                .aged_out
                .fetch_add(aged as u64, Ordering::Relaxed);
        }

        {
            let mut registry = shared.registry.lock().unwrap();
            if registry.changed {
                shadow = registry
                    .entries
                    .iter()
                    .map(|(_, receiver)| receiver.clone())
                    .collect();
                registry.changed = false;
            }
        }

        let harvest = table.harvest();
        if harvest.skipped > 0 {
            shared
                .stats
                .skipped_complete
                .fetch_add(harvest.skipped as u64, Ordering::Relaxed);
        }
        if harvest.trimmed > 0 {
            shared
                .stats
                .trimmed
                .fetch_add(harvest.trimmed as u64, Ordering::Relaxed);
        }

        if let Some(snapshot) = harvest.newest {
            shared.stats.published.fetch_add(1, Ordering::Relaxed);
            counter!("orbit_published_total", 1);
            debug!(key = snapshot.key(), "delivering complete snapshot");
            for receiver in &shadow {
                if let Err(err) = receiver.set_completed_snapshot(&snapshot) {
                    warn!(error = %err, "receiver failed, keeping it registered");
                }
            }
            tokio::time::sleep(flush_period).await;
        } else if outcome == DrainOutcome::Idle {
            shared.wakeup.notified().await;
        }
    }
}
