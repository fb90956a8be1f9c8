//! In-process simulated beamline transport.
//!
//! Serves the `--fake` CLI mode and demos: every subscribed channel connects
//! immediately and a single driver task pushes one sample per channel per
//! tick, all channels sharing the tick's timestamp so orbits complete.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::f64::consts::TAU;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{ChannelTransport, DeviceTable, ModelFetch, Subscription, TransportError};
use crate::aggregator::{SampleSource, SampleValue};
use crate::time::{Clock, SystemClock};

#[derive(Clone, Copy)]
enum ChannelKind {
    Position,
    Intensity,
}

struct SimChannel {
    sink: Arc<SampleSource>,
    kind: ChannelKind,
    phase: f64,
}

struct SimInner {
    clock: Arc<dyn Clock>,
    period: Duration,
    channels: Mutex<HashMap<u64, SimChannel>>,
    next_id: AtomicU64,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Simulated transport; cheap to clone, all clones share one driver task.
#[derive(Clone)]
pub struct SimTransport {
    inner: Arc<SimInner>,
}

impl SimTransport {
    pub fn new(rate_hz: f64) -> Self {
        Self::with_clock(rate_hz, Arc::new(SystemClock))
    }

    pub fn with_clock(rate_hz: f64, clock: Arc<dyn Clock>) -> Self {
        let rate_hz = rate_hz.max(0.1);
        Self {
            inner: Arc::new(SimInner {
                clock,
                period: Duration::from_secs_f64(1.0 / rate_hz),
                channels: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                driver: Mutex::new(None),
            }),
        }
    }
}

impl SimInner {
    fn ensure_driver(inner: &Arc<SimInner>) {
        let mut driver = inner.driver.lock().unwrap();
        if driver.is_some() {
            return;
        }
        let period = inner.period;
        let inner = Arc::downgrade(inner);
        *driver = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            loop {
                ticks.tick().await;
                let Some(inner) = inner.upgrade() else { break };
                inner.tick();
            }
        }));
    }

    fn tick(&self) {
        let ts = self.clock.now();
        let t = ts.sec as f64 + ts.nsec as f64 * 1e-9;
        let channels = self.channels.lock().unwrap();
        for channel in channels.values() {
            let value = match channel.kind {
                ChannelKind::Position => 0.5 * (0.3 * TAU * t + channel.phase).sin(),
                ChannelKind::Intensity => 1.0e9 * (1.0 + 0.02 * (0.1 * TAU * t + channel.phase).sin()),
            };
            channel.sink.push(SampleValue::scalar(ts, value, 0, 0));
        }
    }
}

impl Drop for SimInner {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.lock().unwrap().take() {
            driver.abort();
        }
    }
}

struct SimSubscription {
    id: u64,
    inner: Weak<SimInner>,
}

impl Subscription for SimSubscription {
    fn unsubscribe(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.channels.lock().unwrap().remove(&self.id);
        }
    }
}

fn name_phase(channel: &str) -> f64 {
    let mut hasher = DefaultHasher::new();
    channel.hash(&mut hasher);
    (hasher.finish() % 1000) as f64 / 1000.0 * TAU
}

#[async_trait]
impl ChannelTransport for SimTransport {
    async fn subscribe(
        &self,
        channel: &str,
        sink: Arc<SampleSource>,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let kind = if channel.contains(":TMIT") {
            ChannelKind::Intensity
        } else {
            ChannelKind::Position
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.channels.lock().unwrap().insert(
            id,
            SimChannel {
                sink: sink.clone(),
                kind,
                phase: name_phase(channel),
            },
        );
        SimInner::ensure_driver(&self.inner);
        sink.on_connect();
        debug!(channel, "simulated channel connected");
        Ok(Box::new(SimSubscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }))
    }
}

#[async_trait]
impl ModelFetch for SimTransport {
    /// Synthetic machine model: a BPM every few meters with other device
    /// classes interleaved, so the bootstrap filter has something to drop.
    async fn fetch(&self, model_pv: &str) -> Result<DeviceTable, TransportError> {
        debug!(model_pv, "serving synthetic device table");
        let mut table = DeviceTable::default();
        for i in 0..24u32 {
            let region = 100 + 10 * i;
            table.device_name.push(format!("QUAD:LTUH:{}", region + 1));
            table.s.push(10.0 + 2.5 * i as f64 - 0.5);
            table.device_name.push(format!("BPMS:LTUH:{region}"));
            table.s.push(10.0 + 2.5 * i as f64);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::WakeHandle;
    use crate::time::{ManualClock, Timestamp};
    use tokio::sync::Notify;

    fn sim_source(name: &str, clock: Arc<ManualClock>) -> Arc<SampleSource> {
        Arc::new(SampleSource::new(
            name.into(),
            WakeHandle::new(Arc::new(Notify::new())),
            clock,
            10,
            4,
        ))
    }

    #[tokio::test]
    async fn connects_and_delivers_shared_timestamps() {
        let clock = ManualClock::new(Timestamp::new(50, 0));
        let sim = SimTransport::with_clock(1000.0, clock.clone());
        let x = sim_source("BPMS:LTUH:0:X", clock.clone());
        let tmit = sim_source("BPMS:LTUH:0:TMIT", clock.clone());
        let mut subs = Vec::new();
        subs.push(sim.subscribe(x.name(), x.clone()).await.unwrap());
        subs.push(sim.subscribe(tmit.name(), tmit.clone()).await.unwrap());
        assert!(x.connected());
        assert!(tmit.connected());

        // Discard anything delivered while only one channel was registered;
        // from here on samples arrive in same-timestamp pairs.
        x.clear(0);
        tmit.clear(0);

        // Let the driver tick with a distinct timestamp each time.
        for step in 1..=20 {
            clock.set(Timestamp::new(50, step * 1_000_000));
            tokio::time::sleep(Duration::from_millis(2)).await;
            if x.queue_len() > 0 && tmit.queue_len() > 0 {
                break;
            }
        }
        let from_x = x.pop().expect("no sample on X");
        let from_tmit = tmit.pop().expect("no sample on TMIT");
        assert_eq!(from_x.ts, from_tmit.ts);
        assert!(from_tmit.first().unwrap() > 1.0e8);

        for sub in &mut subs {
            sub.unsubscribe();
        }
        assert_eq!(sim.inner.channels.lock().unwrap().len(), 0);
    }
}
