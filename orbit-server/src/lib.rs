//! Real-time orbit aggregator for a BPM network.
//!
//! Subscribes the scalar live-update channels of a set of beam position
//! monitors (X, Y, TMIT per device), correlates samples into per-timestamp
//! orbit snapshots, and republishes each completed snapshot as a structured
//! table. The upstream subscription transport, the downstream publication
//! transport, and the machine-model loader are trait seams; the shipped
//! implementations (simulated beamline, NDJSON) make the binary runnable
//! end-to-end.

pub mod aggregator;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod publisher;
pub mod time;
pub mod transport;

pub use aggregator::{
    Axis, Orbit, OrbitReceiver, OrbitStats, ReceiverId, SampleSource, SampleValue, Snapshot,
    SnapshotTable, SourceSpec, SEVERITY_INVALID,
};
pub use config::OrbitConfig;
pub use error::OrbitError;
pub use publisher::{NdjsonPublisher, OrbitTable, OrbitTableReceiver, TablePublisher};
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
pub use transport::{
    ChannelTransport, DeviceTable, ModelFetch, SimTransport, Subscription, TransportError,
};

/// Installs the global tracing subscriber. With `None` the filter comes from
/// `RUST_LOG`; an explicit directive string overrides it. Safe to call more
/// than once; later calls keep the first subscriber.
pub fn init_logging(filter: Option<String>) -> anyhow::Result<()> {
    let filter = match filter {
        Some(directives) => tracing_subscriber::EnvFilter::try_new(directives)?,
        None => tracing_subscriber::EnvFilter::from_default_env(),
    };
    if tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(filter)
            .finish(),
    )
    .is_err()
    {
        // Subscriber already set, keep it.
    }
    Ok(())
}
