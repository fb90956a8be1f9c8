//! Downstream publication: the structured orbit table and the transports
//! that carry it. The aggregator itself only knows [`OrbitReceiver`]; the
//! types here adapt completed snapshots into the published table shape.
//!
//! [`OrbitReceiver`]: crate::aggregator::OrbitReceiver

mod ndjson;
mod table;

pub use ndjson::NdjsonPublisher;
pub use table::{
    AlarmInfo, OrbitColumns, OrbitTable, OrbitTableReceiver, TimeInfo, ORBIT_DESCRIPTOR,
    ORBIT_TABLE_LABELS,
};

/// Outbound structured-value transport. Implementations publish one table
/// per completed snapshot under the configured output PV name.
pub trait TablePublisher: Send + Sync {
    fn publish(&self, name: &str, table: &OrbitTable) -> anyhow::Result<()>;
}
