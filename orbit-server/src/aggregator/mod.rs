//! Timestamp-keyed event aggregator: per-channel sample sources, the
//! snapshot correlation table, and the single worker loop that turns
//! loosely-synchronized BPM streams into completed orbit snapshots.

mod orbit;
mod receiver;
mod snapshot;
mod source;

pub use orbit::{Orbit, OrbitStats, ReceiverId};
pub use receiver::OrbitReceiver;
pub use snapshot::{Harvest, Ingest, Snapshot, SnapshotTable};
pub use source::{SampleSource, SampleValue, WakeHandle, SEVERITY_INVALID, STATUS_LINK_ALARM};

use std::fmt;

/// One of the three measurements every BPM serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Tmit,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Tmit];

    pub const fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Tmit => 2,
        }
    }

    /// Channel-name component, e.g. the `X` in `BPMS:LTUH:250:X`.
    pub const fn channel_suffix(self) -> &'static str {
        match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Tmit => "TMIT",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.channel_suffix())
    }
}

/// The BPM set an aggregator is built over: device names, longitudinal
/// positions, and the event-definition suffix appended to channel names.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub names: Vec<String>,
    pub zs: Vec<f64>,
    pub edef_suffix: String,
}

impl SourceSpec {
    pub fn num_bpms(&self) -> usize {
        self.names.len()
    }

    /// Full channel name for one measurement, `<bpm>:<axis><edef_suffix>`.
    pub fn channel_name(&self, bpm: usize, axis: Axis) -> String {
        format!(
            "{}:{}{}",
            self.names[bpm],
            axis.channel_suffix(),
            self.edef_suffix
        )
    }
}
