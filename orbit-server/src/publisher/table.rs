use std::sync::{Arc, Mutex};

use anyhow::ensure;
use serde::{Deserialize, Serialize};

use super::TablePublisher;
use crate::aggregator::{Axis, OrbitReceiver, Snapshot, SEVERITY_INVALID};

pub const ORBIT_TABLE_LABELS: [&str; 5] = ["Device Name", "Z", "X", "Y", "TMIT"];
pub const ORBIT_DESCRIPTOR: &str = "LCLS Orbit Data";

/// Structured table value published for every completed snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrbitTable {
    pub labels: Vec<String>,
    pub value: OrbitColumns,
    pub descriptor: String,
    pub alarm: AlarmInfo,
    #[serde(rename = "timeStamp")]
    pub time_stamp: TimeInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrbitColumns {
    pub device_name: Vec<String>,
    pub z: Vec<f64>,
    pub x_val: Vec<f64>,
    pub x_severity: Vec<u16>,
    pub x_status: Vec<u16>,
    pub y_val: Vec<f64>,
    pub y_severity: Vec<u16>,
    pub y_status: Vec<u16>,
    pub tmit_val: Vec<f64>,
    pub tmit_severity: Vec<u16>,
    pub tmit_status: Vec<u16>,
}

/// Alarm structure carried by the table; present but not populated here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlarmInfo {
    pub severity: i32,
    pub status: i32,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimeInfo {
    #[serde(rename = "secondsPastEpoch")]
    pub seconds_past_epoch: u32,
    pub nanoseconds: u32,
    #[serde(rename = "userTag")]
    pub user_tag: i32,
}

#[derive(Default)]
struct TableState {
    device_name: Vec<String>,
    z: Vec<f64>,
    last_x: Vec<f64>,
    last_y: Vec<f64>,
    last_tmit: Vec<f64>,
}

struct AxisColumns {
    val: Vec<f64>,
    severity: Vec<u16>,
    status: Vec<u16>,
}

/// Receiver that materializes completed snapshots into [`OrbitTable`] values
/// and hands them to a [`TablePublisher`].
///
/// Cells with no valid sample (missing, or severity 4) publish the value of
/// the previous publish with severity forced to 4; before the first publish
/// the carried value is 0.0. The last-good vectors live here, never in the
/// aggregator.
pub struct OrbitTableReceiver {
    output_pv: String,
    publisher: Arc<dyn TablePublisher>,
    state: Mutex<TableState>,
}

impl OrbitTableReceiver {
    pub fn new(output_pv: impl Into<String>, publisher: Arc<dyn TablePublisher>) -> Self {
        Self {
            output_pv: output_pv.into(),
            publisher,
            state: Mutex::new(TableState::default()),
        }
    }

    pub fn output_pv(&self) -> &str {
        &self.output_pv
    }

    fn axis_columns(snapshot: &Snapshot, axis: Axis, last: &mut [f64]) -> AxisColumns {
        let n = last.len();
        let mut columns = AxisColumns {
            val: Vec::with_capacity(n),
            severity: Vec::with_capacity(n),
            status: Vec::with_capacity(n),
        };
        for (bpm, last_val) in last.iter_mut().enumerate() {
            match snapshot.cell(bpm, axis) {
                Some(sample) if sample.is_valid() => {
                    let value = sample.first().unwrap_or_default();
                    columns.val.push(value);
                    columns.severity.push(sample.severity);
                    columns.status.push(sample.status);
                    *last_val = value;
                }
                _ => {
                    columns.val.push(*last_val);
                    columns.severity.push(SEVERITY_INVALID);
                    columns.status.push(0);
                }
            }
        }
        columns
    }
}

impl OrbitReceiver for OrbitTableReceiver {
    fn set_names(&self, names: &[String]) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.device_name = names.to_vec();
        state.last_x = vec![0.0; names.len()];
        state.last_y = vec![0.0; names.len()];
        state.last_tmit = vec![0.0; names.len()];
        Ok(())
    }

    fn set_zs(&self, zs: &[f64]) -> anyhow::Result<()> {
        self.state.lock().unwrap().z = zs.to_vec();
        Ok(())
    }

    fn set_completed_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        ensure!(
            snapshot.num_bpms() == state.device_name.len(),
            "snapshot carries {} BPMs but the table was primed with {}",
            snapshot.num_bpms(),
            state.device_name.len()
        );

        let x = Self::axis_columns(snapshot, Axis::X, &mut state.last_x);
        let y = Self::axis_columns(snapshot, Axis::Y, &mut state.last_y);
        let tmit = Self::axis_columns(snapshot, Axis::Tmit, &mut state.last_tmit);

        let table = OrbitTable {
            labels: ORBIT_TABLE_LABELS.iter().map(|s| s.to_string()).collect(),
            value: OrbitColumns {
                device_name: state.device_name.clone(),
                z: state.z.clone(),
                x_val: x.val,
                x_severity: x.severity,
                x_status: x.status,
                y_val: y.val,
                y_severity: y.severity,
                y_status: y.status,
                tmit_val: tmit.val,
                tmit_severity: tmit.severity,
                tmit_status: tmit.status,
            },
            descriptor: ORBIT_DESCRIPTOR.to_string(),
            alarm: AlarmInfo::default(),
            time_stamp: TimeInfo {
                seconds_past_epoch: snapshot.ts().sec,
                nanoseconds: snapshot.ts().nsec,
                user_tag: 0,
            },
        };
        drop(state);

        self.publisher.publish(&self.output_pv, &table)
    }
}
