use std::collections::BTreeMap;

use metrics::counter;
use tracing::{debug, warn};

use super::source::SampleValue;
use super::Axis;
use crate::config::SNAPSHOT_SOFT_CAP;
use crate::time::Timestamp;

/// Per-timestamp partial or complete orbit: one cell per `(bpm, axis)`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    ts: Timestamp,
    cells: Vec<[Option<SampleValue>; 3]>,
    complete: bool,
}

impl Snapshot {
    fn new(ts: Timestamp, num_bpms: usize) -> Self {
        Self {
            ts,
            cells: (0..num_bpms).map(|_| [None, None, None]).collect(),
            complete: false,
        }
    }

    pub fn ts(&self) -> Timestamp {
        self.ts
    }

    pub fn key(&self) -> u64 {
        self.ts.key()
    }

    pub fn num_bpms(&self) -> usize {
        self.cells.len()
    }

    pub fn cell(&self, bpm: usize, axis: Axis) -> Option<&SampleValue> {
        self.cells.get(bpm)?[axis.index()].as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    #[cfg(test)]
    fn filled_cells(&self) -> usize {
        self.cells
            .iter()
            .flat_map(|row| row.iter())
            .filter(|cell| cell.is_some())
            .count()
    }
}

/// Outcome of offering one sample to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Stored,
    /// At or before the publication watermark; already published or expired.
    Stale,
    /// The cell already held a sample for this key; the first one wins.
    Duplicate,
}

/// Result of one harvest pass.
#[derive(Debug, Default)]
pub struct Harvest {
    /// Newest complete snapshot, the one to deliver.
    pub newest: Option<Snapshot>,
    /// Older complete snapshots erased without delivery.
    pub skipped: usize,
    /// Partial snapshots dropped to hold the soft cap.
    pub trimmed: usize,
}

/// Ordered map from key64 to in-flight snapshot, plus the publication
/// watermark. Owned and mutated exclusively by the aggregator worker.
pub struct SnapshotTable {
    num_bpms: usize,
    events: BTreeMap<u64, Snapshot>,
    oldest_published_key: u64,
}

impl SnapshotTable {
    pub fn new(num_bpms: usize) -> Self {
        Self {
            num_bpms,
            events: BTreeMap::new(),
            oldest_published_key: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn oldest_published_key(&self) -> u64 {
        self.oldest_published_key
    }

    /// Slots one sample into the snapshot for its timestamp, creating the
    /// snapshot on first contact. Never touches the `complete` flag; that is
    /// [`mark_complete`](Self::mark_complete)'s job alone.
    pub fn ingest(&mut self, bpm: usize, axis: Axis, sample: SampleValue) -> Ingest {
        let key = sample.key();
        if key <= self.oldest_published_key {
            return Ingest::Stale;
        }
        let num_bpms = self.num_bpms;
        let snapshot = self
            .events
            .entry(key)
            .or_insert_with(|| Snapshot::new(sample.ts, num_bpms));
        let cell = &mut snapshot.cells[bpm][axis.index()];
        if cell.is_some() {
            warn!(bpm, %axis, key, "duplicate sample for snapshot cell, keeping first");
            counter!("orbit_duplicate_cells_total", 1);
            return Ingest::Duplicate;
        }
        *cell = Some(sample);
        Ingest::Stored
    }

    /// Evicts snapshots older than `max_age_key` relative to `now_key`, then
    /// recomputes completeness for the survivors against the current
    /// connection set. Returns the number of snapshots aged out.
    pub fn mark_complete(
        &mut self,
        now_key: u64,
        max_age_key: u64,
        connected: impl Fn(usize, Axis) -> bool,
    ) -> usize {
        let before = self.events.len();
        self.events
            .retain(|key, _| (now_key as i128) - (*key as i128) < max_age_key as i128);
        let aged_out = before - self.events.len();
        if aged_out > 0 {
            debug!(aged_out, "evicted stale partial snapshots");
            counter!("orbit_aged_out_total", aged_out as u64);
        }

        for snapshot in self.events.values_mut().rev() {
            let mut complete = true;
            'cells: for (bpm, row) in snapshot.cells.iter().enumerate() {
                for axis in Axis::ALL {
                    if row[axis.index()].is_none() && connected(bpm, axis) {
                        complete = false;
                        break 'cells;
                    }
                }
            }
            snapshot.complete = complete;
        }
        aged_out
    }

    /// Erases every complete snapshot, advances the watermark to the newest
    /// erased key, and returns that newest snapshot for delivery. Afterwards
    /// the table is trimmed (oldest first) to the soft cap.
    pub fn harvest(&mut self) -> Harvest {
        let mut harvest = Harvest::default();
        let complete_keys: Vec<u64> = self
            .events
            .iter()
            .filter(|(_, snapshot)| snapshot.complete)
            .map(|(key, _)| *key)
            .collect();
        for key in complete_keys {
            if let Some(snapshot) = self.events.remove(&key) {
                debug_assert!(key > self.oldest_published_key);
                self.oldest_published_key = key;
                if let Some(older) = harvest.newest.replace(snapshot) {
                    debug!(key = older.key(), "skipping older complete snapshot");
                    harvest.skipped += 1;
                }
            }
        }
        while self.events.len() > SNAPSHOT_SOFT_CAP {
            self.events.pop_first();
            harvest.trimmed += 1;
        }
        harvest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(sec: u32, nsec: u32, value: f64) -> SampleValue {
        SampleValue::scalar(Timestamp::new(sec, nsec), value, 0, 0)
    }

    fn fill_bpm(table: &mut SnapshotTable, bpm: usize, sec: u32, nsec: u32) {
        for axis in Axis::ALL {
            table.ingest(bpm, axis, sample(sec, nsec, 1.0));
        }
    }

    const ALL_CONNECTED: fn(usize, Axis) -> bool = |_, _| true;

    #[test]
    fn ingest_creates_dimensioned_snapshot() {
        let mut table = SnapshotTable::new(2);
        assert_eq!(table.ingest(1, Axis::Y, sample(10, 0, 2.5)), Ingest::Stored);
        assert_eq!(table.len(), 1);
        table.mark_complete(Timestamp::new(10, 0).key(), u64::MAX, |_, _| false);
        let snapshot = table.harvest().newest.unwrap();
        assert_eq!(snapshot.num_bpms(), 2);
        assert_eq!(snapshot.cell(1, Axis::Y).unwrap().first(), Some(2.5));
        assert!(snapshot.cell(0, Axis::X).is_none());
    }

    #[test]
    fn duplicate_cell_keeps_first() {
        let mut table = SnapshotTable::new(1);
        table.ingest(0, Axis::X, sample(10, 0, 1.0));
        assert_eq!(
            table.ingest(0, Axis::X, sample(10, 0, 9.0)),
            Ingest::Duplicate
        );
        table.mark_complete(Timestamp::new(10, 0).key(), u64::MAX, |_, axis| {
            axis == Axis::X
        });
        let snapshot = table.harvest().newest.unwrap();
        assert_eq!(snapshot.cell(0, Axis::X).unwrap().first(), Some(1.0));
    }

    #[test]
    fn stale_keys_are_discarded() {
        let mut table = SnapshotTable::new(1);
        fill_bpm(&mut table, 0, 10, 5);
        table.mark_complete(Timestamp::new(10, 5).key(), u64::MAX, ALL_CONNECTED);
        assert!(table.harvest().newest.is_some());

        assert_eq!(table.ingest(0, Axis::X, sample(10, 5, 1.0)), Ingest::Stale);
        assert_eq!(table.ingest(0, Axis::X, sample(10, 4, 1.0)), Ingest::Stale);
        assert_eq!(table.ingest(0, Axis::X, sample(10, 6, 1.0)), Ingest::Stored);
    }

    #[test]
    fn completeness_requires_all_connected_cells() {
        let mut table = SnapshotTable::new(2);
        fill_bpm(&mut table, 0, 10, 0);
        table.ingest(1, Axis::X, sample(10, 0, 1.0));
        table.mark_complete(Timestamp::new(10, 0).key(), u64::MAX, ALL_CONNECTED);
        assert!(table.harvest().newest.is_none());

        // The missing cells belong to a disconnected device: now satisfied.
        let connected = |bpm: usize, _axis: Axis| bpm == 0;
        table.mark_complete(Timestamp::new(10, 0).key(), u64::MAX, connected);
        let snapshot = table.harvest().newest.unwrap();
        assert!(snapshot.is_complete());
        assert_eq!(snapshot.filled_cells(), 4);
    }

    #[test]
    fn age_out_evicts_old_partials() {
        let mut table = SnapshotTable::new(1);
        table.ingest(0, Axis::X, sample(10, 0, 1.0));
        let max_age_key = 1u64 << 32; // one second
        let aged = table.mark_complete(Timestamp::new(11, 0).key(), max_age_key, ALL_CONNECTED);
        assert_eq!(aged, 1);
        assert!(table.is_empty());
        assert!(table.harvest().newest.is_none());
    }

    #[test]
    fn age_out_spares_young_partials() {
        let mut table = SnapshotTable::new(1);
        table.ingest(0, Axis::X, sample(10, 500_000_000, 1.0));
        let max_age_key = 1u64 << 32;
        let aged = table.mark_complete(Timestamp::new(11, 0).key(), max_age_key, ALL_CONNECTED);
        assert_eq!(aged, 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn harvest_delivers_newest_and_skips_older() {
        let mut table = SnapshotTable::new(1);
        fill_bpm(&mut table, 0, 10, 0);
        fill_bpm(&mut table, 0, 10, 1);
        table.mark_complete(Timestamp::new(10, 1).key(), u64::MAX, ALL_CONNECTED);
        let harvest = table.harvest();
        let newest = harvest.newest.unwrap();
        assert_eq!(newest.ts(), Timestamp::new(10, 1));
        assert_eq!(harvest.skipped, 1);
        assert_eq!(table.oldest_published_key(), Timestamp::new(10, 1).key());
        assert!(table.is_empty());
    }

    #[test]
    fn watermark_only_advances() {
        let mut table = SnapshotTable::new(1);
        fill_bpm(&mut table, 0, 12, 0);
        table.mark_complete(Timestamp::new(12, 0).key(), u64::MAX, ALL_CONNECTED);
        table.harvest();
        let watermark = table.oldest_published_key();

        fill_bpm(&mut table, 0, 11, 0); // older than the watermark
        assert!(table.is_empty());
        assert_eq!(table.oldest_published_key(), watermark);
    }

    #[test]
    fn soft_cap_trims_oldest_partials() {
        let mut table = SnapshotTable::new(1);
        for nsec in 0..(SNAPSHOT_SOFT_CAP as u32 + 5) {
            table.ingest(0, Axis::X, sample(10, nsec, 1.0));
        }
        table.mark_complete(Timestamp::new(10, 0).key(), u64::MAX, ALL_CONNECTED);
        let harvest = table.harvest();
        assert!(harvest.newest.is_none());
        assert_eq!(harvest.trimmed, 5);
        assert_eq!(table.len(), SNAPSHOT_SOFT_CAP);
    }
}
