use super::snapshot::Snapshot;

/// Downstream observer of the aggregator.
///
/// `set_names` and `set_zs` are called once, right after registration; the
/// label and position vectors never change for the aggregator's lifetime.
/// All methods are invoked from the aggregator worker with no internal locks
/// held. A returned error is logged and the receiver stays registered.
pub trait OrbitReceiver: Send + Sync {
    fn set_names(&self, names: &[String]) -> anyhow::Result<()>;

    fn set_zs(&self, zs: &[f64]) -> anyhow::Result<()>;

    fn set_completed_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<()>;
}
