//! Metrics of the syncers.
use vise::{Counter, Gauge, Metrics};

#[derive(Debug, Metrics)]
#[metrics(prefix = "isaac_sync")]
pub(crate) struct SyncMetrics {
    /// Blocks committed by syncers.
    pub(crate) blocks_saved: Counter,
    /// Highest height requested from the syncers.
    pub(crate) target_height: Gauge<i64>,
    /// Local blocks removed by rollback.
    pub(crate) rolled_back: Counter,
    /// Syncers that failed.
    pub(crate) failed: Counter,
}

#[vise::register]
pub(crate) static METRICS: vise::Global<SyncMetrics> = vise::Global::new();
