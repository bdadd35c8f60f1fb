//! Metrics of the storage.
use std::time::Duration;
use vise::{Buckets, Counter, Histogram, Metrics, Unit};

#[derive(Debug, Metrics)]
#[metrics(prefix = "isaac_storage")]
pub(crate) struct StorageMetrics {
    /// Compressed bytes written into the block-data store.
    #[metrics(unit = Unit::Bytes)]
    pub(crate) block_data_bytes: Counter,
    /// Number of saved block-data sessions.
    pub(crate) block_data_saved: Counter,
    /// Latency of committing a block into both stores.
    #[metrics(buckets = Buckets::LATENCIES, unit = Unit::Seconds)]
    pub(crate) commit_latency: Histogram<Duration>,
}

#[vise::register]
pub(crate) static METRICS: vise::Global<StorageMetrics> = vise::Global::new();
