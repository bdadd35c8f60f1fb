//! Metrics of the network layer.
use vise::{Counter, EncodeLabelSet, EncodeLabelValue, Family, Metrics};

/// Request served by a [`crate::Handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
#[metrics(rename_all = "snake_case")]
pub(crate) enum Method {
    SendSeal,
    Seals,
    Manifests,
    Blocks,
    BlockDataMaps,
    BlockData,
    NodeInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub(crate) struct MethodLabels {
    pub(crate) method: Method,
}

#[derive(Debug, Metrics)]
#[metrics(prefix = "isaac_network")]
pub(crate) struct NetworkMetrics {
    /// Requests served, by method.
    pub(crate) served: Family<MethodLabels, Counter>,
    /// Requests that failed to reach a peer.
    pub(crate) unreachable: Counter,
}

#[vise::register]
pub(crate) static METRICS: vise::Global<NetworkMetrics> = vise::Global::new();

impl Method {
    pub(crate) fn served(self) {
        METRICS.served[&MethodLabels { method: self }].inc();
    }
}
