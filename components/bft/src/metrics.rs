//! Metrics for the consensus state machine.

use isaac_roles::messages::{Stage, VoteResult};
use std::time::Duration;
use vise::{
    Buckets, Counter, EncodeLabelSet, EncodeLabelValue, Family, Gauge, Histogram, Metrics, Unit,
};

/// Label for a consensus state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
#[metrics(rename_all = "snake_case")]
pub(crate) enum StateLabel {
    Booting,
    Joining,
    Consensus,
    Syncing,
    Broken,
}

/// Label for an inbound seal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
#[metrics(rename_all = "snake_case")]
pub(crate) enum SealLabel {
    /// INIT ballot.
    Init,
    /// SIGN ballot.
    Sign,
    /// ACCEPT ballot.
    Accept,
    /// Proposal ballot.
    Proposal,
    /// Operation seal.
    Operations,
}

impl SealLabel {
    /// Attaches a result to this label.
    pub(crate) fn with_result<T, E>(self, result: &Result<T, E>) -> ProcessingLatencyLabels {
        ProcessingLatencyLabels {
            r#type: self,
            result: ResultLabel::of(result),
        }
    }
}

impl From<Stage> for SealLabel {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Init => Self::Init,
            Stage::Sign => Self::Sign,
            Stage::Accept => Self::Accept,
            Stage::Proposal => Self::Proposal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
#[metrics(rename_all = "snake_case")]
pub(crate) enum ResultLabel {
    Ok,
    Err,
}

impl ResultLabel {
    pub(crate) fn of<T, E>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(_) => Self::Err,
        }
    }
}

/// Labels for processing latency metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelSet)]
pub(crate) struct ProcessingLatencyLabels {
    r#type: SealLabel,
    result: ResultLabel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
#[metrics(rename_all = "snake_case")]
pub(crate) enum StageLabel {
    Init,
    Accept,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
#[metrics(rename_all = "snake_case")]
pub(crate) enum VoteResultLabel {
    Majority,
    Draw,
}

/// Labels of a finalized voteproof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelSet)]
pub(crate) struct VoteproofLabels {
    stage: StageLabel,
    result: VoteResultLabel,
}

impl VoteproofLabels {
    /// Labels of a finalized voteproof, if it is one.
    pub(crate) fn new(stage: Stage, result: VoteResult) -> Option<Self> {
        Some(Self {
            stage: match stage {
                Stage::Init => StageLabel::Init,
                Stage::Accept => StageLabel::Accept,
                _ => return None,
            },
            result: match result {
                VoteResult::Majority => VoteResultLabel::Majority,
                VoteResult::Draw => VoteResultLabel::Draw,
                VoteResult::NotYet => return None,
            },
        })
    }
}

/// Metrics defined by the consensus state machine.
#[derive(Debug, Metrics)]
#[metrics(prefix = "isaac_consensus")]
pub(crate) struct ConsensusMetrics {
    /// Number of activations of each state.
    pub(crate) state_changes: Family<StateLabel, Counter>,
    /// Height the node is working on.
    pub(crate) height: Gauge<i64>,
    /// Round the node is working on.
    pub(crate) round: Gauge<u64>,
    /// Height of the last block committed by the node.
    pub(crate) last_block_height: Gauge<i64>,
    /// Voteproofs finalized by the local ballotbox.
    pub(crate) voteproofs: Family<VoteproofLabels, Counter>,
    /// Latency of preparing a proposal.
    #[metrics(buckets = Buckets::exponential(0.001..=8.0, 2.0), unit = Unit::Seconds)]
    pub(crate) prepare_latency: Family<ResultLabel, Histogram<Duration>>,
    /// Latency of processing inbound seals.
    #[metrics(buckets = Buckets::LATENCIES, unit = Unit::Seconds)]
    pub(crate) seal_processing_latency: Family<ProcessingLatencyLabels, Histogram<Duration>>,
    /// Operations included in committed blocks.
    pub(crate) operations_committed: Counter,
}

/// Global instance of [`ConsensusMetrics`].
#[vise::register]
pub(crate) static METRICS: vise::Global<ConsensusMetrics> = vise::Global::new();
