//! Locally configured consensus parameters.
use crate::{
    messages::{State, StateValue, ThresholdRatio},
    node::NetworkId,
};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use zksync_concurrency::time;

#[cfg(test)]
mod tests;

/// Key of the state holding the network-wide policy overrides.
pub const POLICY_STATE_KEY: &str = "policy";

/// Value of every policy option at one point in time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    /// Domain separator mixed into every signature.
    pub network_id: NetworkId,
    /// Quorum fraction applied to the suffrage size.
    pub threshold_ratio: ThresholdRatio,
    /// Cap on operations per operation seal.
    pub max_operations_in_seal: u64,
    /// Cap on operations referenced by a proposal.
    pub max_operations_in_proposal: u64,
    /// Wait in Consensus before moving to the next round.
    #[serde(with = "crate::serde_ms")]
    pub timeout_waiting_proposal: time::Duration,
    /// Rebroadcast period of INIT ballots.
    #[serde(with = "crate::serde_ms")]
    pub interval_broadcasting_init_ballot: time::Duration,
    /// Rebroadcast period of proposals.
    #[serde(with = "crate::serde_ms")]
    pub interval_broadcasting_proposal: time::Duration,
    /// Wait before the first ACCEPT ballot after prepare.
    #[serde(with = "crate::serde_ms")]
    pub wait_broadcasting_accept_ballot: time::Duration,
    /// Rebroadcast period of ACCEPT ballots.
    #[serde(with = "crate::serde_ms")]
    pub interval_broadcasting_accept_ballot: time::Duration,
    /// Clock-skew tolerance on ballot signing times.
    #[serde(with = "crate::serde_ms")]
    pub timespan_valid_ballot: time::Duration,
    /// Hard cap on proposal processing.
    #[serde(with = "crate::serde_ms")]
    pub timeout_process_proposal: time::Duration,
    /// Per-request deadline on channel calls.
    #[serde(with = "crate::serde_ms")]
    pub network_connection_timeout: time::Duration,
    /// Size of the acting set.
    pub number_of_acting_suffrage_nodes: u64,
    /// Syncer manifest batch size.
    pub limit_manifests_per_worker: u64,
    /// Syncer block batch size.
    pub limit_blocks_per_once: u64,
    /// Maximum range of a single syncer.
    pub limit_blocks_per_syncer: u64,
}

impl PolicySnapshot {
    /// Default policy for a network.
    pub fn new(network_id: NetworkId) -> Self {
        Self {
            network_id,
            threshold_ratio: ThresholdRatio::DEFAULT,
            max_operations_in_seal: 100,
            max_operations_in_proposal: 100,
            timeout_waiting_proposal: time::Duration::seconds(5),
            interval_broadcasting_init_ballot: time::Duration::seconds(1),
            interval_broadcasting_proposal: time::Duration::seconds(1),
            wait_broadcasting_accept_ballot: time::Duration::seconds(2),
            interval_broadcasting_accept_ballot: time::Duration::seconds(1),
            timespan_valid_ballot: time::Duration::minutes(1),
            timeout_process_proposal: time::Duration::seconds(30),
            network_connection_timeout: time::Duration::seconds(3),
            number_of_acting_suffrage_nodes: 1,
            limit_manifests_per_worker: 10,
            limit_blocks_per_once: 10,
            limit_blocks_per_syncer: 100,
        }
    }

    /// Checks every option.
    pub fn verify(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.network_id.0.is_empty(), "empty network id");
        self.threshold_ratio.verify()?;
        for (name, d) in [
            ("timeout_waiting_proposal", self.timeout_waiting_proposal),
            (
                "interval_broadcasting_init_ballot",
                self.interval_broadcasting_init_ballot,
            ),
            (
                "interval_broadcasting_proposal",
                self.interval_broadcasting_proposal,
            ),
            (
                "wait_broadcasting_accept_ballot",
                self.wait_broadcasting_accept_ballot,
            ),
            (
                "interval_broadcasting_accept_ballot",
                self.interval_broadcasting_accept_ballot,
            ),
            ("timespan_valid_ballot", self.timespan_valid_ballot),
            ("timeout_process_proposal", self.timeout_process_proposal),
            ("network_connection_timeout", self.network_connection_timeout),
        ] {
            positive_duration(d).context(name)?;
        }
        for (name, n) in [
            ("max_operations_in_seal", self.max_operations_in_seal),
            ("max_operations_in_proposal", self.max_operations_in_proposal),
            (
                "number_of_acting_suffrage_nodes",
                self.number_of_acting_suffrage_nodes,
            ),
            ("limit_manifests_per_worker", self.limit_manifests_per_worker),
            ("limit_blocks_per_once", self.limit_blocks_per_once),
            ("limit_blocks_per_syncer", self.limit_blocks_per_syncer),
        ] {
            positive_count(n).context(name)?;
        }
        Ok(())
    }
}

fn positive_duration(d: time::Duration) -> anyhow::Result<()> {
    anyhow::ensure!(d.is_positive(), "duration must be positive, got {d}");
    Ok(())
}

fn positive_count(n: u64) -> anyhow::Result<()> {
    anyhow::ensure!(n > 0, "must be positive");
    Ok(())
}

/// Policy overrides; also the value of the `policy` state written by
/// `policy-update` operations. Absent fields keep their current value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyUpdate {
    /// See `PolicySnapshot::threshold_ratio`.
    pub threshold_ratio: Option<ThresholdRatio>,
    /// See `PolicySnapshot::max_operations_in_seal`.
    pub max_operations_in_seal: Option<u64>,
    /// See `PolicySnapshot::max_operations_in_proposal`.
    pub max_operations_in_proposal: Option<u64>,
    /// In milliseconds.
    pub timeout_waiting_proposal_ms: Option<i64>,
    /// In milliseconds.
    pub interval_broadcasting_init_ballot_ms: Option<i64>,
    /// In milliseconds.
    pub interval_broadcasting_proposal_ms: Option<i64>,
    /// In milliseconds.
    pub wait_broadcasting_accept_ballot_ms: Option<i64>,
    /// In milliseconds.
    pub interval_broadcasting_accept_ballot_ms: Option<i64>,
    /// In milliseconds.
    pub timespan_valid_ballot_ms: Option<i64>,
    /// In milliseconds.
    pub timeout_process_proposal_ms: Option<i64>,
    /// In milliseconds.
    pub network_connection_timeout_ms: Option<i64>,
    /// See `PolicySnapshot::number_of_acting_suffrage_nodes`.
    pub number_of_acting_suffrage_nodes: Option<u64>,
    /// See `PolicySnapshot::limit_manifests_per_worker`.
    pub limit_manifests_per_worker: Option<u64>,
    /// See `PolicySnapshot::limit_blocks_per_once`.
    pub limit_blocks_per_once: Option<u64>,
    /// See `PolicySnapshot::limit_blocks_per_syncer`.
    pub limit_blocks_per_syncer: Option<u64>,
}

impl PolicyUpdate {
    /// Overrides replacing every option but the network id with the one in `p`.
    pub fn from_snapshot(p: &PolicySnapshot) -> Self {
        let ms = |d: time::Duration| Some(d.whole_milliseconds() as i64);
        Self {
            threshold_ratio: Some(p.threshold_ratio),
            max_operations_in_seal: Some(p.max_operations_in_seal),
            max_operations_in_proposal: Some(p.max_operations_in_proposal),
            timeout_waiting_proposal_ms: ms(p.timeout_waiting_proposal),
            interval_broadcasting_init_ballot_ms: ms(p.interval_broadcasting_init_ballot),
            interval_broadcasting_proposal_ms: ms(p.interval_broadcasting_proposal),
            wait_broadcasting_accept_ballot_ms: ms(p.wait_broadcasting_accept_ballot),
            interval_broadcasting_accept_ballot_ms: ms(p.interval_broadcasting_accept_ballot),
            timespan_valid_ballot_ms: ms(p.timespan_valid_ballot),
            timeout_process_proposal_ms: ms(p.timeout_process_proposal),
            network_connection_timeout_ms: ms(p.network_connection_timeout),
            number_of_acting_suffrage_nodes: Some(p.number_of_acting_suffrage_nodes),
            limit_manifests_per_worker: Some(p.limit_manifests_per_worker),
            limit_blocks_per_once: Some(p.limit_blocks_per_once),
            limit_blocks_per_syncer: Some(p.limit_blocks_per_syncer),
        }
    }

    /// Applies the overrides to a snapshot.
    pub fn apply(&self, p: &mut PolicySnapshot) {
        let ms = time::Duration::milliseconds;
        let u = self;
        macro_rules! set {
            ($field:ident) => {
                if let Some(v) = u.$field {
                    p.$field = v;
                }
            };
            ($field:ident, $ms:ident) => {
                if let Some(v) = u.$ms {
                    p.$field = ms(v);
                }
            };
        }
        set!(threshold_ratio);
        set!(max_operations_in_seal);
        set!(max_operations_in_proposal);
        set!(timeout_waiting_proposal, timeout_waiting_proposal_ms);
        set!(
            interval_broadcasting_init_ballot,
            interval_broadcasting_init_ballot_ms
        );
        set!(
            interval_broadcasting_proposal,
            interval_broadcasting_proposal_ms
        );
        set!(
            wait_broadcasting_accept_ballot,
            wait_broadcasting_accept_ballot_ms
        );
        set!(
            interval_broadcasting_accept_ballot,
            interval_broadcasting_accept_ballot_ms
        );
        set!(timespan_valid_ballot, timespan_valid_ballot_ms);
        set!(timeout_process_proposal, timeout_process_proposal_ms);
        set!(network_connection_timeout, network_connection_timeout_ms);
        set!(number_of_acting_suffrage_nodes);
        set!(limit_manifests_per_worker);
        set!(limit_blocks_per_once);
        set!(limit_blocks_per_syncer);
    }
}

/// Live policy of the local node. Each option can be replaced independently;
/// readers take a consistent `PolicySnapshot`.
#[derive(Debug)]
pub struct LocalPolicy(RwLock<PolicySnapshot>);

macro_rules! setters {
    ($($setter:ident: $field:ident: $t:ty => $check:expr;)*) => {
        impl LocalPolicy {
            $(
                #[doc = concat!("Replaces `", stringify!($field), "`.")]
                pub fn $setter(&self, v: $t) -> anyhow::Result<()> {
                    let check: fn($t) -> anyhow::Result<()> = $check;
                    check(v).context(stringify!($field))?;
                    self.write().$field = v;
                    Ok(())
                }
            )*
        }
    };
}

setters! {
    set_threshold_ratio: threshold_ratio: ThresholdRatio => |v| v.verify();
    set_max_operations_in_seal: max_operations_in_seal: u64 => positive_count;
    set_max_operations_in_proposal: max_operations_in_proposal: u64 => positive_count;
    set_timeout_waiting_proposal: timeout_waiting_proposal: time::Duration => positive_duration;
    set_interval_broadcasting_init_ballot: interval_broadcasting_init_ballot: time::Duration => positive_duration;
    set_interval_broadcasting_proposal: interval_broadcasting_proposal: time::Duration => positive_duration;
    set_wait_broadcasting_accept_ballot: wait_broadcasting_accept_ballot: time::Duration => positive_duration;
    set_interval_broadcasting_accept_ballot: interval_broadcasting_accept_ballot: time::Duration => positive_duration;
    set_timespan_valid_ballot: timespan_valid_ballot: time::Duration => positive_duration;
    set_timeout_process_proposal: timeout_process_proposal: time::Duration => positive_duration;
    set_network_connection_timeout: network_connection_timeout: time::Duration => positive_duration;
    set_number_of_acting_suffrage_nodes: number_of_acting_suffrage_nodes: u64 => positive_count;
    set_limit_manifests_per_worker: limit_manifests_per_worker: u64 => positive_count;
    set_limit_blocks_per_once: limit_blocks_per_once: u64 => positive_count;
    set_limit_blocks_per_syncer: limit_blocks_per_syncer: u64 => positive_count;
}

impl LocalPolicy {
    /// Constructs a policy from a snapshot.
    pub fn new(snapshot: PolicySnapshot) -> anyhow::Result<Self> {
        snapshot.verify()?;
        Ok(Self(RwLock::new(snapshot)))
    }

    /// Current value of every option.
    pub fn snapshot(&self) -> PolicySnapshot {
        // A poisoned lock still guards a fully written snapshot: writers only assign fields.
        self.0
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PolicySnapshot> {
        self.0
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Network id.
    pub fn network_id(&self) -> NetworkId {
        self.snapshot().network_id
    }

    /// Applies validated overrides. Nothing changes if the result is invalid.
    pub fn update(&self, update: &PolicyUpdate) -> anyhow::Result<()> {
        let mut p = self.write();
        let mut next = p.clone();
        update.apply(&mut next);
        next.verify()?;
        *p = next;
        Ok(())
    }

    /// Reloads the network-wide overrides from the committed `policy` state.
    /// Returns whether anything changed.
    pub fn reload(&self, state: Option<&State>) -> anyhow::Result<bool> {
        let Some(state) = state else {
            return Ok(false);
        };
        let Some(StateValue::Hinted(v)) = &state.value else {
            anyhow::bail!("policy state has unexpected value {:?}", state.value);
        };
        let update: PolicyUpdate =
            serde_json::from_value(v.clone()).context("policy state")?;
        let before = self.snapshot();
        self.update(&update)?;
        Ok(before != self.snapshot())
    }
}
