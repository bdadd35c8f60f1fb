//! Primitive consensus coordinates.
use serde::{Deserialize, Serialize};
use std::fmt;
use zksync_concurrency::time;

/// Height of a block. Heights start at `PRE_GENESIS`, the synthetic block
/// preceding the genesis block.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Height(pub i64);

impl Height {
    /// Height of the synthetic block preceding genesis.
    pub const PRE_GENESIS: Self = Self(-1);
    /// Height of the genesis block.
    pub const GENESIS: Self = Self(0);

    /// Returns the next height.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the previous height.
    pub fn prev(self) -> Self {
        Self(self.0 - 1)
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Attempt number at a fixed height. Resets to 0 on every new height.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Round(pub u64);

impl Round {
    /// Returns the next round.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the previous round, if any.
    pub fn prev(self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stage of a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    /// Agreement on the previous block.
    Init,
    /// Acknowledgement of a processed proposal by the acting set.
    Sign,
    /// Agreement on the new block.
    Accept,
    /// Proposer's selection of operations.
    Proposal,
}

impl Stage {
    /// Whether ballots of this stage are tallied by the ballotbox.
    pub fn can_vote(self) -> bool {
        matches!(self, Self::Init | Self::Accept)
    }

    /// Name of the stage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Sign => "SIGN",
            Self::Accept => "ACCEPT",
            Self::Proposal => "PROPOSAL",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quorum fraction in percent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThresholdRatio(pub u64);

impl ThresholdRatio {
    /// Ratio used outside of bootstrap.
    pub const DEFAULT: Self = Self(67);
    /// Ratio used while bootstrapping a network.
    pub const BOOTSTRAP: Self = Self(100);

    /// Checks that the ratio is a valid percentage.
    pub fn verify(self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (1..=100).contains(&self.0),
            "threshold ratio {} out of range 1..=100",
            self.0
        );
        Ok(())
    }
}

/// Number of votes required for a voteproof in a suffrage of a given size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Threshold {
    /// Size of the suffrage.
    pub total: u64,
    /// Quorum fraction.
    pub ratio: ThresholdRatio,
}

impl Threshold {
    /// Constructs a new threshold.
    pub fn new(total: u64, ratio: ThresholdRatio) -> Self {
        Self { total, ratio }
    }

    /// `ceil(total * ratio / 100)`, at least 1.
    pub fn threshold(&self) -> u64 {
        (self.total * self.ratio.0).div_ceil(100).max(1)
    }

    /// Checks that the threshold is achievable.
    pub fn verify(&self) -> anyhow::Result<()> {
        self.ratio.verify()?;
        anyhow::ensure!(self.total > 0, "empty suffrage");
        Ok(())
    }
}

/// Wall-clock time in milliseconds since the unix epoch.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Converts a UTC time, truncating to milliseconds.
    pub fn from_utc(t: time::Utc) -> Self {
        Self((t - time::UNIX_EPOCH).whole_milliseconds() as i64)
    }

    /// Converts to a UTC time.
    pub fn to_utc(self) -> time::Utc {
        time::UNIX_EPOCH + time::Duration::milliseconds(self.0)
    }

    /// Whether `self` lies within `span` of `other`, in either direction.
    pub fn within(self, other: Self, span: time::Duration) -> bool {
        (self.to_utc() - other.to_utc()).abs() <= span
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_utc())
    }
}
