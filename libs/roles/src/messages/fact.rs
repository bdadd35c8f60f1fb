//! Ballot facts: the immutable content nodes vote on.
use super::{Hash, Height, Round, Stage};
use crate::node::Address;
use serde::{Deserialize, Serialize};

/// Common accessors of ballot facts.
pub trait Fact {
    /// Height the fact is about.
    fn height(&self) -> Height;
    /// Round the fact is about.
    fn round(&self) -> Round;
    /// Stage of the fact.
    fn stage(&self) -> Stage;
    /// Content hash of the fact.
    fn hash(&self) -> Hash;
}

/// INIT fact: agreement on the block a new round builds on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitFact {
    /// Height of the new block.
    pub height: Height,
    /// Round.
    pub round: Round,
    /// Hash of the block at `height - 1`.
    pub previous_block: Hash,
}

/// ACCEPT fact: agreement on the block produced from a proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptFact {
    /// Height of the new block.
    pub height: Height,
    /// Round.
    pub round: Round,
    /// Hash of the processed proposal.
    pub proposal: Hash,
    /// Hash of the resulting block.
    pub new_block: Hash,
}

/// SIGN fact: acknowledgement of a processed proposal by an acting node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignFact {
    /// Height of the new block.
    pub height: Height,
    /// Round.
    pub round: Round,
    /// Hash of the processed proposal.
    pub proposal: Hash,
    /// Hash of the resulting block.
    pub new_block: Hash,
}

/// Reference from a proposal to an operation and the seal carrying it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInfo {
    /// Hash of the operation.
    pub operation: Hash,
    /// Hash of the operation seal containing it.
    pub seal: Hash,
}

/// Proposal fact: the proposer's selection of operations for a round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalFact {
    /// Height of the new block.
    pub height: Height,
    /// Round.
    pub round: Round,
    /// Proposer of this round.
    pub proposer: Address,
    /// Operations in block order.
    pub operations: Vec<OperationInfo>,
}

impl ProposalFact {
    /// Hashes of the operation seals referenced by the proposal, in first-use order.
    pub fn seals(&self) -> Vec<Hash> {
        let mut seen = std::collections::BTreeSet::new();
        self.operations
            .iter()
            .filter(|o| seen.insert(o.seal))
            .map(|o| o.seal)
            .collect()
    }
}

/// Closed set of fact kinds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "UPPERCASE")]
pub enum BallotFact {
    /// INIT.
    Init(InitFact),
    /// SIGN.
    Sign(SignFact),
    /// ACCEPT.
    Accept(AcceptFact),
    /// PROPOSAL.
    Proposal(ProposalFact),
}

impl Fact for BallotFact {
    fn height(&self) -> Height {
        match self {
            Self::Init(f) => f.height,
            Self::Sign(f) => f.height,
            Self::Accept(f) => f.height,
            Self::Proposal(f) => f.height,
        }
    }

    fn round(&self) -> Round {
        match self {
            Self::Init(f) => f.round,
            Self::Sign(f) => f.round,
            Self::Accept(f) => f.round,
            Self::Proposal(f) => f.round,
        }
    }

    fn stage(&self) -> Stage {
        match self {
            Self::Init(_) => Stage::Init,
            Self::Sign(_) => Stage::Sign,
            Self::Accept(_) => Stage::Accept,
            Self::Proposal(_) => Stage::Proposal,
        }
    }

    fn hash(&self) -> Hash {
        Hash::of(self)
    }
}

impl BallotFact {
    /// INIT fact, if it is one.
    pub fn as_init(&self) -> Option<&InitFact> {
        match self {
            Self::Init(f) => Some(f),
            _ => None,
        }
    }

    /// ACCEPT fact, if it is one.
    pub fn as_accept(&self) -> Option<&AcceptFact> {
        match self {
            Self::Accept(f) => Some(f),
            _ => None,
        }
    }

    /// Proposal fact, if it is one.
    pub fn as_proposal(&self) -> Option<&ProposalFact> {
        match self {
            Self::Proposal(f) => Some(f),
            _ => None,
        }
    }
}

macro_rules! impl_fact {
    ($t:ident, $stage:ident) => {
        impl Fact for $t {
            fn height(&self) -> Height {
                self.height
            }
            fn round(&self) -> Round {
                self.round
            }
            fn stage(&self) -> Stage {
                Stage::$stage
            }
            fn hash(&self) -> Hash {
                BallotFact::from(self.clone()).hash()
            }
        }

        impl From<$t> for BallotFact {
            fn from(f: $t) -> Self {
                Self::$stage(f)
            }
        }
    };
}

impl_fact!(InitFact, Init);
impl_fact!(SignFact, Sign);
impl_fact!(AcceptFact, Accept);
impl_fact!(ProposalFact, Proposal);
