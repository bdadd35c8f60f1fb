//! Manifests, blocks and block-data maps.
use super::{Ballot, Hash, Height, Operation, Round, State, Timestamp, Voteproof};
use crate::{
    node::Address,
    tree::{FixedTree, TreeError},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Header of a block: everything the block hash commits to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Height.
    pub height: Height,
    /// Round in which the block was agreed.
    pub round: Round,
    /// Hash of the proposal the block was produced from.
    pub proposal: Hash,
    /// Hash of the block at `height - 1`.
    pub previous_block: Hash,
    /// Root of the operations tree.
    pub operations_root: Option<Hash>,
    /// Root of the states tree.
    pub states_root: Option<Hash>,
    /// Signing time of the proposal.
    pub created_at: Timestamp,
    /// Block hash.
    pub hash: Hash,
}

#[derive(Serialize)]
struct ManifestBody<'a> {
    height: Height,
    round: Round,
    proposal: &'a Hash,
    previous_block: &'a Hash,
    operations_root: &'a Option<Hash>,
    states_root: &'a Option<Hash>,
    created_at: Timestamp,
}

impl Manifest {
    /// Constructs a manifest and computes its hash.
    pub fn new(
        height: Height,
        round: Round,
        proposal: Hash,
        previous_block: Hash,
        operations_root: Option<Hash>,
        states_root: Option<Hash>,
        created_at: Timestamp,
    ) -> Self {
        let mut m = Self {
            height,
            round,
            proposal,
            previous_block,
            operations_root,
            states_root,
            created_at,
            hash: Hash::default(),
        };
        m.hash = m.compute_hash();
        m
    }

    fn compute_hash(&self) -> Hash {
        Hash::of(&ManifestBody {
            height: self.height,
            round: self.round,
            proposal: &self.proposal,
            previous_block: &self.previous_block,
            operations_root: &self.operations_root,
            states_root: &self.states_root,
            created_at: self.created_at,
        })
    }

    /// Checks the block hash.
    pub fn verify(&self) -> Result<(), BlockVerifyError> {
        if self.compute_hash() != self.hash {
            return Err(BlockVerifyError::BadHash);
        }
        Ok(())
    }
}

/// Proposer and acting set a block was produced under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuffrageInfo {
    /// Proposer of the round.
    pub proposer: Address,
    /// Acting set of the round.
    pub nodes: Vec<Address>,
}

/// A block: a manifest with everything needed to validate it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Header.
    pub manifest: Manifest,
    /// INIT voteproof of the round the block was produced in.
    pub init_voteproof: Voteproof,
    /// ACCEPT voteproof finalizing the block; absent on a candidate block.
    pub accept_voteproof: Option<Voteproof>,
    /// Operations in proposal order.
    pub operations: Vec<Operation>,
    /// Tree over `operations`.
    pub operations_tree: FixedTree,
    /// States written by the block, in key order.
    pub states: Vec<State>,
    /// Tree over `states`.
    pub states_tree: FixedTree,
    /// Proposal ballot.
    pub proposal: Ballot,
    /// Suffrage of the round.
    pub suffrage_info: SuffrageInfo,
}

/// Error returned by block validation.
#[derive(Debug, thiserror::Error)]
pub enum BlockVerifyError {
    /// Manifest hash does not match.
    #[error("block hash mismatch")]
    BadHash,
    /// A tree is inconsistent with the block content.
    #[error("{name}: {err}")]
    Tree {
        /// Which tree.
        name: &'static str,
        /// Failure.
        #[source]
        err: TreeError,
    },
    /// A field disagrees with another part of the block.
    #[error("inconsistent block: {0}")]
    Inconsistent(String),
}

impl Block {
    /// Block hash.
    pub fn hash(&self) -> Hash {
        self.manifest.hash
    }

    /// Height.
    pub fn height(&self) -> Height {
        self.manifest.height
    }

    /// Round.
    pub fn round(&self) -> Round {
        self.manifest.round
    }

    /// Checks that the block is self-consistent: manifest hash, trees over the
    /// content, voteproof coordinates and the ACCEPT majority pointing at the block.
    /// Signatures inside voteproofs are checked separately.
    pub fn verify(&self) -> Result<(), BlockVerifyError> {
        use BlockVerifyError as E;
        let m = &self.manifest;
        m.verify()?;
        self.operations_tree
            .verify_keys(self.operations.iter().map(|o| o.hash))
            .map_err(|err| E::Tree {
                name: "operations_tree",
                err,
            })?;
        self.states_tree
            .verify_keys(self.states.iter().map(|s| s.hash))
            .map_err(|err| E::Tree {
                name: "states_tree",
                err,
            })?;
        if self.operations_tree.root() != m.operations_root {
            return Err(E::Inconsistent("operations root".into()));
        }
        if self.states_tree.root() != m.states_root {
            return Err(E::Inconsistent("states root".into()));
        }
        for s in &self.states {
            s.verify()
                .map_err(|err| E::Inconsistent(format!("{err:#}")))?;
            if s.height != m.height {
                return Err(E::Inconsistent(format!("state {:?} height", s.key)));
            }
        }
        if self.proposal.hash() != m.proposal {
            return Err(E::Inconsistent("proposal hash".into()));
        }
        let ivp = &self.init_voteproof;
        if ivp.height != m.height || ivp.round != m.round {
            return Err(E::Inconsistent("init voteproof coordinates".into()));
        }
        let Some(init) = ivp.majority_init() else {
            return Err(E::Inconsistent("init voteproof has no INIT majority".into()));
        };
        if init.previous_block != m.previous_block {
            return Err(E::Inconsistent("init voteproof previous block".into()));
        }
        if let Some(avp) = &self.accept_voteproof {
            if avp.height != m.height || avp.round != m.round {
                return Err(E::Inconsistent("accept voteproof coordinates".into()));
            }
            let Some(accept) = avp.majority_accept() else {
                return Err(E::Inconsistent("accept voteproof has no ACCEPT majority".into()));
            };
            if accept.new_block != m.hash || accept.proposal != m.proposal {
                return Err(E::Inconsistent("accept voteproof new block".into()));
            }
        }
        Ok(())
    }
}

/// Dataset of a block stored in the block-data store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    /// Manifest.
    Manifest,
    /// Operations.
    Operations,
    /// Operations tree.
    OperationsTree,
    /// States.
    States,
    /// States tree.
    StatesTree,
    /// INIT voteproof.
    InitVoteproof,
    /// ACCEPT voteproof.
    AcceptVoteproof,
    /// Suffrage info.
    SuffrageInfo,
    /// Proposal.
    Proposal,
}

impl Dataset {
    /// All datasets.
    pub const ALL: [Dataset; 9] = [
        Self::Manifest,
        Self::Operations,
        Self::OperationsTree,
        Self::States,
        Self::StatesTree,
        Self::InitVoteproof,
        Self::AcceptVoteproof,
        Self::SuffrageInfo,
        Self::Proposal,
    ];

    /// File-friendly name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manifest => "manifest",
            Self::Operations => "operations",
            Self::OperationsTree => "operations_tree",
            Self::States => "states",
            Self::StatesTree => "states_tree",
            Self::InitVoteproof => "init_voteproof",
            Self::AcceptVoteproof => "accept_voteproof",
            Self::SuffrageInfo => "suffrage_info",
            Self::Proposal => "proposal",
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of a stored dataset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDataItem {
    /// Where the dataset can be read from.
    pub url: String,
    /// Hex Keccak256 of the stored bytes.
    pub checksum: String,
}

/// Map from dataset to its stored location, for a single block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDataMap {
    /// Height of the block.
    pub height: Height,
    /// Hash of the block.
    pub block: Hash,
    /// Stored datasets.
    pub items: BTreeMap<Dataset, BlockDataItem>,
}

impl BlockDataMap {
    /// Checks that every dataset is present.
    pub fn verify(&self) -> anyhow::Result<()> {
        for d in Dataset::ALL {
            anyhow::ensure!(self.items.contains_key(&d), "missing dataset {d}");
        }
        Ok(())
    }
}
