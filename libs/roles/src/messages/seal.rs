use super::{Ballot, BallotVerifyError, Hash, OperationSeal, OperationVerifyError};
use crate::node::NetworkId;
use serde::{Deserialize, Serialize};

/// Any signed envelope a node can receive: a ballot (including proposals)
/// or an operation seal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Seal {
    /// Ballot or proposal.
    Ballot(Ballot),
    /// Operation seal.
    Operations(OperationSeal),
}

/// Error returned by `Seal::verify`.
#[derive(Debug, thiserror::Error)]
pub enum SealVerifyError {
    /// Invalid ballot.
    #[error("ballot: {0}")]
    Ballot(#[from] BallotVerifyError),
    /// Invalid operation seal.
    #[error("operation seal: {0}")]
    Operations(#[from] OperationVerifyError),
}

impl Seal {
    /// Seal hash.
    pub fn hash(&self) -> Hash {
        match self {
            Self::Ballot(b) => b.hash(),
            Self::Operations(s) => s.hash(),
        }
    }

    /// Checks hashes and signatures.
    pub fn verify(&self, network_id: &NetworkId) -> Result<(), SealVerifyError> {
        match self {
            Self::Ballot(b) => b.verify(network_id)?,
            Self::Operations(s) => s.verify(network_id)?,
        }
        Ok(())
    }

    /// Ballot, if it is one.
    pub fn as_ballot(&self) -> Option<&Ballot> {
        match self {
            Self::Ballot(b) => Some(b),
            Self::Operations(_) => None,
        }
    }

    /// Operation seal, if it is one.
    pub fn as_operations(&self) -> Option<&OperationSeal> {
        match self {
            Self::Operations(s) => Some(s),
            Self::Ballot(_) => None,
        }
    }
}

impl From<Ballot> for Seal {
    fn from(b: Ballot) -> Self {
        Self::Ballot(b)
    }
}

impl From<OperationSeal> for Seal {
    fn from(s: OperationSeal) -> Self {
        Self::Operations(s)
    }
}
