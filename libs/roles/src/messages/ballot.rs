//! Signed facts and ballots.
use super::{BallotFact, Fact, Hash, Height, ProposalFact, Round, Stage, Timestamp, Voteproof};
use crate::node::{Address, InvalidSignatureError, LocalNode, NetworkId, PublicKey, Signature};
use serde::{Deserialize, Serialize};

/// A ballot fact signed by a suffrage node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedFact {
    /// The fact.
    pub fact: BallotFact,
    /// Hash of `fact`.
    pub fact_hash: Hash,
    /// Address of the signer.
    pub signer: Address,
    /// Key of the signer.
    pub public_key: PublicKey,
    /// Signature over `fact_hash ‖ network_id`.
    pub signature: Signature,
    /// Time of signing.
    pub signed_at: Timestamp,
}

/// Error returned by `SignedFact::verify`.
#[derive(Debug, thiserror::Error)]
pub enum FactVerifyError {
    /// Hash does not match the fact.
    #[error("fact hash mismatch")]
    BadHash,
    /// Signature does not verify.
    #[error(transparent)]
    BadSignature(#[from] InvalidSignatureError),
}

impl SignedFact {
    /// Signs a fact as the local node.
    pub fn sign(
        local: &LocalNode,
        network_id: &NetworkId,
        fact: BallotFact,
        signed_at: Timestamp,
    ) -> Self {
        let fact_hash = fact.hash();
        Self {
            signature: local.key.sign(&fact_hash, network_id),
            fact,
            fact_hash,
            signer: local.address.clone(),
            public_key: local.key.public(),
            signed_at,
        }
    }

    /// Checks the fact hash and the signature.
    pub fn verify(&self, network_id: &NetworkId) -> Result<(), FactVerifyError> {
        if self.fact.hash() != self.fact_hash {
            return Err(FactVerifyError::BadHash);
        }
        self.public_key
            .verify(&self.fact_hash, network_id, &self.signature)?;
        Ok(())
    }
}

/// A vote of a node: a signed fact together with the voteproof justifying it.
///
/// The carried voteproof is stored by value. An INIT ballot carries the ACCEPT
/// voteproof of the previous height (round 0) or the voteproof of the previous
/// round; ACCEPT, SIGN and proposal ballots carry the INIT voteproof of their round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    /// Signed fact.
    pub signed_fact: SignedFact,
    /// Carried voteproof.
    pub voteproof: Option<Box<Voteproof>>,
    /// Hash of `(signed_fact, voteproof)`; the seal hash of the ballot.
    pub body_hash: Hash,
    /// Signature over `body_hash ‖ network_id` by the fact signer.
    pub signature: Signature,
}

#[derive(Serialize)]
struct BallotBody<'a> {
    signed_fact: &'a SignedFact,
    voteproof: Option<&'a Voteproof>,
}

fn body_hash(signed_fact: &SignedFact, voteproof: Option<&Voteproof>) -> Hash {
    Hash::of(&BallotBody {
        signed_fact,
        voteproof,
    })
}

/// Error returned by `Ballot::verify`.
#[derive(Debug, thiserror::Error)]
pub enum BallotVerifyError {
    /// Body hash does not match the content.
    #[error("ballot body hash mismatch")]
    BadHash,
    /// Body signature does not verify.
    #[error("ballot signature: {0}")]
    BadSignature(#[source] InvalidSignatureError),
    /// The signed fact is invalid.
    #[error("signed fact: {0}")]
    Fact(#[from] FactVerifyError),
    /// The carried voteproof is required but absent.
    #[error("missing voteproof")]
    MissingVoteproof,
    /// The carried voteproof is invalid.
    #[error("voteproof: {0}")]
    Voteproof(#[from] super::VoteproofVerifyError),
}

impl Ballot {
    /// Signs a new ballot as the local node.
    pub fn sign(
        local: &LocalNode,
        network_id: &NetworkId,
        fact: BallotFact,
        voteproof: Option<Voteproof>,
        signed_at: Timestamp,
    ) -> Self {
        let signed_fact = SignedFact::sign(local, network_id, fact, signed_at);
        let body_hash = body_hash(&signed_fact, voteproof.as_ref());
        Self {
            signature: local.key.sign(&body_hash, network_id),
            signed_fact,
            voteproof: voteproof.map(Box::new),
            body_hash,
        }
    }

    /// Seal hash of the ballot.
    pub fn hash(&self) -> Hash {
        self.body_hash
    }

    /// Fact of the ballot.
    pub fn fact(&self) -> &BallotFact {
        &self.signed_fact.fact
    }

    /// Height of the fact.
    pub fn height(&self) -> Height {
        self.fact().height()
    }

    /// Round of the fact.
    pub fn round(&self) -> Round {
        self.fact().round()
    }

    /// Stage of the fact.
    pub fn stage(&self) -> Stage {
        self.fact().stage()
    }

    /// Address of the signer.
    pub fn signer(&self) -> &Address {
        &self.signed_fact.signer
    }

    /// Time of signing.
    pub fn signed_at(&self) -> Timestamp {
        self.signed_fact.signed_at
    }

    /// Proposal fact, if this is a proposal.
    pub fn proposal(&self) -> Option<&ProposalFact> {
        self.fact().as_proposal()
    }

    /// Carried voteproof.
    pub fn voteproof(&self) -> Option<&Voteproof> {
        self.voteproof.as_deref()
    }

    /// Checks hashes and signatures of the ballot and of its carried voteproof.
    /// Whether the signer belongs to the suffrage is checked by the caller.
    pub fn verify(&self, network_id: &NetworkId) -> Result<(), BallotVerifyError> {
        if body_hash(&self.signed_fact, self.voteproof()) != self.body_hash {
            return Err(BallotVerifyError::BadHash);
        }
        self.signed_fact
            .public_key
            .verify(&self.body_hash, network_id, &self.signature)
            .map_err(BallotVerifyError::BadSignature)?;
        self.signed_fact.verify(network_id)?;
        // Every ballot but the first INIT of a network justifies itself with a voteproof.
        let Some(vp) = self.voteproof() else {
            if self.height() <= Height::GENESIS && self.stage() == Stage::Init {
                return Ok(());
            }
            return Err(BallotVerifyError::MissingVoteproof);
        };
        vp.verify(network_id)?;
        Ok(())
    }
}
