//! Voteproofs: proofs that a threshold of the suffrage voted for one fact.
use super::{
    AcceptFact, BallotFact, Fact as _, FactVerifyError, Hash, Height, InitFact, Round,
    SignedFact, Stage, Threshold, Timestamp,
};
use crate::node::{Address, Keyring, NetworkId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of a vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteResult {
    /// Not enough votes yet.
    NotYet,
    /// No fact can reach the threshold anymore.
    Draw,
    /// A fact reached the threshold.
    Majority,
}

/// Votes collected for a single (height, round, stage) slot.
///
/// `finalized_at` is set iff `result != NotYet`; once set the voteproof
/// never changes. `closed` is local bookkeeping of the ballotbox and is
/// not part of the serialized form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voteproof {
    /// Height of the slot.
    pub height: Height,
    /// Round of the slot.
    pub round: Round,
    /// Stage of the slot.
    pub stage: Stage,
    /// Threshold the votes are counted against.
    pub threshold: Threshold,
    /// Outcome.
    pub result: VoteResult,
    /// Winning fact; `None` unless `result == Majority`.
    pub majority: Option<BallotFact>,
    /// Contending facts by hash.
    pub facts: BTreeMap<Hash, BallotFact>,
    /// Votes by signer.
    pub votes: BTreeMap<Address, SignedFact>,
    /// When the outcome was reached.
    pub finalized_at: Option<Timestamp>,
    /// Whether the voteproof has already been handed to a consumer.
    #[serde(skip)]
    pub closed: bool,
}

/// Error returned by `Voteproof::verify`.
#[derive(Debug, thiserror::Error)]
pub enum VoteproofVerifyError {
    /// Voteproof has no outcome.
    #[error("voteproof is not finalized")]
    NotFinalized,
    /// Stage is not a voting stage.
    #[error("stage {0} does not vote")]
    BadStage(Stage),
    /// Threshold is malformed.
    #[error("threshold: {0:#}")]
    BadThreshold(anyhow::Error),
    /// A vote does not verify.
    #[error("vote of {signer}: {err}")]
    BadVote {
        /// Signer of the vote.
        signer: Address,
        /// Failure.
        #[source]
        err: FactVerifyError,
    },
    /// A vote is about another slot, or a listed fact is inconsistent.
    #[error("vote of {0} does not belong to the voteproof")]
    ForeignVote(Address),
    /// Signer address disagrees with the vote.
    #[error("vote keyed by {0} was signed by another node")]
    SignerMismatch(Address),
    /// More votes than suffrage members.
    #[error("{votes} votes for a suffrage of {total}")]
    TooManyVotes {
        /// Number of votes.
        votes: usize,
        /// Suffrage size.
        total: u64,
    },
    /// Result disagrees with the votes.
    #[error("result {got:?}, votes yield {want:?}")]
    ResultMismatch {
        /// Result implied by the votes.
        want: VoteResult,
        /// Result claimed by the voteproof.
        got: VoteResult,
    },
    /// Majority fact disagrees with the votes.
    #[error("majority fact does not match the votes")]
    MajorityMismatch,
    /// Signer has no registered key.
    #[error("vote of unknown node {0}")]
    UnknownSigner(Address),
    /// Vote was signed with a key other than the signer's registered key.
    #[error("vote of {0} is not signed with its registered key")]
    KeyMismatch(Address),
    /// Threshold disagrees with the locally configured one.
    #[error("threshold {got:?} does not match the local threshold {want:?}")]
    ThresholdMismatch {
        /// Local threshold.
        want: Threshold,
        /// Threshold claimed by the voteproof.
        got: Threshold,
    },
}

impl Voteproof {
    /// Empty voteproof for a slot.
    pub fn new(height: Height, round: Round, stage: Stage, threshold: Threshold) -> Self {
        Self {
            height,
            round,
            stage,
            threshold,
            result: VoteResult::NotYet,
            majority: None,
            facts: BTreeMap::new(),
            votes: BTreeMap::new(),
            finalized_at: None,
            closed: false,
        }
    }

    /// Builds a finalized voteproof from a set of votes. Used by tests and
    /// by the genesis generator, where all votes are known upfront.
    pub fn from_votes(
        height: Height,
        round: Round,
        stage: Stage,
        threshold: Threshold,
        votes: impl IntoIterator<Item = SignedFact>,
        finalized_at: Timestamp,
    ) -> Self {
        let mut vp = Self::new(height, round, stage, threshold);
        for v in votes {
            vp.add(v);
        }
        vp.finalize(finalized_at);
        vp
    }

    /// Records a vote. Returns false if the signer has already voted.
    /// The caller is responsible for checking that the vote belongs to the slot.
    pub fn add(&mut self, vote: SignedFact) -> bool {
        if self.votes.contains_key(&vote.signer) {
            return false;
        }
        self.facts
            .entry(vote.fact_hash)
            .or_insert_with(|| vote.fact.clone());
        self.votes.insert(vote.signer.clone(), vote);
        true
    }

    /// Counts the votes. Returns the outcome and, for a majority, the winning fact hash.
    pub fn tally(&self) -> (VoteResult, Option<Hash>) {
        self.tally_with(&self.threshold)
    }

    /// Counts the votes against `threshold` instead of the carried one.
    pub fn tally_with(&self, threshold: &Threshold) -> (VoteResult, Option<Hash>) {
        let total = threshold.total;
        let threshold = threshold.threshold();
        let mut counts = BTreeMap::<Hash, u64>::new();
        for v in self.votes.values() {
            *counts.entry(v.fact_hash).or_default() += 1;
        }
        // Highest count wins; ties (only possible with ratio <= 50) go to the smaller hash.
        let best = counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(h, c)| (*h, *c));
        let Some((hash, max)) = best else {
            return (VoteResult::NotYet, None);
        };
        if max >= threshold {
            return (VoteResult::Majority, Some(hash));
        }
        let remaining = total.saturating_sub(self.votes.len() as u64);
        if max + remaining < threshold {
            return (VoteResult::Draw, None);
        }
        (VoteResult::NotYet, None)
    }

    /// Fixes the outcome if the votes yield one. Returns true iff this call finalized the voteproof.
    pub fn finalize(&mut self, now: Timestamp) -> bool {
        if self.is_finished() {
            return false;
        }
        let (result, hash) = self.tally();
        if result == VoteResult::NotYet {
            return false;
        }
        self.result = result;
        self.majority = hash.and_then(|h| self.facts.get(&h).cloned());
        self.finalized_at = Some(now);
        true
    }

    /// Whether the voteproof has an outcome.
    pub fn is_finished(&self) -> bool {
        self.result != VoteResult::NotYet
    }

    /// Winning INIT fact.
    pub fn majority_init(&self) -> Option<&InitFact> {
        self.majority.as_ref()?.as_init()
    }

    /// Winning ACCEPT fact.
    pub fn majority_accept(&self) -> Option<&AcceptFact> {
        self.majority.as_ref()?.as_accept()
    }

    /// Addresses of the nodes which voted.
    pub fn voters(&self) -> Vec<Address> {
        self.votes.keys().cloned().collect()
    }

    /// Addresses of the nodes which voted for the majority fact.
    pub fn majority_voters(&self) -> Vec<Address> {
        let Some(m) = &self.majority else {
            return vec![];
        };
        let h = m.hash();
        self.votes
            .iter()
            .filter(|(_, v)| v.fact_hash == h)
            .map(|(a, _)| a.clone())
            .collect()
    }

    /// Content hash of the voteproof.
    pub fn hash(&self) -> Hash {
        Hash::of(self)
    }

    /// Checks internal consistency: signatures of all votes, membership of
    /// every vote in the slot and the outcome against the vote counts.
    /// Membership of the signers in the suffrage is checked by the caller.
    pub fn verify(&self, network_id: &NetworkId) -> Result<(), VoteproofVerifyError> {
        use VoteproofVerifyError as E;
        if !self.stage.can_vote() {
            return Err(E::BadStage(self.stage));
        }
        if !self.is_finished() || self.finalized_at.is_none() {
            return Err(E::NotFinalized);
        }
        self.threshold.verify().map_err(E::BadThreshold)?;
        if self.votes.len() as u64 > self.threshold.total {
            return Err(E::TooManyVotes {
                votes: self.votes.len(),
                total: self.threshold.total,
            });
        }
        for (signer, v) in &self.votes {
            if signer != &v.signer {
                return Err(E::SignerMismatch(signer.clone()));
            }
            v.verify(network_id).map_err(|err| E::BadVote {
                signer: signer.clone(),
                err,
            })?;
            let f = &v.fact;
            if f.height() != self.height
                || f.round() != self.round
                || f.stage() != self.stage
                || self.facts.get(&v.fact_hash) != Some(f)
            {
                return Err(E::ForeignVote(signer.clone()));
            }
        }
        let (want, hash) = self.tally();
        if want != self.result {
            return Err(E::ResultMismatch {
                want,
                got: self.result,
            });
        }
        if self.majority.as_ref().map(|m| m.hash()) != hash {
            return Err(E::MajorityMismatch);
        }
        Ok(())
    }

    /// Checks that every vote was signed by a node of `keys` with its
    /// registered key.
    pub fn verify_signers(&self, keys: &Keyring) -> Result<(), VoteproofVerifyError> {
        use VoteproofVerifyError as E;
        for (signer, v) in &self.votes {
            let Some(key) = keys.get(signer) else {
                return Err(E::UnknownSigner(signer.clone()));
            };
            if key != &v.public_key {
                return Err(E::KeyMismatch(signer.clone()));
            }
        }
        Ok(())
    }

    /// Checks that the votes reach the same outcome under the local
    /// threshold `local`. The carried ratio may be stricter than the local
    /// one (a bootstrap voteproof), but the outcome must not depend on it.
    pub fn verify_threshold(&self, local: &Threshold) -> Result<(), VoteproofVerifyError> {
        use VoteproofVerifyError as E;
        if self.threshold.total != local.total || self.threshold.ratio.0 < local.ratio.0 {
            return Err(E::ThresholdMismatch {
                want: *local,
                got: self.threshold,
            });
        }
        let (want, hash) = self.tally_with(local);
        if want != self.result {
            return Err(E::ResultMismatch {
                want,
                got: self.result,
            });
        }
        if self.majority.as_ref().map(|m| m.hash()) != hash {
            return Err(E::MajorityMismatch);
        }
        Ok(())
    }
}
