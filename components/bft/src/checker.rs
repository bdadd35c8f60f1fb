//! Admission rules for ballots received from other nodes.
use crate::LocalContext;
use isaac_roles::messages::{Ballot, BallotFact, Height, Round, Stage, Timestamp, Voteproof};

/// Reason a ballot is rejected.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    /// Signer is not a suffrage member.
    #[error("signer {0} is not in the suffrage")]
    NotInSuffrage(String),
    /// Ballot was signed with a key other than the signer's registered key.
    #[error("signer {0} did not use its registered key")]
    KeyMismatch(String),
    /// Ballot was signed too far from the local clock.
    #[error("signed at {signed_at}, local time {now}")]
    Expired {
        /// Signing time of the ballot.
        signed_at: Timestamp,
        /// Local time.
        now: Timestamp,
    },
    /// Proposal does not come from the proposer of its round.
    #[error("{signer} is not the proposer of height {height} round {round}")]
    NotProposer {
        /// Signer of the proposal.
        signer: String,
        /// Height.
        height: Height,
        /// Round.
        round: Round,
    },
    /// Carried voteproof does not justify the ballot.
    #[error("bad voteproof: {0}")]
    BadVoteproof(String),
}

fn bad(msg: impl Into<String>) -> CheckError {
    CheckError::BadVoteproof(msg.into())
}

/// Checks a remote ballot against the suffrage, the local clock and the
/// voteproof it carries. Signatures are checked by `Ballot::verify`.
pub(crate) fn check_ballot(
    local: &LocalContext,
    ballot: &Ballot,
    now: Timestamp,
) -> Result<(), CheckError> {
    let signer = ballot.signer();
    if !local.suffrage.is_inside(signer) {
        return Err(CheckError::NotInSuffrage(signer.to_string()));
    }
    if local.pool.public_key(signer).as_ref() != Some(&ballot.signed_fact.public_key) {
        return Err(CheckError::KeyMismatch(signer.to_string()));
    }
    let span = local.policy.snapshot().timespan_valid_ballot;
    if !ballot.signed_at().within(now, span) {
        return Err(CheckError::Expired {
            signed_at: ballot.signed_at(),
            now,
        });
    }
    let (height, round) = (ballot.height(), ballot.round());
    if let Some(fact) = ballot.proposal() {
        if &fact.proposer != signer || !local.suffrage.is_proposer(height, round, signer) {
            return Err(CheckError::NotProposer {
                signer: signer.to_string(),
                height,
                round,
            });
        }
    }

    let Some(vp) = ballot.voteproof() else {
        // `Ballot::verify` admits this only for the first INIT of the network.
        return Ok(());
    };
    check_voteproof(local, vp)?;
    match ballot.fact() {
        BallotFact::Init(fact) => match round.prev() {
            None => {
                if vp.stage != Stage::Accept || vp.height != height.prev() {
                    return Err(bad(format!(
                        "INIT of round 0 carries {} voteproof of height {}",
                        vp.stage, vp.height
                    )));
                }
                match vp.majority_accept() {
                    Some(accept) if accept.new_block == fact.previous_block => Ok(()),
                    Some(_) => Err(bad("previous block differs from the accepted block")),
                    None => Err(bad("ACCEPT voteproof without a majority")),
                }
            }
            Some(prev) => {
                if !matches!(vp.stage, Stage::Init | Stage::Accept)
                    || vp.height != height
                    || vp.round != prev
                {
                    return Err(bad(format!(
                        "INIT of round {round} carries {} voteproof of height {} round {}",
                        vp.stage, vp.height, vp.round
                    )));
                }
                Ok(())
            }
        },
        _ => {
            if vp.stage != Stage::Init || vp.height != height || vp.round != round {
                return Err(bad(format!(
                    "{} carries {} voteproof of height {} round {}",
                    ballot.stage(),
                    vp.stage,
                    vp.height,
                    vp.round
                )));
            }
            if vp.majority_init().is_none() {
                return Err(bad("INIT voteproof without a majority"));
            }
            Ok(())
        }
    }
}

/// Checks that `vp` was produced by the local suffrage: every voter is a
/// member that signed with its registered key, and the outcome holds under
/// the local threshold. Voteproofs of the genesis blocks are signed by the
/// genesis node alone, so only their keys are checked.
pub(crate) fn check_voteproof(local: &LocalContext, vp: &Voteproof) -> Result<(), CheckError> {
    if let Some(a) = vp.voters().iter().find(|a| !local.suffrage.is_inside(a)) {
        return Err(bad(format!("voter {a} is not in the suffrage")));
    }
    vp.verify_signers(&local.pool.keyring())
        .map_err(|err| bad(err.to_string()))?;
    if vp.height <= Height::GENESIS {
        return Ok(());
    }
    vp.verify_threshold(&local.threshold())
        .map_err(|err| bad(err.to_string()))
}
