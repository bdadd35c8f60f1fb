//! Aggregation of votes into voteproofs.
use isaac_roles::{
    messages::{Fact as _, Height, Round, SignedFact, Stage, Threshold, Timestamp, Voteproof},
    suffrage::Suffrage,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

/// Error returned by [`Ballotbox::vote`].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum VoteError {
    /// The signer already voted for a different fact in this slot.
    #[error("{signer} already voted for another fact at {height}/{round}/{stage}")]
    Duplicate {
        /// Signer of the vote.
        signer: String,
        /// Height of the slot.
        height: Height,
        /// Round of the slot.
        round: Round,
        /// Stage of the slot.
        stage: Stage,
    },
    /// The signer is not a suffrage member.
    #[error("{0} is not in the suffrage")]
    NotInSuffrage(String),
    /// Ballots of this stage are not tallied.
    #[error("stage {0} is not voted on")]
    NotVotingStage(Stage),
    /// The vote is for a height too far above the local tip.
    #[error("vote for height {height} is too far above the tip {tip}")]
    TooFarAhead {
        /// Height of the vote.
        height: Height,
        /// Local tip.
        tip: Height,
    },
}

/// Heights above the next one for which votes are still collected.
/// Anything further is evidence that the node is behind, not a vote to count.
pub const VOTE_WINDOW: i64 = 3;

type Slot = (Height, Round, Stage);

fn window_end(next: Height) -> Height {
    Height(next.0 + VOTE_WINDOW)
}

/// Collects the votes of every (height, round, stage) slot.
///
/// The first vote of a signer in a slot is the one counted. Once a slot is
/// finalized it no longer changes; the first caller to observe the finalized
/// voteproof gets it with `closed == false`, everyone after with `closed == true`.
#[derive(Debug)]
pub struct Ballotbox {
    suffrage: Arc<dyn Suffrage>,
    slots: Mutex<BTreeMap<Slot, Voteproof>>,
}

impl Ballotbox {
    /// Constructs an empty ballotbox.
    pub fn new(suffrage: Arc<dyn Suffrage>) -> Self {
        Self {
            suffrage,
            slots: Mutex::default(),
        }
    }

    /// Records a vote. `threshold` applies if the vote opens the slot.
    /// Returns the current state of the slot.
    pub fn vote(
        &self,
        vote: &SignedFact,
        threshold: Threshold,
        tip: Height,
        now: Timestamp,
    ) -> Result<Voteproof, VoteError> {
        let fact = &vote.fact;
        if !fact.stage().can_vote() {
            return Err(VoteError::NotVotingStage(fact.stage()));
        }
        if !self.suffrage.is_inside(&vote.signer) {
            return Err(VoteError::NotInSuffrage(vote.signer.to_string()));
        }
        if fact.height() > window_end(tip.next()) {
            return Err(VoteError::TooFarAhead {
                height: fact.height(),
                tip,
            });
        }
        let key = (fact.height(), fact.round(), fact.stage());
        // A poisoned lock still guards consistent slots: voteproofs are replaced as a whole.
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        let vp = slots
            .entry(key)
            .or_insert_with(|| Voteproof::new(key.0, key.1, key.2, threshold));
        if vp.is_finished() {
            let mut res = vp.clone();
            res.closed = true;
            return Ok(res);
        }
        if let Some(prev) = vp.votes.get(&vote.signer) {
            if prev.fact_hash != vote.fact_hash {
                return Err(VoteError::Duplicate {
                    signer: vote.signer.to_string(),
                    height: key.0,
                    round: key.1,
                    stage: key.2,
                });
            }
            return Ok(vp.clone());
        }
        vp.add(vote.clone());
        if !vp.finalize(now) {
            return Ok(vp.clone());
        }
        tracing::debug!(
            height = %key.0,
            round = %key.1,
            stage = %key.2,
            result = ?vp.result,
            "ISAAC ballotbox - voteproof finalized"
        );
        let res = vp.clone();
        vp.closed = true;
        Ok(res)
    }

    /// Current state of a slot.
    pub fn voteproof(&self, height: Height, round: Round, stage: Stage) -> Option<Voteproof> {
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(height, round, stage))
            .cloned()
    }

    /// Drops the slots below `(height, round)` and those out of the vote
    /// window above `height`.
    pub fn tidy(&self, height: Height, round: Round) {
        let end = window_end(height);
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.retain(|(h, r, _), _| {
            *h <= end && (*h > height || (*h == height && *r >= round))
        });
    }

    /// Number of open slots.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use isaac_roles::{
        messages::{Hash, InitFact, VoteResult},
        testonly::Setup,
    };
    use pretty_assertions::assert_eq;
    use rand::Rng as _;
    use zksync_concurrency::ctx;

    fn init(height: i64, round: u64, prev: Hash) -> isaac_roles::messages::BallotFact {
        InitFact {
            height: Height(height),
            round: Round(round),
            previous_block: prev,
        }
        .into()
    }

    const TIP: Height = Height::GENESIS;

    fn ballotbox(setup: &Setup) -> Ballotbox {
        Ballotbox::new(Arc::new(setup.suffrage()))
    }

    #[test]
    fn test_majority() {
        let ctx = &ctx::test_root(&ctx::RealClock);
        let rng = &mut ctx.rng();
        let setup = Setup::new(rng, 4);
        let bb = ballotbox(&setup);
        let fact = init(1, 0, rng.gen());
        let threshold = setup.threshold();
        assert_eq!(3, threshold.threshold());

        for i in 0..2 {
            let vote = setup.sign_fact(i, fact.clone());
            let vp = bb.vote(&vote, threshold, TIP, Timestamp(1)).unwrap();
            assert_eq!(VoteResult::NotYet, vp.result);
        }
        let vp = bb.vote(&setup.sign_fact(2, fact.clone()), threshold, TIP, Timestamp(2)).unwrap();
        assert_eq!(VoteResult::Majority, vp.result);
        assert!(!vp.closed);
        assert_eq!(Some(&fact), vp.majority.as_ref());
        assert_eq!(Some(Timestamp(2)), vp.finalized_at);
        vp.verify(&setup.network_id).unwrap();

        // Late votes do not change a finalized voteproof.
        let late = bb.vote(&setup.sign_fact(3, fact), threshold, TIP, Timestamp(3)).unwrap();
        assert!(late.closed);
        assert_eq!(3, late.votes.len());
        assert_eq!(vp.finalized_at, late.finalized_at);
    }

    #[test]
    fn test_draw() {
        let ctx = &ctx::test_root(&ctx::RealClock);
        let rng = &mut ctx.rng();
        let setup = Setup::new(rng, 4);
        let bb = ballotbox(&setup);
        let threshold = setup.threshold();
        let a = init(1, 0, rng.gen());
        let b = init(1, 0, rng.gen());

        bb.vote(&setup.sign_fact(0, a.clone()), threshold, TIP, Timestamp(0)).unwrap();
        bb.vote(&setup.sign_fact(1, b.clone()), threshold, TIP, Timestamp(0)).unwrap();
        let vp = bb.vote(&setup.sign_fact(2, a), threshold, TIP, Timestamp(0)).unwrap();
        assert_eq!(VoteResult::NotYet, vp.result);
        // 2 + 1 remaining can still reach 3; after a second dissent it cannot.
        let vp = bb.vote(&setup.sign_fact(3, b), threshold, TIP, Timestamp(0)).unwrap();
        assert_eq!(VoteResult::Draw, vp.result);
        assert_eq!(None, vp.majority);
    }

    #[test]
    fn test_equivocation() {
        let ctx = &ctx::test_root(&ctx::RealClock);
        let rng = &mut ctx.rng();
        let setup = Setup::new(rng, 4);
        let bb = ballotbox(&setup);
        let threshold = setup.threshold();
        let a = init(1, 0, rng.gen());
        let b = init(1, 0, rng.gen());

        bb.vote(&setup.sign_fact(0, a.clone()), threshold, TIP, Timestamp(0)).unwrap();
        assert_matches!(
            bb.vote(&setup.sign_fact(0, b), threshold, TIP, Timestamp(0)),
            Err(VoteError::Duplicate { .. })
        );
        // Repeating the same vote is harmless.
        let vp = bb.vote(&setup.sign_fact(0, a.clone()), threshold, TIP, Timestamp(0)).unwrap();
        assert_eq!(1, vp.votes.len());

        bb.vote(&setup.sign_fact(1, a.clone()), threshold, TIP, Timestamp(0)).unwrap();
        let vp = bb.vote(&setup.sign_fact(2, a.clone()), threshold, TIP, Timestamp(0)).unwrap();
        assert_eq!(Some(&a), vp.majority.as_ref());
    }

    #[test]
    fn test_rejects() {
        let ctx = &ctx::test_root(&ctx::RealClock);
        let rng = &mut ctx.rng();
        let setup = Setup::new(rng, 4);
        let outsider = Setup::new(rng, 5);
        let bb = ballotbox(&setup);
        let threshold = setup.threshold();

        let fact = init(1, 0, rng.gen());
        assert_matches!(
            bb.vote(&outsider.sign_fact(4, fact), threshold, TIP, Timestamp(0)),
            Err(VoteError::NotInSuffrage(_))
        );
        let sign = isaac_roles::messages::SignFact {
            height: Height(1),
            round: Round(0),
            proposal: rng.gen(),
            new_block: rng.gen(),
        };
        assert_matches!(
            bb.vote(&setup.sign_fact(0, sign.into()), threshold, TIP, Timestamp(0)),
            Err(VoteError::NotVotingStage(Stage::Sign))
        );
        assert_eq!(0, bb.len());
    }

    #[test]
    fn test_tidy() {
        let ctx = &ctx::test_root(&ctx::RealClock);
        let rng = &mut ctx.rng();
        let setup = Setup::new(rng, 4);
        let bb = ballotbox(&setup);
        let threshold = setup.threshold();
        for (h, r) in [(1, 0), (2, 0), (2, 1), (2, 2), (3, 0)] {
            bb.vote(&setup.sign_fact(0, init(h, r, rng.gen())), threshold, TIP, Timestamp(0))
                .unwrap();
        }
        bb.tidy(Height(2), Round(1));
        assert_eq!(3, bb.len());
        assert!(bb.voteproof(Height(2), Round(0), Stage::Init).is_none());
        assert!(bb.voteproof(Height(2), Round(1), Stage::Init).is_some());
        assert!(bb.voteproof(Height(3), Round(0), Stage::Init).is_some());
    }

    #[test]
    fn test_vote_window() {
        let ctx = &ctx::test_root(&ctx::RealClock);
        let rng = &mut ctx.rng();
        let setup = Setup::new(rng, 4);
        let bb = ballotbox(&setup);
        let threshold = setup.threshold();
        let last = 1 + VOTE_WINDOW;

        bb.vote(&setup.sign_fact(0, init(last, 0, rng.gen())), threshold, TIP, Timestamp(0))
            .unwrap();
        let ahead = setup.sign_fact(0, init(last + 1, 0, rng.gen()));
        assert_matches!(
            bb.vote(&ahead, threshold, TIP, Timestamp(0)),
            Err(VoteError::TooFarAhead { height, tip }) if height == Height(last + 1) && tip == TIP
        );
        let far = setup.sign_fact(1, init(1_000_000, 0, rng.gen()));
        assert_matches!(
            bb.vote(&far, threshold, TIP, Timestamp(0)),
            Err(VoteError::TooFarAhead { .. })
        );
        assert_eq!(1, bb.len());

        // Once the tip moves up, the window moves with it.
        let tip = Height(5);
        for h in [last + 1, 6, 6 + VOTE_WINDOW] {
            bb.vote(&setup.sign_fact(0, init(h, 0, rng.gen())), threshold, tip, Timestamp(0))
                .unwrap();
        }
        assert_eq!(4, bb.len());
        // Tidying at a lower height than the tip drops the slots beyond its window.
        bb.tidy(Height(2), Round(0));
        assert_eq!(2, bb.len());
        assert!(bb.voteproof(Height(last), Round(0), Stage::Init).is_some());
        assert!(bb.voteproof(Height(last + 1), Round(0), Stage::Init).is_some());
        assert!(bb.voteproof(Height(6), Round(0), Stage::Init).is_none());
    }
}
