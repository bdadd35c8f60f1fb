use super::{ConsensusState, Env, Error, StateChange, StateHandler, Trigger, POLL_PROPOSAL_INTERVAL};
use crate::{
    metrics::METRICS,
    proposal_maker::make_proposal,
    timers::{TimerId, Timers},
};
use isaac_roles::messages::{
    AcceptFact, Ballot, Block, InitFact, Round, Seal, SignFact, Stage, Voteproof,
};
use zksync_concurrency::{ctx, error::Wrap as _};

/// Takes part in the rounds at the height after the local tip.
#[derive(Debug, Default)]
pub(crate) struct Consensus {
    timers: Timers,
    /// INIT voteproof of the current round.
    init: Option<Voteproof>,
    /// Proposal of the local node in the current round.
    own_proposal: Option<Ballot>,
    /// Proposal taken in the current round.
    proposal: Option<Ballot>,
    /// ACCEPT vote of the local node in the current round.
    accept: Option<AcceptFact>,
    /// INIT vote for the next round or height, with its justification.
    next_init: Option<(InitFact, Voteproof)>,
}

fn change(to: ConsensusState, trigger: Trigger) -> Error {
    Error::ChangeState(StateChange::new(ConsensusState::Consensus, to, trigger))
}

impl Consensus {
    fn clear(&mut self) {
        self.timers.stop_all();
        self.init = None;
        self.own_proposal = None;
        self.proposal = None;
        self.accept = None;
        self.next_init = None;
    }

    #[tracing::instrument(level = "debug", skip_all, fields(height = %vp.height, round = %vp.round))]
    async fn handle_init_voteproof(
        &mut self,
        ctx: &ctx::Ctx,
        env: &mut Env,
        vp: &Voteproof,
    ) -> Result<(), Error> {
        if let Some(cur) = &self.init {
            if cur.height == vp.height && cur.round > vp.round {
                return Err(Error::ignore(format_args!("INIT voteproof of past round {}", vp.round)));
            }
        }
        self.clear();
        self.init = Some(vp.clone());
        METRICS.height.set(vp.height.0);
        METRICS.round.set(vp.round.0);
        if vp.majority_init().is_none() {
            return self.move_next_round(ctx, env, vp.clone());
        }

        let local = env.local.clone();
        let policy = local.policy.snapshot();
        let now = ctx.now();
        if local
            .suffrage
            .is_proposer(vp.height, vp.round, local.address())
        {
            let proposal = make_proposal(ctx, &local, vp.height, vp.round, vp)
                .await
                .wrap("make_proposal()")?;
            tracing::info!(
                height = %vp.height,
                round = %vp.round,
                proposal = %proposal.hash(),
                "ISAAC consensus - broadcasting proposal"
            );
            env.broadcast(proposal.clone());
            self.own_proposal = Some(proposal);
            self.timers.start(
                TimerId::BroadcastProposal,
                now,
                policy.interval_broadcasting_proposal,
                Some(policy.interval_broadcasting_proposal),
            );
        }
        self.timers.start(
            TimerId::MoveNextRound,
            now,
            policy.timeout_waiting_proposal,
            Some(policy.interval_broadcasting_init_ballot),
        );
        self.timers.start(
            TimerId::PollProposal,
            now,
            POLL_PROPOSAL_INTERVAL,
            Some(POLL_PROPOSAL_INTERVAL),
        );
        Ok(())
    }

    /// Gives up on the current round: votes INIT for the next one, justified by `vp`.
    fn move_next_round(&mut self, ctx: &ctx::Ctx, env: &Env, vp: Voteproof) -> Result<(), Error> {
        let tip = env.tip()?;
        let fact = InitFact {
            height: vp.height,
            round: vp.round.next(),
            previous_block: tip.hash,
        };
        tracing::info!(
            height = %fact.height,
            round = %fact.round,
            "ISAAC consensus - moving to next round"
        );
        self.start_init_broadcast(ctx, env, fact, vp);
        Ok(())
    }

    fn start_init_broadcast(&mut self, ctx: &ctx::Ctx, env: &Env, fact: InitFact, vp: Voteproof) {
        self.timers.stop_all();
        env.broadcast(env.sign(ctx, fact.clone(), Some(vp.clone())));
        self.next_init = Some((fact, vp));
        let interval = env.local.policy.snapshot().interval_broadcasting_init_ballot;
        self.timers
            .start(TimerId::BroadcastInitBallot, ctx.now(), interval, Some(interval));
    }

    #[tracing::instrument(level = "debug", skip_all, fields(proposal = %proposal.hash()))]
    fn handle_proposal(
        &mut self,
        ctx: &ctx::Ctx,
        env: &mut Env,
        proposal: &Ballot,
    ) -> Result<(), Error> {
        let Some(init) = self.init.clone() else {
            return Err(Error::ignore("no INIT voteproof"));
        };
        if proposal.height() != init.height || proposal.round() != init.round {
            return Err(Error::ignore(format_args!(
                "proposal of {}/{}",
                proposal.height(),
                proposal.round()
            )));
        }
        if self.next_init.is_some() {
            return Err(Error::ignore("round already given up"));
        }
        if let Some(p) = &self.proposal {
            if p.hash() == proposal.hash() {
                return Ok(());
            }
            return Err(Error::ignore("another proposal already taken"));
        }
        self.proposal = Some(proposal.clone());
        self.timers.stop(TimerId::PollProposal);
        // The preparer always reports back within `timeout_process_proposal`;
        // the round still times out if that report gets lost.
        let policy = env.local.policy.snapshot();
        self.timers.start(
            TimerId::MoveNextRound,
            ctx.now(),
            policy.timeout_process_proposal + policy.timeout_waiting_proposal,
            Some(policy.interval_broadcasting_init_ballot),
        );
        match env.prepare(proposal, &init) {
            Some(block) => self.vote_block(ctx, env, &block),
            None => Ok(()),
        }
    }

    /// Votes SIGN (if acting) and then ACCEPT for the block built from the taken proposal.
    fn vote_block(&mut self, ctx: &ctx::Ctx, env: &Env, block: &Block) -> Result<(), Error> {
        let (Some(init), Some(proposal)) = (&self.init, &self.proposal) else {
            return Err(Error::ignore("no proposal taken"));
        };
        let local = &env.local;
        let policy = local.policy.snapshot();
        if local
            .suffrage
            .is_acting(init.height, init.round, local.address())
        {
            let sign = SignFact {
                height: init.height,
                round: init.round,
                proposal: proposal.hash(),
                new_block: block.hash(),
            };
            env.broadcast(env.sign(ctx, sign, Some(init.clone())));
        }
        self.accept = Some(AcceptFact {
            height: init.height,
            round: init.round,
            proposal: proposal.hash(),
            new_block: block.hash(),
        });
        let now = ctx.now();
        self.timers.start(
            TimerId::BroadcastAcceptBallot,
            now,
            policy.wait_broadcasting_accept_ballot,
            Some(policy.interval_broadcasting_accept_ballot),
        );
        self.timers.start(
            TimerId::MoveNextRound,
            now,
            policy.wait_broadcasting_accept_ballot + policy.timeout_waiting_proposal,
            Some(policy.interval_broadcasting_init_ballot),
        );
        Ok(())
    }

    async fn handle_accept_voteproof(
        &mut self,
        ctx: &ctx::Ctx,
        env: &mut Env,
        vp: &Voteproof,
    ) -> Result<(), Error> {
        if vp.majority_accept().is_none() {
            if self
                .init
                .as_ref()
                .is_some_and(|cur| cur.height == vp.height && cur.round > vp.round)
            {
                return Err(Error::ignore(format_args!("draw of past round {}", vp.round)));
            }
            return self.move_next_round(ctx, env, vp.clone());
        }
        let block = env.save(ctx, ConsensusState::Consensus, vp).await?;
        self.clear();
        let fact = InitFact {
            height: block.height().next(),
            round: Round(0),
            previous_block: block.hash(),
        };
        self.start_init_broadcast(ctx, env, fact, vp.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl StateHandler for Consensus {
    fn state(&self) -> ConsensusState {
        ConsensusState::Consensus
    }

    fn timers(&mut self) -> &mut Timers {
        &mut self.timers
    }

    async fn activate(
        &mut self,
        ctx: &ctx::Ctx,
        env: &mut Env,
        state_change: &StateChange,
    ) -> Result<(), Error> {
        match &state_change.trigger {
            Trigger::Voteproof(vp) if vp.stage == Stage::Init => {
                self.handle_init_voteproof(ctx, env, vp).await
            }
            _ => Err(change(ConsensusState::Joining, Trigger::None)),
        }
    }

    async fn new_seal(&mut self, ctx: &ctx::Ctx, env: &mut Env, seal: &Seal) -> Result<(), Error> {
        let Seal::Ballot(ballot) = seal else {
            return Ok(());
        };
        let next = env.tip()?.height.next();
        // A ballot of a later height means the node is behind.
        if ballot.height() > next && matches!(ballot.stage(), Stage::Init | Stage::Accept) {
            return Err(change(
                ConsensusState::Syncing,
                Trigger::Ballot(ballot.clone()),
            ));
        }
        match ballot.stage() {
            Stage::Proposal => self.handle_proposal(ctx, env, ballot),
            // An ACCEPT vote tells which proposal the others took, in case ours went missing.
            Stage::Accept if self.proposal.is_none() && self.next_init.is_none() => {
                let (Some(fact), Some(init)) = (ballot.fact().as_accept(), &self.init) else {
                    return Ok(());
                };
                if fact.height != init.height || fact.round != init.round {
                    return Ok(());
                }
                let Some(proposal) = env
                    .find_proposal(ctx, fact.height, fact.round, fact.proposal, ballot.signer())
                    .await?
                else {
                    return Ok(());
                };
                self.handle_proposal(ctx, env, &proposal)
            }
            _ => Ok(()),
        }
    }

    async fn prepared(
        &mut self,
        ctx: &ctx::Ctx,
        env: &mut Env,
        proposal: &Ballot,
        block: Option<&Block>,
    ) -> Result<(), Error> {
        let taken = self
            .proposal
            .as_ref()
            .is_some_and(|p| p.hash() == proposal.hash());
        if !taken || self.accept.is_some() || self.next_init.is_some() {
            return Err(Error::ignore("prepared proposal is not the current one"));
        }
        let Some(init) = self.init.clone() else {
            return Err(Error::ignore("no INIT voteproof"));
        };
        match block {
            Some(block) => self.vote_block(ctx, env, block),
            None => self.move_next_round(ctx, env, init),
        }
    }

    async fn new_voteproof(
        &mut self,
        ctx: &ctx::Ctx,
        env: &mut Env,
        vp: &Voteproof,
    ) -> Result<(), Error> {
        match vp.stage {
            Stage::Init => self.handle_init_voteproof(ctx, env, vp).await,
            Stage::Accept => self.handle_accept_voteproof(ctx, env, vp).await,
            _ => Ok(()),
        }
    }

    async fn on_timer(&mut self, ctx: &ctx::Ctx, env: &mut Env, id: TimerId) -> Result<(), Error> {
        match id {
            TimerId::BroadcastInitBallot => {
                if let Some((fact, vp)) = &self.next_init {
                    env.broadcast(env.sign(ctx, fact.clone(), Some(vp.clone())));
                }
                Ok(())
            }
            TimerId::BroadcastProposal => {
                if let Some(p) = &self.own_proposal {
                    env.broadcast(p.clone());
                }
                Ok(())
            }
            TimerId::BroadcastAcceptBallot => {
                if let (Some(fact), Some(init)) = (&self.accept, &self.init) {
                    env.broadcast(env.sign(ctx, fact.clone(), Some(init.clone())));
                }
                Ok(())
            }
            TimerId::MoveNextRound => {
                let Some(init) = self.init.clone() else {
                    return Ok(());
                };
                if self.proposal.is_none() {
                    tracing::info!(
                        height = %init.height,
                        round = %init.round,
                        "ISAAC consensus - no proposal in time"
                    );
                }
                self.move_next_round(ctx, env, init)
            }
            TimerId::PollProposal => {
                let Some(init) = self.init.clone() else {
                    return Ok(());
                };
                let Some(proposal) = env
                    .local
                    .db
                    .proposal(ctx, init.height, init.round)
                    .await
                    .wrap("db.proposal()")?
                else {
                    return Ok(());
                };
                self.handle_proposal(ctx, env, &proposal)
            }
        }
    }
}
