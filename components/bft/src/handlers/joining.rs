use super::{ConsensusState, Env, Error, StateChange, StateHandler, Trigger};
use crate::timers::{TimerId, Timers};
use isaac_roles::messages::{
    AcceptFact, Ballot, Block, Hash, InitFact, Round, Seal, Stage, Voteproof,
};
use zksync_concurrency::ctx;

/// Rejoins the rounds from the local tip.
///
/// Keeps broadcasting the INIT ballot of the next height until an INIT
/// voteproof of that height shows up.
#[derive(Debug, Default)]
pub(crate) struct Joining {
    timers: Timers,
    round: Round,
    /// Voteproof justifying the INIT ballot.
    carried: Option<Voteproof>,
    /// Proposal the others voted ACCEPT for at the next height, with its INIT voteproof.
    accepted: Option<(Hash, Voteproof)>,
}

fn change(to: ConsensusState, trigger: Trigger) -> Error {
    Error::ChangeState(StateChange::new(ConsensusState::Joining, to, trigger))
}

impl Joining {
    fn broadcast_init(&self, ctx: &ctx::Ctx, env: &Env) -> Result<(), Error> {
        let tip = env.tip()?;
        let fact = InitFact {
            height: tip.height.next(),
            round: self.round,
            previous_block: tip.hash,
        };
        env.broadcast(env.sign(ctx, fact, self.carried.clone()));
        Ok(())
    }

    /// Starts over at round 0 of the height after the tip.
    async fn reset(&mut self, ctx: &ctx::Ctx, env: &Env) -> Result<(), Error> {
        let tip = env.tip()?;
        self.round = Round(0);
        self.accepted = None;
        self.carried = Some(env.tip_accept_voteproof(ctx, &tip).await?);
        self.broadcast_init(ctx, env)?;
        let interval = env.local.policy.snapshot().interval_broadcasting_init_ballot;
        self.timers
            .start(TimerId::BroadcastInitBallot, ctx.now(), interval, Some(interval));
        Ok(())
    }

    /// Moves to a later round of the same height, justified by `vp`.
    fn adopt(&mut self, ctx: &ctx::Ctx, env: &Env, round: Round, vp: Voteproof) -> Result<(), Error> {
        tracing::debug!(height = %vp.height, %round, "ISAAC joining - moving to round");
        self.round = round;
        self.carried = Some(vp);
        self.broadcast_init(ctx, env)
    }

    async fn on_accept_ballot(
        &mut self,
        ctx: &ctx::Ctx,
        env: &mut Env,
        ballot: &Ballot,
    ) -> Result<(), Error> {
        let (Some(fact), Some(init)) = (ballot.fact().as_accept(), ballot.voteproof()) else {
            return Err(Error::ignore("malformed ACCEPT ballot"));
        };
        if env.processor.is_prepared(&fact.proposal) || env.processor.is_preparing(&fact.proposal)
        {
            return Ok(());
        }
        self.accepted = Some((fact.proposal, init.clone()));
        let Some(proposal) = env
            .find_proposal(ctx, fact.height, fact.round, fact.proposal, ballot.signer())
            .await?
        else {
            return Ok(());
        };
        self.prepare(ctx, env, &proposal)
    }

    /// Prepares `proposal` if the others accepted it.
    fn prepare(&mut self, ctx: &ctx::Ctx, env: &mut Env, proposal: &Ballot) -> Result<(), Error> {
        let Some((_, init)) = self
            .accepted
            .as_ref()
            .filter(|(hash, _)| hash == &proposal.hash())
        else {
            return Ok(());
        };
        let init = init.clone();
        match env.prepare(proposal, &init) {
            Some(block) => self.vote_accept(ctx, env, proposal, &block),
            None => Ok(()),
        }
    }

    /// Joins the ACCEPT vote on the block built from `proposal`.
    fn vote_accept(
        &self,
        ctx: &ctx::Ctx,
        env: &Env,
        proposal: &Ballot,
        block: &Block,
    ) -> Result<(), Error> {
        let Some((_, init)) = &self.accepted else {
            return Ok(());
        };
        let accept = AcceptFact {
            height: init.height,
            round: init.round,
            proposal: proposal.hash(),
            new_block: block.hash(),
        };
        env.broadcast(env.sign(ctx, accept, Some(init.clone())));
        Ok(())
    }
}

#[async_trait::async_trait]
impl StateHandler for Joining {
    fn state(&self) -> ConsensusState {
        ConsensusState::Joining
    }

    fn timers(&mut self) -> &mut Timers {
        &mut self.timers
    }

    async fn activate(
        &mut self,
        ctx: &ctx::Ctx,
        env: &mut Env,
        _change: &StateChange,
    ) -> Result<(), Error> {
        let tip = env.tip()?;
        tracing::info!(height = %tip.height, "ISAAC joining - joining from the local tip");
        self.reset(ctx, env).await
    }

    async fn new_seal(&mut self, ctx: &ctx::Ctx, env: &mut Env, seal: &Seal) -> Result<(), Error> {
        let Seal::Ballot(ballot) = seal else {
            return Ok(());
        };
        if ballot.signer() == env.local.address() {
            return Ok(());
        }
        let next = env.tip()?.height.next();
        if ballot.height() < next {
            return Err(Error::ignore(format_args!("stale ballot of height {}", ballot.height())));
        }
        match ballot.stage() {
            Stage::Init | Stage::Accept if ballot.height() > next => Err(change(
                ConsensusState::Syncing,
                Trigger::Ballot(ballot.clone()),
            )),
            Stage::Init => {
                match ballot.voteproof() {
                    Some(vp) if ballot.round() > self.round && vp.height == next => {
                        self.adopt(ctx, env, ballot.round(), vp.clone())?;
                    }
                    _ => {}
                }
                Ok(())
            }
            Stage::Accept => self.on_accept_ballot(ctx, env, ballot).await,
            Stage::Proposal => self.prepare(ctx, env, ballot),
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
        let accepted = self
            .accepted
            .as_ref()
            .is_some_and(|(hash, _)| hash == &proposal.hash());
        match block {
            Some(block) if accepted => self.vote_accept(ctx, env, proposal, block),
            _ => Ok(()),
        }
    }

    async fn new_voteproof(
        &mut self,
        ctx: &ctx::Ctx,
        env: &mut Env,
        vp: &Voteproof,
    ) -> Result<(), Error> {
        match vp.stage {
            Stage::Init => Err(change(
                ConsensusState::Consensus,
                Trigger::Voteproof(vp.clone()),
            )),
            Stage::Accept => match vp.majority_accept() {
                Some(fact) => {
                    if !env.processor.is_prepared(&fact.proposal) {
                        return Err(change(
                            ConsensusState::Syncing,
                            Trigger::Voteproof(vp.clone()),
                        ));
                    }
                    env.save(ctx, ConsensusState::Joining, vp).await?;
                    self.reset(ctx, env).await
                }
                None => self.adopt(ctx, env, vp.round.next(), vp.clone()),
            },
            _ => Ok(()),
        }
    }

    async fn on_timer(&mut self, ctx: &ctx::Ctx, env: &mut Env, id: TimerId) -> Result<(), Error> {
        match id {
            TimerId::BroadcastInitBallot => self.broadcast_init(ctx, env),
            _ => Ok(()),
        }
    }
}
