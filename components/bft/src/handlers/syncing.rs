use super::{ConsensusState, Env, Error, StateChange, StateHandler, Trigger};
use crate::timers::{TimerId, Timers};
use isaac_roles::{
    messages::{Ballot, Height, Seal, Stage, Voteproof},
    node::Address,
};
use isaac_sync::SyncEvent;
use zksync_concurrency::ctx;

/// Catches up with the network through the syncers.
#[derive(Debug, Default)]
pub(crate) struct Syncing {
    timers: Timers,
}

fn change(to: ConsensusState, trigger: Trigger) -> Error {
    Error::ChangeState(StateChange::new(ConsensusState::Syncing, to, trigger))
}

/// Height to sync to and the nodes which vouch for it, as implied by a voteproof.
fn voteproof_target(vp: &Voteproof) -> (Height, Vec<Address>) {
    let height = match vp.stage {
        Stage::Accept if vp.majority.is_some() => vp.height,
        _ => vp.height.prev(),
    };
    (height, vp.voters())
}

/// Height to sync to and the nodes which vouch for it, as implied by a ballot.
fn ballot_target(ballot: &Ballot) -> (Height, Vec<Address>) {
    let mut sources = vec![ballot.signer().clone()];
    if let Some(vp) = ballot.voteproof() {
        sources.extend(vp.voters());
    }
    sources.sort();
    sources.dedup();
    (ballot.height().prev(), sources)
}

impl Syncing {
    fn add_target(&self, env: &Env, height: Height, sources: &[Address]) {
        if env.sync_to(height, sources) {
            tracing::info!(%height, "ISAAC syncing - new sync target");
        }
    }

    /// Leaves Syncing once the syncers have nothing left to do.
    fn check_finished(&self, env: &Env) -> Result<(), Error> {
        if env.local.tip().is_some() && env.syncers.is_finished() {
            return Err(change(ConsensusState::Joining, Trigger::None));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StateHandler for Syncing {
    fn state(&self) -> ConsensusState {
        ConsensusState::Syncing
    }

    fn timers(&mut self) -> &mut Timers {
        &mut self.timers
    }

    async fn activate(
        &mut self,
        _ctx: &ctx::Ctx,
        env: &mut Env,
        state_change: &StateChange,
    ) -> Result<(), Error> {
        env.processor.cancel();
        let target = match &state_change.trigger {
            Trigger::None => None,
            Trigger::Voteproof(vp) => Some(voteproof_target(vp)),
            Trigger::Ballot(b) => Some(ballot_target(b)),
            Trigger::Target { height, sources } => Some((*height, sources.clone())),
        };
        tracing::info!(
            local = %env.local.tip_height(),
            target = ?target.as_ref().map(|t| t.0),
            "ISAAC syncing - started"
        );
        if let Some((height, sources)) = target {
            self.add_target(env, height, &sources);
        }
        self.check_finished(env)
    }

    async fn new_seal(&mut self, _ctx: &ctx::Ctx, env: &mut Env, seal: &Seal) -> Result<(), Error> {
        let Seal::Ballot(ballot) = seal else {
            return Ok(());
        };
        let next = env.local.tip_height().next();
        if ballot.height() > next {
            let (height, sources) = ballot_target(ballot);
            self.add_target(env, height, &sources);
            return Ok(());
        }
        // Only once the syncers are done, so that prepare never races a syncer commit.
        if ballot.stage() == Stage::Proposal
            && ballot.height() == next
            && env.syncers.is_finished()
        {
            if let Some(init) = ballot.voteproof() {
                env.prepare(ballot, init);
            }
        }
        Ok(())
    }

    async fn new_voteproof(
        &mut self,
        ctx: &ctx::Ctx,
        env: &mut Env,
        vp: &Voteproof,
    ) -> Result<(), Error> {
        let next = env.local.tip_height().next();
        if vp.height == next && env.syncers.is_finished() {
            match vp.stage {
                Stage::Init => {
                    return Err(change(
                        ConsensusState::Consensus,
                        Trigger::Voteproof(vp.clone()),
                    ));
                }
                Stage::Accept => {
                    if let Some(fact) = vp.majority_accept() {
                        if env.processor.is_prepared(&fact.proposal) {
                            match env.save(ctx, ConsensusState::Syncing, vp).await {
                                Ok(block) => {
                                    tracing::info!(height = %block.height(), "ISAAC syncing - saved block in place");
                                    return Ok(());
                                }
                                Err(Error::ChangeState(c)) if c.to == ConsensusState::Syncing => {}
                                Err(err) => return Err(err),
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        let (height, sources) = voteproof_target(vp);
        self.add_target(env, height, &sources);
        Ok(())
    }

    async fn on_timer(&mut self, _ctx: &ctx::Ctx, _env: &mut Env, _id: TimerId) -> Result<(), Error> {
        Ok(())
    }

    async fn sync_event(
        &mut self,
        _ctx: &ctx::Ctx,
        env: &mut Env,
        event: &SyncEvent,
    ) -> Result<(), Error> {
        match event {
            SyncEvent::Finished(height) => {
                tracing::info!(%height, "ISAAC syncing - blocks synced");
                self.check_finished(env)
            }
            SyncEvent::Failed(err) => {
                tracing::debug!("ISAAC syncing - sync attempt failed: {err}");
                Ok(())
            }
        }
    }
}
