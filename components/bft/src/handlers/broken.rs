use super::{ConsensusState, Env, Error, StateChange, StateHandler};
use crate::timers::{TimerId, Timers};
use isaac_roles::messages::{Seal, Voteproof};
use zksync_concurrency::ctx;

/// Terminal state: the node stops taking part in consensus.
#[derive(Debug, Default)]
pub(crate) struct Broken {
    timers: Timers,
}

#[async_trait::async_trait]
impl StateHandler for Broken {
    fn state(&self) -> ConsensusState {
        ConsensusState::Broken
    }

    fn timers(&mut self) -> &mut Timers {
        &mut self.timers
    }

    async fn activate(
        &mut self,
        _ctx: &ctx::Ctx,
        env: &mut Env,
        change: &StateChange,
    ) -> Result<(), Error> {
        env.processor.cancel();
        tracing::error!(
            from = ?change.from,
            height = %env.local.tip_height(),
            "ISAAC broken - node stopped taking part in consensus"
        );
        Ok(())
    }

    async fn new_seal(&mut self, _ctx: &ctx::Ctx, _env: &mut Env, _seal: &Seal) -> Result<(), Error> {
        Err(Error::ignore("broken"))
    }

    async fn new_voteproof(
        &mut self,
        _ctx: &ctx::Ctx,
        _env: &mut Env,
        _vp: &Voteproof,
    ) -> Result<(), Error> {
        Err(Error::ignore("broken"))
    }

    async fn on_timer(&mut self, _ctx: &ctx::Ctx, _env: &mut Env, _id: TimerId) -> Result<(), Error> {
        Ok(())
    }
}
