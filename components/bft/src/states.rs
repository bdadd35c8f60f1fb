//! Consensus state machine: routes seals, voteproofs, timers and sync
//! events to the active state handler.
use crate::{
    ballotbox::{Ballotbox, VoteError},
    checker,
    handlers::{self, ConsensusState, Env, Error, StateChange, StateHandler, Trigger},
    metrics::{SealLabel, StateLabel, VoteproofLabels, METRICS},
    processor::{PrepareError, PrepareRequest, Prepared},
};
use isaac_roles::messages::{Ballot, Hash, Seal, Stage, Voteproof};
use isaac_sync::SyncEvent;
use zksync_concurrency::{ctx, error::Wrap as _, sync, time};

/// Input of the state machine.
#[derive(Debug)]
pub(crate) enum Event {
    /// Seal received from a remote node or broadcast by the local node.
    Seal(Seal),
    /// Progress of the syncers.
    Sync(SyncEvent),
    /// Outcome of a background prepare.
    Prepared(Prepared),
    /// Outcome of a background proposal fetch.
    Fetched {
        /// Requested proposal.
        hash: Hash,
        /// The proposal, if the node asked returned a valid one.
        proposal: Option<Ballot>,
    },
}

impl From<ConsensusState> for StateLabel {
    fn from(s: ConsensusState) -> Self {
        match s {
            ConsensusState::Booting => Self::Booting,
            ConsensusState::Joining => Self::Joining,
            ConsensusState::Consensus => Self::Consensus,
            ConsensusState::Syncing => Self::Syncing,
            ConsensusState::Broken => Self::Broken,
        }
    }
}

/// Holds the active handler and serializes everything delivered to it.
#[derive(Debug)]
pub(crate) struct StateMachine {
    env: Env,
    ballotbox: Ballotbox,
    handler: Option<Box<dyn StateHandler>>,
}

impl StateMachine {
    pub(crate) fn new(env: Env) -> Self {
        Self {
            ballotbox: Ballotbox::new(env.local.suffrage.clone()),
            env,
            handler: None,
        }
    }

    /// Prepare requests of the processor, served by [`crate::processor::run_preparer`].
    pub(crate) fn prepare_requests(&self) -> sync::watch::Receiver<PrepareRequest> {
        self.env.processor.subscribe()
    }

    pub(crate) fn state(&self) -> Option<ConsensusState> {
        self.handler.as_ref().map(|h| h.state())
    }

    /// Makes `handler` active without calling its `activate`.
    #[cfg(test)]
    pub(crate) fn install(&mut self, handler: Box<dyn StateHandler>) {
        self.env.local.set_state(handler.state());
        self.handler = Some(handler);
    }

    /// Runs until `ctx` is canceled or an internal error occurs.
    pub(crate) async fn run(
        mut self,
        ctx: &ctx::Ctx,
        events: &mut ctx::channel::UnboundedReceiver<Event>,
    ) -> ctx::Result<()> {
        let start = StateChange {
            from: None,
            to: ConsensusState::Booting,
            trigger: Trigger::None,
        };
        self.transition(ctx, start).await?;
        loop {
            let deadline = match &mut self.handler {
                Some(h) => h.timers().deadline(),
                None => time::Deadline::Infinite,
            };
            let res = match events.recv(&ctx.with_deadline(deadline)).await {
                Ok(Event::Seal(seal)) => {
                    let label = match &seal {
                        Seal::Ballot(b) => SealLabel::from(b.stage()),
                        Seal::Operations(_) => SealLabel::Operations,
                    };
                    let start = std::time::Instant::now();
                    let res = self.on_seal(ctx, seal).await;
                    METRICS.seal_processing_latency[&label.with_result(&res)]
                        .observe(start.elapsed());
                    res
                }
                Ok(Event::Sync(event)) => self.on_sync_event(ctx, event).await,
                Ok(Event::Prepared(done)) => self.on_prepared(ctx, done).await,
                Ok(Event::Fetched { hash, proposal }) => {
                    self.env.fetched(&hash);
                    match proposal {
                        Some(p) => self.on_seal(ctx, Seal::Ballot(p)).await,
                        None => Ok(()),
                    }
                }
                Err(ctx::Canceled) => {
                    if !ctx.is_active() {
                        return Ok(());
                    }
                    self.on_timers(ctx).await?;
                    continue;
                }
            };
            self.handle(ctx, res).await?;
        }
    }

    /// Acts on the outcome of a handler call.
    async fn handle(&mut self, ctx: &ctx::Ctx, res: Result<(), Error>) -> ctx::Result<()> {
        match res {
            Ok(()) => Ok(()),
            Err(Error::Ignore(reason)) => {
                tracing::trace!(state = ?self.state(), "ISAAC states - ignored: {reason}");
                Ok(())
            }
            Err(Error::ChangeState(change)) => self.transition(ctx, change).await,
            Err(Error::Internal(err)) => Err(err),
        }
    }

    /// Replaces the active handler. A handler may refuse to activate by
    /// asking for another state, which is then activated in turn.
    pub(crate) async fn transition(
        &mut self,
        ctx: &ctx::Ctx,
        mut change: StateChange,
    ) -> ctx::Result<()> {
        loop {
            let from = self.state();
            if from == Some(change.to) {
                tracing::debug!(state = %change.to, "ISAAC states - already in state");
                return Ok(());
            }
            if from == Some(ConsensusState::Broken) {
                return Ok(());
            }
            if let Some(mut h) = self.handler.take() {
                match h.deactivate(ctx, &mut self.env).await {
                    Ok(()) | Err(Error::Ignore(_) | Error::ChangeState(_)) => {}
                    Err(Error::Internal(err)) => return Err(err),
                }
            }
            tracing::info!(
                from = ?from,
                to = %change.to,
                "ISAAC states - state changed"
            );
            METRICS.state_changes[&StateLabel::from(change.to)].inc();
            self.env.local.set_state(change.to);
            change.from = from;
            let handler = self.handler.insert(handlers::new_handler(change.to));
            match handler.activate(ctx, &mut self.env, &change).await {
                Ok(()) => return Ok(()),
                Err(Error::Ignore(reason)) => {
                    tracing::debug!(state = %change.to, "ISAAC states - activation: {reason}");
                    return Ok(());
                }
                Err(Error::ChangeState(next)) => change = next,
                Err(Error::Internal(err)) => return Err(err),
            }
        }
    }

    /// Delivers every fired timer, handling each outcome on its own. Stops
    /// once a timer changes the state: the rest belong to the old handler.
    pub(crate) async fn on_timers(&mut self, ctx: &ctx::Ctx) -> ctx::Result<()> {
        let Some(h) = &mut self.handler else {
            return Ok(());
        };
        let state = h.state();
        let fired = h.timers().fired(ctx.now());
        for id in fired {
            let Some(h) = self.handler.as_mut().filter(|h| h.state() == state) else {
                break;
            };
            let res = h.on_timer(ctx, &mut self.env, id).await;
            self.handle(ctx, res).await?;
        }
        Ok(())
    }

    async fn on_prepared(&mut self, ctx: &ctx::Ctx, done: Prepared) -> Result<(), Error> {
        let proposal = done.proposal.clone();
        let Some(res) = self.env.processor.finish(done) else {
            return Err(Error::ignore(format_args!(
                "superseded prepare of {}",
                proposal.hash()
            )));
        };
        let block = match res {
            Ok(block) => Some(block),
            Err(PrepareError::Internal(err)) => return Err(err.into()),
            Err(err) => {
                tracing::warn!(
                    height = %proposal.height(),
                    round = %proposal.round(),
                    proposal = %proposal.hash(),
                    "ISAAC states - failed to prepare proposal: {err:#}"
                );
                None
            }
        };
        let Some(h) = &mut self.handler else {
            return Ok(());
        };
        h.prepared(ctx, &mut self.env, &proposal, block.as_ref()).await
    }

    async fn on_sync_event(&mut self, ctx: &ctx::Ctx, event: SyncEvent) -> Result<(), Error> {
        if let SyncEvent::Finished(_) = &event {
            self.env
                .local
                .update_tip(ctx)
                .await
                .wrap("update_tip()")?;
            self.env.processor.cancel();
        }
        let Some(h) = &mut self.handler else {
            return Ok(());
        };
        h.sync_event(ctx, &mut self.env, &event).await
    }

    /// Seal pipeline: verify, persist, vote, deliver.
    pub(crate) async fn on_seal(&mut self, ctx: &ctx::Ctx, seal: Seal) -> Result<(), Error> {
        if matches!(self.state(), None | Some(ConsensusState::Booting | ConsensusState::Broken)) {
            return Err(Error::ignore("not accepting seals"));
        }
        let local = self.env.local.clone();
        let now = local.now(ctx);
        let known = local
            .db
            .seal(ctx, &seal.hash())
            .await
            .wrap("db.seal()")?
            .is_some();
        let is_local = match &seal {
            Seal::Ballot(b) => b.signer() == local.address(),
            Seal::Operations(_) => false,
        };
        if !is_local && !known {
            if let Err(err) = seal.verify(&local.network_id()) {
                tracing::warn!(seal = %seal.hash(), "ISAAC states - invalid seal: {err:#}");
                return Err(Error::ignore(err));
            }
        }

        match &seal {
            Seal::Operations(s) => {
                if known {
                    return Ok(());
                }
                let max = local.policy.snapshot().max_operations_in_seal as usize;
                if s.operations.len() > max {
                    tracing::warn!(
                        seal = %s.hash(),
                        "ISAAC states - operation seal with {} operations exceeds {max}",
                        s.operations.len()
                    );
                    return Err(Error::ignore("too many operations"));
                }
                local
                    .db
                    .new_seals(ctx, std::slice::from_ref(&seal))
                    .await
                    .wrap("db.new_seals()")?;
                // Relay new operation seals so that every proposer gets to see them.
                self.env.broadcast(seal.clone());
            }
            Seal::Ballot(b) => {
                if !is_local {
                    if let Err(err) = checker::check_ballot(&local, b, now) {
                        tracing::debug!(
                            seal = %b.hash(),
                            signer = %b.signer(),
                            stage = %b.stage(),
                            "ISAAC states - ballot rejected: {err:#}"
                        );
                        return Err(Error::ignore(err));
                    }
                }
                if !known {
                    local
                        .db
                        .new_seals(ctx, std::slice::from_ref(&seal))
                        .await
                        .wrap("db.new_seals()")?;
                    if b.proposal().is_some() {
                        local
                            .db
                            .new_proposal(ctx, b)
                            .await
                            .wrap("db.new_proposal()")?;
                    }
                }
                if b.stage().can_vote() {
                    let tip = local.tip_height();
                    match self.ballotbox.vote(&b.signed_fact, local.threshold(), tip, now) {
                        Ok(vp) if vp.is_finished() && !vp.closed => {
                            self.on_voteproof(ctx, vp).await?;
                        }
                        Ok(_) => {}
                        Err(
                            err @ (VoteError::Duplicate { .. } | VoteError::TooFarAhead { .. }),
                        ) => {
                            tracing::debug!("ISAAC states - {err}");
                        }
                        Err(err) => {
                            tracing::warn!("ISAAC states - vote rejected: {err}");
                        }
                    }
                }
            }
        }
        let Some(h) = &mut self.handler else {
            return Ok(());
        };
        h.new_seal(ctx, &mut self.env, &seal).await
    }

    /// Voteproof pipeline: check against the local tip, persist, deliver.
    pub(crate) async fn on_voteproof(
        &mut self,
        ctx: &ctx::Ctx,
        vp: Voteproof,
    ) -> Result<(), Error> {
        if vp.closed {
            return Ok(());
        }
        if let Some(labels) = VoteproofLabels::new(vp.stage, vp.result) {
            METRICS.voteproofs[&labels].inc();
        }
        let Some(state) = self.state() else {
            return Ok(());
        };
        if matches!(state, ConsensusState::Booting | ConsensusState::Broken) {
            return Ok(());
        }
        let local = self.env.local.clone();
        let tip = local.tip();
        let next = local.tip_height().next();
        tracing::debug!(
            height = %vp.height,
            round = %vp.round,
            stage = %vp.stage,
            result = ?vp.result,
            "ISAAC states - new voteproof"
        );
        if vp.height < next {
            return Err(Error::ignore(format_args!("stale voteproof of height {}", vp.height)));
        }
        let linked = match vp.majority_init() {
            Some(fact) => tip.as_ref().map(|m| m.hash) == Some(fact.previous_block),
            None => true,
        };
        if vp.height > next || !linked {
            if state != ConsensusState::Syncing {
                return Err(Error::ChangeState(StateChange::new(
                    state,
                    ConsensusState::Syncing,
                    Trigger::Voteproof(vp),
                )));
            }
            if !linked {
                self.env.sync_to(vp.height.prev(), &vp.voters());
                return Ok(());
            }
        } else {
            match vp.stage {
                Stage::Init => {
                    local
                        .db
                        .new_init_voteproof(ctx, &vp)
                        .await
                        .wrap("db.new_init_voteproof()")?;
                    self.ballotbox.tidy(vp.height, vp.round);
                    self.env.last_init_voteproof = Some(vp.clone());
                }
                _ => {
                    local
                        .db
                        .new_accept_voteproof(ctx, &vp)
                        .await
                        .wrap("db.new_accept_voteproof()")?;
                    self.env.last_accept_voteproof = Some(vp.clone());
                }
            }
        }
        let Some(h) = &mut self.handler else {
            return Ok(());
        };
        h.new_voteproof(ctx, &mut self.env, &vp).await
    }
}
