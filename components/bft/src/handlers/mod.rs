//! State handlers of the consensus state machine.
//!
//! Exactly one handler is active at a time. Handlers never call each other:
//! a handler asks for a transition by returning [`Error::ChangeState`].
use crate::{
    fetcher::FetchRequest,
    processor::{ProposalProcessor, SaveError},
    timers::{TimerId, Timers},
    LocalContext,
};
use isaac_network::RemoteNode;
use isaac_roles::{
    messages::{Ballot, BallotFact, Block, Hash, Height, Manifest, Round, Seal, Voteproof},
    node::Address,
};
use isaac_sync::{SyncEvent, Syncers};
use std::{collections::HashSet, fmt, sync::Arc};
use zksync_concurrency::{ctx, error::Wrap, time};

mod booting;
mod broken;
mod consensus;
mod joining;
mod syncing;

pub(crate) use booting::Booting;
pub(crate) use broken::Broken;
pub(crate) use consensus::Consensus;
pub(crate) use joining::Joining;
pub(crate) use syncing::Syncing;

/// Interval at which the consensus handler looks for a proposal which
/// arrived before the INIT voteproof of its round.
pub(crate) const POLL_PROPOSAL_INTERVAL: time::Duration = time::Duration::milliseconds(100);

/// State of the consensus state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsensusState {
    /// Validating the local chain on start.
    Booting,
    /// Rejoining the network from the local tip.
    Joining,
    /// Taking part in the rounds.
    Consensus,
    /// Catching up with the network.
    Syncing,
    /// Stopped after an unrecoverable error.
    Broken,
}

impl fmt::Display for ConsensusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Booting => "BOOTING",
            Self::Joining => "JOINING",
            Self::Consensus => "CONSENSUS",
            Self::Syncing => "SYNCING",
            Self::Broken => "BROKEN",
        })
    }
}

/// What caused a state change.
#[derive(Debug, Clone)]
pub(crate) enum Trigger {
    /// Nothing in particular.
    None,
    /// A voteproof the new state has to act upon.
    Voteproof(Voteproof),
    /// A ballot from ahead of the local chain.
    Ballot(Ballot),
    /// Blocks to fetch.
    Target {
        /// Height to sync to.
        height: Height,
        /// Nodes to fetch from.
        sources: Vec<Address>,
    },
}

/// Request to replace the active handler.
#[derive(Debug, Clone)]
pub(crate) struct StateChange {
    /// Active state; `None` on start.
    pub(crate) from: Option<ConsensusState>,
    /// Requested state.
    pub(crate) to: ConsensusState,
    /// Cause of the change.
    pub(crate) trigger: Trigger,
}

impl StateChange {
    pub(crate) fn new(from: ConsensusState, to: ConsensusState, trigger: Trigger) -> Self {
        Self {
            from: Some(from),
            to,
            trigger,
        }
    }
}

/// Outcome of a handler call other than success.
#[derive(Debug)]
pub(crate) enum Error {
    /// The event does not concern the handler.
    Ignore(String),
    /// The handler asks to be replaced.
    ChangeState(StateChange),
    /// Internal error; stops the node.
    Internal(ctx::Error),
}

impl From<ctx::Error> for Error {
    fn from(err: ctx::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<ctx::Canceled> for Error {
    fn from(err: ctx::Canceled) -> Self {
        Self::Internal(err.into())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.into())
    }
}

impl Wrap for Error {
    fn with_wrap<C: fmt::Display + Send + Sync + 'static, F: FnOnce() -> C>(
        self,
        f: F,
    ) -> Self {
        match self {
            Error::Internal(err) => Error::Internal(err.with_wrap(f)),
            err => err,
        }
    }
}

impl Error {
    pub(crate) fn ignore(reason: impl fmt::Display) -> Self {
        Self::Ignore(reason.to_string())
    }
}

/// State shared by the handlers and owned by the state machine.
#[derive(Debug)]
pub(crate) struct Env {
    pub(crate) local: Arc<LocalContext>,
    pub(crate) processor: ProposalProcessor,
    pub(crate) syncers: Arc<Syncers>,
    outbound: ctx::channel::UnboundedSender<Seal>,
    fetches: ctx::channel::UnboundedSender<FetchRequest>,
    /// Proposals requested from other nodes and not delivered yet.
    fetching: HashSet<Hash>,
    /// Last INIT voteproof accepted by the voteproof pipeline.
    pub(crate) last_init_voteproof: Option<Voteproof>,
    /// Last ACCEPT voteproof accepted by the voteproof pipeline.
    pub(crate) last_accept_voteproof: Option<Voteproof>,
}

impl Env {
    pub(crate) fn new(
        local: Arc<LocalContext>,
        syncers: Arc<Syncers>,
        outbound: ctx::channel::UnboundedSender<Seal>,
        fetches: ctx::channel::UnboundedSender<FetchRequest>,
    ) -> Self {
        Self {
            processor: ProposalProcessor::new(local.clone()),
            local,
            syncers,
            outbound,
            fetches,
            fetching: HashSet::new(),
            last_init_voteproof: None,
            last_accept_voteproof: None,
        }
    }

    /// Sends a seal to every remote node and back to the local state machine.
    pub(crate) fn broadcast(&self, seal: impl Into<Seal>) {
        self.outbound.send(seal.into());
    }

    /// Signs a ballot of the local node.
    pub(crate) fn sign(
        &self,
        ctx: &ctx::Ctx,
        fact: impl Into<BallotFact>,
        voteproof: Option<Voteproof>,
    ) -> Ballot {
        Ballot::sign(
            &self.local.local,
            &self.local.network_id(),
            fact.into(),
            voteproof,
            self.local.now(ctx),
        )
    }

    /// Local tip. Handlers past Booting require one.
    pub(crate) fn tip(&self) -> Result<Manifest, Error> {
        self.local
            .tip()
            .ok_or_else(|| Error::ignore("no local block"))
    }

    /// ACCEPT voteproof of the local tip.
    pub(crate) async fn tip_accept_voteproof(
        &self,
        ctx: &ctx::Ctx,
        tip: &Manifest,
    ) -> ctx::Result<Voteproof> {
        if let Some(vp) = self
            .last_accept_voteproof
            .as_ref()
            .filter(|vp| vp.majority_accept().is_some_and(|f| f.new_block == tip.hash))
        {
            return Ok(vp.clone());
        }
        let block = self
            .local
            .db
            .block_by_height(ctx, tip.height)
            .await
            .wrap("db.block_by_height()")?
            .ok_or_else(|| anyhow::format_err!("tip block {} missing", tip.height))?;
        Ok(block
            .accept_voteproof
            .ok_or_else(|| anyhow::format_err!("tip block {} has no ACCEPT voteproof", tip.height))?)
    }

    /// Proposal with the given hash from the local database. A missing
    /// proposal is requested from `from` in the background; if it arrives it
    /// goes through the seal pipeline like any other proposal.
    pub(crate) async fn find_proposal(
        &mut self,
        ctx: &ctx::Ctx,
        height: Height,
        round: Round,
        hash: Hash,
        from: &Address,
    ) -> ctx::Result<Option<Ballot>> {
        if let Some(p) = self
            .local
            .db
            .proposal(ctx, height, round)
            .await
            .wrap("db.proposal()")?
            .filter(|p| p.hash() == hash)
        {
            return Ok(Some(p));
        }
        if self.fetching.insert(hash) {
            tracing::debug!(%height, %round, proposal = %hash, %from, "ISAAC states - fetching proposal");
            self.fetches.send(FetchRequest {
                height,
                round,
                hash,
                from: from.clone(),
            });
        }
        Ok(None)
    }

    /// Marks a proposal fetch as done, so that it may be requested again.
    pub(crate) fn fetched(&mut self, hash: &Hash) {
        self.fetching.remove(hash);
    }

    /// Starts preparing a proposal in the background. Returns the block if
    /// the proposal is already prepared; otherwise the active handler learns
    /// the outcome through [`StateHandler::prepared`].
    pub(crate) fn prepare(&mut self, proposal: &Ballot, init: &Voteproof) -> Option<Block> {
        self.processor.start(proposal, init)
    }

    /// Saves the block accepted by `accept`. A storage failure breaks the node;
    /// any other failure means the local node missed the block and has to sync.
    pub(crate) async fn save(
        &mut self,
        ctx: &ctx::Ctx,
        from: ConsensusState,
        accept: &Voteproof,
    ) -> Result<Block, Error> {
        match self.processor.save(ctx, accept).await {
            Ok(block) => {
                self.last_accept_voteproof = Some(accept.clone());
                Ok(block)
            }
            Err(SaveError::Internal(err)) => Err(err.into()),
            Err(SaveError::Commit(err)) => {
                tracing::error!(height = %accept.height, "ISAAC states - failed to commit block: {err:#}");
                Err(Error::ChangeState(StateChange::new(
                    from,
                    ConsensusState::Broken,
                    Trigger::None,
                )))
            }
            Err(err) => {
                tracing::warn!(height = %accept.height, "ISAAC states - cannot save accepted block: {err:#}");
                Err(Error::ChangeState(StateChange::new(
                    from,
                    ConsensusState::Syncing,
                    Trigger::Voteproof(accept.clone()),
                )))
            }
        }
    }

    /// Asks the syncers for the blocks up to `height` from `sources`.
    pub(crate) fn sync_to(&self, height: Height, sources: &[Address]) -> bool {
        if height <= self.local.tip_height() {
            return false;
        }
        let remotes: Vec<RemoteNode> = self.local.remotes(sources);
        if remotes.is_empty() {
            tracing::debug!(%height, "ISAAC states - no known source to sync from");
            return false;
        }
        self.syncers.add(height, remotes)
    }
}

/// Handler of one consensus state.
#[async_trait::async_trait]
pub(crate) trait StateHandler: fmt::Debug + Send {
    /// State implemented.
    fn state(&self) -> ConsensusState;
    /// Timers of the handler.
    fn timers(&mut self) -> &mut Timers;

    /// Called when the handler becomes active.
    async fn activate(
        &mut self,
        ctx: &ctx::Ctx,
        env: &mut Env,
        change: &StateChange,
    ) -> Result<(), Error>;

    /// Called when the handler is replaced.
    async fn deactivate(&mut self, _ctx: &ctx::Ctx, _env: &mut Env) -> Result<(), Error> {
        self.timers().stop_all();
        Ok(())
    }

    /// A seal passed the seal pipeline.
    async fn new_seal(&mut self, ctx: &ctx::Ctx, env: &mut Env, seal: &Seal)
        -> Result<(), Error>;

    /// A voteproof passed the voteproof pipeline.
    async fn new_voteproof(
        &mut self,
        ctx: &ctx::Ctx,
        env: &mut Env,
        vp: &Voteproof,
    ) -> Result<(), Error>;

    /// A timer fired.
    async fn on_timer(&mut self, ctx: &ctx::Ctx, env: &mut Env, id: TimerId)
        -> Result<(), Error>;

    /// A prepare started by [`Env::prepare`] finished. `block` is `None` if
    /// the proposal could not be turned into a block.
    async fn prepared(
        &mut self,
        _ctx: &ctx::Ctx,
        _env: &mut Env,
        _proposal: &Ballot,
        _block: Option<&Block>,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// The syncers reported progress.
    async fn sync_event(
        &mut self,
        _ctx: &ctx::Ctx,
        _env: &mut Env,
        _event: &SyncEvent,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Fresh handler of a state.
pub(crate) fn new_handler(state: ConsensusState) -> Box<dyn StateHandler> {
    match state {
        ConsensusState::Booting => Box::<Booting>::default(),
        ConsensusState::Joining => Box::<Joining>::default(),
        ConsensusState::Consensus => Box::<Consensus>::default(),
        ConsensusState::Syncing => Box::<Syncing>::default(),
        ConsensusState::Broken => Box::<Broken>::default(),
    }
}
