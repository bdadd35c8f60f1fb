//! Turns a proposal into a block and commits it once the network accepts it.
use crate::{
    metrics::{ResultLabel, METRICS},
    operations::ProcessError,
    seals::{self, ExtractError},
    state_pool::StatePool,
    LocalContext,
};
use isaac_roles::{
    messages::{Ballot, Block, Hash, Manifest, Voteproof},
    policy::POLICY_STATE_KEY,
    tree::FixedTree,
};
use isaac_storage::{commit_block, write_block, BlockDataSession, DatabaseSession};
use std::sync::Arc;
use zksync_concurrency::{ctx, error::Wrap, scope, sync, time};

/// Error returned by [`ProposalProcessor::prepare`].
#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    /// The proposal does not fit the local chain or the INIT voteproof.
    #[error("stale proposal: {0}")]
    Stale(String),
    /// There is no local block to build on.
    #[error("no base manifest")]
    BaseManifestNotFound,
    /// The operations could not be collected.
    #[error("extract: {0}")]
    Extract(#[source] ExtractError),
    /// An operation could not be processed.
    #[error("process: {0:#}")]
    Process(#[source] anyhow::Error),
    /// Processing took longer than `timeout_process_proposal`.
    #[error("timed out after {0}")]
    Timeout(time::Duration),
    /// Internal error.
    #[error(transparent)]
    Internal(#[from] ctx::Error),
}

impl Wrap for PrepareError {
    fn with_wrap<C: std::fmt::Display + Send + Sync + 'static, F: FnOnce() -> C>(
        self,
        f: F,
    ) -> Self {
        match self {
            PrepareError::Internal(err) => PrepareError::Internal(err.with_wrap(f)),
            err => err,
        }
    }
}

/// Error returned by [`ProposalProcessor::save`].
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    /// The accepted proposal has not been prepared locally.
    #[error("proposal {0} is not prepared")]
    NotPrepared(Hash),
    /// The network accepted a different block than the one prepared locally.
    #[error("prepared block {local} differs from the accepted block {accepted}")]
    BlockMismatch {
        /// Hash of the local block.
        local: Hash,
        /// Hash of the accepted block.
        accepted: Hash,
    },
    /// Storage failed to commit the block.
    #[error("commit: {0:#}")]
    Commit(#[source] anyhow::Error),
    /// Internal error.
    #[error(transparent)]
    Internal(#[from] ctx::Error),
}

impl Wrap for SaveError {
    fn with_wrap<C: std::fmt::Display + Send + Sync + 'static, F: FnOnce() -> C>(
        self,
        f: F,
    ) -> Self {
        match self {
            SaveError::Internal(err) => SaveError::Internal(err.with_wrap(f)),
            err => err,
        }
    }
}

/// Stage of the proposal being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Nothing processed yet.
    BeforePrepared,
    /// Prepare in progress.
    Preparing,
    /// Block built and staged.
    Prepared,
    /// Commit in progress.
    Saving,
    /// Block committed.
    Saved,
    /// Prepare failed; everything staged was discarded.
    PrepareFailed,
    /// Commit failed; everything staged was discarded.
    SaveFailed,
}

/// Block built from a proposal, with the storage sessions holding it.
#[derive(Debug)]
pub(crate) struct Staged {
    proposal: Hash,
    block: Block,
    db_session: Option<Box<dyn DatabaseSession>>,
    bd_session: Option<Box<dyn BlockDataSession>>,
}

impl Staged {
    fn cancel(&mut self) {
        if let Some(mut s) = self.db_session.take() {
            s.cancel();
        }
        if let Some(mut s) = self.bd_session.take() {
            s.cancel();
        }
    }
}

/// Latest prepare requested from the preparer. Every request or cancel
/// bumps `generation`, which aborts the prepare in progress.
#[derive(Debug, Clone, Default)]
pub(crate) struct PrepareRequest {
    pub(crate) generation: u64,
    pub(crate) job: Option<(Ballot, Voteproof)>,
}

/// Outcome of a prepare run by [`run_preparer`].
#[derive(Debug)]
pub(crate) struct Prepared {
    pub(crate) generation: u64,
    pub(crate) proposal: Ballot,
    pub(crate) res: Result<Staged, PrepareError>,
}

/// Processes one proposal at a time. A new proposal discards the previous one.
#[derive(Debug)]
pub struct ProposalProcessor {
    local: Arc<LocalContext>,
    state: ProcessorState,
    staged: Option<Staged>,
    /// Proposal handed to the preparer and not finished yet.
    pending: Option<Hash>,
    requests: sync::watch::Sender<PrepareRequest>,
}

impl ProposalProcessor {
    /// Constructs an idle processor.
    pub fn new(local: Arc<LocalContext>) -> Self {
        Self {
            local,
            state: ProcessorState::BeforePrepared,
            staged: None,
            pending: None,
            requests: sync::watch::channel(PrepareRequest::default()).0,
        }
    }

    /// Subscribes to the prepare requests; consumed by [`run_preparer`].
    pub(crate) fn subscribe(&self) -> sync::watch::Receiver<PrepareRequest> {
        self.requests.subscribe()
    }

    fn next_generation(&self, job: Option<(Ballot, Voteproof)>) {
        self.requests.send_modify(|r| {
            r.generation += 1;
            r.job = job;
        });
    }

    fn generation(&self) -> u64 {
        self.requests.borrow().generation
    }

    /// Current state.
    pub fn state(&self) -> ProcessorState {
        self.state
    }

    /// Whether `proposal` has been prepared (or already saved).
    pub fn is_prepared(&self, proposal: &Hash) -> bool {
        self.block(proposal).is_some()
    }

    /// Block built from `proposal`, if prepared.
    pub fn block(&self, proposal: &Hash) -> Option<&Block> {
        match self.state {
            ProcessorState::Prepared | ProcessorState::Saved => {}
            _ => return None,
        }
        self.staged
            .as_ref()
            .filter(|s| &s.proposal == proposal)
            .map(|s| &s.block)
    }

    /// Whether `proposal` is being prepared by the preparer.
    pub fn is_preparing(&self, proposal: &Hash) -> bool {
        self.pending.as_ref() == Some(proposal)
    }

    /// Discards the staged block and aborts the prepare in progress.
    pub fn cancel(&mut self) {
        if let Some(mut s) = self.staged.take() {
            s.cancel();
        }
        if self.pending.take().is_some() {
            self.next_generation(None);
        }
        if self.state != ProcessorState::Saved {
            self.state = ProcessorState::BeforePrepared;
        }
    }

    /// Hands `proposal` to the preparer. Returns the block right away if the
    /// proposal is already prepared; otherwise the outcome arrives later and
    /// has to be passed to [`ProposalProcessor::finish`].
    pub(crate) fn start(&mut self, proposal: &Ballot, init: &Voteproof) -> Option<Block> {
        let hash = proposal.hash();
        if let Some(b) = self.block(&hash) {
            return Some(b.clone());
        }
        if self.is_preparing(&hash) {
            return None;
        }
        self.cancel();
        self.state = ProcessorState::Preparing;
        self.pending = Some(hash);
        self.next_generation(Some((proposal.clone(), init.clone())));
        None
    }

    /// Takes the outcome of a prepare started by [`ProposalProcessor::start`].
    /// Returns `None` if the prepare was superseded; its staged block is discarded.
    pub(crate) fn finish(&mut self, done: Prepared) -> Option<Result<Block, PrepareError>> {
        if done.generation != self.generation() || !self.is_preparing(&done.proposal.hash()) {
            if let Ok(mut staged) = done.res {
                staged.cancel();
            }
            return None;
        }
        self.pending = None;
        Some(self.stage(done.res))
    }

    /// Builds the block of `proposal` on top of the local tip and stages it,
    /// without going through the preparer.
    /// Preparing the same proposal again returns the staged block.
    pub async fn prepare(
        &mut self,
        ctx: &ctx::Ctx,
        proposal: &Ballot,
        init: &Voteproof,
    ) -> Result<Block, PrepareError> {
        if let Some(b) = self.block(&proposal.hash()) {
            return Ok(b.clone());
        }
        self.cancel();
        self.state = ProcessorState::Preparing;
        let res = prepare_timed(ctx, &self.local, proposal, init).await;
        self.stage(res)
    }

    fn stage(&mut self, res: Result<Staged, PrepareError>) -> Result<Block, PrepareError> {
        match res {
            Ok(staged) => {
                let block = staged.block.clone();
                tracing::debug!(block = %block.hash(), "ISAAC processor - proposal prepared");
                self.staged = Some(staged);
                self.state = ProcessorState::Prepared;
                Ok(block)
            }
            Err(err) => {
                self.state = ProcessorState::PrepareFailed;
                Err(err)
            }
        }
    }

    /// Commits the staged block with the ACCEPT voteproof which finalized it.
    /// Saving an already saved block returns it.
    #[tracing::instrument(level = "debug", skip_all, fields(height = %accept.height, round = %accept.round))]
    pub async fn save(&mut self, ctx: &ctx::Ctx, accept: &Voteproof) -> Result<Block, SaveError> {
        let Some(fact) = accept.majority_accept() else {
            return Err(SaveError::NotPrepared(Hash::default()));
        };
        let Some(staged) = self
            .staged
            .as_mut()
            .filter(|s| s.proposal == fact.proposal)
        else {
            return Err(SaveError::NotPrepared(fact.proposal));
        };
        match self.state {
            ProcessorState::Saved if staged.block.hash() == fact.new_block => {
                return Ok(staged.block.clone());
            }
            ProcessorState::Prepared => {}
            _ => return Err(SaveError::NotPrepared(fact.proposal)),
        }
        if staged.block.hash() != fact.new_block {
            let err = SaveError::BlockMismatch {
                local: staged.block.hash(),
                accepted: fact.new_block,
            };
            self.cancel();
            self.state = ProcessorState::SaveFailed;
            return Err(err);
        }

        self.state = ProcessorState::Saving;
        let res = Self::commit(ctx, &self.local, staged, accept).await;
        match res {
            Ok(()) => {
                self.state = ProcessorState::Saved;
                let block = staged.block.clone();
                tracing::info!(
                    height = %block.height(),
                    round = %block.round(),
                    block = %block.hash(),
                    "ISAAC processor - block saved"
                );
                METRICS
                    .operations_committed
                    .inc_by(block.operations.len() as u64);
                self.local.update_tip(ctx).await.wrap("update_tip()")?;
                if let Some(s) = block.states.iter().find(|s| s.key == POLICY_STATE_KEY) {
                    match self.local.policy.reload(Some(s)) {
                        Ok(true) => tracing::info!("ISAAC processor - policy reloaded"),
                        Ok(false) => {}
                        Err(err) => tracing::warn!("ISAAC processor - policy reload: {err:#}"),
                    }
                }
                Ok(block)
            }
            Err(err) => {
                self.cancel();
                self.state = ProcessorState::SaveFailed;
                Err(err)
            }
        }
    }

    async fn commit(
        ctx: &ctx::Ctx,
        local: &LocalContext,
        staged: &mut Staged,
        accept: &Voteproof,
    ) -> Result<(), SaveError> {
        let (Some(mut db_session), Some(mut bd_session)) =
            (staged.db_session.take(), staged.bd_session.take())
        else {
            return Err(SaveError::Internal(
                anyhow::format_err!("sessions of a prepared block are missing").into(),
            ));
        };
        staged.block.accept_voteproof = Some(accept.clone());
        let res: ctx::Result<_> = async {
            db_session
                .set_block(ctx, staged.block.clone())
                .await
                .wrap("db_session.set_block()")?;
            bd_session
                .set_accept_voteproof(ctx, accept)
                .await
                .wrap("bd_session.set_accept_voteproof()")?;
            commit_block(ctx, &*local.db, &*local.block_data, db_session, bd_session).await
        }
        .await;
        match res {
            Ok(_) => Ok(()),
            Err(ctx::Error::Canceled(err)) => Err(SaveError::Internal(err.into())),
            Err(ctx::Error::Internal(err)) => Err(SaveError::Commit(err)),
        }
    }
}

/// Runs [`build`] under `timeout_process_proposal`.
#[tracing::instrument(level = "debug", skip_all, fields(height = %proposal.height(), round = %proposal.round()))]
async fn prepare_timed(
    ctx: &ctx::Ctx,
    local: &LocalContext,
    proposal: &Ballot,
    init: &Voteproof,
) -> Result<Staged, PrepareError> {
    let timeout = local.policy.snapshot().timeout_process_proposal;
    let start = std::time::Instant::now();
    let pctx = &ctx.with_timeout(timeout);
    let mut res = build(pctx, local, proposal, init).await;
    if res.is_err() && !pctx.is_active() && ctx.is_active() {
        res = Err(PrepareError::Timeout(timeout));
    }
    METRICS.prepare_latency[&ResultLabel::of(&res)].observe(start.elapsed());
    if let Err(err) = &res {
        tracing::debug!("ISAAC processor - prepare failed: {err:#}");
    }
    res
}

/// Raised inside the preparer scope when a newer request arrives.
#[derive(Debug)]
struct Superseded;

/// Prepares the proposals requested through [`ProposalProcessor::start`],
/// one at a time, and reports each outcome to `done`. A newer request or
/// a cancel aborts the prepare in progress.
pub(crate) async fn run_preparer(
    ctx: &ctx::Ctx,
    local: &LocalContext,
    mut requests: sync::watch::Receiver<PrepareRequest>,
    done: impl Fn(Prepared) + Send,
) -> ctx::Result<()> {
    let mut last = 0;
    loop {
        let (generation, proposal, init) = sync::wait_for_some(ctx, &mut requests, |r| {
            let (proposal, init) = r.job.as_ref().filter(|_| r.generation > last)?;
            Some((r.generation, proposal.clone(), init.clone()))
        })
        .await?;
        last = generation;
        let mut newer = requests.clone();
        let res = scope::run!(ctx, |ctx, s| async {
            s.spawn_bg(async {
                // Canceled once the prepare below is done.
                let superseded = sync::wait_for(ctx, &mut newer, |r| r.generation != generation)
                    .await
                    .is_ok();
                if superseded {
                    return Err(Superseded);
                }
                Ok(())
            });
            Ok(prepare_timed(ctx, local, &proposal, &init).await)
        })
        .await;
        match res {
            Ok(res) => done(Prepared {
                generation,
                proposal,
                res,
            }),
            Err(Superseded) => {
                tracing::debug!(
                    proposal = %proposal.hash(),
                    "ISAAC processor - prepare superseded"
                );
            }
        }
        if !ctx.is_active() {
            return Err(ctx::Canceled.into());
        }
    }
}

/// Builds the block of `proposal` on top of the local tip and stages it in
/// new storage sessions.
async fn build(
    ctx: &ctx::Ctx,
    local: &LocalContext,
    proposal: &Ballot,
    init: &Voteproof,
) -> Result<Staged, PrepareError> {
    let policy = local.policy.snapshot();
    let Some(fact) = proposal.proposal() else {
        return Err(PrepareError::Stale("not a proposal".into()));
    };
    if init.height != fact.height || init.round != fact.round {
        return Err(PrepareError::Stale(format!(
            "INIT voteproof of {}/{}",
            init.height, init.round
        )));
    }
    let Some(finalized_at) = init.finalized_at else {
        return Err(PrepareError::Stale("INIT voteproof not finalized".into()));
    };
    if !proposal
        .signed_at()
        .within(finalized_at, policy.timespan_valid_ballot)
    {
        return Err(PrepareError::Stale(format!(
            "signed at {}, INIT voteproof finalized at {finalized_at}",
            proposal.signed_at()
        )));
    }

    let Some(base) = local
        .db
        .last_manifest(ctx)
        .await
        .wrap("db.last_manifest()")?
    else {
        return Err(PrepareError::BaseManifestNotFound);
    };
    if base.height.next() != fact.height {
        return Err(PrepareError::Stale(format!(
            "height {} on top of {}",
            fact.height, base.height
        )));
    }
    if init.majority_init().map(|f| f.previous_block) != Some(base.hash) {
        return Err(PrepareError::Stale("INIT voteproof does not link to the base".into()));
    }

    let ops = seals::extract(ctx, local, proposal)
        .await
        .map_err(|err| match err {
            ExtractError::Internal(err) => PrepareError::Internal(err),
            err => PrepareError::Extract(err),
        })?;
    let mut pool = StatePool::new(local.db.clone());
    let mut included = vec![];
    for op in ops {
        if local
            .db
            .has_operation(ctx, &op.hash)
            .await
            .wrap("db.has_operation()")?
        {
            tracing::debug!(operation = %op.hash, "ISAAC processor - operation already committed");
            continue;
        }
        match local.processors.process(ctx, &op, &mut pool).await {
            Ok(()) => included.push(op),
            Err(ProcessError::Ignore(reason)) => {
                tracing::debug!(operation = %op.hash, "ISAAC processor - operation ignored: {reason}");
            }
            Err(ProcessError::Internal(err @ ctx::Error::Canceled(_))) => return Err(err.into()),
            Err(ProcessError::Internal(ctx::Error::Internal(err))) => {
                return Err(PrepareError::Process(err));
            }
        }
    }
    included.extend(pool.added_operations().iter().cloned());

    let operations_tree = FixedTree::new(included.iter().map(|o| o.hash));
    let states = pool.stamped(fact.height);
    let states_tree = FixedTree::new(states.iter().map(|s| s.hash));
    let manifest = Manifest::new(
        fact.height,
        fact.round,
        proposal.hash(),
        base.hash,
        operations_tree.root(),
        states_tree.root(),
        proposal.signed_at(),
    );
    let block = Block {
        manifest,
        init_voteproof: init.clone(),
        accept_voteproof: None,
        operations: included,
        operations_tree,
        states,
        states_tree,
        proposal: proposal.clone(),
        suffrage_info: local.suffrage.acting(fact.height, fact.round).info(),
    };
    block
        .verify()
        .map_err(|err| PrepareError::Process(anyhow::Error::new(err).context("block.verify()")))?;

    let db_session = local
        .db
        .new_session(ctx, &block)
        .await
        .wrap("db.new_session()")?;
    let mut bd_session = local
        .block_data
        .new_session(ctx, block.height())
        .await
        .wrap("block_data.new_session()")?;
    write_block(ctx, bd_session.as_mut(), &block)
        .await
        .wrap("write_block()")?;
    Ok(Staged {
        proposal: proposal.hash(),
        block,
        db_session: Some(db_session),
        bd_session: Some(bd_session),
    })
}
