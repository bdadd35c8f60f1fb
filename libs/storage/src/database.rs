//! Block database interface.
use isaac_roles::messages::{
    Ballot, Block, BlockDataMap, Hash, Height, Manifest, OperationSeal, Round, Seal, Stage, State,
    Voteproof,
};
use std::{fmt, sync::Arc};
use zksync_concurrency::ctx;

/// Iteration order of listing queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// Oldest first.
    #[default]
    Ascending,
    /// Newest first.
    Descending,
}

/// Persistent storage of manifests, blocks, seals, proposals, voteproofs and states.
///
/// Reads observe only committed data: a block staged in a [`DatabaseSession`]
/// becomes visible atomically when the session commits.
#[async_trait::async_trait]
pub trait Database: 'static + fmt::Debug + Send + Sync {
    /// Manifest of the block with the greatest height.
    async fn last_manifest(&self, ctx: &ctx::Ctx) -> ctx::Result<Option<Manifest>>;
    /// Manifest of the block with the given hash.
    async fn manifest(&self, ctx: &ctx::Ctx, hash: &Hash) -> ctx::Result<Option<Manifest>>;
    /// Manifest of the block at the given height.
    async fn manifest_by_height(
        &self,
        ctx: &ctx::Ctx,
        height: Height,
    ) -> ctx::Result<Option<Manifest>>;
    /// Block with the given hash.
    async fn block(&self, ctx: &ctx::Ctx, hash: &Hash) -> ctx::Result<Option<Block>>;
    /// Block at the given height.
    async fn block_by_height(&self, ctx: &ctx::Ctx, height: Height) -> ctx::Result<Option<Block>>;

    /// Seal with the given hash.
    async fn seal(&self, ctx: &ctx::Ctx, hash: &Hash) -> ctx::Result<Option<Seal>>;
    /// All stored seals, in insertion order.
    async fn seals(&self, ctx: &ctx::Ctx, order: Order) -> ctx::Result<Vec<Seal>>;
    /// Stores seals. Already stored seals are skipped.
    async fn new_seals(&self, ctx: &ctx::Ctx, seals: &[Seal]) -> ctx::Result<()>;
    /// Operation seals holding at least one operation which no committed block
    /// includes, oldest first, at most `limit` of them.
    async fn staged_operation_seals(
        &self,
        ctx: &ctx::Ctx,
        limit: usize,
    ) -> ctx::Result<Vec<OperationSeal>>;

    /// Proposal for the given height and round.
    async fn proposal(
        &self,
        ctx: &ctx::Ctx,
        height: Height,
        round: Round,
    ) -> ctx::Result<Option<Ballot>>;
    /// All stored proposals, ordered by (height, round).
    async fn proposals(&self, ctx: &ctx::Ctx, order: Order) -> ctx::Result<Vec<Ballot>>;
    /// Stores a proposal. A second proposal for the same (height, round) is ignored.
    async fn new_proposal(&self, ctx: &ctx::Ctx, proposal: &Ballot) -> ctx::Result<()>;

    /// Records the last INIT voteproof acted upon.
    async fn new_init_voteproof(&self, ctx: &ctx::Ctx, vp: &Voteproof) -> ctx::Result<()>;
    /// Records the last ACCEPT voteproof acted upon.
    async fn new_accept_voteproof(&self, ctx: &ctx::Ctx, vp: &Voteproof) -> ctx::Result<()>;
    /// Latest recorded voteproof of the given stage, by (height, round).
    async fn last_voteproof(&self, ctx: &ctx::Ctx, stage: Stage)
        -> ctx::Result<Option<Voteproof>>;
    /// Latest recorded voteproof of the given stage at the given height.
    async fn last_voteproof_of_height(
        &self,
        ctx: &ctx::Ctx,
        height: Height,
        stage: Stage,
    ) -> ctx::Result<Option<Voteproof>>;

    /// Latest committed version of the state with the given key.
    async fn state(&self, ctx: &ctx::Ctx, key: &str) -> ctx::Result<Option<State>>;
    /// Writes a state outside of a block session.
    async fn new_state(&self, ctx: &ctx::Ctx, state: &State) -> ctx::Result<()>;
    /// Whether an operation with the given hash is included in a committed block.
    async fn has_operation(&self, ctx: &ctx::Ctx, hash: &Hash) -> ctx::Result<bool>;
    /// Whether an operation with the given fact hash is included in a committed block.
    async fn has_operation_fact(&self, ctx: &ctx::Ctx, fact: &Hash) -> ctx::Result<bool>;

    /// Block-data map of the block at the given height.
    async fn block_data_map(
        &self,
        ctx: &ctx::Ctx,
        height: Height,
    ) -> ctx::Result<Option<BlockDataMap>>;

    /// Opens a session staging `block` for commit.
    async fn new_session(
        &self,
        ctx: &ctx::Ctx,
        block: &Block,
    ) -> ctx::Result<Box<dyn DatabaseSession>>;

    /// Removes everything.
    async fn clean(&self, ctx: &ctx::Ctx) -> ctx::Result<()>;
    /// Removes blocks, states, operations, voteproofs and maps at `height` and above.
    async fn clean_by_height(&self, ctx: &ctx::Ctx, height: Height) -> ctx::Result<()>;
}

/// A single block staged for commit.
///
/// A session is committed or cancelled exactly once. Dropping an open
/// session cancels it.
#[async_trait::async_trait]
pub trait DatabaseSession: fmt::Debug + Send + Sync {
    /// Staged block.
    fn block(&self) -> &Block;
    /// Replaces the staged block. The height must not change.
    async fn set_block(&mut self, ctx: &ctx::Ctx, block: Block) -> ctx::Result<()>;
    /// Atomically writes the staged block, its states and operations, its
    /// voteproofs and the block-data map. Requires an ACCEPT voteproof.
    async fn commit(&mut self, ctx: &ctx::Ctx, map: &BlockDataMap) -> ctx::Result<()>;
    /// Closes a committed session. Closing an uncommitted session cancels it.
    fn close(&mut self);
    /// Discards the staged block.
    fn cancel(&mut self);
}

#[async_trait::async_trait]
impl<D: Database + ?Sized> Database for Arc<D> {
    async fn last_manifest(&self, ctx: &ctx::Ctx) -> ctx::Result<Option<Manifest>> {
        (**self).last_manifest(ctx).await
    }

    async fn manifest(&self, ctx: &ctx::Ctx, hash: &Hash) -> ctx::Result<Option<Manifest>> {
        (**self).manifest(ctx, hash).await
    }

    async fn manifest_by_height(
        &self,
        ctx: &ctx::Ctx,
        height: Height,
    ) -> ctx::Result<Option<Manifest>> {
        (**self).manifest_by_height(ctx, height).await
    }

    async fn block(&self, ctx: &ctx::Ctx, hash: &Hash) -> ctx::Result<Option<Block>> {
        (**self).block(ctx, hash).await
    }

    async fn block_by_height(&self, ctx: &ctx::Ctx, height: Height) -> ctx::Result<Option<Block>> {
        (**self).block_by_height(ctx, height).await
    }

    async fn seal(&self, ctx: &ctx::Ctx, hash: &Hash) -> ctx::Result<Option<Seal>> {
        (**self).seal(ctx, hash).await
    }

    async fn seals(&self, ctx: &ctx::Ctx, order: Order) -> ctx::Result<Vec<Seal>> {
        (**self).seals(ctx, order).await
    }

    async fn new_seals(&self, ctx: &ctx::Ctx, seals: &[Seal]) -> ctx::Result<()> {
        (**self).new_seals(ctx, seals).await
    }

    async fn staged_operation_seals(
        &self,
        ctx: &ctx::Ctx,
        limit: usize,
    ) -> ctx::Result<Vec<OperationSeal>> {
        (**self).staged_operation_seals(ctx, limit).await
    }

    async fn proposal(
        &self,
        ctx: &ctx::Ctx,
        height: Height,
        round: Round,
    ) -> ctx::Result<Option<Ballot>> {
        (**self).proposal(ctx, height, round).await
    }

    async fn proposals(&self, ctx: &ctx::Ctx, order: Order) -> ctx::Result<Vec<Ballot>> {
        (**self).proposals(ctx, order).await
    }

    async fn new_proposal(&self, ctx: &ctx::Ctx, proposal: &Ballot) -> ctx::Result<()> {
        (**self).new_proposal(ctx, proposal).await
    }

    async fn new_init_voteproof(&self, ctx: &ctx::Ctx, vp: &Voteproof) -> ctx::Result<()> {
        (**self).new_init_voteproof(ctx, vp).await
    }

    async fn new_accept_voteproof(&self, ctx: &ctx::Ctx, vp: &Voteproof) -> ctx::Result<()> {
        (**self).new_accept_voteproof(ctx, vp).await
    }

    async fn last_voteproof(
        &self,
        ctx: &ctx::Ctx,
        stage: Stage,
    ) -> ctx::Result<Option<Voteproof>> {
        (**self).last_voteproof(ctx, stage).await
    }

    async fn last_voteproof_of_height(
        &self,
        ctx: &ctx::Ctx,
        height: Height,
        stage: Stage,
    ) -> ctx::Result<Option<Voteproof>> {
        (**self).last_voteproof_of_height(ctx, height, stage).await
    }

    async fn state(&self, ctx: &ctx::Ctx, key: &str) -> ctx::Result<Option<State>> {
        (**self).state(ctx, key).await
    }

    async fn new_state(&self, ctx: &ctx::Ctx, state: &State) -> ctx::Result<()> {
        (**self).new_state(ctx, state).await
    }

    async fn has_operation(&self, ctx: &ctx::Ctx, hash: &Hash) -> ctx::Result<bool> {
        (**self).has_operation(ctx, hash).await
    }

    async fn has_operation_fact(&self, ctx: &ctx::Ctx, fact: &Hash) -> ctx::Result<bool> {
        (**self).has_operation_fact(ctx, fact).await
    }

    async fn block_data_map(
        &self,
        ctx: &ctx::Ctx,
        height: Height,
    ) -> ctx::Result<Option<BlockDataMap>> {
        (**self).block_data_map(ctx, height).await
    }

    async fn new_session(
        &self,
        ctx: &ctx::Ctx,
        block: &Block,
    ) -> ctx::Result<Box<dyn DatabaseSession>> {
        (**self).new_session(ctx, block).await
    }

    async fn clean(&self, ctx: &ctx::Ctx) -> ctx::Result<()> {
        (**self).clean(ctx).await
    }

    async fn clean_by_height(&self, ctx: &ctx::Ctx, height: Height) -> ctx::Result<()> {
        (**self).clean_by_height(ctx, height).await
    }
}

/// Checks that `block` is complete enough to be committed on top of `last`.
pub fn check_commit(last: Option<&Manifest>, block: &Block) -> anyhow::Result<()> {
    anyhow::ensure!(
        block.accept_voteproof.is_some(),
        "block {} has no ACCEPT voteproof",
        block.height()
    );
    if let Some(last) = last {
        anyhow::ensure!(
            block.height() == last.height.next(),
            "block {} does not follow the last block {}",
            block.height(),
            last.height
        );
        anyhow::ensure!(
            block.manifest.previous_block == last.hash,
            "block {} does not link to the last block",
            block.height()
        );
    }
    Ok(())
}
