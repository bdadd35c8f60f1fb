//! Block-data store interface.
use isaac_roles::messages::{
    Ballot, Block, BlockDataMap, Dataset, Height, Manifest, Operation, State, Voteproof,
};
use isaac_roles::{messages::SuffrageInfo, tree::FixedTree};
use std::{fmt, sync::Arc};
use zksync_concurrency::ctx;

/// Append-only archive of full blocks, one dataset per file.
#[async_trait::async_trait]
pub trait BlockData: 'static + fmt::Debug + Send + Sync {
    /// Opens a session writing the datasets of the block at `height`.
    async fn new_session(
        &self,
        ctx: &ctx::Ctx,
        height: Height,
    ) -> ctx::Result<Box<dyn BlockDataSession>>;
    /// Moves the datasets written by `session` into place.
    async fn save_session(
        &self,
        ctx: &ctx::Ctx,
        session: Box<dyn BlockDataSession>,
    ) -> ctx::Result<BlockDataMap> {
        let mut session = session;
        session.save(ctx).await
    }
    /// Whether a block is stored at `height`.
    async fn exists(&self, ctx: &ctx::Ctx, height: Height) -> ctx::Result<bool>;
    /// Removes the block stored at `height`. Returns false if there was none.
    async fn remove(&self, ctx: &ctx::Ctx, height: Height) -> ctx::Result<bool>;
    /// Removes the block stored at `height` together with unsaved sessions for it.
    async fn remove_all(&self, ctx: &ctx::Ctx, height: Height) -> ctx::Result<()>;
    /// Removes every stored block; with `remove_root` also the root directory.
    async fn clean(&self, ctx: &ctx::Ctx, remove_root: bool) -> ctx::Result<()>;
    /// Removes blocks at `height` and above.
    async fn clean_by_height(&self, ctx: &ctx::Ctx, height: Height) -> ctx::Result<()>;
    /// Block-data map of the block stored at `height`.
    async fn map(&self, ctx: &ctx::Ctx, height: Height) -> ctx::Result<Option<BlockDataMap>>;
    /// Stored (compressed) bytes behind a dataset URL.
    async fn read(&self, ctx: &ctx::Ctx, url: &str) -> ctx::Result<Vec<u8>>;
}

/// Datasets of a single block, staged before being saved.
///
/// Dropping an unsaved session discards what it wrote.
#[async_trait::async_trait]
pub trait BlockDataSession: fmt::Debug + Send + Sync {
    /// Height of the staged block.
    fn height(&self) -> Height;
    /// Writes the manifest.
    async fn set_manifest(&mut self, ctx: &ctx::Ctx, manifest: &Manifest) -> ctx::Result<()>;
    /// Buffers operations until `close_operations`.
    async fn add_operations(&mut self, ctx: &ctx::Ctx, ops: &[Operation]) -> ctx::Result<()>;
    /// Writes the buffered operations.
    async fn close_operations(&mut self, ctx: &ctx::Ctx) -> ctx::Result<()>;
    /// Writes the operations tree.
    async fn set_operations_tree(&mut self, ctx: &ctx::Ctx, tree: &FixedTree) -> ctx::Result<()>;
    /// Buffers states until `close_states`.
    async fn add_states(&mut self, ctx: &ctx::Ctx, states: &[State]) -> ctx::Result<()>;
    /// Writes the buffered states.
    async fn close_states(&mut self, ctx: &ctx::Ctx) -> ctx::Result<()>;
    /// Writes the states tree.
    async fn set_states_tree(&mut self, ctx: &ctx::Ctx, tree: &FixedTree) -> ctx::Result<()>;
    /// Writes the INIT voteproof.
    async fn set_init_voteproof(&mut self, ctx: &ctx::Ctx, vp: &Voteproof) -> ctx::Result<()>;
    /// Writes the ACCEPT voteproof.
    async fn set_accept_voteproof(&mut self, ctx: &ctx::Ctx, vp: &Voteproof)
        -> ctx::Result<()>;
    /// Writes the suffrage info.
    async fn set_suffrage_info(&mut self, ctx: &ctx::Ctx, info: &SuffrageInfo)
        -> ctx::Result<()>;
    /// Writes the proposal.
    async fn set_proposal(&mut self, ctx: &ctx::Ctx, proposal: &Ballot) -> ctx::Result<()>;
    /// Writes an already encoded dataset, as read from another node's store.
    async fn import(&mut self, ctx: &ctx::Ctx, dataset: Dataset, raw: &[u8]) -> ctx::Result<()>;
    /// Checks that every dataset was written and returns the map the block will be saved under.
    async fn done(&mut self, ctx: &ctx::Ctx) -> ctx::Result<BlockDataMap>;
    /// Moves the written datasets into place.
    async fn save(&mut self, ctx: &ctx::Ctx) -> ctx::Result<BlockDataMap>;
    /// Discards everything written.
    fn cancel(&mut self);
}

#[async_trait::async_trait]
impl<B: BlockData + ?Sized> BlockData for Arc<B> {
    async fn new_session(
        &self,
        ctx: &ctx::Ctx,
        height: Height,
    ) -> ctx::Result<Box<dyn BlockDataSession>> {
        (**self).new_session(ctx, height).await
    }

    async fn save_session(
        &self,
        ctx: &ctx::Ctx,
        session: Box<dyn BlockDataSession>,
    ) -> ctx::Result<BlockDataMap> {
        (**self).save_session(ctx, session).await
    }

    async fn exists(&self, ctx: &ctx::Ctx, height: Height) -> ctx::Result<bool> {
        (**self).exists(ctx, height).await
    }

    async fn remove(&self, ctx: &ctx::Ctx, height: Height) -> ctx::Result<bool> {
        (**self).remove(ctx, height).await
    }

    async fn remove_all(&self, ctx: &ctx::Ctx, height: Height) -> ctx::Result<()> {
        (**self).remove_all(ctx, height).await
    }

    async fn clean(&self, ctx: &ctx::Ctx, remove_root: bool) -> ctx::Result<()> {
        (**self).clean(ctx, remove_root).await
    }

    async fn clean_by_height(&self, ctx: &ctx::Ctx, height: Height) -> ctx::Result<()> {
        (**self).clean_by_height(ctx, height).await
    }

    async fn map(&self, ctx: &ctx::Ctx, height: Height) -> ctx::Result<Option<BlockDataMap>> {
        (**self).map(ctx, height).await
    }

    async fn read(&self, ctx: &ctx::Ctx, url: &str) -> ctx::Result<Vec<u8>> {
        (**self).read(ctx, url).await
    }
}

/// Writes every dataset of a complete block into `session`.
pub async fn write_block(
    ctx: &ctx::Ctx,
    session: &mut dyn BlockDataSession,
    block: &Block,
) -> ctx::Result<()> {
    session.set_init_voteproof(ctx, &block.init_voteproof).await?;
    session.set_suffrage_info(ctx, &block.suffrage_info).await?;
    session.set_proposal(ctx, &block.proposal).await?;
    session.add_operations(ctx, &block.operations).await?;
    session.close_operations(ctx).await?;
    session
        .set_operations_tree(ctx, &block.operations_tree)
        .await?;
    session.add_states(ctx, &block.states).await?;
    session.close_states(ctx).await?;
    session.set_states_tree(ctx, &block.states_tree).await?;
    session.set_manifest(ctx, &block.manifest).await?;
    if let Some(vp) = &block.accept_voteproof {
        session.set_accept_voteproof(ctx, vp).await?;
    }
    Ok(())
}
