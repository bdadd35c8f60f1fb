//! Storage of an ISAAC node.
//!
//! - [`Database`]: manifests, blocks, seals, proposals, voteproofs and states.
//!   Blocks are written through a [`DatabaseSession`], atomically.
//! - [`BlockData`]: append-only archive of full blocks, split in datasets.
//!   [`localfs::LocalFs`] keeps it on the local filesystem.
//!
//! A block is considered stored once both sides have committed it; see
//! [`commit_block`] and [`clean_by_height`].

mod block_data;
mod database;
mod in_memory;
pub mod localfs;
mod metrics;
pub mod testonly;
#[cfg(test)]
mod tests;

pub use block_data::{write_block, BlockData, BlockDataSession};
pub use database::{check_commit, Database, DatabaseSession, Order};
pub use in_memory::InMemoryDatabase;

use isaac_roles::messages::{Block, BlockDataMap, Height};
use zksync_concurrency::{ctx, error::Wrap as _};

/// Removes blocks at `height` and above from both the database and the block-data store.
pub async fn clean_by_height(
    ctx: &ctx::Ctx,
    db: &dyn Database,
    block_data: &dyn BlockData,
    height: Height,
) -> ctx::Result<()> {
    db.clean_by_height(ctx, height)
        .await
        .wrap("db.clean_by_height()")?;
    block_data
        .clean_by_height(ctx, height)
        .await
        .wrap("block_data.clean_by_height()")?;
    tracing::info!(%height, "ISAAC storage - removed blocks from height");
    Ok(())
}

/// Commits a staged block: the database session first, then the block-data
/// session. If either fails, both are rolled back.
pub async fn commit_block(
    ctx: &ctx::Ctx,
    db: &dyn Database,
    block_data: &dyn BlockData,
    mut db_session: Box<dyn DatabaseSession>,
    bd_session: Box<dyn BlockDataSession>,
) -> ctx::Result<BlockDataMap> {
    let height = db_session.block().height();
    let t = std::time::Instant::now();
    let res = commit_sessions(ctx, db, block_data, db_session.as_mut(), bd_session).await;
    db_session.close();
    match res {
        Ok(map) => {
            metrics::METRICS.commit_latency.observe(t.elapsed());
            Ok(map)
        }
        Err(err) => {
            // Leftovers of a partially saved block must not survive.
            if let Err(rm) = block_data.remove_all(ctx, height).await {
                tracing::warn!(%height, "ISAAC storage - failed to remove block-data: {rm:#}");
            }
            Err(err)
        }
    }
}

async fn commit_sessions(
    ctx: &ctx::Ctx,
    db: &dyn Database,
    block_data: &dyn BlockData,
    db_session: &mut dyn DatabaseSession,
    mut bd_session: Box<dyn BlockDataSession>,
) -> ctx::Result<BlockDataMap> {
    let height = db_session.block().height();
    let map = bd_session.done(ctx).await.wrap("bd_session.done()")?;
    db_session
        .commit(ctx, &map)
        .await
        .wrap("db_session.commit()")?;
    match block_data.save_session(ctx, bd_session).await {
        Ok(map) => Ok(map),
        Err(err) => {
            db.clean_by_height(ctx, height)
                .await
                .wrap("db.clean_by_height()")?;
            Err(err.wrap("block_data.save_session()"))
        }
    }
}

/// Writes a complete block, as fetched from another node, into both stores.
pub async fn store_block(
    ctx: &ctx::Ctx,
    db: &dyn Database,
    block_data: &dyn BlockData,
    block: &Block,
) -> ctx::Result<BlockDataMap> {
    let db_session = db.new_session(ctx, block).await.wrap("db.new_session()")?;
    let mut bd_session = block_data
        .new_session(ctx, block.height())
        .await
        .wrap("block_data.new_session()")?;
    write_block(ctx, bd_session.as_mut(), block)
        .await
        .wrap("write_block()")?;
    commit_block(ctx, db, block_data, db_session, bd_session).await
}
