//! Search for the last block the local chain shares with the sources.
use crate::{
    syncer::{agree, fetch_manifests},
    SyncerError,
};
use isaac_network::RemoteNode;
use isaac_roles::messages::Height;
use isaac_storage::Database;
use zksync_concurrency::{ctx, error::Wrap as _, time};

/// Whether the local manifest at `height` matches the one agreed upon by `nodes`.
async fn agrees(
    ctx: &ctx::Ctx,
    db: &dyn Database,
    nodes: &[RemoteNode],
    threshold: u64,
    timeout: time::Duration,
    height: Height,
) -> Result<bool, SyncerError> {
    let Some(local) = db
        .manifest_by_height(ctx, height)
        .await
        .wrap("db.manifest_by_height()")?
    else {
        return Ok(false);
    };
    let answers = fetch_manifests(ctx, nodes, &[height], timeout).await?;
    let (remote, _) = agree(&[height], &answers, threshold)?;
    Ok(remote.get(&height).map(|m| m.hash) == Some(local.hash))
}

/// Binary-searches `[PRE_GENESIS, diverged)` for the greatest height at which
/// the local chain agrees with the sources. `diverged` must be a height at
/// which they disagree. Returns `None` if they disagree already at pre-genesis.
pub(crate) async fn find_common_height(
    ctx: &ctx::Ctx,
    db: &dyn Database,
    nodes: &[RemoteNode],
    threshold: u64,
    timeout: time::Duration,
    diverged: Height,
) -> Result<Option<Height>, SyncerError> {
    let mut lo = Height::PRE_GENESIS;
    if diverged <= lo || !agrees(ctx, db, nodes, threshold, timeout, lo).await? {
        return Ok(None);
    }
    let mut hi = diverged;
    // `lo` agrees and `hi` does not.
    while hi.0 - lo.0 > 1 {
        let mid = Height(lo.0 + (hi.0 - lo.0) / 2);
        if agrees(ctx, db, nodes, threshold, timeout, mid).await? {
            lo = mid;
        } else {
            hi = mid;
        }
        tracing::debug!(%lo, %hi, "ISAAC syncer - rollback search");
    }
    Ok(Some(lo))
}
