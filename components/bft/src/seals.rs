//! Materializes the operations a proposal refers to.
use crate::LocalContext;
use isaac_network::ChannelError;
use isaac_roles::messages::{Ballot, Hash, Operation, OperationSeal, Seal};
use std::collections::{BTreeMap, BTreeSet};
use zksync_concurrency::{ctx, error::Wrap};

/// Error returned by [`extract`].
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// Operations which could be found neither locally nor at the proposer.
    #[error("missing operations {0:?}")]
    Missing(Vec<Hash>),
    /// The proposer could not be asked for the missing seals.
    #[error("channel: {0}")]
    Channel(#[source] ChannelError),
    /// Internal error.
    #[error(transparent)]
    Internal(#[from] ctx::Error),
}

impl Wrap for ExtractError {
    fn with_wrap<C: std::fmt::Display + Send + Sync + 'static, F: FnOnce() -> C>(
        self,
        f: F,
    ) -> Self {
        match self {
            ExtractError::Internal(err) => ExtractError::Internal(err.with_wrap(f)),
            err => err,
        }
    }
}

/// Operations listed by `proposal`, in proposal order, without duplicates.
///
/// Seals are looked up locally first; the missing ones are requested from
/// the proposer and stored.
pub(crate) async fn extract(
    ctx: &ctx::Ctx,
    local: &LocalContext,
    proposal: &Ballot,
) -> Result<Vec<Operation>, ExtractError> {
    let Some(fact) = proposal.proposal() else {
        return Ok(vec![]);
    };
    let mut seals = BTreeMap::<Hash, OperationSeal>::new();
    let mut missing = vec![];
    for h in fact.seals() {
        match local.db.seal(ctx, &h).await.wrap("db.seal()")? {
            Some(Seal::Operations(s)) => {
                seals.insert(h, s);
            }
            _ => missing.push(h),
        }
    }

    if !missing.is_empty() {
        if &fact.proposer == local.address() {
            tracing::warn!(
                height = %fact.height,
                round = %fact.round,
                "ISAAC extractor - local proposal refers to {} unknown seals",
                missing.len()
            );
        }
        if let Some(channel) = local.pool.channel(&fact.proposer) {
            let timeout = local.policy.snapshot().network_connection_timeout;
            let network_id = local.network_id();
            let received = channel
                .seals(&ctx.with_timeout(timeout), &missing)
                .await
                .map_err(ExtractError::Channel)?;
            let mut fetched = vec![];
            for seal in received {
                let Seal::Operations(s) = &seal else { continue };
                if !missing.contains(&s.hash()) {
                    continue;
                }
                if let Err(err) = s.verify(&network_id) {
                    tracing::warn!("ISAAC extractor - invalid seal from {}: {err:#}", fact.proposer);
                    continue;
                }
                seals.insert(s.hash(), s.clone());
                fetched.push(seal);
            }
            local
                .db
                .new_seals(ctx, &fetched)
                .await
                .wrap("db.new_seals()")?;
        }
    }

    let mut ops = vec![];
    let mut seen = BTreeSet::new();
    let mut unresolved = vec![];
    for info in &fact.operations {
        if !seen.insert(info.operation) {
            continue;
        }
        let op = seals
            .get(&info.seal)
            .and_then(|s| s.operations.iter().find(|o| o.hash == info.operation));
        match op {
            Some(op) => ops.push(op.clone()),
            None => unresolved.push(info.operation),
        }
    }
    if !unresolved.is_empty() {
        return Err(ExtractError::Missing(unresolved));
    }
    Ok(ops)
}
