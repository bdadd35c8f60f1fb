//! Proposals of the local node.
use crate::LocalContext;
use isaac_roles::messages::{Ballot, Height, OperationInfo, ProposalFact, Round, Voteproof};
use std::collections::BTreeSet;
use zksync_concurrency::{ctx, error::Wrap as _};

/// Builds the proposal of the local node for `(height, round)` over the staged
/// operation seals, oldest first, skipping operations already in a block.
/// Only the seals the database still lists as staged are read.
///
/// A proposal already made for the same height and round is returned as is,
/// so that rebroadcasts do not create competing proposals.
pub(crate) async fn make_proposal(
    ctx: &ctx::Ctx,
    local: &LocalContext,
    height: Height,
    round: Round,
    init: &Voteproof,
) -> ctx::Result<Ballot> {
    if let Some(p) = local
        .db
        .proposal(ctx, height, round)
        .await
        .wrap("db.proposal()")?
    {
        if p.signer() == local.address() {
            return Ok(p);
        }
    }
    let max = local.policy.snapshot().max_operations_in_proposal as usize;
    let mut operations = vec![];
    let mut seen = BTreeSet::new();
    'seals: for s in local
        .db
        .staged_operation_seals(ctx, max)
        .await
        .wrap("db.staged_operation_seals()")?
    {
        for op in &s.operations {
            if operations.len() >= max {
                break 'seals;
            }
            if !seen.insert(op.hash) {
                continue;
            }
            if local
                .db
                .has_operation(ctx, &op.hash)
                .await
                .wrap("db.has_operation()")?
            {
                continue;
            }
            operations.push(OperationInfo {
                operation: op.hash,
                seal: s.hash(),
            });
        }
    }
    let fact = ProposalFact {
        height,
        round,
        proposer: local.address().clone(),
        operations,
    };
    tracing::debug!(
        %height,
        %round,
        operations = fact.operations.len(),
        "ISAAC proposal maker - new proposal"
    );
    Ok(Ballot::sign(
        &local.local,
        &local.network_id(),
        fact.into(),
        Some(init.clone()),
        local.now(ctx),
    ))
}
