//! Fetches proposals the local node missed from the nodes that voted for them.
use crate::LocalContext;
use isaac_roles::{
    messages::{Ballot, Hash, Height, Round, Seal},
    node::Address,
};
use zksync_concurrency::{ctx, scope};

/// Proposal to fetch and the node to ask.
#[derive(Debug, Clone)]
pub(crate) struct FetchRequest {
    pub(crate) height: Height,
    pub(crate) round: Round,
    pub(crate) hash: Hash,
    pub(crate) from: Address,
}

/// Serves every request concurrently and reports each outcome to `done`:
/// the proposal if `from` returned a valid one, `None` otherwise.
pub(crate) async fn run_fetcher(
    ctx: &ctx::Ctx,
    local: &LocalContext,
    mut requests: ctx::channel::UnboundedReceiver<FetchRequest>,
    done: impl Fn(Hash, Option<Ballot>) + Send + Sync,
) -> ctx::Result<()> {
    let done = &done;
    scope::run!(ctx, |ctx, s| async {
        loop {
            let req = requests.recv(ctx).await?;
            s.spawn_bg(async move {
                let proposal = fetch_proposal(ctx, local, &req).await;
                done(req.hash, proposal);
                Ok(())
            });
        }
    })
    .await
}

async fn fetch_proposal(ctx: &ctx::Ctx, local: &LocalContext, req: &FetchRequest) -> Option<Ballot> {
    let channel = local.pool.channel(&req.from)?;
    let timeout = local.policy.snapshot().network_connection_timeout;
    let seals = match channel.seals(&ctx.with_timeout(timeout), &[req.hash]).await {
        Ok(seals) => seals,
        Err(err) => {
            tracing::debug!(from = %req.from, "ISAAC fetcher - fetching proposal: {err:#}");
            return None;
        }
    };
    let network_id = local.network_id();
    seals.into_iter().find_map(|seal| {
        let Seal::Ballot(p) = seal else { return None };
        let fact = p.proposal()?;
        let valid = p.hash() == req.hash
            && fact.height == req.height
            && fact.round == req.round
            && p.verify(&network_id).is_ok()
            && local.suffrage.is_proposer(fact.height, fact.round, p.signer())
            && local.pool.public_key(p.signer()).as_ref() == Some(&p.signed_fact.public_key);
        valid.then_some(p)
    })
}
