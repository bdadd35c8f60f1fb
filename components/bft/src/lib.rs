//! ISAAC consensus component.
//!
//! A node moves between five states (Booting, Joining, Consensus, Syncing,
//! Broken). In Consensus it runs the rounds of the next height: INIT ballots
//! agree on the previous block, the proposer broadcasts a proposal, SIGN and
//! ACCEPT ballots agree on the block built from it. A node which falls behind
//! or finds its chain forked switches to Syncing and fetches blocks from
//! the nodes that vouched for the newer ones.
//!
//! Everything a node needs is gathered in a [`LocalContext`];
//! [`LocalContext::run`] drives the state machine over a stream of inbound seals.

use isaac_roles::messages::Seal;
use isaac_sync::Syncers;
use std::sync::Arc;
use zksync_concurrency::{ctx, error::Wrap as _, scope};

mod ballotbox;
mod checker;
mod context;
mod fetcher;
pub mod genesis;
mod handlers;
mod metrics;
pub mod operations;
mod processor;
mod proposal_maker;
mod seals;
mod state_pool;
mod states;
pub mod testonly;
#[cfg(test)]
mod tests;
mod timers;

pub use ballotbox::{Ballotbox, VoteError, VOTE_WINDOW};
pub use checker::CheckError;
pub use context::LocalContext;
pub use handlers::ConsensusState;
pub use processor::{PrepareError, ProcessorState, ProposalProcessor, SaveError};
pub use seals::ExtractError;
pub use state_pool::StatePool;

impl LocalContext {
    /// Runs the consensus state machine of the node until `ctx` is canceled.
    ///
    /// `inbound` carries the seals received from other nodes, usually fed by
    /// an [`isaac_network::Handler`]. Seals broadcast by the local node are
    /// sent to every node in the pool and delivered to the local state
    /// machine as well.
    pub async fn run(
        self: Arc<Self>,
        ctx: &ctx::Ctx,
        mut inbound: ctx::channel::UnboundedReceiver<Seal>,
    ) -> anyhow::Result<()> {
        let (events_send, mut events_recv) = ctx::channel::unbounded();
        let (outbound_send, mut outbound_recv) = ctx::channel::unbounded::<Seal>();
        let (sync_send, mut sync_recv) = ctx::channel::unbounded();
        let (fetch_send, fetch_recv) = ctx::channel::unbounded();
        let syncers = Arc::new(Syncers::new(
            self.db.clone(),
            self.block_data.clone(),
            self.policy.clone(),
            self.pool.keyring(),
            sync_send,
        ));
        let machine = states::StateMachine::new(handlers::Env::new(
            self.clone(),
            syncers.clone(),
            outbound_send,
            fetch_send,
        ));
        let prepare_requests = machine.prepare_requests();

        let res = scope::run!(ctx, |ctx, s| async {
            tracing::info!(local = %self.address(), "ISAAC node - starting");
            s.spawn_bg(async { syncers.run(ctx).await.map_err(ctx::Error::Internal) });
            s.spawn_bg(async {
                loop {
                    let seal = inbound.recv(ctx).await?;
                    events_send.send(states::Event::Seal(seal));
                }
            });
            s.spawn_bg(async {
                loop {
                    let event = sync_recv.recv(ctx).await?;
                    events_send.send(states::Event::Sync(event));
                }
            });
            s.spawn_bg(processor::run_preparer(ctx, &self, prepare_requests, {
                let events = events_send.clone();
                move |done| events.send(states::Event::Prepared(done))
            }));
            s.spawn_bg(fetcher::run_fetcher(ctx, &self, fetch_recv, {
                let events = events_send.clone();
                move |hash, proposal| events.send(states::Event::Fetched { hash, proposal })
            }));
            s.spawn_bg(async {
                loop {
                    let seal = outbound_recv.recv(ctx).await?;
                    events_send.send(states::Event::Seal(seal.clone()));
                    let timeout = self.policy.snapshot().network_connection_timeout;
                    let seal = Arc::new(seal);
                    for remote in self.pool.remotes() {
                        let seal = seal.clone();
                        s.spawn_bg(async move {
                            let ctx = &ctx.with_timeout(timeout);
                            if let Err(err) = remote.channel.send_seal(ctx, &seal).await {
                                tracing::debug!(
                                    to = %remote.node.address,
                                    "ISAAC node - failed to send seal: {err:#}"
                                );
                            }
                            Ok(())
                        });
                    }
                }
            });
            machine
                .run(ctx, &mut events_recv)
                .await
                .wrap("StateMachine::run()")
        })
        .await;
        match res {
            Ok(()) | Err(ctx::Error::Canceled(_)) => Ok(()),
            Err(ctx::Error::Internal(err)) => Err(err),
        }
    }
}
