//! Executor of an ISAAC node: wires the consensus state machine to storage and to a
//! network transport. Kept as a library so that the tools crate can embed it.
use anyhow::Context as _;
use isaac_bft::LocalContext;
use isaac_network::{Channel, Handler, LocalNetwork, NodePool};
use isaac_roles::{
    messages::Seal,
    node::{Address, LocalNode, Node},
    policy::{LocalPolicy, PolicySnapshot},
    suffrage::RoundRobinSuffrage,
};
use isaac_storage::{BlockData, Database};
use std::{collections::HashSet, fmt, sync::Arc};
use zksync_concurrency::{ctx, scope};

#[cfg(test)]
mod tests;

/// Config of the node executor.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of the node.
    pub local: LocalNode,
    /// Every member of the suffrage, the local node included.
    pub suffrage: Vec<Node>,
    /// Initial policy. Booting may replace it with the policy of the network.
    pub policy: PolicySnapshot,
}

impl Config {
    /// Checks the config for consistency.
    pub fn check(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.suffrage.is_empty(), "empty suffrage");
        let mut seen = HashSet::new();
        for node in &self.suffrage {
            anyhow::ensure!(
                seen.insert(&node.address),
                "duplicate suffrage member {}",
                node.address
            );
        }
        let local = self
            .suffrage
            .iter()
            .find(|n| n.address == self.local.address)
            .with_context(|| format!("local node {} is not in the suffrage", self.local.address))?;
        anyhow::ensure!(
            local.public_key == self.local.key.public(),
            "public key of {} in the suffrage does not match the secret key",
            self.local.address
        );
        anyhow::ensure!(
            self.policy.number_of_acting_suffrage_nodes <= self.suffrage.len() as u64,
            "{} acting nodes out of a suffrage of {}",
            self.policy.number_of_acting_suffrage_nodes,
            self.suffrage.len()
        );
        self.policy.verify().context("policy")
    }
}

/// Carries channel calls between nodes.
#[async_trait::async_trait]
pub trait Transport: 'static + fmt::Debug + Send + Sync {
    /// Channel from the local node `from` to the remote node `to`.
    fn channel(&self, from: &Address, to: &Node) -> anyhow::Result<Arc<dyn Channel>>;
    /// Answers calls addressed to `address` with `handler` until `ctx` is canceled.
    async fn serve(
        &self,
        ctx: &ctx::Ctx,
        address: &Address,
        handler: Arc<Handler>,
    ) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl Transport for LocalNetwork {
    fn channel(&self, from: &Address, to: &Node) -> anyhow::Result<Arc<dyn Channel>> {
        Ok(LocalNetwork::channel(self, from, &to.address))
    }

    async fn serve(
        &self,
        ctx: &ctx::Ctx,
        address: &Address,
        handler: Arc<Handler>,
    ) -> anyhow::Result<()> {
        self.register(address.clone(), handler);
        ctx.canceled().await;
        self.unregister(address);
        Ok(())
    }
}

/// Executor allowing to spin up all components necessary for a consensus node.
#[derive(Debug)]
pub struct Executor {
    local: Arc<LocalContext>,
    handler: Arc<Handler>,
    inbound: ctx::channel::UnboundedReceiver<Seal>,
    transport: Arc<dyn Transport>,
}

impl Executor {
    /// Constructs the components of a node. Nothing runs until [`Executor::run`].
    pub fn new(
        config: Config,
        db: Arc<dyn Database>,
        block_data: Arc<dyn BlockData>,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Self> {
        config.check().context("config")?;
        let policy = Arc::new(LocalPolicy::new(config.policy.clone()).context("LocalPolicy::new()")?);
        let suffrage = Arc::new(
            RoundRobinSuffrage::new(
                config.suffrage.iter().map(|n| n.address.clone()).collect(),
                config.policy.number_of_acting_suffrage_nodes as usize,
            )
            .context("RoundRobinSuffrage::new()")?,
        );
        let pool = Arc::new(NodePool::new(config.local.node()));
        for node in config
            .suffrage
            .iter()
            .filter(|n| n.address != config.local.address)
        {
            let channel = transport
                .channel(&config.local.address, node)
                .with_context(|| format!("channel to {}", node.address))?;
            pool.add(node.clone(), channel).context("pool.add()")?;
        }
        let (inbound_send, inbound) = ctx::channel::unbounded();
        let handler = Arc::new(Handler::new(
            config.local.node(),
            policy.clone(),
            db.clone(),
            block_data.clone(),
            inbound_send,
        ));
        let local = Arc::new(LocalContext::new(
            config.local,
            policy,
            suffrage,
            pool,
            db,
            block_data,
        ));
        Ok(Self {
            local,
            handler,
            inbound,
            transport,
        })
    }

    /// Context of the node, for observing its state and tip.
    pub fn local(&self) -> &Arc<LocalContext> {
        &self.local
    }

    /// Runs this executor to completion. This should be spawned on a separate task.
    pub async fn run(self, ctx: &ctx::Ctx) -> anyhow::Result<()> {
        let Self {
            local,
            handler,
            inbound,
            transport,
        } = self;
        tracing::info!(
            node = %local.address(),
            peers = local.pool.len(),
            "ISAAC executor - starting"
        );
        let res = scope::run!(ctx, |ctx, s| async {
            s.spawn_bg(async {
                transport
                    .serve(ctx, local.address(), handler)
                    .await
                    .context("transport stopped")?;
                Ok(())
            });
            local
                .clone()
                .run(ctx, inbound)
                .await
                .context("consensus stopped")?;
            Ok(())
        })
        .await;
        match res {
            Ok(()) | Err(ctx::Error::Canceled(_)) => {
                tracing::info!(node = %local.address(), "ISAAC executor - stopped");
                Ok(())
            }
            Err(ctx::Error::Internal(err)) => {
                tracing::error!(node = %local.address(), "ISAAC executor - failed: {err:#}");
                Err(err)
            }
        }
    }
}
