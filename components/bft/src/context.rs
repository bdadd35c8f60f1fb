//! Everything a node shares between its components.
use crate::{handlers::ConsensusState, operations::OperationProcessors};
use isaac_network::{NodePool, RemoteNode};
use isaac_roles::{
    messages::{Height, Manifest, Threshold, Timestamp},
    node::{Address, LocalNode, NetworkId},
    policy::LocalPolicy,
    suffrage::Suffrage,
};
use isaac_storage::{BlockData, Database};
use std::sync::Arc;
use zksync_concurrency::{ctx, error::Wrap as _, sync};

/// Identity, configuration, storage and peers of the local node.
#[derive(Debug)]
pub struct LocalContext {
    /// Local node.
    pub local: LocalNode,
    /// Live policy.
    pub policy: Arc<LocalPolicy>,
    /// Suffrage of the network.
    pub suffrage: Arc<dyn Suffrage>,
    /// Remote nodes.
    pub pool: Arc<NodePool>,
    /// Database.
    pub db: Arc<dyn Database>,
    /// Block-data store.
    pub block_data: Arc<dyn BlockData>,
    /// Processors applying operations to states.
    pub processors: Arc<OperationProcessors>,
    tip: sync::watch::Sender<Option<Manifest>>,
    state: sync::watch::Sender<Option<ConsensusState>>,
}

impl LocalContext {
    /// Constructs a context. The tip is read from `db` by [`LocalContext::update_tip`].
    pub fn new(
        local: LocalNode,
        policy: Arc<LocalPolicy>,
        suffrage: Arc<dyn Suffrage>,
        pool: Arc<NodePool>,
        db: Arc<dyn Database>,
        block_data: Arc<dyn BlockData>,
    ) -> Self {
        let processors = Arc::new(OperationProcessors::new(policy.clone()));
        Self {
            local,
            policy,
            suffrage,
            pool,
            db,
            block_data,
            processors,
            tip: sync::watch::channel(None).0,
            state: sync::watch::channel(None).0,
        }
    }

    /// Address of the local node.
    pub fn address(&self) -> &Address {
        &self.local.address
    }

    /// Network id.
    pub fn network_id(&self) -> NetworkId {
        self.policy.network_id()
    }

    /// Threshold over the whole suffrage, with the current ratio.
    pub fn threshold(&self) -> Threshold {
        Threshold::new(
            self.suffrage.nodes().len() as u64,
            self.policy.snapshot().threshold_ratio,
        )
    }

    /// Current wall clock time.
    pub fn now(&self, ctx: &ctx::Ctx) -> Timestamp {
        Timestamp::from_utc(ctx.now_utc())
    }

    /// Last block known to be committed locally.
    pub fn tip(&self) -> Option<Manifest> {
        self.tip.borrow().clone()
    }

    /// Height of the last committed block; the height before pre-genesis if none.
    pub fn tip_height(&self) -> Height {
        self.tip
            .borrow()
            .as_ref()
            .map_or(Height::PRE_GENESIS.prev(), |m| m.height)
    }

    /// Subscribes to the local tip.
    pub fn subscribe(&self) -> sync::watch::Receiver<Option<Manifest>> {
        self.tip.subscribe()
    }

    /// Reloads the tip from the database and publishes it.
    pub async fn update_tip(&self, ctx: &ctx::Ctx) -> ctx::Result<Option<Manifest>> {
        let last = self
            .db
            .last_manifest(ctx)
            .await
            .wrap("db.last_manifest()")?;
        self.tip.send_if_modified(|t| {
            if *t == last {
                return false;
            }
            t.clone_from(&last);
            true
        });
        if let Some(m) = &last {
            crate::metrics::METRICS.last_block_height.set(m.height.0);
        }
        Ok(last)
    }

    /// Waits until a block at `height` or above is committed.
    pub async fn wait_for_height(
        &self,
        ctx: &ctx::Ctx,
        height: Height,
    ) -> ctx::OrCanceled<Manifest> {
        let mut tip = self.tip.subscribe();
        sync::wait_for_some(ctx, &mut tip, |t| {
            t.as_ref().filter(|m| m.height >= height).cloned()
        })
        .await
    }

    /// Active state of the consensus state machine; `None` before it runs.
    pub fn state(&self) -> Option<ConsensusState> {
        *self.state.borrow()
    }

    /// Subscribes to the state of the consensus state machine.
    pub fn subscribe_state(&self) -> sync::watch::Receiver<Option<ConsensusState>> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: ConsensusState) {
        self.state.send_replace(Some(state));
    }

    /// Waits until the consensus state machine enters `state`.
    pub async fn wait_for_state(
        &self,
        ctx: &ctx::Ctx,
        state: ConsensusState,
    ) -> ctx::OrCanceled<()> {
        let mut sub = self.state.subscribe();
        sync::wait_for(ctx, &mut sub, |s| *s == Some(state)).await?;
        Ok(())
    }

    /// Remote nodes among `addresses`, skipping unknown ones and the local node.
    pub fn remotes(&self, addresses: &[Address]) -> Vec<RemoteNode> {
        addresses.iter().filter_map(|a| self.pool.get(a)).collect()
    }
}
