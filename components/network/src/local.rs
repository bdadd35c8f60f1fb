//! In-process transport connecting the nodes of a single process.
use crate::{metrics::METRICS, Channel, ChannelError, NodeInfo};
use isaac_roles::{
    messages::{Block, BlockDataMap, Hash, Height, Manifest, Seal},
    node::Address,
};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, RwLock},
};
use zksync_concurrency::ctx;

/// Decides whether a seal sent from the first address to the second is delivered.
pub type SealFilter = Arc<dyn Fn(&Address, &Address, &Seal) -> bool + Send + Sync>;

#[derive(Default)]
struct Inner {
    handlers: HashMap<Address, Arc<dyn Channel>>,
    offline: HashSet<Address>,
    filter: Option<SealFilter>,
}

/// Registry of the request handlers of in-process nodes.
///
/// Nodes can be taken offline and back, and seal delivery can be filtered,
/// to simulate crashes and faulty links.
#[derive(Clone, Default)]
pub struct LocalNetwork(Arc<RwLock<Inner>>);

impl fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.read().unwrap();
        f.debug_struct("LocalNetwork")
            .field("nodes", &inner.handlers.keys().collect::<Vec<_>>())
            .field("offline", &inner.offline)
            .finish_non_exhaustive()
    }
}

impl LocalNetwork {
    /// Constructs an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler answering requests addressed to `address`.
    /// Replaces a previously registered handler.
    pub fn register(&self, address: Address, handler: Arc<dyn Channel>) {
        let mut inner = self.0.write().unwrap();
        inner.offline.remove(&address);
        inner.handlers.insert(address, handler);
    }

    /// Removes the handler of `address`.
    pub fn unregister(&self, address: &Address) {
        self.0.write().unwrap().handlers.remove(address);
    }

    /// Takes `address` offline or back online. An offline node neither sends nor receives.
    pub fn set_online(&self, address: &Address, online: bool) {
        let mut inner = self.0.write().unwrap();
        if online {
            inner.offline.remove(address);
        } else {
            inner.offline.insert(address.clone());
        }
    }

    /// Installs (or removes) a filter on seal delivery.
    pub fn set_seal_filter(&self, filter: Option<SealFilter>) {
        self.0.write().unwrap().filter = filter;
    }

    /// Channel from `from` to `to`.
    pub fn channel(&self, from: &Address, to: &Address) -> Arc<dyn Channel> {
        Arc::new(LocalChannel {
            net: self.clone(),
            from: from.clone(),
            to: to.clone(),
        })
    }

    fn target(&self, from: &Address, to: &Address) -> Result<Arc<dyn Channel>, ChannelError> {
        let inner = self.0.read().unwrap();
        if inner.offline.contains(from) || inner.offline.contains(to) {
            METRICS.unreachable.inc();
            return Err(ChannelError::Unreachable(to.clone()));
        }
        inner.handlers.get(to).cloned().ok_or_else(|| {
            METRICS.unreachable.inc();
            ChannelError::Unreachable(to.clone())
        })
    }

    fn deliver(&self, from: &Address, to: &Address, seal: &Seal) -> bool {
        match &self.0.read().unwrap().filter {
            Some(f) => f(from, to, seal),
            None => true,
        }
    }
}

/// [`Channel`] over a [`LocalNetwork`].
#[derive(Debug)]
pub struct LocalChannel {
    net: LocalNetwork,
    from: Address,
    to: Address,
}

impl LocalChannel {
    fn target(&self) -> Result<Arc<dyn Channel>, ChannelError> {
        self.net.target(&self.from, &self.to)
    }
}

#[async_trait::async_trait]
impl Channel for LocalChannel {
    async fn send_seal(&self, ctx: &ctx::Ctx, seal: &Seal) -> Result<(), ChannelError> {
        let target = self.target()?;
        if !self.net.deliver(&self.from, &self.to, seal) {
            return Ok(());
        }
        target.send_seal(ctx, seal).await
    }

    async fn seals(&self, ctx: &ctx::Ctx, hashes: &[Hash]) -> Result<Vec<Seal>, ChannelError> {
        self.target()?.seals(ctx, hashes).await
    }

    async fn manifests(
        &self,
        ctx: &ctx::Ctx,
        heights: &[Height],
    ) -> Result<Vec<Manifest>, ChannelError> {
        self.target()?.manifests(ctx, heights).await
    }

    async fn blocks(
        &self,
        ctx: &ctx::Ctx,
        heights: &[Height],
    ) -> Result<Vec<Block>, ChannelError> {
        self.target()?.blocks(ctx, heights).await
    }

    async fn block_data_maps(
        &self,
        ctx: &ctx::Ctx,
        heights: &[Height],
    ) -> Result<Vec<BlockDataMap>, ChannelError> {
        self.target()?.block_data_maps(ctx, heights).await
    }

    async fn block_data(&self, ctx: &ctx::Ctx, url: &str) -> Result<Vec<u8>, ChannelError> {
        self.target()?.block_data(ctx, url).await
    }

    async fn node_info(&self, ctx: &ctx::Ctx) -> Result<NodeInfo, ChannelError> {
        self.target()?.node_info(ctx).await
    }
}
