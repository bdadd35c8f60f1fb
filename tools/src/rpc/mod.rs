//! JSON-RPC transport between nodes.
//!
//! Every node serves its [`isaac_network::Handler`] over HTTP JSON-RPC and
//! reaches its peers through [`RpcChannel`]s. `GET /health` is proxied to the
//! `health_check` method.
use anyhow::Context as _;
use isaac_executor::Transport;
use isaac_network::{Channel, Handler};
use isaac_roles::node::{Address, Node};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use zksync_concurrency::{ctx, time};

mod client;
mod server;

pub use client::RpcChannel;

/// Method names.
pub(crate) mod methods {
    pub(crate) const HEALTH_CHECK: &str = "health_check";
    pub(crate) const HEALTH_CHECK_PATH: &str = "/health";
    pub(crate) const SEND_SEAL: &str = "isaac_sendSeal";
    pub(crate) const SEALS: &str = "isaac_seals";
    pub(crate) const MANIFESTS: &str = "isaac_manifests";
    pub(crate) const BLOCKS: &str = "isaac_blocks";
    pub(crate) const BLOCK_DATA_MAPS: &str = "isaac_blockDataMaps";
    pub(crate) const BLOCK_DATA: &str = "isaac_blockData";
    pub(crate) const NODE_INFO: &str = "isaac_nodeInfo";
}

/// Error code of a request for an item the node does not have.
pub(crate) const NOT_FOUND_CODE: i32 = -32004;

/// [`Transport`] over HTTP JSON-RPC.
#[derive(Debug, Clone)]
pub struct RpcTransport {
    listen: SocketAddr,
    peers: HashMap<Address, String>,
    timeout: time::Duration,
}

impl RpcTransport {
    /// Transport serving on `listen` and calling peers at the given URLs.
    /// `timeout` bounds every outbound request.
    pub fn new(
        listen: SocketAddr,
        peers: HashMap<Address, String>,
        timeout: time::Duration,
    ) -> Self {
        Self {
            listen,
            peers,
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl Transport for RpcTransport {
    fn channel(&self, _from: &Address, to: &Node) -> anyhow::Result<Arc<dyn Channel>> {
        let url = self
            .peers
            .get(&to.address)
            .with_context(|| format!("no rpc address for {}", to.address))?;
        Ok(Arc::new(RpcChannel::new(
            to.address.clone(),
            url,
            self.timeout,
        )?))
    }

    async fn serve(
        &self,
        ctx: &ctx::Ctx,
        address: &Address,
        handler: Arc<Handler>,
    ) -> anyhow::Result<()> {
        tracing::info!(%address, listen = %self.listen, "ISAAC rpc - serving");
        server::serve(ctx, self.listen, handler).await
    }
}
