use super::{methods, NOT_FOUND_CODE};
use anyhow::Context as _;
use isaac_network::{Channel, ChannelError, NodeInfo};
use isaac_roles::{
    messages::{Block, BlockDataMap, Hash, Height, Manifest, Seal},
    node::Address,
};
use jsonrpsee::{
    core::{client::ClientT as _, params::ArrayParams, ClientError},
    http_client::{HttpClient, HttpClientBuilder},
    rpc_params,
};
use serde::de::DeserializeOwned;
use zksync_concurrency::{ctx, time};

/// [`Channel`] to a node serving JSON-RPC.
///
/// Transport failures and errors reported by the peer make it
/// [`ChannelError::Unreachable`]; only a missing item is reported as such.
#[derive(Debug)]
pub struct RpcChannel {
    address: Address,
    client: HttpClient,
}

impl RpcChannel {
    /// Channel to the node `address` listening at `url`.
    pub fn new(address: Address, url: &str, timeout: time::Duration) -> anyhow::Result<Self> {
        let timeout = std::time::Duration::try_from(timeout).context("timeout")?;
        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .build(url)
            .with_context(|| format!("HttpClientBuilder::build({url})"))?;
        Ok(Self { address, client })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        ctx: &ctx::Ctx,
        method: &str,
        params: ArrayParams,
    ) -> Result<T, ChannelError> {
        let res = ctx
            .wait(self.client.request::<T, _>(method, params))
            .await
            .map_err(ctx::Error::Canceled)?;
        match res {
            Ok(v) => Ok(v),
            Err(ClientError::Call(err)) if err.code() == NOT_FOUND_CODE => {
                Err(ChannelError::NotFound(err.message().to_owned()))
            }
            Err(err) => {
                tracing::debug!(
                    "ISAAC rpc - {method} to {} failed: {err:#}",
                    self.address
                );
                Err(ChannelError::Unreachable(self.address.clone()))
            }
        }
    }
}

#[async_trait::async_trait]
impl Channel for RpcChannel {
    async fn send_seal(&self, ctx: &ctx::Ctx, seal: &Seal) -> Result<(), ChannelError> {
        self.call(ctx, methods::SEND_SEAL, rpc_params![seal]).await
    }

    async fn seals(&self, ctx: &ctx::Ctx, hashes: &[Hash]) -> Result<Vec<Seal>, ChannelError> {
        self.call(ctx, methods::SEALS, rpc_params![hashes]).await
    }

    async fn manifests(
        &self,
        ctx: &ctx::Ctx,
        heights: &[Height],
    ) -> Result<Vec<Manifest>, ChannelError> {
        self.call(ctx, methods::MANIFESTS, rpc_params![heights])
            .await
    }

    async fn blocks(
        &self,
        ctx: &ctx::Ctx,
        heights: &[Height],
    ) -> Result<Vec<Block>, ChannelError> {
        self.call(ctx, methods::BLOCKS, rpc_params![heights]).await
    }

    async fn block_data_maps(
        &self,
        ctx: &ctx::Ctx,
        heights: &[Height],
    ) -> Result<Vec<BlockDataMap>, ChannelError> {
        self.call(ctx, methods::BLOCK_DATA_MAPS, rpc_params![heights])
            .await
    }

    async fn block_data(&self, ctx: &ctx::Ctx, url: &str) -> Result<Vec<u8>, ChannelError> {
        let raw: String = self.call(ctx, methods::BLOCK_DATA, rpc_params![url]).await?;
        Ok(hex::decode(raw).context("block data is not hex")?)
    }

    async fn node_info(&self, ctx: &ctx::Ctx) -> Result<NodeInfo, ChannelError> {
        self.call(ctx, methods::NODE_INFO, rpc_params![]).await
    }
}
