//! Per-peer request/response interface.
use isaac_roles::{
    messages::{Block, BlockDataMap, Hash, Height, Manifest, Seal},
    node::{Address, NetworkId, PublicKey},
    policy::PolicySnapshot,
};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use zksync_concurrency::{ctx, error::Wrap};

/// Self-description of a node, as returned by [`Channel::node_info`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Address of the node.
    pub address: Address,
    /// Public key of the node.
    pub public_key: PublicKey,
    /// Network the node belongs to.
    pub network_id: NetworkId,
    /// Policy the node currently runs with.
    pub policy: PolicySnapshot,
    /// Manifest of the node's last block.
    pub last_manifest: Option<Manifest>,
}

/// Error returned by channel calls.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The peer could not be reached or did not answer in time.
    #[error("peer {0} unreachable")]
    Unreachable(Address),
    /// The peer does not have the requested item.
    #[error("not found: {0}")]
    NotFound(String),
    /// Internal error.
    #[error(transparent)]
    Internal(#[from] ctx::Error),
}

impl Wrap for ChannelError {
    fn with_wrap<C: fmt::Display + Send + Sync + 'static, F: FnOnce() -> C>(
        self,
        f: F,
    ) -> Self {
        match self {
            ChannelError::Internal(err) => ChannelError::Internal(err.with_wrap(f)),
            err => err,
        }
    }
}

impl From<anyhow::Error> for ChannelError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.into())
    }
}

/// Channel to a single remote node.
///
/// Batch requests return the items the peer has, in request order, and
/// silently skip the ones it does not have.
#[async_trait::async_trait]
pub trait Channel: 'static + fmt::Debug + Send + Sync {
    /// Pushes a seal to the peer.
    async fn send_seal(&self, ctx: &ctx::Ctx, seal: &Seal) -> Result<(), ChannelError>;
    /// Seals with the given hashes.
    async fn seals(&self, ctx: &ctx::Ctx, hashes: &[Hash]) -> Result<Vec<Seal>, ChannelError>;
    /// Manifests at the given heights.
    async fn manifests(
        &self,
        ctx: &ctx::Ctx,
        heights: &[Height],
    ) -> Result<Vec<Manifest>, ChannelError>;
    /// Blocks at the given heights.
    async fn blocks(&self, ctx: &ctx::Ctx, heights: &[Height])
        -> Result<Vec<Block>, ChannelError>;
    /// Block-data maps at the given heights.
    async fn block_data_maps(
        &self,
        ctx: &ctx::Ctx,
        heights: &[Height],
    ) -> Result<Vec<BlockDataMap>, ChannelError>;
    /// Stored bytes of a block-data item.
    async fn block_data(&self, ctx: &ctx::Ctx, url: &str) -> Result<Vec<u8>, ChannelError>;
    /// Peer's self-description.
    async fn node_info(&self, ctx: &ctx::Ctx) -> Result<NodeInfo, ChannelError>;
}

#[async_trait::async_trait]
impl<C: Channel + ?Sized> Channel for Arc<C> {
    async fn send_seal(&self, ctx: &ctx::Ctx, seal: &Seal) -> Result<(), ChannelError> {
        (**self).send_seal(ctx, seal).await
    }

    async fn seals(&self, ctx: &ctx::Ctx, hashes: &[Hash]) -> Result<Vec<Seal>, ChannelError> {
        (**self).seals(ctx, hashes).await
    }

    async fn manifests(
        &self,
        ctx: &ctx::Ctx,
        heights: &[Height],
    ) -> Result<Vec<Manifest>, ChannelError> {
        (**self).manifests(ctx, heights).await
    }

    async fn blocks(
        &self,
        ctx: &ctx::Ctx,
        heights: &[Height],
    ) -> Result<Vec<Block>, ChannelError> {
        (**self).blocks(ctx, heights).await
    }

    async fn block_data_maps(
        &self,
        ctx: &ctx::Ctx,
        heights: &[Height],
    ) -> Result<Vec<BlockDataMap>, ChannelError> {
        (**self).block_data_maps(ctx, heights).await
    }

    async fn block_data(&self, ctx: &ctx::Ctx, url: &str) -> Result<Vec<u8>, ChannelError> {
        (**self).block_data(ctx, url).await
    }

    async fn node_info(&self, ctx: &ctx::Ctx) -> Result<NodeInfo, ChannelError> {
        (**self).node_info(ctx).await
    }
}
