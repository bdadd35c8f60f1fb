//! Server side of [`Channel`]: answers peer requests from local storage.
use crate::{metrics::Method, Channel, ChannelError, NodeInfo};
use isaac_roles::{
    messages::{Block, BlockDataMap, Hash, Height, Manifest, Seal},
    node::Node,
    policy::LocalPolicy,
};
use isaac_storage::{BlockData, Database};
use std::sync::Arc;
use zksync_concurrency::{ctx, error::Wrap as _};

/// Largest number of items a single batch request may ask for.
pub const MAX_BATCH: usize = 1000;

/// Answers requests of remote nodes.
///
/// Inbound seals are not validated here; they are forwarded to the state
/// machine, which owns validation.
#[derive(Debug)]
pub struct Handler {
    node: Node,
    policy: Arc<LocalPolicy>,
    db: Arc<dyn Database>,
    block_data: Arc<dyn BlockData>,
    inbound: ctx::channel::UnboundedSender<Seal>,
}

impl Handler {
    /// Constructs a handler forwarding inbound seals into `inbound`.
    pub fn new(
        node: Node,
        policy: Arc<LocalPolicy>,
        db: Arc<dyn Database>,
        block_data: Arc<dyn BlockData>,
        inbound: ctx::channel::UnboundedSender<Seal>,
    ) -> Self {
        Self {
            node,
            policy,
            db,
            block_data,
            inbound,
        }
    }

    fn check_batch(len: usize) -> Result<(), ChannelError> {
        if len > MAX_BATCH {
            return Err(anyhow::format_err!("batch of {len} items exceeds {MAX_BATCH}").into());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Channel for Handler {
    async fn send_seal(&self, _ctx: &ctx::Ctx, seal: &Seal) -> Result<(), ChannelError> {
        Method::SendSeal.served();
        self.inbound.send(seal.clone());
        Ok(())
    }

    async fn seals(&self, ctx: &ctx::Ctx, hashes: &[Hash]) -> Result<Vec<Seal>, ChannelError> {
        Method::Seals.served();
        Self::check_batch(hashes.len())?;
        let mut seals = vec![];
        for h in hashes {
            if let Some(s) = self.db.seal(ctx, h).await.wrap("db.seal()")? {
                seals.push(s);
            }
        }
        Ok(seals)
    }

    async fn manifests(
        &self,
        ctx: &ctx::Ctx,
        heights: &[Height],
    ) -> Result<Vec<Manifest>, ChannelError> {
        Method::Manifests.served();
        Self::check_batch(heights.len())?;
        let mut manifests = vec![];
        for h in heights {
            if let Some(m) = self
                .db
                .manifest_by_height(ctx, *h)
                .await
                .wrap("db.manifest_by_height()")?
            {
                manifests.push(m);
            }
        }
        Ok(manifests)
    }

    async fn blocks(
        &self,
        ctx: &ctx::Ctx,
        heights: &[Height],
    ) -> Result<Vec<Block>, ChannelError> {
        Method::Blocks.served();
        Self::check_batch(heights.len())?;
        let mut blocks = vec![];
        for h in heights {
            if let Some(b) = self
                .db
                .block_by_height(ctx, *h)
                .await
                .wrap("db.block_by_height()")?
            {
                blocks.push(b);
            }
        }
        Ok(blocks)
    }

    async fn block_data_maps(
        &self,
        ctx: &ctx::Ctx,
        heights: &[Height],
    ) -> Result<Vec<BlockDataMap>, ChannelError> {
        Method::BlockDataMaps.served();
        Self::check_batch(heights.len())?;
        let mut maps = vec![];
        for h in heights {
            if let Some(m) = self
                .db
                .block_data_map(ctx, *h)
                .await
                .wrap("db.block_data_map()")?
            {
                maps.push(m);
            }
        }
        Ok(maps)
    }

    async fn block_data(&self, ctx: &ctx::Ctx, url: &str) -> Result<Vec<u8>, ChannelError> {
        Method::BlockData.served();
        match self.block_data.read(ctx, url).await {
            Ok(raw) => Ok(raw),
            Err(ctx::Error::Internal(err)) => {
                tracing::debug!("ISAAC network - block data {url:?} not served: {err:#}");
                Err(ChannelError::NotFound(url.to_owned()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn node_info(&self, ctx: &ctx::Ctx) -> Result<NodeInfo, ChannelError> {
        Method::NodeInfo.served();
        let policy = self.policy.snapshot();
        Ok(NodeInfo {
            address: self.node.address.clone(),
            public_key: self.node.public_key.clone(),
            network_id: policy.network_id.clone(),
            policy,
            last_manifest: self
                .db
                .last_manifest(ctx)
                .await
                .wrap("db.last_manifest()")?,
        })
    }
}
