//! Test-only utilities.
use isaac_network::{Handler, LocalNetwork, RemoteNode};
use isaac_roles::{messages::Block, policy::LocalPolicy, testonly::Setup};
use isaac_storage::testonly::TestStore;
use std::sync::Arc;
use zksync_concurrency::ctx;

/// Source nodes serving pre-built chains to node 0 of a [`Setup`].
#[derive(Debug)]
pub struct TestSources {
    /// Transport the sources are registered in.
    pub net: LocalNetwork,
    /// Storage of each source; source `i` is node `i + 1` of the setup.
    pub stores: Vec<TestStore>,
    /// Sources as seen from node 0.
    pub nodes: Vec<RemoteNode>,
}

impl TestSources {
    /// Registers one source per chain, storing that chain in its storage.
    pub async fn new(ctx: &ctx::Ctx, setup: &Setup, chains: &[&[Block]]) -> ctx::Result<Self> {
        assert!(chains.len() < setup.nodes.len(), "node 0 is the local node");
        let net = LocalNetwork::new();
        let local = &setup.nodes[0];
        let mut stores = vec![];
        let mut nodes = vec![];
        for (i, chain) in chains.iter().enumerate() {
            let node = setup.local(i + 1).node();
            let store = TestStore::new();
            store.put_blocks(ctx, chain).await?;
            let (inbound, _) = ctx::channel::unbounded();
            let handler = Handler::new(
                node.clone(),
                Arc::new(LocalPolicy::new(setup.policy.clone())?),
                store.db.clone(),
                store.block_data.clone(),
                inbound,
            );
            net.register(node.address.clone(), Arc::new(handler));
            nodes.push(RemoteNode {
                channel: net.channel(local, &node.address),
                node,
            });
            stores.push(store);
        }
        Ok(Self { net, stores, nodes })
    }
}
