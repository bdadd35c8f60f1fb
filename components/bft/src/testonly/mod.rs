//! Test-only utilities: networks of in-process consensus nodes.
use crate::{genesis, LocalContext};
use isaac_network::{Channel as _, ChannelError, Handler, LocalNetwork, NodePool};
use isaac_roles::{
    messages::{Block, Height, Seal},
    policy::{LocalPolicy, PolicySnapshot},
    suffrage::Suffrage,
    testonly::Setup,
};
use isaac_storage::testonly::TestStore;
use rand::Rng;
use std::sync::Arc;
use zksync_concurrency::{ctx, error::Wrap as _, scope, time};

/// Policy with short timeouts, so that rounds move quickly in tests.
pub fn fast_policy(policy: &PolicySnapshot) -> PolicySnapshot {
    PolicySnapshot {
        timeout_waiting_proposal: time::Duration::milliseconds(600),
        interval_broadcasting_init_ballot: time::Duration::milliseconds(200),
        interval_broadcasting_proposal: time::Duration::milliseconds(200),
        wait_broadcasting_accept_ballot: time::Duration::milliseconds(50),
        interval_broadcasting_accept_ballot: time::Duration::milliseconds(200),
        timeout_process_proposal: time::Duration::seconds(5),
        network_connection_timeout: time::Duration::seconds(1),
        limit_blocks_per_syncer: 5,
        limit_blocks_per_once: 3,
        limit_manifests_per_worker: 3,
        ..policy.clone()
    }
}

/// Setup of `n` nodes with [`fast_policy`].
pub fn setup(rng: &mut impl Rng, n: usize) -> Setup {
    let mut setup = Setup::new(rng, n);
    setup.policy = fast_policy(&setup.policy);
    setup
}

/// A node of a [`TestNetwork`].
#[derive(Debug)]
pub struct TestNode {
    /// Context of the node.
    pub local: Arc<LocalContext>,
    /// Storage of the node.
    pub store: TestStore,
    /// Request handler of the node, as registered in the network.
    pub handler: Arc<Handler>,
}

impl TestNode {
    /// Delivers a seal to the node, as if a peer sent it.
    pub async fn inject(&self, ctx: &ctx::Ctx, seal: impl Into<Seal>) -> Result<(), ChannelError> {
        self.handler.send_seal(ctx, &seal.into()).await
    }

    /// Blocks of the node from pre-genesis up to its tip.
    pub async fn chain(&self, ctx: &ctx::Ctx) -> ctx::Result<Vec<Block>> {
        let mut blocks = vec![];
        let Some(tip) = self.local.tip() else {
            return Ok(blocks);
        };
        let mut h = Height::PRE_GENESIS;
        while h <= tip.height {
            let b = self
                .local
                .db
                .block_by_height(ctx, h)
                .await
                .wrap("block_by_height()")?
                .ok_or_else(|| anyhow::format_err!("block {h} missing"))?;
            blocks.push(b);
            h = h.next();
        }
        Ok(blocks)
    }
}

/// State machine of a [`TestNode`], not yet started.
#[derive(Debug)]
pub struct NodeRunner {
    local: Arc<LocalContext>,
    inbound: ctx::channel::UnboundedReceiver<Seal>,
}

impl NodeRunner {
    /// Address of the node.
    pub fn address(&self) -> &isaac_roles::node::Address {
        self.local.address()
    }

    /// Runs the node until `ctx` is canceled.
    pub async fn run(self, ctx: &ctx::Ctx) -> anyhow::Result<()> {
        let span = tracing::info_span!("node", local = %self.local.address());
        tracing::Instrument::instrument(self.local.run(ctx, self.inbound), span).await
    }
}

/// Nodes of a [`Setup`], connected over a [`LocalNetwork`], each with its own storage.
#[derive(Debug)]
pub struct TestNetwork {
    /// Keys, addresses and policy of the nodes.
    pub setup: Setup,
    /// Transport.
    pub network: LocalNetwork,
    /// Node `i` is node `i` of the setup.
    pub nodes: Vec<TestNode>,
}

impl TestNetwork {
    /// Constructs the nodes with empty storage. Nothing runs until the
    /// returned runners are started.
    pub fn new(setup: &Setup) -> (Self, Vec<NodeRunner>) {
        let network = LocalNetwork::new();
        let suffrage: Arc<dyn Suffrage> = Arc::new(setup.suffrage());
        let node_list = setup.node_list();
        let mut nodes = vec![];
        let mut runners = vec![];
        for i in 0..setup.nodes.len() {
            let local = setup.local(i);
            let store = TestStore::new();
            let policy = Arc::new(LocalPolicy::new(setup.policy.clone()).unwrap());
            let pool = Arc::new(NodePool::new(local.node()));
            for node in node_list.iter().filter(|n| n.address != local.address) {
                let channel = network.channel(&local.address, &node.address);
                pool.add(node.clone(), channel).unwrap();
            }
            let (inbound_send, inbound_recv) = ctx::channel::unbounded();
            let handler = Arc::new(Handler::new(
                local.node(),
                policy.clone(),
                store.db.clone(),
                store.block_data.clone(),
                inbound_send,
            ));
            network.register(local.address.clone(), handler.clone());
            let local = Arc::new(LocalContext::new(
                local,
                policy,
                suffrage.clone(),
                pool,
                store.db.clone(),
                store.block_data.clone(),
            ));
            runners.push(NodeRunner {
                local: local.clone(),
                inbound: inbound_recv,
            });
            nodes.push(TestNode {
                local,
                store,
                handler,
            });
        }
        let this = Self {
            setup: setup.clone(),
            network,
            nodes,
        };
        (this, runners)
    }

    /// Generates genesis on node 0 and copies it to every other node.
    pub async fn init_genesis(&self, ctx: &ctx::Ctx) -> ctx::Result<genesis::Genesis> {
        let first = &self.nodes[0];
        let g = genesis::generate(
            ctx,
            &first.local.local,
            &self.setup.policy,
            first.store.db.clone(),
            first.store.block_data.clone(),
            vec![],
        )
        .await
        .wrap("genesis::generate()")?;
        let blocks = [g.pre_genesis.clone(), g.genesis.clone()];
        for n in &self.nodes[1..] {
            n.store.put_blocks(ctx, &blocks).await.wrap("put_blocks()")?;
        }
        Ok(g)
    }

    /// Waits until every node in `nodes` reaches `height`.
    pub async fn wait_for_height(
        &self,
        ctx: &ctx::Ctx,
        nodes: &[usize],
        height: Height,
    ) -> ctx::OrCanceled<()> {
        for i in nodes {
            self.nodes[*i].local.wait_for_height(ctx, height).await?;
        }
        Ok(())
    }
}

/// Error returned by [`Test::run`].
#[derive(thiserror::Error, Debug)]
pub enum TestError {
    /// Two nodes committed different blocks at the same height.
    #[error("nodes committed conflicting blocks at height {0}")]
    BlockConflict(Height),
    /// Anything else.
    #[error(transparent)]
    Other(#[from] ctx::Error),
}

/// Runs `nodes` nodes from genesis until each of them commits `blocks_to_finalize`
/// blocks past genesis, then checks that they all committed the same chain.
#[derive(Debug, Clone)]
pub struct Test {
    /// Number of nodes.
    pub nodes: usize,
    /// Blocks to commit past genesis.
    pub blocks_to_finalize: usize,
}

impl Test {
    /// Runs the test.
    pub async fn run(&self, ctx: &ctx::Ctx) -> Result<(), TestError> {
        let rng = &mut ctx.rng();
        let setup = setup(rng, self.nodes);
        let (net, runners) = TestNetwork::new(&setup);
        net.init_genesis(ctx).await?;
        let height = Height(self.blocks_to_finalize as i64);
        scope::run!(ctx, |ctx, s| async {
            for r in runners {
                s.spawn_bg(async { r.run(ctx).await.map_err(ctx::Error::Internal) });
            }
            let all: Vec<_> = (0..self.nodes).collect();
            net.wait_for_height(ctx, &all, height).await?;
            Ok(())
        })
        .await?;
        check_chains(ctx, &net.nodes, height).await
    }
}

/// Checks that the given nodes agree on every block up to `height`.
pub async fn check_chains(
    ctx: &ctx::Ctx,
    nodes: &[TestNode],
    height: Height,
) -> Result<(), TestError> {
    let mut h = Height::PRE_GENESIS;
    while h <= height {
        let mut hashes = vec![];
        for n in nodes {
            let m = n
                .local
                .db
                .manifest_by_height(ctx, h)
                .await
                .wrap("manifest_by_height()")?
                .ok_or_else(|| anyhow::format_err!("block {h} missing"))
                .map_err(ctx::Error::Internal)?;
            hashes.push(m.hash);
        }
        hashes.dedup();
        if hashes.len() > 1 {
            return Err(TestError::BlockConflict(h));
        }
        h = h.next();
    }
    Ok(())
}
