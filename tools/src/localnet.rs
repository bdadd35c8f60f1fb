//! Network of nodes running in a single process.
use anyhow::Context as _;
use isaac_bft::genesis;
use isaac_executor::{Config, Executor};
use isaac_network::LocalNetwork;
use isaac_roles::{
    messages::{Height, Manifest},
    node::{Address, LocalNode, NetworkId, SecretKey},
    policy::PolicySnapshot,
};
use isaac_storage::{localfs::LocalFs, store_block, Database as _, InMemoryDatabase};
use std::{path::PathBuf, sync::Arc};
use zksync_concurrency::{ctx, error::Wrap as _, scope};

/// `nodes` nodes with in-memory databases, talking over a [`LocalNetwork`].
/// Block data of node `i` is kept under `<data_dir>/node<i>`.
#[derive(Debug, Clone)]
pub struct Localnet {
    pub nodes: usize,
    pub policy: PolicySnapshot,
    pub data_dir: PathBuf,
}

impl Localnet {
    /// Localnet with the default policy, where every node is acting.
    pub fn new(nodes: usize, data_dir: PathBuf) -> Self {
        let mut policy = PolicySnapshot::new(NetworkId::from("localnet"));
        policy.number_of_acting_suffrage_nodes = nodes as u64;
        Self {
            nodes,
            policy,
            data_dir,
        }
    }

    /// Runs the network until every node has committed a block at `height`.
    /// Returns the manifests at `height`, one per node.
    pub async fn run(self, ctx: &ctx::Ctx, height: Height) -> anyhow::Result<Vec<Manifest>> {
        anyhow::ensure!(self.nodes > 0, "localnet needs at least one node");
        let locals: Vec<_> = (0..self.nodes)
            .map(|i| LocalNode::new(Address(format!("node{i}")), SecretKey::generate()))
            .collect();
        let suffrage: Vec<_> = locals.iter().map(LocalNode::node).collect();
        let net = LocalNetwork::new();

        let mut stores = vec![];
        for i in 0..self.nodes {
            let dir = self.data_dir.join(format!("node{i}"));
            let block_data = Arc::new(LocalFs::open(&dir).context("LocalFs::open()")?);
            stores.push((Arc::new(InMemoryDatabase::new()), block_data));
        }
        let g = genesis::generate(
            ctx,
            &locals[0],
            &self.policy,
            stores[0].0.clone(),
            stores[0].1.clone(),
            vec![],
        )
        .await
        .wrap("genesis::generate()")?;
        tracing::info!(genesis = %g.genesis.hash(), "ISAAC localnet - genesis generated");
        for (db, block_data) in &stores[1..] {
            for b in [&g.pre_genesis, &g.genesis] {
                store_block(ctx, &**db, &**block_data, b)
                    .await
                    .wrap("store_block()")?;
            }
        }

        let dbs: Vec<_> = stores.iter().map(|(db, _)| db.clone()).collect();
        let mut executors = vec![];
        for (local, (db, block_data)) in locals.into_iter().zip(stores) {
            let cfg = Config {
                local,
                suffrage: suffrage.clone(),
                policy: self.policy.clone(),
            };
            executors.push(
                Executor::new(cfg, db, block_data, Arc::new(net.clone()))
                    .context("Executor::new()")?,
            );
        }
        let contexts: Vec<_> = executors.iter().map(|e| e.local().clone()).collect();
        let res = scope::run!(ctx, |ctx, s| async {
            for e in executors {
                s.spawn_bg(async { e.run(ctx).await.map_err(ctx::Error::Internal) });
            }
            let mut manifests = vec![];
            for local in &contexts {
                let m = local.wait_for_height(ctx, height).await?;
                tracing::info!(node = %local.address(), height = %m.height, "ISAAC localnet - node reached height");
                manifests.push(m);
            }
            Ok(manifests)
        })
        .await;
        let mut manifests = res.wrap("localnet")?;
        // Nodes may have gone past `height` before they were checked.
        for ((m, db), local) in manifests.iter_mut().zip(&dbs).zip(&contexts) {
            if m.height != height {
                *m = db
                    .manifest_by_height(ctx, height)
                    .await
                    .wrap("db.manifest_by_height()")?
                    .with_context(|| format!("{} has no block at {height}", local.address()))?;
            }
        }
        Ok(manifests)
    }
}
