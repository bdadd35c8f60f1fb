//! Remote nodes known to the local node.
use crate::Channel;
use isaac_roles::node::{Address, Keyring, Node, PublicKey};
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

/// A remote node with the channel to reach it.
#[derive(Debug, Clone)]
pub struct RemoteNode {
    /// Identity.
    pub node: Node,
    /// Channel to the node.
    pub channel: Arc<dyn Channel>,
}

/// Pool of remote nodes keyed by address. The local node is kept apart.
#[derive(Debug)]
pub struct NodePool {
    local: Node,
    remotes: RwLock<BTreeMap<Address, RemoteNode>>,
}

impl NodePool {
    /// Constructs an empty pool for `local`.
    pub fn new(local: Node) -> Self {
        Self {
            local,
            remotes: RwLock::default(),
        }
    }

    /// Local node.
    pub fn local(&self) -> &Node {
        &self.local
    }

    /// Adds a remote node. Fails for the local address or an address already present.
    pub fn add(&self, node: Node, channel: Arc<dyn Channel>) -> anyhow::Result<()> {
        anyhow::ensure!(
            node.address != self.local.address,
            "{} is the local node",
            node.address
        );
        let mut remotes = self.remotes.write().unwrap();
        anyhow::ensure!(
            !remotes.contains_key(&node.address),
            "{} is already in the pool",
            node.address
        );
        remotes.insert(node.address.clone(), RemoteNode { node, channel });
        Ok(())
    }

    /// Removes a remote node. Returns false if it was not in the pool.
    pub fn remove(&self, address: &Address) -> bool {
        self.remotes.write().unwrap().remove(address).is_some()
    }

    /// Remote node with the given address.
    pub fn get(&self, address: &Address) -> Option<RemoteNode> {
        self.remotes.read().unwrap().get(address).cloned()
    }

    /// Channel to the remote node with the given address.
    pub fn channel(&self, address: &Address) -> Option<Arc<dyn Channel>> {
        self.get(address).map(|r| r.channel)
    }

    /// Whether `address` is the local node or a remote node of the pool.
    pub fn exists(&self, address: &Address) -> bool {
        address == &self.local.address || self.remotes.read().unwrap().contains_key(address)
    }

    /// Registered key of the local or a remote node.
    pub fn public_key(&self, address: &Address) -> Option<PublicKey> {
        if address == &self.local.address {
            return Some(self.local.public_key.clone());
        }
        let remotes = self.remotes.read().unwrap();
        Some(remotes.get(address)?.node.public_key.clone())
    }

    /// Registered keys of the local node and all remote nodes.
    pub fn keyring(&self) -> Keyring {
        let remotes = self.remotes.read().unwrap();
        Keyring::new(
            std::iter::once(self.local.clone()).chain(remotes.values().map(|r| r.node.clone())),
        )
    }

    /// All remote nodes, ordered by address.
    pub fn remotes(&self) -> Vec<RemoteNode> {
        self.remotes.read().unwrap().values().cloned().collect()
    }

    /// Number of remote nodes.
    pub fn len(&self) -> usize {
        self.remotes.read().unwrap().len()
    }
}
