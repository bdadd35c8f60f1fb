//! Node configuration.
use crate::rpc::RpcTransport;
use anyhow::Context as _;
use isaac_executor as executor;
use isaac_roles::{
    node::{Address, LocalNode, NetworkId, Node, PublicKey, SecretKey},
    policy::{PolicySnapshot, PolicyUpdate},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

/// Member of the suffrage, as listed in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuffrageMember {
    pub address: Address,
    pub public_key: PublicKey,
    /// URL of the member's JSON-RPC server, e.g. `http://127.0.0.1:3054`.
    pub rpc_url: String,
}

impl SuffrageMember {
    pub fn node(&self) -> Node {
        Node {
            address: self.address.clone(),
            public_key: self.public_key.clone(),
        }
    }
}

/// Main struct that holds the config options for the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub network_id: String,
    pub address: Address,
    #[serde(with = "isaac_crypto::serde_text")]
    pub secret_key: SecretKey,
    /// Holds the database, the block-data store and the log file.
    pub data_dir: PathBuf,
    /// Address the JSON-RPC server listens on.
    pub rpc_addr: SocketAddr,
    pub suffrage: Vec<SuffrageMember>,
    pub number_of_acting_suffrage_nodes: u64,
    #[serde(default)]
    pub policy: PolicyUpdate,
    #[serde(default)]
    pub metrics_server_addr: Option<SocketAddr>,
}

impl AppConfig {
    /// Reads and checks the config file at `path`.
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw).context("failed decoding config")?;
        cfg.check().context("invalid config")?;
        Ok(cfg)
    }

    /// Writes the config file to `path`.
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let raw = serde_json::to_string_pretty(self).context("serde_json::to_string_pretty()")?;
        fs::write(path, raw).with_context(|| format!("failed writing {}", path.display()))
    }

    pub fn check(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.network_id.is_empty(), "empty network_id");
        anyhow::ensure!(
            self.number_of_acting_suffrage_nodes > 0,
            "number_of_acting_suffrage_nodes must be positive"
        );
        let mut urls = HashSet::new();
        for m in &self.suffrage {
            anyhow::ensure!(
                urls.insert(&m.rpc_url),
                "rpc_url {} listed twice",
                m.rpc_url
            );
        }
        self.executor_config().check()
    }

    /// Policy of the node: defaults, then the overrides, then the acting set size.
    pub fn policy(&self) -> PolicySnapshot {
        let mut policy = PolicySnapshot::new(NetworkId::from(self.network_id.as_str()));
        self.policy.apply(&mut policy);
        policy.number_of_acting_suffrage_nodes = self.number_of_acting_suffrage_nodes;
        policy
    }

    pub fn local(&self) -> LocalNode {
        LocalNode::new(self.address.clone(), self.secret_key.clone())
    }

    pub fn executor_config(&self) -> executor::Config {
        executor::Config {
            local: self.local(),
            suffrage: self.suffrage.iter().map(SuffrageMember::node).collect(),
            policy: self.policy(),
        }
    }

    /// JSON-RPC transport reaching every other suffrage member.
    pub fn transport(&self) -> RpcTransport {
        let peers: HashMap<_, _> = self
            .suffrage
            .iter()
            .filter(|m| m.address != self.address)
            .map(|m| (m.address.clone(), m.rpc_url.clone()))
            .collect();
        RpcTransport::new(
            self.rpc_addr,
            peers,
            self.policy().network_connection_timeout,
        )
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("database")
    }

    pub fn block_data_path(&self) -> PathBuf {
        self.data_dir.join("blockdata")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("logs").join("isaac.log")
    }
}
