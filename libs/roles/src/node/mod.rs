//! Node identities.

mod keys;
pub mod testonly;
#[cfg(test)]
mod tests;

pub use keys::*;
use serde::{Deserialize, Serialize};

/// Public identity of a suffrage member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Address of the node.
    pub address: Address,
    /// Key the node signs its ballots with.
    pub public_key: PublicKey,
}

/// The node whose secret key is held by this process.
#[derive(Clone, Debug)]
pub struct LocalNode {
    /// Address of the node.
    pub address: Address,
    /// Signing key.
    pub key: SecretKey,
}

impl LocalNode {
    /// Constructs a local node.
    pub fn new(address: Address, key: SecretKey) -> Self {
        Self { address, key }
    }

    /// Public identity of the local node.
    pub fn node(&self) -> Node {
        Node {
            address: self.address.clone(),
            public_key: self.key.public(),
        }
    }
}

/// Registered public keys of the suffrage members, by address.
///
/// A vote is only accepted if it was signed with the key registered for
/// its signer; the key embedded in a signed fact is not trusted on its own.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Keyring(std::collections::BTreeMap<Address, PublicKey>);

impl Keyring {
    /// Keyring of the given nodes. Later entries win on duplicate addresses.
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Self {
        Self(
            nodes
                .into_iter()
                .map(|n| (n.address, n.public_key))
                .collect(),
        )
    }

    /// Registered key of `addr`.
    pub fn get(&self, addr: &Address) -> Option<&PublicKey> {
        self.0.get(addr)
    }

    /// Whether `key` is the registered key of `addr`.
    pub fn is_registered(&self, addr: &Address, key: &PublicKey) -> bool {
        self.get(addr) == Some(key)
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no node is registered.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
