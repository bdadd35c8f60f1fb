//! Fixed merkle tree committing to the ordered operations and states of a block.
//!
//! The tree is a complete binary tree in array layout: node `i` has children
//! `2i+1` and `2i+2`. Every node carries a key (the hash of the item it
//! represents) and its hash is `H(key ‖ left.hash ‖ right.hash)`, where
//! missing children contribute nothing. The root is node 0.
use crate::messages::Hash;
use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests;

/// A node of the tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Hash of the item.
    pub key: Hash,
    /// Hash of the subtree rooted at this node.
    pub hash: Hash,
}

/// Error returned by tree validation.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    /// Node hash is inconsistent with its key and children.
    #[error("node {0}: hash mismatch")]
    HashMismatch(usize),
    /// Index beyond the tree.
    #[error("index {0} out of range")]
    OutOfRange(usize),
    /// Tree has no root.
    #[error("empty tree")]
    Empty,
    /// Proof does not lead to the expected root.
    #[error("proof does not match the root")]
    ProofMismatch,
    /// Tree keys do not match the items it commits to.
    #[error("node {0}: key does not match the item")]
    KeyMismatch(usize),
}

/// Fixed merkle tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FixedTree {
    nodes: Vec<TreeNode>,
}

fn node_hash(key: &Hash, left: Option<&Hash>, right: Option<&Hash>) -> Hash {
    let mut parts: Vec<&[u8]> = vec![key.as_bytes()];
    parts.extend(left.map(|h| &h.as_bytes()[..]));
    parts.extend(right.map(|h| &h.as_bytes()[..]));
    Hash::concat(parts)
}

impl FixedTree {
    /// Builds a tree over `keys`, in the given order.
    pub fn new(keys: impl IntoIterator<Item = Hash>) -> Self {
        let mut nodes: Vec<TreeNode> = keys
            .into_iter()
            .map(|key| TreeNode {
                key,
                hash: Hash::default(),
            })
            .collect();
        for i in (0..nodes.len()).rev() {
            let left = nodes.get(2 * i + 1).map(|n| n.hash);
            let right = nodes.get(2 * i + 2).map(|n| n.hash);
            nodes[i].hash = node_hash(&nodes[i].key, left.as_ref(), right.as_ref());
        }
        Self { nodes }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes in array order.
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    /// Root hash; `None` for an empty tree.
    pub fn root(&self) -> Option<Hash> {
        self.nodes.first().map(|n| n.hash)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl '_ + Iterator<Item = Hash> {
        self.nodes.iter().map(|n| n.key)
    }

    /// Recomputes every node hash.
    pub fn verify(&self) -> Result<(), TreeError> {
        for (i, n) in self.nodes.iter().enumerate() {
            let left = self.nodes.get(2 * i + 1).map(|n| &n.hash);
            let right = self.nodes.get(2 * i + 2).map(|n| &n.hash);
            if node_hash(&n.key, left, right) != n.hash {
                return Err(TreeError::HashMismatch(i));
            }
        }
        Ok(())
    }

    /// Checks that the tree commits to exactly `keys`, in order.
    pub fn verify_keys(&self, keys: impl IntoIterator<Item = Hash>) -> Result<(), TreeError> {
        let mut n = 0;
        for (i, k) in keys.into_iter().enumerate() {
            match self.nodes.get(i) {
                Some(node) if node.key == k => n += 1,
                _ => return Err(TreeError::KeyMismatch(i)),
            }
        }
        if n != self.nodes.len() {
            return Err(TreeError::KeyMismatch(n));
        }
        self.verify()
    }

    /// Proof that the node at `index` is part of the tree.
    pub fn proof(&self, index: usize) -> Result<TreeProof, TreeError> {
        let node = self.nodes.get(index).ok_or(TreeError::OutOfRange(index))?;
        let children = [
            self.nodes.get(2 * index + 1).map(|n| n.hash),
            self.nodes.get(2 * index + 2).map(|n| n.hash),
        ];
        let mut path = vec![];
        let mut i = index;
        while i > 0 {
            let parent = (i - 1) / 2;
            let is_left = i % 2 == 1;
            let sibling = if is_left { i + 1 } else { i - 1 };
            path.push(ProofStep {
                key: self.nodes[parent].key,
                sibling: self.nodes.get(sibling).map(|n| n.hash),
                is_left,
            });
            i = parent;
        }
        Ok(TreeProof {
            key: node.key,
            children,
            path,
        })
    }
}

/// Step of a proof: the parent of the current node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    /// Key of the parent.
    pub key: Hash,
    /// Hash of the sibling of the current node.
    pub sibling: Option<Hash>,
    /// Whether the current node is the left child.
    pub is_left: bool,
}

/// Inclusion proof of a single key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeProof {
    /// Proved key.
    pub key: Hash,
    /// Hashes of the children of the proved node.
    pub children: [Option<Hash>; 2],
    /// Path to the root.
    pub path: Vec<ProofStep>,
}

impl TreeProof {
    /// Checks that the proof leads to `root`.
    pub fn verify(&self, root: &Hash) -> Result<(), TreeError> {
        let mut h = node_hash(
            &self.key,
            self.children[0].as_ref(),
            self.children[1].as_ref(),
        );
        for step in &self.path {
            h = if step.is_left {
                node_hash(&step.key, Some(&h), step.sibling.as_ref())
            } else {
                let Some(sibling) = &step.sibling else {
                    return Err(TreeError::ProofMismatch);
                };
                node_hash(&step.key, Some(sibling), Some(&h))
            };
        }
        if &h != root {
            return Err(TreeError::ProofMismatch);
        }
        Ok(())
    }
}
