//! Suffrage: the deterministic mapping from (height, round) to the proposer
//! and the acting set of a round.
use crate::{
    messages::{Height, Round, SuffrageInfo},
    node::Address,
};
use std::fmt;

/// Proposer and acting set of a single round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActingSuffrage {
    /// Height.
    pub height: Height,
    /// Round.
    pub round: Round,
    /// Proposer.
    pub proposer: Address,
    /// Acting nodes, starting with the proposer.
    pub nodes: Vec<Address>,
}

impl ActingSuffrage {
    /// Whether `node` acts in this round.
    pub fn exists(&self, node: &Address) -> bool {
        self.nodes.contains(node)
    }

    /// Suffrage info stored with a block.
    pub fn info(&self) -> SuffrageInfo {
        SuffrageInfo {
            proposer: self.proposer.clone(),
            nodes: self.nodes.clone(),
        }
    }
}

/// Membership of the network and the rule selecting proposers.
/// Implementations must be pure: every node computes the same acting suffrage.
pub trait Suffrage: 'static + fmt::Debug + Send + Sync {
    /// All suffrage members, in canonical order.
    fn nodes(&self) -> &[Address];

    /// Acting suffrage of a round.
    fn acting(&self, height: Height, round: Round) -> ActingSuffrage;

    /// Whether `node` is a suffrage member.
    fn is_inside(&self, node: &Address) -> bool {
        self.nodes().contains(node)
    }

    /// Whether `node` proposes in the given round.
    fn is_proposer(&self, height: Height, round: Round, node: &Address) -> bool {
        &self.acting(height, round).proposer == node
    }

    /// Whether `node` acts in the given round.
    fn is_acting(&self, height: Height, round: Round, node: &Address) -> bool {
        self.acting(height, round).exists(node)
    }
}

/// Rotates the proposer through the sorted member list by `height + round`.
/// The acting set is the proposer followed by the next members in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundRobinSuffrage {
    nodes: Vec<Address>,
    number_of_acting: usize,
}

impl RoundRobinSuffrage {
    /// Constructs a suffrage over `nodes`, with acting sets of size `number_of_acting`
    /// (capped at the number of members).
    pub fn new(mut nodes: Vec<Address>, number_of_acting: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(!nodes.is_empty(), "empty suffrage");
        anyhow::ensure!(number_of_acting > 0, "acting set must not be empty");
        nodes.sort();
        let n = nodes.len();
        nodes.dedup();
        anyhow::ensure!(n == nodes.len(), "duplicate suffrage member");
        Ok(Self {
            number_of_acting: number_of_acting.min(nodes.len()),
            nodes,
        })
    }
}

impl Suffrage for RoundRobinSuffrage {
    fn nodes(&self) -> &[Address] {
        &self.nodes
    }

    fn acting(&self, height: Height, round: Round) -> ActingSuffrage {
        let n = self.nodes.len() as u64;
        // Height can be -1, so rotate in i128 before reducing.
        let start = ((height.0 as i128 + round.0 as i128).rem_euclid(n as i128)) as usize;
        let nodes: Vec<_> = (0..self.number_of_acting)
            .map(|i| self.nodes[(start + i) % self.nodes.len()].clone())
            .collect();
        ActingSuffrage {
            height,
            round,
            proposer: nodes[0].clone(),
            nodes,
        }
    }
}

/// Suffrage with a fixed proposer in every round. Used for single-node
/// networks and for generating genesis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FixedSuffrage {
    proposer: Address,
    nodes: Vec<Address>,
}

impl FixedSuffrage {
    /// Constructs a suffrage in which `proposer` always proposes and all `nodes` act.
    pub fn new(proposer: Address, mut nodes: Vec<Address>) -> Self {
        if !nodes.contains(&proposer) {
            nodes.push(proposer.clone());
        }
        nodes.sort();
        Self { proposer, nodes }
    }
}

impl Suffrage for FixedSuffrage {
    fn nodes(&self) -> &[Address] {
        &self.nodes
    }

    fn acting(&self, height: Height, round: Round) -> ActingSuffrage {
        let mut nodes = vec![self.proposer.clone()];
        nodes.extend(self.nodes.iter().filter(|n| *n != &self.proposer).cloned());
        ActingSuffrage {
            height,
            round,
            proposer: self.proposer.clone(),
            nodes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(n: usize) -> Vec<Address> {
        (0..n).map(|i| Address(format!("n{i}"))).collect()
    }

    #[test]
    fn test_round_robin_rotates() {
        let s = RoundRobinSuffrage::new(addrs(3), 2).unwrap();
        let a = s.acting(Height(1), Round(0));
        assert_eq!(Address::from("n1"), a.proposer);
        assert_eq!(vec![Address::from("n1"), Address::from("n2")], a.nodes);
        // Next round elects the next node.
        assert_eq!(Address::from("n2"), s.acting(Height(1), Round(1)).proposer);
        // Wraps around, including the pre-genesis height.
        assert_eq!(Address::from("n0"), s.acting(Height(1), Round(2)).proposer);
        assert_eq!(
            Address::from("n2"),
            s.acting(Height::PRE_GENESIS, Round(0)).proposer
        );
        assert!(s.is_acting(Height(1), Round(0), &"n2".into()));
        assert!(!s.is_acting(Height(1), Round(0), &"n0".into()));
        assert!(s.is_inside(&"n0".into()));
        assert!(!s.is_inside(&"x".into()));
    }

    #[test]
    fn test_round_robin_rejects_duplicates() {
        let mut nodes = addrs(2);
        nodes.push("n0".into());
        assert!(RoundRobinSuffrage::new(nodes, 1).is_err());
        assert!(RoundRobinSuffrage::new(vec![], 1).is_err());
    }

    #[test]
    fn test_fixed_suffrage() {
        let s = FixedSuffrage::new("n1".into(), addrs(3));
        for r in 0..5 {
            assert!(s.is_proposer(Height(r), Round(r as u64), &"n1".into()));
        }
        assert_eq!(3, s.acting(Height(0), Round(0)).nodes.len());
    }
}
