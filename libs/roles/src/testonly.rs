//! Test-only utilities.
use crate::{
    messages::{
        AcceptFact, Ballot, BallotFact, Block, Hash, Height, InitFact, Manifest, Operation,
        OperationInfo, OperationSeal, ProposalFact, Round, SignedFact, Threshold, Timestamp,
        Voteproof,
    },
    node::{Address, Keyring, LocalNode, NetworkId, Node, SecretKey},
    policy::PolicySnapshot,
    suffrage::{RoundRobinSuffrage, Suffrage as _},
    tree::FixedTree,
};
use rand::Rng;

/// A network of `n` nodes with deterministic addresses `node00`, `node01`, ...
/// Index `i` of `keys` belongs to index `i` of `nodes`, and `nodes` is sorted.
#[derive(Debug, Clone)]
pub struct Setup {
    /// Network id.
    pub network_id: NetworkId,
    /// Secret keys.
    pub keys: Vec<SecretKey>,
    /// Addresses.
    pub nodes: Vec<Address>,
    /// Policy shared by all nodes.
    pub policy: PolicySnapshot,
}

impl Setup {
    /// Generates a new setup.
    pub fn new(rng: &mut impl Rng, n: usize) -> Self {
        let network_id: NetworkId = rng.gen();
        Self {
            keys: (0..n).map(|_| rng.gen()).collect(),
            nodes: (0..n).map(|i| Address(format!("node{i:02}"))).collect(),
            policy: PolicySnapshot::new(network_id.clone()),
            network_id,
        }
    }

    /// Local identity of node `i`.
    pub fn local(&self, i: usize) -> LocalNode {
        LocalNode::new(self.nodes[i].clone(), self.keys[i].clone())
    }

    /// Public identities of all nodes.
    pub fn node_list(&self) -> Vec<Node> {
        (0..self.nodes.len()).map(|i| self.local(i).node()).collect()
    }

    /// Registered keys of all nodes.
    pub fn keyring(&self) -> Keyring {
        Keyring::new(self.node_list())
    }

    /// Round-robin suffrage over all nodes.
    pub fn suffrage(&self) -> RoundRobinSuffrage {
        RoundRobinSuffrage::new(
            self.nodes.clone(),
            self.policy.number_of_acting_suffrage_nodes as usize,
        )
        .unwrap()
    }

    /// Threshold of the whole suffrage.
    pub fn threshold(&self) -> Threshold {
        Threshold::new(self.nodes.len() as u64, self.policy.threshold_ratio)
    }

    /// Fact signed by node `i`.
    pub fn sign_fact(&self, i: usize, fact: BallotFact) -> SignedFact {
        SignedFact::sign(&self.local(i), &self.network_id, fact, Timestamp(0))
    }

    fn voteproof(&self, fact: BallotFact, signers: &[usize]) -> Voteproof {
        use crate::messages::Fact as _;
        Voteproof::from_votes(
            fact.height(),
            fact.round(),
            fact.stage(),
            self.threshold(),
            signers.iter().map(|i| self.sign_fact(*i, fact.clone())),
            Timestamp(0),
        )
    }

    /// INIT voteproof signed by `signers`.
    pub fn init_voteproof(
        &self,
        height: Height,
        round: Round,
        previous_block: Hash,
        signers: &[usize],
    ) -> Voteproof {
        self.voteproof(
            InitFact {
                height,
                round,
                previous_block,
            }
            .into(),
            signers,
        )
    }

    /// ACCEPT voteproof signed by `signers`.
    pub fn accept_voteproof(
        &self,
        height: Height,
        round: Round,
        proposal: Hash,
        new_block: Hash,
        signers: &[usize],
    ) -> Voteproof {
        self.voteproof(
            AcceptFact {
                height,
                round,
                proposal,
                new_block,
            }
            .into(),
            signers,
        )
    }

    /// INIT ballot of node `i` carrying `voteproof`.
    pub fn init_ballot(
        &self,
        i: usize,
        height: Height,
        round: Round,
        previous_block: Hash,
        voteproof: Voteproof,
    ) -> Ballot {
        Ballot::sign(
            &self.local(i),
            &self.network_id,
            InitFact {
                height,
                round,
                previous_block,
            }
            .into(),
            Some(voteproof),
            Timestamp(0),
        )
    }

    /// Operation seal with `n` random operations, signed by node 0.
    pub fn operation_seal(&self, rng: &mut impl Rng, n: usize) -> OperationSeal {
        let key = &self.keys[0];
        let ops = (0..n)
            .map(|_| Operation::sign(rng.gen(), key, &self.network_id, Timestamp(0)))
            .collect();
        OperationSeal::sign(ops, key, &self.network_id, Timestamp(0))
    }

    /// Index of the node with the given address.
    pub fn index_of(&self, addr: &Address) -> usize {
        self.nodes.iter().position(|a| a == addr).unwrap()
    }

    /// Proposal ballot of node `i` carrying the INIT `voteproof`.
    pub fn proposal(
        &self,
        i: usize,
        height: Height,
        round: Round,
        operations: Vec<OperationInfo>,
        voteproof: Voteproof,
    ) -> Ballot {
        Ballot::sign(
            &self.local(i),
            &self.network_id,
            ProposalFact {
                height,
                round,
                proposer: self.nodes[i].clone(),
                operations,
            }
            .into(),
            Some(voteproof),
            Timestamp(0),
        )
    }

    /// Finalized block without operations on top of `previous`, or the
    /// pre-genesis block if `previous` is `None`. Signed by every node.
    pub fn empty_block(&self, previous: Option<&Manifest>, round: Round) -> Block {
        let (height, previous_block) = match previous {
            Some(m) => (m.height.next(), m.hash),
            None => (Height::PRE_GENESIS, Hash::default()),
        };
        let all: Vec<_> = (0..self.nodes.len()).collect();
        let init_voteproof = self.init_voteproof(height, round, previous_block, &all);
        let acting = self.suffrage().acting(height, round);
        let proposal = self.proposal(
            self.index_of(&acting.proposer),
            height,
            round,
            vec![],
            init_voteproof.clone(),
        );
        let manifest = Manifest::new(
            height,
            round,
            proposal.hash(),
            previous_block,
            None,
            None,
            proposal.signed_at(),
        );
        let accept_voteproof =
            self.accept_voteproof(height, round, proposal.hash(), manifest.hash, &all);
        Block {
            init_voteproof,
            accept_voteproof: Some(accept_voteproof),
            operations: vec![],
            operations_tree: FixedTree::default(),
            states: vec![],
            states_tree: FixedTree::default(),
            proposal,
            suffrage_info: acting.info(),
            manifest,
        }
    }

    /// Chain of `n` empty blocks starting from pre-genesis.
    pub fn empty_chain(&self, n: usize) -> Vec<Block> {
        let mut chain: Vec<Block> = vec![];
        for _ in 0..n {
            let b = self.empty_block(chain.last().map(|b| &b.manifest), Round(0));
            chain.push(b);
        }
        chain
    }
}
