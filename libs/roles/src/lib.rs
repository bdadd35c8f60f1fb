//! Data model of the ISAAC consensus engine.
//!
//! - `node`: node identities (addresses, keys, network id).
//! - `messages`: everything that gets signed, voted on or stored: ballot facts,
//!   ballots, voteproofs, operations, seals, states, manifests and blocks.
//! - `tree`: the fixed merkle tree committing to the operations and states of a block.
//! - `suffrage`: the deterministic mapping from (height, round) to proposer and acting set.
//! - `policy`: the locally configured consensus parameters.

pub mod messages;
pub mod node;
pub mod policy;
pub mod suffrage;
pub mod testonly;
pub mod tree;

mod serde_ms;
