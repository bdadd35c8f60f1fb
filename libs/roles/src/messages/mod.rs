//! Messages exchanged and stored by ISAAC nodes.

mod ballot;
mod base;
mod block;
mod fact;
mod hash;
mod operation;
mod seal;
mod state;
pub mod testonly;
#[cfg(test)]
mod tests;
mod voteproof;

pub use ballot::*;
pub use base::*;
pub use block::*;
pub use fact::*;
pub use hash::*;
pub use operation::*;
pub use seal::*;
pub use state::*;
pub use voteproof::*;

/// Canonical byte encoding of a value, used as the preimage of content hashes.
///
/// Structs encode their fields in declaration order and maps are `BTreeMap`s,
/// so the encoding is deterministic.
pub fn canonical<T: serde::Serialize + ?Sized>(v: &T) -> Vec<u8> {
    // Only fails for maps with non-string keys, which none of the message types contain.
    serde_json::to_vec(v).expect("message types have string map keys")
}
