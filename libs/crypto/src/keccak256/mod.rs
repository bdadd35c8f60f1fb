//! Wrappers for the Keccak256 cryptographic hash algorithm.
//! Every content hash in ISAAC (facts, seals, manifests, states, tree nodes)
//! is a Keccak256 digest.
use crate::ByteFmt;
use sha3::Digest as _;
use std::fmt;

pub mod testonly;

/// Keccak256 hash.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Keccak256(pub(crate) [u8; 32]);

impl Keccak256 {
    /// Computes a Keccak256 hash of a message.
    pub fn new(msg: &[u8]) -> Self {
        Self(sha3::Keccak256::digest(msg).into())
    }

    /// Computes a hash of the concatenation of `parts`.
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut h = sha3::Keccak256::new();
        for p in parts {
            h.update(p);
        }
        Self(h.finalize().into())
    }

    /// Returns a reference to the bytes of this hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex of the hash.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Keccak256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Keccak256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl ByteFmt for Keccak256 {
    fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(Self(bytes.try_into()?))
    }

    fn encode(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}
