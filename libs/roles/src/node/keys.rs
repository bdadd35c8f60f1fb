//! Cryptographic keys representing a node.
//! Every signature made by a node covers `hash ‖ network_id`, so that
//! messages signed for one deployment never verify in another.

use crate::messages::Hash;
pub use ed25519::InvalidSignatureError;
use isaac_crypto::{ed25519, serde_hex, serde_text, ByteFmt, Text, TextFmt};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, sync::Arc};

/// A node's secret key.
#[derive(Clone, PartialEq)]
pub struct SecretKey(pub(super) Arc<ed25519::SecretKey>);

impl SecretKey {
    /// Generates a secret key from a cryptographically-secure entropy source.
    pub fn generate() -> Self {
        Self(Arc::new(ed25519::SecretKey::generate()))
    }

    /// Signs a hash for the given network.
    pub fn sign(&self, hash: &Hash, network_id: &NetworkId) -> Signature {
        Signature(self.0.sign(hash.as_bytes(), &network_id.0))
    }

    /// Get the public key corresponding to this secret key.
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.public())
    }
}

impl ByteFmt for SecretKey {
    fn encode(&self) -> Vec<u8> {
        ByteFmt::encode(&*self.0)
    }
    fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        ByteFmt::decode(bytes).map(|k| Self(Arc::new(k)))
    }
}

impl TextFmt for SecretKey {
    fn encode(&self) -> String {
        format!("isaac:secret:ed25519:{}", hex::encode(ByteFmt::encode(self)))
    }
    fn decode(text: Text) -> anyhow::Result<Self> {
        text.strip("isaac:secret:ed25519:")?.decode_hex()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "<secret for {}>", TextFmt::encode(&self.public()))
    }
}

/// A node's public key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey(pub(super) ed25519::PublicKey);

impl PublicKey {
    /// Verifies a signature of `hash` made for the given network.
    pub fn verify(
        &self,
        hash: &Hash,
        network_id: &NetworkId,
        sig: &Signature,
    ) -> Result<(), InvalidSignatureError> {
        self.0.verify(hash.as_bytes(), &network_id.0, &sig.0)
    }
}

impl ByteFmt for PublicKey {
    fn encode(&self) -> Vec<u8> {
        ByteFmt::encode(&self.0)
    }
    fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        ByteFmt::decode(bytes).map(Self)
    }
}

impl TextFmt for PublicKey {
    fn encode(&self) -> String {
        format!("isaac:public:ed25519:{}", hex::encode(ByteFmt::encode(self)))
    }
    fn decode(text: Text) -> anyhow::Result<Self> {
        text.strip("isaac:public:ed25519:")?.decode_hex()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(&TextFmt::encode(self))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde_text::serialize(self, s)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        serde_text::deserialize(d)
    }
}

/// A signature made by a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(pub(super) ed25519::Signature);

impl ByteFmt for Signature {
    fn encode(&self) -> Vec<u8> {
        ByteFmt::encode(&self.0)
    }
    fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        ByteFmt::decode(bytes).map(Self)
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde_hex::serialize(self, s)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        serde_hex::deserialize(d)
    }
}

/// Address uniquely identifying a node in the network.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
    /// Borrows the address as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, fmt)
    }
}

/// Domain separator mixed into every signature.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct NetworkId(pub Vec<u8>);

impl NetworkId {
    /// Raw bytes of the id.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for NetworkId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl fmt::Debug for NetworkId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "NetworkId({})", String::from_utf8_lossy(&self.0))
    }
}

impl ByteFmt for NetworkId {
    fn encode(&self) -> Vec<u8> {
        self.0.clone()
    }
    fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(!bytes.is_empty(), "empty network id");
        Ok(Self(bytes.to_vec()))
    }
}

impl Serialize for NetworkId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde_hex::serialize(self, s)
    }
}

impl<'de> Deserialize<'de> for NetworkId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        serde_hex::deserialize(d)
    }
}
