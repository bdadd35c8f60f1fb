use isaac_crypto::{keccak256::Keccak256, serde_hex, ByteFmt, Text, TextFmt};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Content address of a message.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash(pub Keccak256);

impl Hash {
    /// Hash of the canonical encoding of `v`.
    pub fn of<T: Serialize + ?Sized>(v: &T) -> Self {
        Self(Keccak256::new(&super::canonical(v)))
    }

    /// Hash of raw bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(Keccak256::new(bytes))
    }

    /// Hash of the concatenation of `parts`.
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        Self(Keccak256::concat(parts))
    }

    /// Bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Lowercase hex of the hash.
    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl ByteFmt for Hash {
    fn encode(&self) -> Vec<u8> {
        ByteFmt::encode(&self.0)
    }
    fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        ByteFmt::decode(bytes).map(Self)
    }
}

impl TextFmt for Hash {
    fn encode(&self) -> String {
        format!("hash:keccak256:{}", self.to_hex())
    }
    fn decode(text: Text) -> anyhow::Result<Self> {
        text.strip("hash:keccak256:")?.decode_hex()
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde_hex::serialize(self, s)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        serde_hex::deserialize(d)
    }
}
