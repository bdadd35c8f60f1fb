//! Encodings of keys, signatures and hashes.
//!
//! [`ByteFmt`] is what gets signed, hashed and stored. [`TextFmt`] is what
//! users see in config files and logs: a `<namespace>:<role>:<scheme>:<hex>`
//! string, e.g. `isaac:public:ed25519:3d40..`.
use anyhow::Context as _;

/// Text being parsed by [`TextFmt::decode`], prefix by prefix.
pub struct Text<'a> {
    /// Whole input, used in error messages.
    context: &'a str,
    /// Not yet parsed suffix of `context`.
    inner: &'a str,
}

impl<'a> Text<'a> {
    /// Starts parsing `s`.
    pub fn new(s: &'a str) -> Self {
        Self {
            context: s,
            inner: s,
        }
    }

    /// Already parsed part of the input.
    fn prefix(&self) -> &'a str {
        // `inner` is always a suffix of `context`, so the cut lands on a char boundary.
        &self.context[..self.context.len() - self.inner.len()]
    }

    /// Consumes `prefix`, failing if the text continues differently.
    pub fn strip(mut self, prefix: &str) -> anyhow::Result<Self> {
        let Some(inner) = self.inner.strip_prefix(prefix) else {
            anyhow::bail!("{}: expected {} got {}", self.prefix(), prefix, self.inner);
        };
        self.inner = inner;
        Ok(self)
    }

    /// Decodes the rest of the text as hex-encoded [`ByteFmt`] bytes.
    pub fn decode_hex<T: ByteFmt>(self) -> anyhow::Result<T> {
        let raw = hex::decode(self.inner).context(self.prefix().to_owned())?;
        ByteFmt::decode(&raw).context(self.prefix().to_owned())
    }

    /// Syntax sugar for `TextFmt::decode`.
    pub fn decode<T: TextFmt>(self) -> anyhow::Result<T> {
        TextFmt::decode(self)
    }
}

/// Human-readable encoding.
///
/// Encodings of different key roles must not parse as each other, and the
/// format must stay stable, since encoded keys live in config files.
pub trait TextFmt: Sized {
    /// Parses `text`.
    fn decode(text: Text) -> anyhow::Result<Self>;
    /// Renders `self`; `decode` of the result gives back `self`.
    fn encode(&self) -> String;
}

/// Canonical binary encoding, independent of any serializer.
pub trait ByteFmt: Sized {
    /// Parses `bytes`, rejecting malformed input.
    fn decode(bytes: &[u8]) -> anyhow::Result<Self>;
    /// Canonical bytes of `self`.
    fn encode(&self) -> Vec<u8>;
}

/// Serde adapter (de)serializing a `ByteFmt` value as a lowercase hex string.
/// Use it with `#[serde(with = "isaac_crypto::serde_hex")]`.
pub mod serde_hex {
    use super::ByteFmt;
    use serde::{de::Error as _, Deserialize as _, Deserializer, Serializer};

    /// Serializes `v` as hex.
    pub fn serialize<T: ByteFmt, S: Serializer>(v: &T, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v.encode()))
    }

    /// Deserializes a hex string into `T`.
    pub fn deserialize<'de, T: ByteFmt, D: Deserializer<'de>>(d: D) -> Result<T, D::Error> {
        let s = String::deserialize(d)?;
        let raw = hex::decode(s).map_err(D::Error::custom)?;
        T::decode(&raw).map_err(|err| D::Error::custom(format!("{err:#}")))
    }
}

/// Serde adapter (de)serializing a `TextFmt` value as its text encoding.
/// Use it with `#[serde(with = "isaac_crypto::serde_text")]`.
pub mod serde_text {
    use super::{Text, TextFmt};
    use serde::{de::Error as _, Deserialize as _, Deserializer, Serializer};

    /// Serializes `v` with `TextFmt::encode`.
    pub fn serialize<T: TextFmt, S: Serializer>(v: &T, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.encode())
    }

    /// Deserializes `T` with `TextFmt::decode`.
    pub fn deserialize<'de, T: TextFmt, D: Deserializer<'de>>(d: D) -> Result<T, D::Error> {
        let s = String::deserialize(d)?;
        Text::new(&s)
            .decode()
            .map_err(|err| D::Error::custom(format!("{err:#}")))
    }
}
