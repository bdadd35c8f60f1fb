//! ed25519 signatures scoped to a network.
//!
//! A signature always covers `msg ‖ network_id`, so a signature made for one
//! deployment never verifies in another. Verification is strict: small-order
//! keys and non-canonical signatures are rejected.

use crate::ByteFmt;
use anyhow::Context as _;
use ed25519_dalek as ed;
use std::{cmp::Ordering, fmt, hash};
use zeroize::Zeroizing;

pub mod testonly;

/// Buffer of `msg ‖ network_id`, wiped once signed or verified.
fn signing_payload(msg: &[u8], network_id: &[u8]) -> Zeroizing<Vec<u8>> {
    Zeroizing::new([msg, network_id].concat())
}

/// ed25519 secret key.
#[derive(Clone)]
pub struct SecretKey(ed::SigningKey);

impl SecretKey {
    /// Generates a key from the OS entropy source.
    pub fn generate() -> Self {
        Self(ed::SigningKey::generate(&mut rand::rngs::OsRng))
    }

    /// Signs `msg` for the network `network_id`.
    pub fn sign(&self, msg: &[u8], network_id: &[u8]) -> Signature {
        self.sign_raw(&signing_payload(msg, network_id))
    }

    /// Signs `msg` as is, without a network id.
    pub fn sign_raw(&self, msg: &[u8]) -> Signature {
        Signature(ed::Signer::sign(&self.0, msg))
    }

    /// Public key of this secret key.
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.public() == other.public()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(of {:?})", self.public())
    }
}

impl ByteFmt for SecretKey {
    fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let seed: Zeroizing<ed::SecretKey> = Zeroizing::new(
            bytes
                .try_into()
                .context("secret key must be 32 bytes long")?,
        );
        Ok(Self(ed::SigningKey::from_bytes(&seed)))
    }

    fn encode(&self) -> Vec<u8> {
        self.0.to_bytes().into()
    }
}

/// ed25519 public key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(ed::VerifyingKey);

impl PublicKey {
    /// Verifies a signature made with [`SecretKey::sign`] for `network_id`.
    pub fn verify(
        &self,
        msg: &[u8],
        network_id: &[u8],
        sig: &Signature,
    ) -> Result<(), InvalidSignatureError> {
        self.verify_raw(&signing_payload(msg, network_id), sig)
    }

    /// Verifies a signature made with [`SecretKey::sign_raw`].
    pub fn verify_raw(&self, msg: &[u8], sig: &Signature) -> Result<(), InvalidSignatureError> {
        self.0
            .verify_strict(msg, &sig.0)
            .map_err(|_| InvalidSignatureError)
    }

    fn as_bytes(&self) -> &[u8; ed::PUBLIC_KEY_LENGTH] {
        self.0.as_bytes()
    }
}

// Keys are compared and hashed by their compressed encoding.
impl hash::Hash for PublicKey {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ed25519:{}", hex::encode(&self.as_bytes()[..8]))
    }
}

impl ByteFmt for PublicKey {
    fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let bytes: &[u8; ed::PUBLIC_KEY_LENGTH] = bytes
            .try_into()
            .context("public key must be 32 bytes long")?;
        let key = ed::VerifyingKey::from_bytes(bytes).context("not a curve point")?;
        anyhow::ensure!(!key.is_weak(), "small-order public key");
        Ok(Self(key))
    }

    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

/// ed25519 signature.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(ed::Signature);

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig:{}", hex::encode(&self.0.r_bytes()[..8]))
    }
}

impl ByteFmt for Signature {
    fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let bytes: &[u8; ed::SIGNATURE_LENGTH] = bytes
            .try_into()
            .context("signature must be 64 bytes long")?;
        Ok(Self(ed::Signature::from_bytes(bytes)))
    }

    fn encode(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }
}

/// Signature doesn't match the key, the message or the network id.
#[derive(Debug, thiserror::Error)]
#[error("invalid signature")]
pub struct InvalidSignatureError;
