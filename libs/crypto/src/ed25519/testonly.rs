//! Random keys and signatures for tests.

use super::{SecretKey, Signature};
use rand::{
    distributions::{Distribution, Standard},
    Rng,
};

impl Distribution<SecretKey> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> SecretKey {
        SecretKey(ed25519_dalek::SigningKey::from_bytes(&rng.gen()))
    }
}

/// Signature of a random message by a random key.
impl Distribution<Signature> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Signature {
        let key: SecretKey = rng.gen();
        key.sign(&rng.gen::<[u8; 32]>(), b"testonly")
    }
}
