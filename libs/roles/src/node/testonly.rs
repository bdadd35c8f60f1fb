//! Random generation of node identities, intended for use in testing.
use super::{Address, NetworkId, SecretKey, Signature};
use rand::{
    distributions::{Distribution, Standard},
    Rng,
};
use std::sync::Arc;

impl Distribution<Signature> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Signature {
        Signature(rng.gen())
    }
}

impl Distribution<SecretKey> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> SecretKey {
        SecretKey(Arc::new(rng.gen()))
    }
}

impl Distribution<Address> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Address {
        Address(format!("node-{:08x}", rng.gen::<u32>()))
    }
}

impl Distribution<NetworkId> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> NetworkId {
        NetworkId(format!("isaac-test-{}", rng.gen::<u16>()).into_bytes())
    }
}
