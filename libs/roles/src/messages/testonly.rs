//! Random message generation, intended for use in testing.
use super::{Hash, OperationFact};
use rand::{
    distributions::{Distribution, Standard},
    Rng,
};

impl Distribution<Hash> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Hash {
        Hash(rng.gen())
    }
}

impl Distribution<OperationFact> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> OperationFact {
        OperationFact {
            kind: "kv-set".to_owned(),
            body: serde_json::json!({
                "key": format!("key-{}", rng.gen_range(0..1000)),
                "value": format!("value-{}", rng.gen::<u32>()),
            }),
            token: hex::encode(rng.gen::<[u8; 8]>()),
        }
    }
}
