use super::*;
use crate::messages::Hash;
use isaac_crypto::{ByteFmt, Text, TextFmt};
use rand::Rng as _;
use zksync_concurrency::ctx;

#[test]
fn test_byte_encoding() {
    let key = SecretKey::generate();
    assert_eq!(key, ByteFmt::decode(&ByteFmt::encode(&key)).unwrap());
    assert_eq!(
        key.public(),
        ByteFmt::decode(&ByteFmt::encode(&key.public())).unwrap()
    );
}

#[test]
fn test_text_encoding() {
    let key = SecretKey::generate();
    let t1 = TextFmt::encode(&key);
    let t2 = TextFmt::encode(&key.public());
    assert!(t1.starts_with("isaac:secret:ed25519:"));
    assert_eq!(key, Text::new(&t1).decode::<SecretKey>().unwrap());
    assert_eq!(key.public(), Text::new(&t2).decode().unwrap());
    assert!(Text::new(&t1).decode::<PublicKey>().is_err());
    assert!(Text::new(&t2).decode::<SecretKey>().is_err());
}

#[test]
fn test_public_key_serde() {
    let key = SecretKey::generate().public();
    let json = serde_json::to_string(&key).unwrap();
    assert_eq!(json, format!("\"{}\"", TextFmt::encode(&key)));
    let got: PublicKey = serde_json::from_str(&json).unwrap();
    assert_eq!(key, got);
}

#[test]
fn test_signature_is_bound_to_network() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let hash: Hash = rng.gen();
    let other_hash: Hash = rng.gen();
    let network: NetworkId = "isaac-a".into();
    let key1: SecretKey = rng.gen();
    let key2: SecretKey = rng.gen();

    let sig = key1.sign(&hash, &network);
    assert!(key1.public().verify(&hash, &network, &sig).is_ok());
    // Mismatching hash.
    assert!(key1.public().verify(&other_hash, &network, &sig).is_err());
    // Mismatching key.
    assert!(key2.public().verify(&hash, &network, &sig).is_err());
    // Mismatching network.
    assert!(key1
        .public()
        .verify(&hash, &"isaac-b".into(), &sig)
        .is_err());
}
