use super::*;
use assert_matches::assert_matches;
use rand::Rng as _;
use test_casing::test_casing;
use zksync_concurrency::ctx;

#[test]
fn test_empty_tree_has_no_root() {
    let tree = FixedTree::new([]);
    assert_eq!(tree.root(), None);
    tree.verify().unwrap();
}

#[test]
fn test_single_node_root() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let key: Hash = rng.gen();
    let tree = FixedTree::new([key]);
    assert_eq!(tree.root(), Some(Hash::concat([&key.as_bytes()[..]])));
}

#[test_casing(5, [1, 2, 3, 7, 10])]
#[test]
fn test_proofs(size: usize) {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let keys: Vec<Hash> = (0..size).map(|_| rng.gen()).collect();
    let tree = FixedTree::new(keys.clone());
    tree.verify_keys(keys).unwrap();
    let root = tree.root().unwrap();
    for i in 0..size {
        tree.proof(i).unwrap().verify(&root).unwrap();
    }
    assert_matches!(tree.proof(size), Err(TreeError::OutOfRange(_)));

    // A proof for a different key does not verify.
    let mut proof = tree.proof(size - 1).unwrap();
    proof.key = rng.gen();
    assert_matches!(proof.verify(&root), Err(TreeError::ProofMismatch));
}

#[test]
fn test_order_matters() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let a: Hash = rng.gen();
    let b: Hash = rng.gen();
    assert_ne!(FixedTree::new([a, b]).root(), FixedTree::new([b, a]).root());
    assert_matches!(
        FixedTree::new([a, b]).verify_keys([b, a]),
        Err(TreeError::KeyMismatch(0))
    );
    assert_matches!(
        FixedTree::new([a, b]).verify_keys([a]),
        Err(TreeError::KeyMismatch(1))
    );
}

#[test]
fn test_tampered_tree_is_detected() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let keys: Vec<Hash> = (0..5).map(|_| rng.gen()).collect();
    let tree = FixedTree::new(keys);
    let mut json: serde_json::Value = serde_json::to_value(&tree).unwrap();
    json[3]["key"] = serde_json::to_value(rng.gen::<Hash>()).unwrap();
    let tampered: FixedTree = serde_json::from_value(json).unwrap();
    assert_matches!(tampered.verify(), Err(TreeError::HashMismatch(3)));
}
