use super::*;
use crate::testonly::TestStore;
use assert_matches::assert_matches;
use isaac_roles::{
    messages::{
        Block, BlockDataMap, OperationSeal, Round, Seal, Stage, State, StateValue, Timestamp,
    },
    testonly::Setup,
};
use pretty_assertions::assert_eq;
use rand::Rng as _;
use zksync_concurrency::ctx;

#[tokio::test]
async fn test_commit_and_read_back() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    let chain = setup.empty_chain(4);
    let store = TestStore::new();
    store.put_blocks(ctx, &chain).await.unwrap();

    let last = store.db.last_manifest(ctx).await.unwrap().unwrap();
    assert_eq!(chain[3].manifest, last);
    for b in &chain {
        assert_eq!(Some(b), store.db.block(ctx, &b.hash()).await.unwrap().as_ref());
        assert_eq!(
            Some(&b.manifest),
            store.db.manifest_by_height(ctx, b.height()).await.unwrap().as_ref()
        );
        assert!(store.block_data.exists(ctx, b.height()).await.unwrap());
        let map = store.db.block_data_map(ctx, b.height()).await.unwrap().unwrap();
        map.verify().unwrap();
        assert_eq!(Some(map), store.block_data.map(ctx, b.height()).await.unwrap());
    }
    let accept = store.db.last_voteproof(ctx, Stage::Accept).await.unwrap();
    assert_eq!(chain[3].accept_voteproof, accept);
}

#[tokio::test]
async fn test_commit_rejects_gap() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    let chain = setup.empty_chain(3);
    let store = TestStore::new();
    store.put_blocks(ctx, &chain[..1]).await.unwrap();
    assert!(store.put_blocks(ctx, &chain[2..]).await.is_err());
    // Nothing of the rejected block is left behind.
    assert!(!store.block_data.exists(ctx, chain[2].height()).await.unwrap());
    assert_eq!(
        chain[0].height(),
        store.db.last_manifest(ctx).await.unwrap().unwrap().height
    );
}

#[tokio::test]
async fn test_commit_requires_accept_voteproof() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    let mut block = setup.empty_block(None, Round(0));
    block.accept_voteproof = None;
    let store = TestStore::new();
    assert!(store.put_blocks(ctx, &[block]).await.is_err());
    assert_eq!(None, store.db.last_manifest(ctx).await.unwrap());
}

#[tokio::test]
async fn test_clean_by_height() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    let chain = setup.empty_chain(5);
    let store = TestStore::new();
    store.put_blocks(ctx, &chain).await.unwrap();

    clean_by_height(ctx, &*store.db, &*store.block_data, chain[2].height())
        .await
        .unwrap();
    let last = store.db.last_manifest(ctx).await.unwrap().unwrap();
    assert_eq!(chain[1].manifest, last);
    for b in &chain[2..] {
        assert_eq!(None, store.db.block(ctx, &b.hash()).await.unwrap());
        assert!(!store.block_data.exists(ctx, b.height()).await.unwrap());
    }
    assert!(store.block_data.exists(ctx, chain[1].height()).await.unwrap());

    // The chain can be extended again from the cut.
    store.put_blocks(ctx, &chain[2..]).await.unwrap();
    assert_eq!(
        chain[4].manifest,
        store.db.last_manifest(ctx).await.unwrap().unwrap()
    );
}

#[tokio::test]
async fn test_states_are_versioned_by_height() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let db = InMemoryDatabase::new();
    let op = ctx.rng().gen();
    let mut v1 = State::empty("k").with_value(StateValue::Number(1), op);
    v1.stamp(Height(1), &State::empty("k"));
    let mut v2 = v1.with_value(StateValue::Number(2), op);
    v2.stamp(Height(3), &v1);
    db.new_state(ctx, &v1).await.unwrap();
    db.new_state(ctx, &v2).await.unwrap();
    assert_eq!(Some(&v2), db.state(ctx, "k").await.unwrap().as_ref());
    db.clean_by_height(ctx, Height(2)).await.unwrap();
    assert_eq!(Some(&v1), db.state(ctx, "k").await.unwrap().as_ref());
    db.clean_by_height(ctx, Height(0)).await.unwrap();
    assert_eq!(None, db.state(ctx, "k").await.unwrap());
}

#[tokio::test]
async fn test_seals_keep_insertion_order() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    let seals: Vec<Seal> = (0..4)
        .map(|_| setup.operation_seal(rng, 1).into())
        .collect();
    let db = InMemoryDatabase::new();
    db.new_seals(ctx, &seals[..2]).await.unwrap();
    // Duplicates are skipped.
    db.new_seals(ctx, &seals).await.unwrap();
    assert_eq!(seals, db.seals(ctx, Order::Ascending).await.unwrap());
    let mut rev = seals.clone();
    rev.reverse();
    assert_eq!(rev, db.seals(ctx, Order::Descending).await.unwrap());
    assert_matches!(db.seal(ctx, &seals[3].hash()).await.unwrap(), Some(s) if s == seals[3]);
}

#[tokio::test]
async fn test_first_proposal_wins() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    let vp = setup.init_voteproof(Height(1), Round(0), rng.gen(), &[0, 1, 2]);
    let p1 = setup.proposal(0, Height(1), Round(0), vec![], vp.clone());
    let p2 = setup.proposal(1, Height(1), Round(0), vec![], vp);
    let db = InMemoryDatabase::new();
    db.new_proposal(ctx, &p1).await.unwrap();
    db.new_proposal(ctx, &p2).await.unwrap();
    assert_eq!(
        Some(p1),
        db.proposal(ctx, Height(1), Round(0)).await.unwrap()
    );
}

/// Commits `block` to `db` alone, without block data.
async fn commit_to_db(ctx: &ctx::Ctx, db: &dyn Database, block: &Block) {
    let mut session = db.new_session(ctx, block).await.unwrap();
    let map = BlockDataMap {
        height: block.height(),
        block: block.hash(),
        items: Default::default(),
    };
    session.commit(ctx, &map).await.unwrap();
    session.close();
}

#[tokio::test]
async fn test_staged_operation_seals() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    let chain = setup.empty_chain(3);
    let seals: Vec<OperationSeal> = (0..3).map(|_| setup.operation_seal(rng, 2)).collect();
    let db = InMemoryDatabase::new();
    for b in &chain[..2] {
        commit_to_db(ctx, &db, b).await;
    }
    let stored: Vec<Seal> = seals.iter().cloned().map(Seal::from).collect();
    db.new_seals(ctx, &stored).await.unwrap();
    assert_eq!(seals, db.staged_operation_seals(ctx, 10).await.unwrap());
    assert_eq!(seals[..2], db.staged_operation_seals(ctx, 2).await.unwrap()[..]);

    // Block 1 includes the first seal and half of the second one.
    let mut block = chain[2].clone();
    block.operations = seals[0].operations.clone();
    block.operations.push(seals[1].operations[0].clone());
    commit_to_db(ctx, &db, &block).await;
    assert_eq!(seals[1..], db.staged_operation_seals(ctx, 10).await.unwrap()[..]);

    // A seal of committed operations only is never staged.
    let resent = OperationSeal::sign(
        seals[0].operations.clone(),
        &setup.keys[0],
        &setup.network_id,
        Timestamp(1),
    );
    db.new_seals(ctx, &[resent.clone().into()]).await.unwrap();
    assert_eq!(seals[1..], db.staged_operation_seals(ctx, 10).await.unwrap()[..]);

    // Rolling the block back makes its operations proposable again.
    db.clean_by_height(ctx, Height(1)).await.unwrap();
    let mut want = seals.clone();
    want.push(resent);
    assert_eq!(want, db.staged_operation_seals(ctx, 10).await.unwrap());
}
