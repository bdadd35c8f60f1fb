use super::*;
use crate::testonly::TestSources;
use assert_matches::assert_matches;
use isaac_roles::{
    messages::{Block, Round, Stage, Threshold, ThresholdRatio, Voteproof},
    testonly::Setup,
};
use rand::Rng as _;
use isaac_storage::{testonly::TestStore, Database as _};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use test_casing::test_casing;
use zksync_concurrency::{ctx, scope, testonly::abort_on_panic};

fn config(setup: &Setup, batch: u64) -> SyncerConfig {
    let mut cfg = SyncerConfig::new(&setup.policy, setup.keyring());
    cfg.limit_manifests_per_worker = batch;
    cfg.limit_blocks_per_once = batch;
    cfg
}

fn syncer(
    setup: &Setup,
    store: &TestStore,
    sources: &TestSources,
    from: Height,
    to: Height,
    base: Option<&Block>,
    batch: u64,
) -> GeneralSyncer {
    GeneralSyncer::new(
        0,
        from,
        to,
        base.map(|b| b.manifest.clone()),
        sources.nodes.clone(),
        store.db.clone(),
        store.block_data.clone(),
        config(setup, batch),
    )
    .unwrap()
}

/// Chain sharing the first `common` blocks of `chain`, continued with blocks of another round.
fn fork(setup: &Setup, chain: &[Block], common: usize, len: usize) -> Vec<Block> {
    let mut fork = chain[..common].to_vec();
    while fork.len() < len {
        let b = setup.empty_block(fork.last().map(|b| &b.manifest), Round(1));
        fork.push(b);
    }
    fork
}

#[tokio::test]
async fn test_refuses_invalid_range() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 4);
    let chain = setup.empty_chain(3);
    let sources = TestSources::new(ctx, &setup, &[&chain]).await.unwrap();
    let store = TestStore::new();

    let res = GeneralSyncer::new(
        0,
        Height(3),
        Height(2),
        None,
        sources.nodes.clone(),
        store.db.clone(),
        store.block_data.clone(),
        config(&setup, 10),
    );
    assert_matches!(res, Err(SyncerError::InvalidRange { .. }));
    let res = GeneralSyncer::new(
        0,
        Height(0),
        Height(2),
        None,
        vec![],
        store.db.clone(),
        store.block_data.clone(),
        config(&setup, 10),
    );
    assert_matches!(res, Err(SyncerError::NoSource));
    let res = GeneralSyncer::new(
        0,
        Height(2),
        Height(2),
        Some(chain[0].manifest.clone()),
        sources.nodes.clone(),
        store.db.clone(),
        store.block_data.clone(),
        config(&setup, 10),
    );
    assert_matches!(res, Err(SyncerError::Internal(_)));
}

#[test_casing(3, [1, 2, 10])]
#[tokio::test]
async fn test_sync_from_pre_genesis(batch: u64) {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 4);
    let chain = setup.empty_chain(6);
    let sources = TestSources::new(ctx, &setup, &[&chain, &chain, &chain])
        .await
        .unwrap();
    let store = TestStore::new();

    let mut s = syncer(&setup, &store, &sources, Height::PRE_GENESIS, Height(4), None, batch);
    assert_eq!(SyncerState::Created, s.state());
    s.prepare(ctx).await.unwrap();
    assert_eq!(SyncerState::Prepared, s.state());
    assert_eq!(Some(&chain[5].manifest), s.last_manifest());
    assert_eq!(None, store.db.last_manifest(ctx).await.unwrap());

    let last = s.save(ctx).await.unwrap();
    assert_eq!(SyncerState::Saved, s.state());
    assert_eq!(chain[5].manifest, last);
    for b in &chain {
        assert_eq!(
            Some(b.clone()),
            store.db.block_by_height(ctx, b.height()).await.unwrap()
        );
        assert!(store.block_data.exists(ctx, b.height()).await.unwrap());
    }
    // Saving again is a no-op.
    assert_eq!(chain[5].manifest, s.save(ctx).await.unwrap());
}

#[tokio::test]
async fn test_sync_on_top_of_local_chain() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 4);
    let chain = setup.empty_chain(8);
    let sources = TestSources::new(ctx, &setup, &[&chain, &chain, &chain])
        .await
        .unwrap();
    let store = TestStore::new();
    store.put_blocks(ctx, &chain[..3]).await.unwrap();

    let mut s = syncer(&setup, &store, &sources, Height(2), Height(6), Some(&chain[2]), 3);
    assert_eq!(chain[7].manifest, s.run(ctx).await.unwrap());
    assert_eq!(
        Some(chain[7].manifest.clone()),
        store.db.last_manifest(ctx).await.unwrap()
    );
}

#[tokio::test]
async fn test_no_threshold_agreement() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 4);
    let chain = setup.empty_chain(4);
    let other = fork(&setup, &chain, 1, 4);
    let sources = TestSources::new(ctx, &setup, &[&chain, &chain, &other])
        .await
        .unwrap();
    let store = TestStore::new();

    // 2 of 3 sources agree, the threshold is 3.
    let mut s = syncer(&setup, &store, &sources, Height::PRE_GENESIS, Height(2), None, 10);
    assert_matches!(
        s.prepare(ctx).await,
        Err(SyncerError::Threshold { height }) if height == Height(2)
    );
    assert_eq!(SyncerState::Failed, s.state());
    assert_eq!(None, store.db.last_manifest(ctx).await.unwrap());
}

#[tokio::test]
async fn test_unreachable_source_breaks_threshold() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 4);
    let chain = setup.empty_chain(4);
    let sources = TestSources::new(ctx, &setup, &[&chain, &chain, &chain])
        .await
        .unwrap();
    sources.net.set_online(&setup.nodes[3], false);
    let store = TestStore::new();

    let mut s = syncer(&setup, &store, &sources, Height::PRE_GENESIS, Height(2), None, 10);
    assert_matches!(s.prepare(ctx).await, Err(SyncerError::Threshold { .. }));
}

#[tokio::test]
async fn test_source_with_invalid_block_is_dropped() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 4);
    let chain = setup.empty_chain(5);
    let mut bad = chain.clone();
    // Same manifest, but the ACCEPT voteproof no longer verifies.
    bad[2].accept_voteproof.as_mut().unwrap().finalized_at = None;
    let sources = TestSources::new(ctx, &setup, &[&chain, &chain, &bad])
        .await
        .unwrap();
    let store = TestStore::new();

    // One block per request: the third source is asked for height 1 first.
    let mut s = syncer(&setup, &store, &sources, Height::PRE_GENESIS, Height(3), None, 1);
    s.prepare(ctx).await.unwrap();
    assert_eq!(3, s.proved().len());
    assert_eq!(chain[4].manifest, s.save(ctx).await.unwrap());
    assert_eq!(vec![setup.nodes[1].clone(), setup.nodes[2].clone()], s.proved());
    assert_eq!(
        Some(chain[2].clone()),
        store.db.block_by_height(ctx, Height(1)).await.unwrap()
    );
}

#[tokio::test]
async fn test_blocks_voted_with_unregistered_keys_are_refused() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 4);
    // Same addresses and network, fresh keys: every voteproof is self-consistent.
    let mut impostors = setup.clone();
    impostors.keys = (0..4).map(|_| rng.gen()).collect();
    let chain = impostors.empty_chain(3);
    chain[2].accept_voteproof.as_ref().unwrap().verify(&setup.network_id).unwrap();
    let sources = TestSources::new(ctx, &setup, &[&chain, &chain, &chain])
        .await
        .unwrap();
    let store = TestStore::new();

    let mut s = syncer(&setup, &store, &sources, Height::PRE_GENESIS, Height(1), None, 10);
    s.prepare(ctx).await.unwrap();
    assert_matches!(s.save(ctx).await, Err(SyncerError::Integrity { .. }));
    assert_eq!(SyncerState::Failed, s.state());
    assert_eq!(None, store.db.last_manifest(ctx).await.unwrap());
}

#[tokio::test]
async fn test_blocks_with_lowered_threshold_are_refused() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 4);
    let mut chain = setup.empty_chain(3);
    // Height 1 finalized by a single genuine vote under a 1% ratio.
    let accept = chain[2].accept_voteproof.clone().unwrap();
    let forged = Voteproof::from_votes(
        accept.height,
        accept.round,
        Stage::Accept,
        Threshold::new(4, ThresholdRatio(1)),
        accept.votes.into_values().take(1),
        accept.finalized_at.unwrap(),
    );
    forged.verify(&setup.network_id).unwrap();
    chain[2].accept_voteproof = Some(forged);
    let sources = TestSources::new(ctx, &setup, &[&chain, &chain, &chain])
        .await
        .unwrap();
    let store = TestStore::new();

    let mut s = syncer(&setup, &store, &sources, Height::PRE_GENESIS, Height(1), None, 10);
    s.prepare(ctx).await.unwrap();
    assert_matches!(s.save(ctx).await, Err(SyncerError::Integrity { .. }));
    assert_eq!(None, store.db.block_by_height(ctx, Height(1)).await.unwrap());
}

#[tokio::test]
async fn test_fork_rollback() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 4);
    // Heights -1..=10.
    let chain = setup.empty_chain(12);
    // Diverges at height 3.
    let local = fork(&setup, &chain, 4, 7);
    let sources = TestSources::new(ctx, &setup, &[&chain, &chain, &chain])
        .await
        .unwrap();
    let store = TestStore::new();
    store.put_blocks(ctx, &local).await.unwrap();

    let mut s = syncer(&setup, &store, &sources, Height(6), Height(10), Some(&local[6]), 4);
    assert_eq!(chain[11].manifest, s.run(ctx).await.unwrap());
    assert_eq!(Height(3), s.from());
    for b in &chain {
        assert_eq!(
            Some(b.manifest.clone()),
            store.db.manifest_by_height(ctx, b.height()).await.unwrap()
        );
    }
}

#[tokio::test]
async fn test_fork_without_local_base() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 4);
    let chain = setup.empty_chain(6);
    let other = fork(&setup, &chain, 3, 6);
    let sources = TestSources::new(ctx, &setup, &[&chain, &chain, &chain])
        .await
        .unwrap();
    let store = TestStore::new();

    // The base was never committed locally, so nothing can be rolled back.
    let mut s = syncer(&setup, &store, &sources, Height(3), Height(4), Some(&other[3]), 10);
    assert_matches!(s.prepare(ctx).await, Err(SyncerError::Fork { .. }));
}

#[tokio::test]
async fn test_syncers_pipeline() {
    abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let mut setup = Setup::new(rng, 4);
    setup.policy.limit_blocks_per_syncer = 2;
    let chain = setup.empty_chain(10);
    let sources = TestSources::new(ctx, &setup, &[&chain, &chain, &chain])
        .await
        .unwrap();
    let store = TestStore::new();
    store.put_blocks(ctx, &chain[..2]).await.unwrap();
    let policy = Arc::new(isaac_roles::policy::LocalPolicy::new(setup.policy.clone()).unwrap());
    let (send, mut events) = ctx::channel::unbounded();
    let syncers = Syncers::new(
        store.db.clone(),
        store.block_data.clone(),
        policy,
        setup.keyring(),
        send,
    );

    scope::run!(ctx, |ctx, s| async {
        s.spawn_bg(syncers.run(ctx));
        assert!(syncers.add(Height(5), sources.nodes.clone()));
        assert!(!syncers.add(Height(4), sources.nodes.clone()));
        assert_eq!(SyncEvent::Finished(Height(5)), events.recv(ctx).await?);
        assert!(syncers.is_finished());

        assert!(syncers.add(Height(8), sources.nodes.clone()));
        assert_eq!(SyncEvent::Finished(Height(8)), events.recv(ctx).await?);
        Ok(())
    })
    .await
    .unwrap();

    for b in &chain {
        assert_eq!(
            Some(b.manifest.clone()),
            store.db.manifest_by_height(ctx, b.height()).await.unwrap()
        );
    }
}
