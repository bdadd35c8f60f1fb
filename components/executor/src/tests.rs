use super::*;
use assert_matches::assert_matches;
use isaac_bft::{genesis, testonly, ConsensusState};
use isaac_roles::{messages::Height, testonly::Setup};
use isaac_storage::testonly::TestStore;
use rand::Rng as _;
use test_casing::test_casing;
use zksync_concurrency::{testonly::abort_on_panic, time};

fn config(setup: &Setup, i: usize) -> Config {
    Config {
        local: setup.local(i),
        suffrage: setup.node_list(),
        policy: setup.policy.clone(),
    }
}

fn executor(setup: &Setup, i: usize, store: &TestStore, net: &LocalNetwork) -> Executor {
    Executor::new(
        config(setup, i),
        store.db.clone(),
        store.block_data.clone(),
        Arc::new(net.clone()),
    )
    .unwrap()
}

#[test]
fn test_config_check() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    config(&setup, 1).check().unwrap();

    let mut cfg = config(&setup, 1);
    cfg.suffrage.remove(1);
    assert!(cfg.check().is_err());

    let mut cfg = config(&setup, 1);
    cfg.suffrage.push(cfg.suffrage[0].clone());
    assert!(cfg.check().is_err());

    let mut cfg = config(&setup, 1);
    cfg.local.key = rng.gen();
    assert!(cfg.check().is_err());

    let mut cfg = config(&setup, 1);
    cfg.policy.number_of_acting_suffrage_nodes = 4;
    assert!(cfg.check().is_err());

    let mut cfg = config(&setup, 1);
    cfg.suffrage.clear();
    let store = TestStore::new();
    assert_matches!(
        Executor::new(
            cfg,
            store.db.clone(),
            store.block_data.clone(),
            Arc::new(LocalNetwork::new()),
        ),
        Err(_)
    );
}

#[test_casing(3, [1, 2, 4])]
#[tokio::test]
async fn test_executors_finalize_blocks(nodes: usize) {
    abort_on_panic();
    let _guard = zksync_concurrency::testonly::set_timeout(time::Duration::seconds(60));
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = testonly::setup(rng, nodes);
    let net = LocalNetwork::new();
    let stores: Vec<_> = (0..nodes).map(|_| TestStore::new()).collect();

    let g = genesis::generate(
        ctx,
        &setup.local(0),
        &setup.policy,
        stores[0].db.clone(),
        stores[0].block_data.clone(),
        vec![],
    )
    .await
    .unwrap();
    for store in &stores[1..] {
        store
            .put_blocks(ctx, &[g.pre_genesis.clone(), g.genesis.clone()])
            .await
            .unwrap();
    }

    let executors: Vec<_> = (0..nodes)
        .map(|i| executor(&setup, i, &stores[i], &net))
        .collect();
    let locals: Vec<_> = executors.iter().map(|e| e.local().clone()).collect();
    scope::run!(ctx, |ctx, s| async {
        for e in executors {
            s.spawn_bg(async { e.run(ctx).await.map_err(ctx::Error::Internal) });
        }
        for local in &locals {
            local.wait_for_height(ctx, Height(3)).await?;
        }
        Ok(())
    })
    .await
    .unwrap();

    let want = stores[0]
        .db
        .manifest_by_height(ctx, Height(3))
        .await
        .unwrap()
        .unwrap();
    for store in &stores[1..] {
        let got = store.db.manifest_by_height(ctx, Height(3)).await.unwrap();
        assert_eq!(Some(&want), got.as_ref());
    }
}

#[tokio::test]
async fn test_empty_node_syncs_from_peers() {
    abort_on_panic();
    let _guard = zksync_concurrency::testonly::set_timeout(time::Duration::seconds(60));
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = testonly::setup(rng, 4);
    let net = LocalNetwork::new();
    let stores: Vec<_> = (0..4).map(|_| TestStore::new()).collect();

    let g = genesis::generate(
        ctx,
        &setup.local(0),
        &setup.policy,
        stores[0].db.clone(),
        stores[0].block_data.clone(),
        vec![],
    )
    .await
    .unwrap();
    for store in &stores[1..3] {
        store
            .put_blocks(ctx, &[g.pre_genesis.clone(), g.genesis.clone()])
            .await
            .unwrap();
    }

    let mut executors: Vec<_> = (0..4)
        .map(|i| executor(&setup, i, &stores[i], &net))
        .collect();
    let late = executors.pop().unwrap();
    let late_local = late.local().clone();
    let first = executors[0].local().clone();
    scope::run!(ctx, |ctx, s| async {
        for e in executors {
            s.spawn_bg(async { e.run(ctx).await.map_err(ctx::Error::Internal) });
        }
        first.wait_for_height(ctx, Height(2)).await?;
        s.spawn_bg(async { late.run(ctx).await.map_err(ctx::Error::Internal) });
        late_local.wait_for_height(ctx, Height(3)).await?;
        Ok(())
    })
    .await
    .unwrap();
    assert_ne!(Some(ConsensusState::Broken), late_local.state());
}
