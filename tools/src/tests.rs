use crate::{localnet::Localnet, rpc::RpcChannel, store::RocksDB, AppConfig, SuffrageMember};
use assert_matches::assert_matches;
use isaac_bft::testonly::fast_policy;
use isaac_executor::Transport as _;
use isaac_network::{Channel, ChannelError, Handler};
use isaac_roles::{
    messages::{
        Block, BlockDataMap, Dataset, Height, OperationSeal, Round, Seal, Stage, State,
        StateValue, Timestamp,
    },
    policy::{LocalPolicy, PolicyUpdate},
    testonly::Setup,
};
use isaac_storage::{
    clean_by_height, localfs::LocalFs, store_block, Database as _, Order,
};
use pretty_assertions::assert_eq;
use rand::Rng as _;
use std::{net::SocketAddr, sync::Arc};
use tempfile::TempDir;
use zksync_concurrency::{ctx, scope, testonly::abort_on_panic, time};

/// Address of a port nothing listens on right now.
fn free_addr() -> SocketAddr {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
}

fn app_config(setup: &Setup, i: usize, dir: &TempDir) -> AppConfig {
    AppConfig {
        network_id: "isaac-test".to_owned(),
        address: setup.nodes[i].clone(),
        secret_key: setup.keys[i].clone(),
        data_dir: dir.path().join(format!("node{i}")),
        rpc_addr: free_addr(),
        suffrage: setup
            .node_list()
            .into_iter()
            .enumerate()
            .map(|(j, n)| SuffrageMember {
                address: n.address,
                public_key: n.public_key,
                rpc_url: format!("http://127.0.0.1:{}", 3000 + j),
            })
            .collect(),
        number_of_acting_suffrage_nodes: setup.nodes.len() as u64,
        policy: PolicyUpdate::default(),
        metrics_server_addr: None,
    }
}

#[test]
fn test_config_file() {
    let ctx = ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    let dir = TempDir::new().unwrap();
    let mut cfg = app_config(&setup, 1, &dir);
    cfg.policy.timeout_waiting_proposal_ms = Some(1500);
    cfg.metrics_server_addr = Some(free_addr());
    let path = dir.path().join("config.json");
    cfg.write(&path).unwrap();
    assert_eq!(cfg, AppConfig::read(&path).unwrap());

    let policy = cfg.policy();
    assert_eq!(time::Duration::milliseconds(1500), policy.timeout_waiting_proposal);
    assert_eq!(3, policy.number_of_acting_suffrage_nodes);
    assert_eq!(cfg.local().node(), setup.local(1).node());

    // Unknown fields are rejected.
    let mut raw: serde_json::Value = serde_json::to_value(&cfg).unwrap();
    raw["gossip_addr"] = serde_json::json!("127.0.0.1:1");
    std::fs::write(&path, raw.to_string()).unwrap();
    assert!(AppConfig::read(&path).is_err());
}

#[test]
fn test_config_check() {
    let ctx = ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    let dir = TempDir::new().unwrap();
    app_config(&setup, 0, &dir).check().unwrap();

    let mut cfg = app_config(&setup, 0, &dir);
    cfg.suffrage.remove(0);
    assert!(cfg.check().is_err());

    let mut cfg = app_config(&setup, 0, &dir);
    cfg.suffrage[2].rpc_url = cfg.suffrage[1].rpc_url.clone();
    assert!(cfg.check().is_err());

    let mut cfg = app_config(&setup, 0, &dir);
    cfg.secret_key = setup.keys[1].clone();
    assert!(cfg.check().is_err());

    let mut cfg = app_config(&setup, 0, &dir);
    cfg.number_of_acting_suffrage_nodes = 0;
    assert!(cfg.check().is_err());

    let mut cfg = app_config(&setup, 0, &dir);
    cfg.number_of_acting_suffrage_nodes = 4;
    assert!(cfg.check().is_err());

    let mut cfg = app_config(&setup, 0, &dir);
    cfg.network_id.clear();
    assert!(cfg.check().is_err());
}

#[tokio::test]
async fn test_rocksdb_commit_and_reopen() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    let chain = setup.empty_chain(5);
    let dir = TempDir::new().unwrap();
    let block_data = LocalFs::open(&dir.path().join("blockdata")).unwrap();

    for (i, b) in chain.iter().enumerate() {
        let db = RocksDB::open(&dir.path().join("db")).await.unwrap();
        assert_eq!(
            i.checked_sub(1).map(|j| chain[j].manifest.clone()),
            db.last_manifest(ctx).await.unwrap()
        );
        store_block(ctx, &db, &block_data, b).await.unwrap();
    }

    let db = RocksDB::open(&dir.path().join("db")).await.unwrap();
    for b in &chain {
        assert_eq!(Some(b), db.block(ctx, &b.hash()).await.unwrap().as_ref());
        assert_eq!(
            Some(&b.manifest),
            db.manifest(ctx, &b.hash()).await.unwrap().as_ref()
        );
        assert_eq!(
            Some(b),
            db.block_by_height(ctx, b.height()).await.unwrap().as_ref()
        );
        let map = db.block_data_map(ctx, b.height()).await.unwrap().unwrap();
        assert_eq!(b.hash(), map.block);
    }
    assert_eq!(
        chain[4].accept_voteproof,
        db.last_voteproof(ctx, Stage::Accept).await.unwrap()
    );
    assert_eq!(
        Some(chain[4].init_voteproof.clone()),
        db.last_voteproof(ctx, Stage::Init).await.unwrap()
    );
    assert_eq!(
        Some(chain[2].init_voteproof.clone()),
        db.last_voteproof_of_height(ctx, chain[2].height(), Stage::Init)
            .await
            .unwrap()
    );
    // Pre-genesis sorts before the positive heights.
    assert_eq!(
        Some(chain[0].manifest.clone()),
        db.manifest_by_height(ctx, Height(-1)).await.unwrap()
    );
    assert_eq!(None, db.manifest_by_height(ctx, Height(4)).await.unwrap());
}

#[tokio::test]
async fn test_rocksdb_rejects_gap() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    let chain = setup.empty_chain(3);
    let dir = TempDir::new().unwrap();
    let block_data = LocalFs::open(&dir.path().join("blockdata")).unwrap();
    let db = RocksDB::open(&dir.path().join("db")).await.unwrap();
    store_block(ctx, &db, &block_data, &chain[0]).await.unwrap();
    assert!(store_block(ctx, &db, &block_data, &chain[2]).await.is_err());
    assert_eq!(None, db.block(ctx, &chain[2].hash()).await.unwrap());
    assert_eq!(
        Some(chain[0].manifest.clone()),
        db.last_manifest(ctx).await.unwrap()
    );
}

#[tokio::test]
async fn test_rocksdb_clean_by_height() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    let chain = setup.empty_chain(5);
    let dir = TempDir::new().unwrap();
    let block_data = LocalFs::open(&dir.path().join("blockdata")).unwrap();
    let db = RocksDB::open(&dir.path().join("db")).await.unwrap();
    for b in &chain {
        store_block(ctx, &db, &block_data, b).await.unwrap();
    }

    clean_by_height(ctx, &db, &block_data, chain[2].height())
        .await
        .unwrap();
    assert_eq!(
        Some(chain[1].manifest.clone()),
        db.last_manifest(ctx).await.unwrap()
    );
    for b in &chain[2..] {
        assert_eq!(None, db.block(ctx, &b.hash()).await.unwrap());
        assert_eq!(None, db.block_data_map(ctx, b.height()).await.unwrap());
        assert_eq!(
            None,
            db.last_voteproof_of_height(ctx, b.height(), Stage::Accept)
                .await
                .unwrap()
        );
    }
    assert_eq!(
        chain[1].accept_voteproof,
        db.last_voteproof(ctx, Stage::Accept).await.unwrap()
    );

    // The chain can be extended again from the cut.
    for b in &chain[2..] {
        store_block(ctx, &db, &block_data, b).await.unwrap();
    }
    assert_eq!(
        Some(chain[4].manifest.clone()),
        db.last_manifest(ctx).await.unwrap()
    );

    db.clean(ctx).await.unwrap();
    assert_eq!(None, db.last_manifest(ctx).await.unwrap());
}

#[tokio::test]
async fn test_rocksdb_states_are_versioned_by_height() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let dir = TempDir::new().unwrap();
    let db = RocksDB::open(dir.path()).await.unwrap();
    let op = ctx.rng().gen();
    let mut v1 = State::empty("k").with_value(StateValue::Number(1), op);
    v1.stamp(Height(1), &State::empty("k"));
    let mut v2 = v1.with_value(StateValue::Number(2), op);
    v2.stamp(Height(3), &v1);
    // A key which is a prefix of another must not see its versions.
    let mut other = State::empty("kk").with_value(StateValue::Number(7), op);
    other.stamp(Height(5), &State::empty("kk"));
    db.new_state(ctx, &v1).await.unwrap();
    db.new_state(ctx, &v2).await.unwrap();
    db.new_state(ctx, &other).await.unwrap();
    assert_eq!(Some(&v2), db.state(ctx, "k").await.unwrap().as_ref());
    db.clean_by_height(ctx, Height(2)).await.unwrap();
    assert_eq!(Some(&v1), db.state(ctx, "k").await.unwrap().as_ref());
    assert_eq!(None, db.state(ctx, "kk").await.unwrap());
    db.clean_by_height(ctx, Height(0)).await.unwrap();
    assert_eq!(None, db.state(ctx, "k").await.unwrap());
}

#[tokio::test]
async fn test_rocksdb_seals_and_proposals() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    let seals: Vec<Seal> = (0..4)
        .map(|_| setup.operation_seal(rng, 1).into())
        .collect();
    let vp = setup.init_voteproof(Height(1), Round(0), rng.gen(), &[0, 1, 2]);
    let p1 = setup.proposal(0, Height(1), Round(0), vec![], vp.clone());
    let p2 = setup.proposal(1, Height(1), Round(0), vec![], vp);
    let dir = TempDir::new().unwrap();
    {
        let db = RocksDB::open(dir.path()).await.unwrap();
        db.new_seals(ctx, &seals[..2]).await.unwrap();
        db.new_proposal(ctx, &p1).await.unwrap();
        db.new_proposal(ctx, &p2).await.unwrap();
    }
    // Insertion order survives reopening.
    let db = RocksDB::open(dir.path()).await.unwrap();
    db.new_seals(ctx, &seals).await.unwrap();
    assert_eq!(seals, db.seals(ctx, Order::Ascending).await.unwrap());
    let mut rev = seals.clone();
    rev.reverse();
    assert_eq!(rev, db.seals(ctx, Order::Descending).await.unwrap());
    assert_matches!(db.seal(ctx, &seals[3].hash()).await.unwrap(), Some(s) if s == seals[3]);

    assert_eq!(
        Some(p1.clone()),
        db.proposal(ctx, Height(1), Round(0)).await.unwrap()
    );
    assert_eq!(vec![p1], db.proposals(ctx, Order::Ascending).await.unwrap());
}

/// Commits `block` to `db` alone, without block data.
async fn commit_to_db(ctx: &ctx::Ctx, db: &RocksDB, block: &Block) {
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
async fn test_rocksdb_staged_operation_seals() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    let chain = setup.empty_chain(3);
    let seals: Vec<OperationSeal> = (0..3).map(|_| setup.operation_seal(rng, 2)).collect();
    let stored: Vec<Seal> = seals.iter().cloned().map(Seal::from).collect();
    let dir = TempDir::new().unwrap();
    {
        let db = RocksDB::open(dir.path()).await.unwrap();
        for b in &chain[..2] {
            commit_to_db(ctx, &db, b).await;
        }
        db.new_seals(ctx, &stored).await.unwrap();
        assert_eq!(seals, db.staged_operation_seals(ctx, 10).await.unwrap());
    }
    let db = RocksDB::open(dir.path()).await.unwrap();
    assert_eq!(seals[..1], db.staged_operation_seals(ctx, 1).await.unwrap()[..]);

    let mut block = chain[2].clone();
    block.operations = seals[0].operations.clone();
    block.operations.push(seals[1].operations[0].clone());
    commit_to_db(ctx, &db, &block).await;
    assert_eq!(seals[1..], db.staged_operation_seals(ctx, 10).await.unwrap()[..]);

    let resent = OperationSeal::sign(
        seals[0].operations.clone(),
        &setup.keys[0],
        &setup.network_id,
        Timestamp(1),
    );
    db.new_seals(ctx, &[resent.clone().into()]).await.unwrap();
    assert_eq!(seals[1..], db.staged_operation_seals(ctx, 10).await.unwrap()[..]);

    db.clean_by_height(ctx, Height(1)).await.unwrap();
    let mut want = seals.clone();
    want.push(resent);
    assert_eq!(want, db.staged_operation_seals(ctx, 10).await.unwrap());
}

#[tokio::test]
async fn test_rpc_channel() {
    abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    let chain = setup.empty_chain(3);
    let store = isaac_storage::testonly::TestStore::new();
    store.put_blocks(ctx, &chain).await.unwrap();
    let (inbound_send, mut inbound) = ctx::channel::unbounded();
    let handler = Arc::new(Handler::new(
        setup.local(0).node(),
        Arc::new(LocalPolicy::new(setup.policy.clone()).unwrap()),
        store.db.clone(),
        store.block_data.clone(),
        inbound_send,
    ));

    let dir = TempDir::new().unwrap();
    let cfg = app_config(&setup, 0, &dir);
    let transport = cfg.transport();
    let url = format!("http://{}", cfg.rpc_addr);
    let channel = RpcChannel::new(setup.nodes[0].clone(), &url, time::Duration::seconds(5)).unwrap();

    let seal: Seal = setup.operation_seal(rng, 2).into();
    let (setup, chain, channel) = (&setup, &chain, &channel);
    scope::run!(ctx, |ctx, s| async move {
        s.spawn_bg(async move {
            transport
                .serve(ctx, &setup.nodes[0], handler)
                .await
                .map_err(ctx::Error::Internal)
        });
        // Wait for the server to come up.
        let info = loop {
            match channel.node_info(ctx).await {
                Ok(info) => break info,
                Err(ChannelError::Unreachable(_)) => {
                    ctx.sleep(time::Duration::milliseconds(50)).await?
                }
                Err(err) => panic!("{err}"),
            }
        };
        assert_eq!(setup.nodes[0], info.address);
        assert_eq!(Some(chain[2].manifest.clone()), info.last_manifest);

        let heights = [Height(0), Height(7), Height(1)];
        assert_eq!(
            vec![chain[1].manifest.clone(), chain[2].manifest.clone()],
            channel.manifests(ctx, &heights).await.unwrap()
        );
        assert_eq!(
            vec![chain[1].clone(), chain[2].clone()],
            channel.blocks(ctx, &heights).await.unwrap()
        );
        let maps = channel.block_data_maps(ctx, &heights).await.unwrap();
        assert_eq!(2, maps.len());
        let raw = channel
            .block_data(ctx, &maps[0].items[&Dataset::Manifest].url)
            .await
            .unwrap();
        assert_eq!(
            chain[1].manifest,
            isaac_storage::localfs::decode(&raw).unwrap()
        );
        assert_matches!(
            channel.block_data(ctx, "file:///nowhere").await,
            Err(ChannelError::NotFound(_))
        );

        channel.send_seal(ctx, &seal).await.unwrap();
        assert_eq!(seal, inbound.recv(ctx).await.unwrap());
        Ok(())
    })
    .await
    .unwrap();

    // Nothing serves the address anymore.
    assert_matches!(
        channel.node_info(ctx).await,
        Err(ChannelError::Unreachable(_))
    );
}

#[tokio::test]
async fn test_rpc_nodes_finalize_blocks() {
    abort_on_panic();
    let _guard = zksync_concurrency::testonly::set_timeout(time::Duration::seconds(60));
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = isaac_bft::testonly::setup(rng, 3);
    let dir = TempDir::new().unwrap();

    let mut cfgs: Vec<_> = (0..3).map(|i| app_config(&setup, i, &dir)).collect();
    let members: Vec<_> = cfgs
        .iter()
        .map(|c| format!("http://{}", c.rpc_addr))
        .collect();
    for cfg in &mut cfgs {
        cfg.policy = PolicyUpdate::from_snapshot(&fast_policy(&setup.policy));
        for (m, url) in cfg.suffrage.iter_mut().zip(&members) {
            m.rpc_url = url.clone();
        }
        cfg.check().unwrap();
    }

    let mut stores = vec![];
    for cfg in &cfgs {
        let db = Arc::new(RocksDB::open(&cfg.database_path()).await.unwrap());
        let block_data = Arc::new(LocalFs::open(&cfg.block_data_path()).unwrap());
        stores.push((db, block_data));
    }
    let g = isaac_bft::genesis::generate(
        ctx,
        &cfgs[0].local(),
        &cfgs[0].policy(),
        stores[0].0.clone(),
        stores[0].1.clone(),
        vec![],
    )
    .await
    .unwrap();
    for (db, block_data) in &stores[1..] {
        for b in [&g.pre_genesis, &g.genesis] {
            store_block(ctx, &**db, &**block_data, b).await.unwrap();
        }
    }

    let executors: Vec<_> = cfgs
        .iter()
        .zip(&stores)
        .map(|(cfg, (db, block_data))| {
            isaac_executor::Executor::new(
                cfg.executor_config(),
                db.clone(),
                block_data.clone(),
                Arc::new(cfg.transport()),
            )
            .unwrap()
        })
        .collect();
    let locals: Vec<_> = executors.iter().map(|e| e.local().clone()).collect();
    scope::run!(ctx, |ctx, s| async {
        for e in executors {
            s.spawn_bg(async { e.run(ctx).await.map_err(ctx::Error::Internal) });
        }
        for local in &locals {
            local.wait_for_height(ctx, Height(2)).await?;
        }
        Ok(())
    })
    .await
    .unwrap();

    let want = stores[0].0.manifest_by_height(ctx, Height(2)).await.unwrap();
    assert!(want.is_some());
    for (db, _) in &stores[1..] {
        assert_eq!(want, db.manifest_by_height(ctx, Height(2)).await.unwrap());
    }
}

#[tokio::test]
async fn test_localnet() {
    abort_on_panic();
    let _guard = zksync_concurrency::testonly::set_timeout(time::Duration::seconds(60));
    let ctx = &ctx::test_root(&ctx::RealClock);
    let dir = TempDir::new().unwrap();
    let mut net = Localnet::new(3, dir.path().to_path_buf());
    net.policy = fast_policy(&net.policy);
    let manifests = net.run(ctx, Height(3)).await.unwrap();
    assert_eq!(3, manifests.len());
    assert_eq!(Height(3), manifests[0].height);
    assert_eq!(manifests[0], manifests[1]);
    assert_eq!(manifests[0], manifests[2]);

    assert!(Localnet::new(0, dir.path().to_path_buf())
        .run(ctx, Height(1))
        .await
        .is_err());
}
