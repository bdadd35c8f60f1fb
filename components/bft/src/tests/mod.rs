use crate::{
    testonly::{self, check_chains, Test, TestNetwork},
    ConsensusState,
};
use isaac_network::SealFilter;
use isaac_roles::{
    messages::{AcceptFact, Ballot, Block, Hash, Height, InitFact, Round, Seal, Stage, Timestamp},
    node::Address,
    suffrage::Suffrage as _,
    testonly::Setup,
};
use pretty_assertions::assert_eq;
use rand::Rng as _;
use std::sync::Arc;
use test_casing::test_casing;
use zksync_concurrency::{ctx, scope, time};

mod proposal_maker;
mod states;

fn now(ctx: &ctx::Ctx) -> Timestamp {
    Timestamp::from_utc(ctx.now_utc())
}

/// ACCEPT ballot of node `i` for a finalized block, signed now.
fn accept_ballot(ctx: &ctx::Ctx, setup: &Setup, i: usize, block: &Block) -> Ballot {
    Ballot::sign(
        &setup.local(i),
        &setup.network_id,
        AcceptFact {
            height: block.height(),
            round: block.round(),
            proposal: block.proposal.hash(),
            new_block: block.hash(),
        }
        .into(),
        Some(block.init_voteproof.clone()),
        now(ctx),
    )
}

fn hashes(blocks: &[Block]) -> Vec<Hash> {
    blocks.iter().map(|b| b.hash()).collect()
}

#[test_casing(4, [1, 2, 3, 4])]
#[tokio::test]
async fn happy_path(nodes: usize) {
    zksync_concurrency::testonly::abort_on_panic();
    let _guard = zksync_concurrency::testonly::set_timeout(time::Duration::seconds(60));
    let ctx = &ctx::test_root(&ctx::RealClock);
    Test {
        nodes,
        blocks_to_finalize: 5,
    }
    .run(ctx)
    .await
    .unwrap();
}

#[tokio::test]
async fn missing_proposal_moves_to_next_round() {
    zksync_concurrency::testonly::abort_on_panic();
    let _guard = zksync_concurrency::testonly::set_timeout(time::Duration::seconds(60));
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = testonly::setup(rng, 3);
    let (net, runners) = TestNetwork::new(&setup);
    net.init_genesis(ctx).await.unwrap();

    // The proposer of (1, 0) is cut off after its INIT ballot.
    let proposer = setup.suffrage().acting(Height(1), Round(0)).proposer;
    let filter: SealFilter = Arc::new(move |from: &Address, _: &Address, seal: &Seal| {
        let Some(b) = seal.as_ballot() else {
            return true;
        };
        !(from == &proposer
            && b.height() == Height(1)
            && b.round() == Round(0)
            && b.stage() != Stage::Init)
    });
    net.network.set_seal_filter(Some(filter));

    scope::run!(ctx, |ctx, s| async {
        for r in runners {
            s.spawn_bg(async { r.run(ctx).await.map_err(ctx::Error::Internal) });
        }
        net.wait_for_height(ctx, &[0, 1, 2], Height(2)).await?;
        Ok(())
    })
    .await
    .unwrap();

    for n in &net.nodes {
        let m = n
            .local
            .db
            .manifest_by_height(ctx, Height(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.round, Round(1));
    }
    check_chains(ctx, &net.nodes, Height(2)).await.unwrap();
}

#[tokio::test]
async fn restarted_node_catches_up() {
    zksync_concurrency::testonly::abort_on_panic();
    let _guard = zksync_concurrency::testonly::set_timeout(time::Duration::seconds(90));
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = testonly::setup(rng, 4);
    let (net, mut runners) = TestNetwork::new(&setup);
    net.init_genesis(ctx).await.unwrap();
    let late = runners.pop().unwrap();
    let late_addr = late.address().clone();
    net.network.set_online(&late_addr, false);

    scope::run!(ctx, |ctx, s| async {
        for r in runners {
            s.spawn_bg(async { r.run(ctx).await.map_err(ctx::Error::Internal) });
        }
        net.wait_for_height(ctx, &[0, 1, 2], Height(5)).await?;
        assert_eq!(net.nodes[3].local.state(), None);

        net.network.set_online(&late_addr, true);
        s.spawn_bg(async { late.run(ctx).await.map_err(ctx::Error::Internal) });
        net.nodes[3]
            .local
            .wait_for_state(ctx, ConsensusState::Consensus)
            .await?;
        net.wait_for_height(ctx, &[0, 1, 2, 3], Height(8)).await?;
        Ok(())
    })
    .await
    .unwrap();
    check_chains(ctx, &net.nodes, Height(8)).await.unwrap();
}

#[tokio::test]
async fn equivocating_node_is_counted_once() {
    zksync_concurrency::testonly::abort_on_panic();
    let _guard = zksync_concurrency::testonly::set_timeout(time::Duration::seconds(60));
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = testonly::setup(rng, 4);
    let (net, mut runners) = TestNetwork::new(&setup);
    let genesis = net.init_genesis(ctx).await.unwrap().genesis;

    // The byzantine node proposes (1, 0) and never does, so the honest nodes
    // vote on (1, 1), where it has already voted for two different facts.
    let byzantine = setup.index_of(&setup.suffrage().acting(Height(1), Round(0)).proposer);
    let runner = runners.remove(byzantine);
    drop(runner);
    let honest: Vec<usize> = (0..4).filter(|i| *i != byzantine).collect();
    let all: Vec<usize> = (0..4).collect();
    let init = setup.init_voteproof(Height(1), Round(0), genesis.hash(), &all);
    let forged: Hash = rng.gen();
    for previous_block in [forged, genesis.hash()] {
        let ballot = Ballot::sign(
            &setup.local(byzantine),
            &setup.network_id,
            InitFact {
                height: Height(1),
                round: Round(1),
                previous_block,
            }
            .into(),
            Some(init.clone()),
            now(ctx),
        );
        for i in &honest {
            net.nodes[*i].inject(ctx, ballot.clone()).await.unwrap();
        }
    }

    scope::run!(ctx, |ctx, s| async {
        for r in runners {
            s.spawn_bg(async { r.run(ctx).await.map_err(ctx::Error::Internal) });
        }
        net.wait_for_height(ctx, &honest, Height(2)).await?;
        Ok(())
    })
    .await
    .unwrap();

    let honest_nodes: Vec<_> = net
        .nodes
        .into_iter()
        .enumerate()
        .filter(|(i, _)| *i != byzantine)
        .map(|(_, n)| n)
        .collect();
    for n in &honest_nodes {
        let b = n
            .local
            .db
            .block_by_height(ctx, Height(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            b.init_voteproof.majority_init().unwrap().previous_block,
            genesis.hash()
        );
    }
    check_chains(ctx, &honest_nodes, Height(2)).await.unwrap();
}

#[tokio::test]
async fn forked_node_rolls_back() {
    zksync_concurrency::testonly::abort_on_panic();
    let _guard = zksync_concurrency::testonly::set_timeout(time::Duration::seconds(60));
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = testonly::setup(rng, 4);
    // Heights -1..=10.
    let canonical = setup.empty_chain(12);
    // Same up to height 2, then 3..=5 finalized in round 1.
    let mut forked = canonical[..4].to_vec();
    for _ in 0..3 {
        let b = setup.empty_block(forked.last().map(|b| &b.manifest), Round(1));
        forked.push(b);
    }
    let (net, mut runners) = TestNetwork::new(&setup);
    net.nodes[0].store.put_blocks(ctx, &forked).await.unwrap();
    for n in &net.nodes[1..] {
        n.store.put_blocks(ctx, &canonical).await.unwrap();
    }
    let top = &canonical[11];
    for i in 1..4 {
        let ballot = accept_ballot(ctx, &setup, i, top);
        net.nodes[0].inject(ctx, ballot).await.unwrap();
    }

    let runner = runners.remove(0);
    scope::run!(ctx, |ctx, s| async {
        s.spawn_bg(async { runner.run(ctx).await.map_err(ctx::Error::Internal) });
        net.wait_for_height(ctx, &[0], Height(10)).await?;
        Ok(())
    })
    .await
    .unwrap();

    let chain = net.nodes[0].chain(ctx).await.unwrap();
    assert_eq!(hashes(&chain), hashes(&canonical));
}

#[tokio::test]
async fn future_voteproof_starts_sync() {
    zksync_concurrency::testonly::abort_on_panic();
    let _guard = zksync_concurrency::testonly::set_timeout(time::Duration::seconds(60));
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = testonly::setup(rng, 4);
    // Heights -1..=20.
    let chain = setup.empty_chain(22);
    let (net, mut runners) = TestNetwork::new(&setup);
    net.nodes[0].store.put_blocks(ctx, &chain[..7]).await.unwrap();
    for n in &net.nodes[1..] {
        n.store.put_blocks(ctx, &chain).await.unwrap();
    }
    let top = &chain[21];
    for i in 1..4 {
        let ballot = accept_ballot(ctx, &setup, i, top);
        net.nodes[0].inject(ctx, ballot).await.unwrap();
    }

    let runner = runners.remove(0);
    scope::run!(ctx, |ctx, s| async {
        s.spawn_bg(async { runner.run(ctx).await.map_err(ctx::Error::Internal) });
        net.wait_for_height(ctx, &[0], Height(20)).await?;
        net.nodes[0]
            .local
            .wait_for_state(ctx, ConsensusState::Joining)
            .await?;
        Ok(())
    })
    .await
    .unwrap();

    let local = net.nodes[0].chain(ctx).await.unwrap();
    assert_eq!(hashes(&local), hashes(&chain));
}
