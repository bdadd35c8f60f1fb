use crate::{
    proposal_maker::make_proposal,
    testonly::{self, TestNetwork},
};
use isaac_roles::messages::{Ballot, BlockDataMap, Hash, Height, OperationSeal, Round, Seal};
use pretty_assertions::assert_eq;
use zksync_concurrency::ctx;

fn operations(p: &Ballot) -> Vec<Hash> {
    p.proposal()
        .unwrap()
        .operations
        .iter()
        .map(|o| o.operation)
        .collect()
}

#[tokio::test]
async fn proposal_takes_staged_operations_only() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = testonly::setup(rng, 4);
    let (net, _runners) = TestNetwork::new(&setup);
    let genesis = net.init_genesis(ctx).await.unwrap().genesis;
    let local = net.nodes[0].local.clone();
    let seals: Vec<OperationSeal> = (0..3).map(|_| setup.operation_seal(rng, 2)).collect();
    let stored: Vec<Seal> = seals.iter().cloned().map(Seal::from).collect();
    local.db.new_seals(ctx, &stored).await.unwrap();

    let all: Vec<usize> = (0..4).collect();
    let init = setup.init_voteproof(Height(1), Round(0), genesis.hash(), &all);
    let p = make_proposal(ctx, &local, Height(1), Round(0), &init).await.unwrap();
    let want: Vec<Hash> = seals
        .iter()
        .flat_map(|s| s.operations.iter().map(|o| o.hash))
        .collect();
    assert_eq!(want, operations(&p));

    // Block 1 takes the first seal and half of the second one.
    let mut block = setup.empty_block(Some(&genesis.manifest), Round(0));
    block.operations = seals[0].operations.clone();
    block.operations.push(seals[1].operations[0].clone());
    let mut session = local.db.new_session(ctx, &block).await.unwrap();
    let map = BlockDataMap {
        height: block.height(),
        block: block.hash(),
        items: Default::default(),
    };
    session.commit(ctx, &map).await.unwrap();
    session.close();

    let init = setup.init_voteproof(Height(2), Round(0), block.hash(), &all);
    let p = make_proposal(ctx, &local, Height(2), Round(0), &init).await.unwrap();
    let mut want = vec![seals[1].operations[1].hash];
    want.extend(seals[2].operations.iter().map(|o| o.hash));
    assert_eq!(want, operations(&p));
    assert_eq!(
        seals[1..],
        local.db.staged_operation_seals(ctx, 10).await.unwrap()[..]
    );
}
