//! Generation of the first two blocks of a network.
use crate::{
    processor::{PrepareError, ProposalProcessor, SaveError},
    proposal_maker::make_proposal,
    LocalContext,
};
use anyhow::Context as _;
use isaac_network::NodePool;
use isaac_roles::{
    messages::{
        AcceptFact, Ballot, BallotFact, Block, Hash, Height, InitFact, Manifest, Operation,
        OperationSeal, ProposalFact, Round, Seal, SignedFact, Stage, Threshold, ThresholdRatio,
        Timestamp, Voteproof,
    },
    node::{LocalNode, NetworkId},
    policy::{LocalPolicy, PolicySnapshot},
    suffrage::{FixedSuffrage, Suffrage as _},
    tree::FixedTree,
};
use isaac_storage::{store_block, BlockData, Database};
use std::sync::Arc;
use zksync_concurrency::{ctx, error::Wrap as _};

/// Pre-genesis and genesis blocks, as written to the local storage.
#[derive(Debug, Clone)]
pub struct Genesis {
    /// Block at [`Height::PRE_GENESIS`].
    pub pre_genesis: Block,
    /// Block at [`Height::GENESIS`].
    pub genesis: Block,
}

fn single_vote(
    local: &LocalNode,
    network_id: &NetworkId,
    fact: BallotFact,
    stage: Stage,
    now: Timestamp,
) -> Voteproof {
    use isaac_roles::messages::Fact as _;
    Voteproof::from_votes(
        fact.height(),
        fact.round(),
        stage,
        Threshold::new(1, ThresholdRatio::BOOTSTRAP),
        [SignedFact::sign(local, network_id, fact, now)],
        now,
    )
}

/// Builds the pre-genesis block. Its previous block is derived from a
/// signature of the local node, so the chain records who started it.
fn pre_genesis(local: &LocalNode, network_id: &NetworkId, now: Timestamp) -> Block {
    let height = Height::PRE_GENESIS;
    let round = Round(0);
    let previous_block = Hash::of(&local.key.sign(&Hash::default(), network_id));
    let init_voteproof = single_vote(
        local,
        network_id,
        InitFact {
            height,
            round,
            previous_block,
        }
        .into(),
        Stage::Init,
        now,
    );
    let proposal = Ballot::sign(
        local,
        network_id,
        ProposalFact {
            height,
            round,
            proposer: local.address.clone(),
            operations: vec![],
        }
        .into(),
        Some(init_voteproof.clone()),
        now,
    );
    let manifest = Manifest::new(
        height,
        round,
        proposal.hash(),
        previous_block,
        None,
        None,
        now,
    );
    let accept_voteproof = single_vote(
        local,
        network_id,
        AcceptFact {
            height,
            round,
            proposal: proposal.hash(),
            new_block: manifest.hash,
        }
        .into(),
        Stage::Accept,
        now,
    );
    let suffrage = FixedSuffrage::new(local.address.clone(), vec![]);
    Block {
        manifest,
        init_voteproof,
        accept_voteproof: Some(accept_voteproof),
        operations: vec![],
        operations_tree: FixedTree::default(),
        states: vec![],
        states_tree: FixedTree::default(),
        proposal,
        suffrage_info: suffrage.acting(height, round).info(),
    }
}

/// Writes the pre-genesis and genesis blocks into empty storage.
///
/// Genesis goes through the regular proposal processor, so `operations`
/// are processed exactly like in any other block. The local node is the
/// only voter and the threshold is 100%.
#[tracing::instrument(level = "debug", skip_all, fields(local = %local.address))]
pub async fn generate(
    ctx: &ctx::Ctx,
    local: &LocalNode,
    policy: &PolicySnapshot,
    db: Arc<dyn Database>,
    block_data: Arc<dyn BlockData>,
    operations: Vec<Operation>,
) -> ctx::Result<Genesis> {
    if let Some(m) = db.last_manifest(ctx).await.wrap("db.last_manifest()")? {
        return Err(anyhow::format_err!("storage is not empty: last block is {}", m.height).into());
    }
    let network_id = &policy.network_id;
    let mut policy = policy.clone();
    policy.threshold_ratio = ThresholdRatio::BOOTSTRAP;
    let policy = Arc::new(LocalPolicy::new(policy).context("LocalPolicy::new()")?);
    let genesis_ctx = Arc::new(LocalContext::new(
        local.clone(),
        policy,
        Arc::new(FixedSuffrage::new(local.address.clone(), vec![])),
        Arc::new(NodePool::new(local.node())),
        db.clone(),
        block_data.clone(),
    ));
    let now = genesis_ctx.now(ctx);

    let pre_genesis = pre_genesis(local, network_id, now);
    store_block(ctx, &*db, &*block_data, &pre_genesis)
        .await
        .wrap("store_block()")?;
    tracing::info!(block = %pre_genesis.hash(), "ISAAC genesis - pre-genesis block stored");

    if !operations.is_empty() {
        let seal = OperationSeal::sign(operations, &local.key, network_id, now);
        db.new_seals(ctx, &[Seal::Operations(seal)])
            .await
            .wrap("db.new_seals()")?;
    }

    let height = Height::GENESIS;
    let round = Round(0);
    let init = single_vote(
        local,
        network_id,
        InitFact {
            height,
            round,
            previous_block: pre_genesis.hash(),
        }
        .into(),
        Stage::Init,
        now,
    );
    let proposal = make_proposal(ctx, &genesis_ctx, height, round, &init)
        .await
        .wrap("make_proposal()")?;
    db.new_proposal(ctx, &proposal)
        .await
        .wrap("db.new_proposal()")?;
    genesis_ctx.update_tip(ctx).await.wrap("update_tip()")?;

    let mut processor = ProposalProcessor::new(genesis_ctx.clone());
    let block = processor
        .prepare(ctx, &proposal, &init)
        .await
        .map_err(|err| match err {
            PrepareError::Internal(err) => err,
            err => anyhow::Error::new(err).context("prepare genesis").into(),
        })?;
    let accept = single_vote(
        local,
        network_id,
        AcceptFact {
            height,
            round,
            proposal: proposal.hash(),
            new_block: block.hash(),
        }
        .into(),
        Stage::Accept,
        now,
    );
    let genesis = processor
        .save(ctx, &accept)
        .await
        .map_err(|err| match err {
            SaveError::Internal(err) => err,
            err => anyhow::Error::new(err).context("save genesis").into(),
        })?;
    tracing::info!(
        block = %genesis.hash(),
        operations = genesis.operations.len(),
        "ISAAC genesis - genesis block stored"
    );
    Ok(Genesis {
        pre_genesis,
        genesis,
    })
}
