use super::*;
use crate::{
    node::{Address, LocalNode},
    testonly::Setup,
};
use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use rand::Rng as _;
use test_casing::test_casing;
use zksync_concurrency::ctx;

#[test_casing(6, [(3, 67, 3), (4, 67, 3), (10, 67, 7), (1, 100, 1), (5, 100, 5), (7, 1, 1)])]
#[test]
fn test_threshold(total: u64, ratio: u64, want: u64) {
    assert_eq!(want, Threshold::new(total, ThresholdRatio(ratio)).threshold());
}

#[test]
fn test_height_navigation() {
    assert_eq!(Height::GENESIS, Height::PRE_GENESIS.next());
    assert_eq!(Height::PRE_GENESIS, Height::GENESIS.prev());
    assert_eq!(None, Round(0).prev());
    assert_eq!(Some(Round(1)), Round(2).prev());
}

#[test]
fn test_timestamp_within() {
    let t = Timestamp(10_000);
    let span = zksync_concurrency::time::Duration::seconds(5);
    assert!(t.within(Timestamp(14_000), span));
    assert!(t.within(Timestamp(5_000), span));
    assert!(!t.within(Timestamp(15_001), span));
}

#[test]
fn test_fact_hash_depends_on_stage() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let (proposal, new_block) = (rng.gen(), rng.gen());
    let accept = AcceptFact {
        height: Height(1),
        round: Round(0),
        proposal,
        new_block,
    };
    let sign = SignFact {
        height: Height(1),
        round: Round(0),
        proposal,
        new_block,
    };
    assert_ne!(accept.hash(), sign.hash());
    assert_eq!(accept.hash(), BallotFact::Accept(accept.clone()).hash());
}

#[test]
fn test_ballot_verify() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    let vp = setup.accept_voteproof(Height(0), Round(0), rng.gen(), rng.gen(), &[0, 1, 2]);
    let ballot = setup.init_ballot(0, Height(1), Round(0), vp.majority_accept().unwrap().new_block, vp);
    ballot.verify(&setup.network_id).unwrap();

    // Wrong network.
    assert_matches!(
        ballot.verify(&"another".into()),
        Err(BallotVerifyError::BadSignature(_))
    );

    // Tampered fact.
    let mut bad = ballot.clone();
    bad.signed_fact.signed_at = Timestamp(bad.signed_fact.signed_at.0 + 1);
    assert_matches!(bad.verify(&setup.network_id), Err(BallotVerifyError::BadHash));

    // Missing voteproof above genesis.
    let local = LocalNode::new(setup.nodes[0].clone(), setup.keys[0].clone());
    let bad = Ballot::sign(
        &local,
        &setup.network_id,
        ballot.fact().clone(),
        None,
        Timestamp::from_utc(ctx.now_utc()),
    );
    assert_matches!(
        bad.verify(&setup.network_id),
        Err(BallotVerifyError::MissingVoteproof)
    );
}

#[test]
fn test_voteproof_majority_and_draw() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    // 4 nodes at 67% need 3 votes.
    let setup = Setup::new(rng, 4);
    let threshold = setup.threshold();
    assert_eq!(3, threshold.threshold());
    let now = Timestamp::from_utc(ctx.now_utc());

    let a = InitFact {
        height: Height(1),
        round: Round(0),
        previous_block: rng.gen(),
    };
    let b = InitFact {
        previous_block: rng.gen(),
        ..a.clone()
    };
    let c = InitFact {
        previous_block: rng.gen(),
        ..a.clone()
    };

    let vp = Voteproof::from_votes(
        Height(1),
        Round(0),
        Stage::Init,
        threshold,
        (0..3).map(|i| setup.sign_fact(i, a.clone().into())),
        now,
    );
    assert_eq!(VoteResult::Majority, vp.result);
    assert_eq!(Some(&a), vp.majority_init());
    assert_eq!(Some(now), vp.finalized_at);
    vp.verify(&setup.network_id).unwrap();

    // 2:1:1 leaves no fact able to reach 3.
    let vp = Voteproof::from_votes(
        Height(1),
        Round(0),
        Stage::Init,
        threshold,
        [
            setup.sign_fact(0, a.clone().into()),
            setup.sign_fact(1, a.clone().into()),
            setup.sign_fact(2, b.clone().into()),
            setup.sign_fact(3, c.into()),
        ],
        now,
    );
    assert_eq!(VoteResult::Draw, vp.result);
    assert_eq!(None, vp.majority);
    vp.verify(&setup.network_id).unwrap();

    // 1:1 with two votes outstanding is not decided yet.
    let mut vp = Voteproof::new(Height(1), Round(0), Stage::Init, threshold);
    assert!(vp.add(setup.sign_fact(0, a.clone().into())));
    assert!(vp.add(setup.sign_fact(1, b.into())));
    // A second vote of the same signer is not recorded.
    assert!(!vp.add(setup.sign_fact(1, a.into())));
    assert!(!vp.finalize(now));
    assert_eq!(VoteResult::NotYet, vp.result);
    assert_eq!(None, vp.finalized_at);
    assert_matches!(
        vp.verify(&setup.network_id),
        Err(VoteproofVerifyError::NotFinalized)
    );
}

#[test]
fn test_voteproof_verify_detects_forgery() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 4);
    let vp = setup.accept_voteproof(Height(3), Round(1), rng.gen(), rng.gen(), &[0, 1, 2]);
    vp.verify(&setup.network_id).unwrap();

    // Claiming majority with too few votes.
    let mut bad = vp.clone();
    bad.votes.pop_last();
    assert_matches!(
        bad.verify(&setup.network_id),
        Err(VoteproofVerifyError::ResultMismatch { .. })
    );

    // Vote for another round.
    let mut bad = vp.clone();
    let fact: BallotFact = AcceptFact {
        height: Height(3),
        round: Round(2),
        proposal: rng.gen(),
        new_block: rng.gen(),
    }
    .into();
    let vote = setup.sign_fact(3, fact.clone());
    bad.facts.insert(vote.fact_hash, fact);
    bad.votes.insert(vote.signer.clone(), vote);
    assert_matches!(
        bad.verify(&setup.network_id),
        Err(VoteproofVerifyError::ForeignVote(_))
    );
}

#[test]
fn test_voteproof_rejects_unregistered_keys() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 4);
    let keys = setup.keyring();
    let vp = setup.accept_voteproof(Height(3), Round(1), rng.gen(), rng.gen(), &[0, 1, 2]);
    vp.verify_signers(&keys).unwrap();

    // A self-consistent vote made with a fresh key under a member's address.
    let mut forged = vp.clone();
    let rogue = LocalNode::new(setup.nodes[3].clone(), rng.gen());
    let fact = vp.majority.clone().unwrap();
    let vote = SignedFact::sign(&rogue, &setup.network_id, fact, Timestamp(0));
    forged.votes.insert(vote.signer.clone(), vote);
    forged.verify(&setup.network_id).unwrap();
    assert_matches!(
        forged.verify_signers(&keys),
        Err(VoteproofVerifyError::KeyMismatch(a)) if a == setup.nodes[3]
    );

    // A vote of a node outside of the keyring.
    let mut forged = vp.clone();
    let outsider = LocalNode::new(Address("outsider".into()), rng.gen());
    let vote = SignedFact::sign(
        &outsider,
        &setup.network_id,
        vp.majority.clone().unwrap(),
        Timestamp(0),
    );
    forged.votes.insert(vote.signer.clone(), vote);
    assert_matches!(
        forged.verify_signers(&keys),
        Err(VoteproofVerifyError::UnknownSigner(_))
    );
}

#[test]
fn test_voteproof_rejects_lowered_threshold() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 4);
    let local = setup.threshold();
    let fact: BallotFact = AcceptFact {
        height: Height(5),
        round: Round(0),
        proposal: rng.gen(),
        new_block: rng.gen(),
    }
    .into();
    // A single vote is a self-consistent majority under a 1% ratio.
    let forged = Voteproof::from_votes(
        Height(5),
        Round(0),
        Stage::Accept,
        Threshold::new(4, ThresholdRatio(1)),
        [setup.sign_fact(0, fact.clone())],
        Timestamp(0),
    );
    forged.verify(&setup.network_id).unwrap();
    assert_eq!(VoteResult::Majority, forged.result);
    assert_matches!(
        forged.verify_threshold(&local),
        Err(VoteproofVerifyError::ThresholdMismatch { .. })
    );

    // Same ratio, but a smaller suffrage.
    let forged = Voteproof::from_votes(
        Height(5),
        Round(0),
        Stage::Accept,
        Threshold::new(1, local.ratio),
        [setup.sign_fact(0, fact.clone())],
        Timestamp(0),
    );
    assert_matches!(
        forged.verify_threshold(&local),
        Err(VoteproofVerifyError::ThresholdMismatch { .. })
    );

    // A stricter ratio is fine as long as the outcome holds locally.
    let strict = Voteproof::from_votes(
        Height(5),
        Round(0),
        Stage::Accept,
        Threshold::new(4, ThresholdRatio::BOOTSTRAP),
        (0..4).map(|i| setup.sign_fact(i, fact.clone())),
        Timestamp(0),
    );
    strict.verify_threshold(&local).unwrap();
    setup
        .accept_voteproof(Height(5), Round(0), rng.gen(), rng.gen(), &[0, 1, 2])
        .verify_threshold(&local)
        .unwrap();
}

#[test]
fn test_operation_seal_verify() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 1);
    let seal = setup.operation_seal(rng, 3);
    seal.verify(&setup.network_id).unwrap();
    assert_eq!(seal.hash(), Seal::from(seal.clone()).hash());

    let mut bad = seal.clone();
    bad.operations[1].fact.token = "other".to_owned();
    assert_matches!(
        bad.verify(&setup.network_id),
        Err(OperationVerifyError::BadHash)
    );
}

#[test]
fn test_seal_json_round_trip() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = Setup::new(rng, 3);
    let vp = setup.accept_voteproof(Height(0), Round(0), rng.gen(), rng.gen(), &[0, 1, 2]);
    let seal: Seal = setup
        .init_ballot(1, Height(1), Round(0), vp.majority_accept().unwrap().new_block, vp)
        .into();
    let json = serde_json::to_vec(&seal).unwrap();
    let got: Seal = serde_json::from_slice(&json).unwrap();
    assert_eq!(seal, got);
    got.verify(&setup.network_id).unwrap();
}

#[test]
fn test_state_hash_ignores_block_hash() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let base = State::empty("a");
    let mut s = base.with_value(StateValue::Number(7), rng.gen());
    s.stamp(Height(4), &base);
    s.verify().unwrap();
    let mut with_block = s.clone();
    with_block.block_hash = Some(rng.gen());
    with_block.verify().unwrap();
    assert_eq!(Height::PRE_GENESIS, s.previous_height);
}
