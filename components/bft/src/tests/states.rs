use crate::{
    fetcher::FetchRequest,
    handlers::{ConsensusState, Env, Error, StateChange, StateHandler, Trigger},
    states::StateMachine,
    testonly::{self, TestNetwork},
    timers::{TimerId, Timers},
};
use assert_matches::assert_matches;
use isaac_roles::{
    messages::{Hash, Height, Round, Seal, Stage, Voteproof},
    testonly::Setup,
};
use isaac_sync::{SyncEvent, Syncers};
use pretty_assertions::assert_eq;
use rand::Rng as _;
use std::sync::{Arc, Mutex};
use zksync_concurrency::{ctx, time};

/// Receiving ends of the channels an [`Env`] writes to.
struct Outputs {
    _seals: ctx::channel::UnboundedReceiver<Seal>,
    _sync: ctx::channel::UnboundedReceiver<SyncEvent>,
    fetches: ctx::channel::UnboundedReceiver<FetchRequest>,
}

fn env(net: &TestNetwork, i: usize) -> (Env, Outputs) {
    let local = net.nodes[i].local.clone();
    let (seals_send, seals_recv) = ctx::channel::unbounded();
    let (sync_send, sync_recv) = ctx::channel::unbounded();
    let (fetch_send, fetch_recv) = ctx::channel::unbounded();
    let syncers = Arc::new(Syncers::new(
        local.db.clone(),
        local.block_data.clone(),
        local.policy.clone(),
        local.pool.keyring(),
        sync_send,
    ));
    let env = Env::new(local, syncers, seals_send, fetch_send);
    let outputs = Outputs {
        _seals: seals_recv,
        _sync: sync_recv,
        fetches: fetch_recv,
    };
    (env, outputs)
}

/// State machine of node 0 with genesis stored, in Joining.
async fn joining(ctx: &ctx::Ctx, setup: &Setup) -> (TestNetwork, StateMachine, Outputs, Hash) {
    let (net, _runners) = TestNetwork::new(setup);
    let genesis = net.init_genesis(ctx).await.unwrap().genesis;
    net.nodes[0].local.update_tip(ctx).await.unwrap();
    let (env, outputs) = env(&net, 0);
    let mut machine = StateMachine::new(env);
    let change = StateChange {
        from: None,
        to: ConsensusState::Joining,
        trigger: Trigger::None,
    };
    machine.transition(ctx, change).await.unwrap();
    assert_eq!(Some(ConsensusState::Joining), machine.state());
    (net, machine, outputs, genesis.hash())
}

async fn stored_init_height(ctx: &ctx::Ctx, net: &TestNetwork) -> Option<Height> {
    let vp = net.nodes[0].local.db.last_voteproof(ctx, Stage::Init).await.unwrap();
    vp.map(|vp| vp.height)
}

#[tokio::test]
async fn unlinked_voteproof_starts_sync() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = testonly::setup(rng, 4);
    let (net, mut machine, _outputs, _) = joining(ctx, &setup).await;
    let before = stored_init_height(ctx, &net).await;

    // The majority agrees on a previous block the local node does not have.
    let all: Vec<usize> = (0..4).collect();
    let vp = setup.init_voteproof(Height(1), Round(0), rng.gen(), &all);
    assert_matches!(
        machine.on_voteproof(ctx, vp).await,
        Err(Error::ChangeState(c)) if c.to == ConsensusState::Syncing
    );
    assert_eq!(before, stored_init_height(ctx, &net).await);
}

#[tokio::test]
async fn closed_voteproof_is_ignored() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = testonly::setup(rng, 4);
    let (net, mut machine, _outputs, genesis) = joining(ctx, &setup).await;
    let before = stored_init_height(ctx, &net).await;

    let all: Vec<usize> = (0..4).collect();
    let mut linked = setup.init_voteproof(Height(1), Round(0), genesis, &all);
    linked.closed = true;
    machine.on_voteproof(ctx, linked).await.unwrap();
    let mut future = setup.init_voteproof(Height(5), Round(0), rng.gen(), &all);
    future.closed = true;
    machine.on_voteproof(ctx, future).await.unwrap();

    assert_eq!(Some(ConsensusState::Joining), machine.state());
    assert_eq!(before, stored_init_height(ctx, &net).await);
}

#[tokio::test]
async fn missing_proposal_is_fetched_in_background() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = testonly::setup(rng, 4);
    let (net, _runners) = TestNetwork::new(&setup);
    net.init_genesis(ctx).await.unwrap();
    let (mut env, mut outputs) = env(&net, 0);
    let from = setup.nodes[1].clone();
    let hash: Hash = rng.gen();

    // The lookup returns at once; the fetch is left to the fetcher.
    let found = env.find_proposal(ctx, Height(1), Round(0), hash, &from).await.unwrap();
    assert!(found.is_none());
    let req = outputs.fetches.try_recv().unwrap();
    assert_eq!(hash, req.hash);
    assert_eq!(from, req.from);
    assert_eq!((Height(1), Round(0)), (req.height, req.round));

    // Requested once until the fetch is reported done.
    env.find_proposal(ctx, Height(1), Round(0), hash, &from).await.unwrap();
    assert!(outputs.fetches.try_recv().is_none());
    env.fetched(&hash);
    env.find_proposal(ctx, Height(1), Round(0), hash, &from).await.unwrap();
    assert_eq!(hash, outputs.fetches.try_recv().unwrap().hash);
}

#[tokio::test]
async fn stored_proposal_is_not_fetched() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = testonly::setup(rng, 4);
    let (net, _runners) = TestNetwork::new(&setup);
    let genesis = net.init_genesis(ctx).await.unwrap().genesis;
    let (mut env, mut outputs) = env(&net, 0);

    let all: Vec<usize> = (0..4).collect();
    let init = setup.init_voteproof(Height(1), Round(0), genesis.hash(), &all);
    let proposal = setup.proposal(1, Height(1), Round(0), vec![], init);
    net.nodes[0].local.db.new_proposal(ctx, &proposal).await.unwrap();

    let found = env
        .find_proposal(ctx, Height(1), Round(0), proposal.hash(), &setup.nodes[1])
        .await
        .unwrap();
    assert_eq!(Some(proposal.hash()), found.map(|p| p.hash()));
    assert!(outputs.fetches.try_recv().is_none());
}

/// Handler recording the timers delivered to it and answering each with
/// the outcome registered for it.
#[derive(Debug)]
struct TimerRecorder {
    timers: Timers,
    fired: Arc<Mutex<Vec<TimerId>>>,
    outcome: fn(TimerId) -> Result<(), Error>,
}

#[async_trait::async_trait]
impl StateHandler for TimerRecorder {
    fn state(&self) -> ConsensusState {
        ConsensusState::Consensus
    }

    fn timers(&mut self) -> &mut Timers {
        &mut self.timers
    }

    async fn activate(
        &mut self,
        _ctx: &ctx::Ctx,
        _env: &mut Env,
        _change: &StateChange,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn new_seal(
        &mut self,
        _ctx: &ctx::Ctx,
        _env: &mut Env,
        _seal: &Seal,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn new_voteproof(
        &mut self,
        _ctx: &ctx::Ctx,
        _env: &mut Env,
        _vp: &Voteproof,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn on_timer(
        &mut self,
        _ctx: &ctx::Ctx,
        _env: &mut Env,
        id: TimerId,
    ) -> Result<(), Error> {
        self.fired.lock().unwrap().push(id);
        (self.outcome)(id)
    }
}

/// Machine of node 0 running a [`TimerRecorder`] whose timers are all due.
fn with_due_timers(
    ctx: &ctx::Ctx,
    net: &TestNetwork,
    outcome: fn(TimerId) -> Result<(), Error>,
) -> (StateMachine, Outputs, Arc<Mutex<Vec<TimerId>>>) {
    let (env, outputs) = env(net, 0);
    let mut machine = StateMachine::new(env);
    let fired = Arc::new(Mutex::new(vec![]));
    let mut timers = Timers::default();
    for id in [TimerId::BroadcastInitBallot, TimerId::MoveNextRound, TimerId::PollProposal] {
        timers.start(id, ctx.now(), time::Duration::ZERO, None);
    }
    machine.install(Box::new(TimerRecorder {
        timers,
        fired: fired.clone(),
        outcome,
    }));
    (machine, outputs, fired)
}

#[tokio::test]
async fn ignored_timer_does_not_stop_the_rest() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = testonly::setup(rng, 4);
    let (net, _runners) = TestNetwork::new(&setup);
    let (mut machine, _outputs, fired) = with_due_timers(ctx, &net, |id| match id {
        TimerId::BroadcastInitBallot => Err(Error::ignore("nothing to broadcast")),
        _ => Ok(()),
    });

    machine.on_timers(ctx).await.unwrap();
    assert_eq!(
        vec![
            TimerId::BroadcastInitBallot,
            TimerId::MoveNextRound,
            TimerId::PollProposal
        ],
        *fired.lock().unwrap()
    );
    assert_eq!(Some(ConsensusState::Consensus), machine.state());
}

#[tokio::test]
async fn state_change_drops_remaining_timers() {
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = testonly::setup(rng, 4);
    let (net, _runners) = TestNetwork::new(&setup);
    let (mut machine, _outputs, fired) = with_due_timers(ctx, &net, |id| match id {
        TimerId::MoveNextRound => Err(Error::ChangeState(StateChange {
            from: Some(ConsensusState::Consensus),
            to: ConsensusState::Broken,
            trigger: Trigger::None,
        })),
        _ => Ok(()),
    });

    machine.on_timers(ctx).await.unwrap();
    assert_eq!(
        vec![TimerId::BroadcastInitBallot, TimerId::MoveNextRound],
        *fired.lock().unwrap()
    );
    assert_eq!(Some(ConsensusState::Broken), machine.state());
}
