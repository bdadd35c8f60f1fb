use super::{ConsensusState, Env, Error, StateChange, StateHandler, Trigger};
use crate::timers::{TimerId, Timers};
use isaac_network::NodeInfo;
use isaac_roles::{
    messages::{Block, Height, Seal, Stage, Threshold, Voteproof},
    node::Address,
    policy::{PolicySnapshot, PolicyUpdate, POLICY_STATE_KEY},
};
use zksync_concurrency::{ctx, error::Wrap as _};

/// Validates the local chain, then hands over to Joining or Syncing.
#[derive(Debug, Default)]
pub(crate) struct Booting {
    timers: Timers,
}

fn change(to: ConsensusState, trigger: Trigger) -> Error {
    Error::ChangeState(StateChange::new(ConsensusState::Booting, to, trigger))
}

/// Checks the stored block against its own voteproofs.
fn check_block(env: &Env, block: &Block) -> anyhow::Result<()> {
    block.verify()?;
    let network_id = env.local.network_id();
    block.init_voteproof.verify(&network_id)?;
    let accept = block
        .accept_voteproof
        .as_ref()
        .ok_or_else(|| anyhow::format_err!("missing ACCEPT voteproof"))?;
    accept.verify(&network_id)?;
    let fact = accept
        .majority_accept()
        .ok_or_else(|| anyhow::format_err!("ACCEPT voteproof without a majority"))?;
    anyhow::ensure!(
        fact.new_block == block.hash() && fact.proposal == block.manifest.proposal,
        "ACCEPT voteproof is about another block"
    );
    Ok(())
}

impl Booting {
    /// Policy shared by a threshold of the suffrage, the local node included,
    /// with the nodes sharing it and their highest block.
    async fn discover_policy(
        &self,
        ctx: &ctx::Ctx,
        env: &Env,
    ) -> Option<(PolicySnapshot, Vec<Address>, Height)> {
        let local = &env.local;
        let policy = local.policy.snapshot();
        let mut infos: Vec<NodeInfo> = vec![];
        for remote in local.pool.remotes() {
            if !local.suffrage.is_inside(&remote.node.address) {
                continue;
            }
            let ctx = &ctx.with_timeout(policy.network_connection_timeout);
            match remote.channel.node_info(ctx).await {
                Ok(info) if info.network_id == policy.network_id => infos.push(info),
                Ok(info) => tracing::warn!(
                    node = %info.address,
                    "ISAAC booting - node belongs to another network"
                ),
                Err(err) => tracing::debug!(
                    node = %remote.node.address,
                    "ISAAC booting - node_info: {err:#}"
                ),
            }
        }

        let mut groups: Vec<(PolicySnapshot, Vec<Address>, Height)> = vec![(
            policy.clone(),
            vec![local.address().clone()],
            Height::PRE_GENESIS.prev(),
        )];
        for info in infos {
            let height = info
                .last_manifest
                .as_ref()
                .map_or(Height::PRE_GENESIS.prev(), |m| m.height);
            match groups.iter_mut().find(|g| g.0 == info.policy) {
                Some(g) => {
                    g.1.push(info.address);
                    g.2 = g.2.max(height);
                }
                None => groups.push((info.policy, vec![info.address], height)),
            }
        }
        let threshold =
            Threshold::new(local.suffrage.nodes().len() as u64, policy.threshold_ratio).threshold();
        groups
            .into_iter()
            .filter(|g| g.1.len() as u64 >= threshold)
            .max_by_key(|g| g.1.len())
    }
}

#[async_trait::async_trait]
impl StateHandler for Booting {
    fn state(&self) -> ConsensusState {
        ConsensusState::Booting
    }

    fn timers(&mut self) -> &mut Timers {
        &mut self.timers
    }

    async fn activate(
        &mut self,
        ctx: &ctx::Ctx,
        env: &mut Env,
        _change: &StateChange,
    ) -> Result<(), Error> {
        let local = env.local.clone();
        let policy_state = local
            .db
            .state(ctx, POLICY_STATE_KEY)
            .await
            .wrap("db.state()")?;
        if let Err(err) = local.policy.reload(policy_state.as_ref()) {
            tracing::warn!("ISAAC booting - stored policy: {err:#}");
        }

        if let Some(tip) = local.update_tip(ctx).await.wrap("update_tip()")? {
            let block = local
                .db
                .block_by_height(ctx, tip.height)
                .await
                .wrap("db.block_by_height()")?;
            let res = match &block {
                Some(b) => check_block(env, b),
                None => Err(anyhow::format_err!("block of the last manifest is missing")),
            };
            if let Err(err) = res {
                tracing::error!(height = %tip.height, "ISAAC booting - invalid local chain: {err:#}");
                return Err(change(ConsensusState::Broken, Trigger::None));
            }
            env.last_accept_voteproof = block.and_then(|b| b.accept_voteproof);
            env.last_init_voteproof = local
                .db
                .last_voteproof(ctx, Stage::Init)
                .await
                .wrap("db.last_voteproof()")?
                .filter(|vp: &Voteproof| vp.height > tip.height);
            tracing::info!(height = %tip.height, block = %tip.hash, "ISAAC booting - local chain is valid");
            return Err(change(ConsensusState::Joining, Trigger::None));
        }

        tracing::info!("ISAAC booting - empty local chain");
        let Some((policy, sources, height)) = self.discover_policy(ctx, env).await else {
            tracing::warn!("ISAAC booting - no policy shared by a threshold of the suffrage");
            return Err(change(ConsensusState::Syncing, Trigger::None));
        };
        if policy != local.policy.snapshot() {
            local.policy.update(&PolicyUpdate::from_snapshot(&policy))?;
            tracing::info!("ISAAC booting - adopted the policy of the suffrage");
        }
        let sources = sources
            .into_iter()
            .filter(|a| a != local.address())
            .collect();
        Err(change(
            ConsensusState::Syncing,
            Trigger::Target { height, sources },
        ))
    }

    async fn new_seal(
        &mut self,
        _ctx: &ctx::Ctx,
        _env: &mut Env,
        _seal: &Seal,
    ) -> Result<(), Error> {
        Err(Error::ignore("booting"))
    }

    async fn new_voteproof(
        &mut self,
        _ctx: &ctx::Ctx,
        _env: &mut Env,
        _vp: &Voteproof,
    ) -> Result<(), Error> {
        Err(Error::ignore("booting"))
    }

    async fn on_timer(
        &mut self,
        _ctx: &ctx::Ctx,
        _env: &mut Env,
        _id: TimerId,
    ) -> Result<(), Error> {
        Ok(())
    }
}
