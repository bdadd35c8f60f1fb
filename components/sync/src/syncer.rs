//! Syncer of a single height range.
use crate::{metrics::METRICS, rollback, SyncerError};
use isaac_network::RemoteNode;
use isaac_roles::{
    messages::{
        Block, Hash, Height, Manifest, Threshold, ThresholdRatio, Voteproof, VoteproofVerifyError,
    },
    node::{Address, Keyring, NetworkId},
    policy::PolicySnapshot,
};
use isaac_storage::{BlockData, Database};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};
use zksync_concurrency::{ctx, error::Wrap as _, scope, sync, time};

/// Parameters of a syncer, taken from the local policy.
#[derive(Debug, Clone)]
pub struct SyncerConfig {
    /// Network the blocks were signed in.
    pub network_id: NetworkId,
    /// Share of the source nodes that has to agree on a manifest.
    pub threshold_ratio: ThresholdRatio,
    /// Manifests requested at once.
    pub limit_manifests_per_worker: u64,
    /// Blocks requested at once.
    pub limit_blocks_per_once: u64,
    /// Deadline of a single request.
    pub request_timeout: time::Duration,
    /// Registered keys of the suffrage members; the votes of fetched blocks
    /// must be signed with them.
    pub keys: Keyring,
}

impl SyncerConfig {
    /// Config from a policy snapshot and the keys of the suffrage.
    pub fn new(policy: &PolicySnapshot, keys: Keyring) -> Self {
        Self {
            keys,
            network_id: policy.network_id.clone(),
            threshold_ratio: policy.threshold_ratio,
            limit_manifests_per_worker: policy.limit_manifests_per_worker,
            limit_blocks_per_once: policy.limit_blocks_per_once,
            request_timeout: policy.network_connection_timeout,
        }
    }
}

/// Lifecycle of a [`GeneralSyncer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncerState {
    /// Constructed.
    Created,
    /// Fetching manifests.
    Preparing,
    /// Manifests of the whole range agreed upon.
    Prepared,
    /// Fetching and committing blocks.
    Saving,
    /// Every block of the range committed.
    Saved,
    /// Failed; the syncer can't be used anymore.
    Failed,
    /// Canceled while running.
    Canceled,
}

/// Fetches the blocks of `[from, to]` from source nodes, validates them
/// against manifests agreed upon by a threshold of the sources, and commits
/// them into local storage.
#[derive(Debug)]
pub struct GeneralSyncer {
    id: u64,
    from: Height,
    to: Height,
    /// Manifest at `from - 1`: the local tip or the last manifest of the previous syncer.
    base: Option<Manifest>,
    sources: Vec<RemoteNode>,
    /// Sources that agreed on every manifest so far.
    proved: Vec<RemoteNode>,
    threshold: u64,
    manifests: BTreeMap<Height, Manifest>,
    db: Arc<dyn Database>,
    block_data: Arc<dyn BlockData>,
    cfg: SyncerConfig,
    state: sync::watch::Sender<SyncerState>,
}

/// Sources caught returning invalid blocks, shared by the fetch tasks of a batch.
#[derive(Debug, Default)]
struct BadSources(Mutex<HashSet<Address>>);

impl BadSources {
    fn lock(&self) -> MutexGuard<'_, HashSet<Address>> {
        // The set stays consistent even if a holder panicked.
        self.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn contains(&self, addr: &Address) -> bool {
        self.lock().contains(addr)
    }

    fn insert(&self, addr: Address) {
        self.lock().insert(addr);
    }
}

/// Result of checking fetched blocks.
enum BlockCheck {
    /// Some blocks were not returned.
    Missing,
    /// A returned block is invalid.
    Invalid(Height, String),
}

impl GeneralSyncer {
    /// Constructs a syncer. `base`, if any, must be the manifest at `from - 1`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        from: Height,
        to: Height,
        base: Option<Manifest>,
        sources: Vec<RemoteNode>,
        db: Arc<dyn Database>,
        block_data: Arc<dyn BlockData>,
        cfg: SyncerConfig,
    ) -> Result<Self, SyncerError> {
        if to < from || from < Height::PRE_GENESIS {
            return Err(SyncerError::InvalidRange { from, to });
        }
        if sources.is_empty() {
            return Err(SyncerError::NoSource);
        }
        if let Some(base) = &base {
            if base.height.next() != from {
                return Err(anyhow::format_err!(
                    "base manifest {} does not precede {from}",
                    base.height
                )
                .into());
            }
        }
        let threshold = Threshold::new(sources.len() as u64, cfg.threshold_ratio).threshold();
        Ok(Self {
            id,
            from,
            to,
            base,
            proved: sources.clone(),
            sources,
            threshold,
            manifests: BTreeMap::new(),
            db,
            block_data,
            cfg,
            state: sync::watch::channel(SyncerState::Created).0,
        })
    }

    /// Id of the syncer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// First height of the range. Moves down if the local chain was rolled back.
    pub fn from(&self) -> Height {
        self.from
    }

    /// Last height of the range.
    pub fn to(&self) -> Height {
        self.to
    }

    /// Current state.
    pub fn state(&self) -> SyncerState {
        *self.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> sync::watch::Receiver<SyncerState> {
        self.state.subscribe()
    }

    /// Addresses of the sources trusted for the rest of the syncer's lifetime.
    pub fn proved(&self) -> Vec<Address> {
        self.proved.iter().map(|n| n.node.address.clone()).collect()
    }

    /// Agreed manifest at `to`, once prepared.
    pub fn last_manifest(&self) -> Option<&Manifest> {
        self.manifests.get(&self.to)
    }

    fn set_state(&self, state: SyncerState) {
        self.state.send_replace(state);
        tracing::debug!(syncer = self.id, ?state, "ISAAC syncer - state changed");
    }

    fn finish<T>(&self, res: Result<T, SyncerError>, ok: SyncerState) -> Result<T, SyncerError> {
        match &res {
            Ok(_) => self.set_state(ok),
            Err(SyncerError::Internal(ctx::Error::Canceled(_))) => {
                self.set_state(SyncerState::Canceled)
            }
            Err(err) => {
                METRICS.failed.inc();
                tracing::warn!(syncer = self.id, "ISAAC syncer - failed: {err:#}");
                self.set_state(SyncerState::Failed);
            }
        }
        res
    }

    /// Prepares and saves.
    pub async fn run(&mut self, ctx: &ctx::Ctx) -> Result<Manifest, SyncerError> {
        self.prepare(ctx).await?;
        self.save(ctx).await
    }

    /// Fetches the manifests of the whole range and checks that they link.
    /// Rolls the local chain back if it diverges from the sources.
    #[tracing::instrument(level = "debug", skip_all, fields(syncer = self.id, from = %self.from, to = %self.to))]
    pub async fn prepare(&mut self, ctx: &ctx::Ctx) -> Result<(), SyncerError> {
        match self.state() {
            SyncerState::Created => {}
            SyncerState::Prepared | SyncerState::Saving | SyncerState::Saved => return Ok(()),
            state => {
                return Err(anyhow::format_err!("syncer can't be prepared in state {state:?}").into())
            }
        }
        self.set_state(SyncerState::Preparing);
        let res = self.prepare_inner(ctx).await;
        self.finish(res, SyncerState::Prepared)
    }

    async fn prepare_inner(&mut self, ctx: &ctx::Ctx) -> Result<(), SyncerError> {
        loop {
            self.manifests.clear();
            let mut ends = vec![self.from];
            if self.to != self.from {
                ends.push(self.to);
            }
            let got = self.fetch_agreed(ctx, &ends).await?;
            if let Some(base) = self.base.clone() {
                if got[&self.from].previous_block != base.hash {
                    self.rollback(ctx, &base).await?;
                    continue;
                }
            }
            self.manifests.extend(got);
            break;
        }

        let rest: Vec<Height> = (self.from.0 + 1..self.to.0).map(Height).collect();
        let batch = self.cfg.limit_manifests_per_worker.max(1) as usize;
        for chunk in rest.chunks(batch) {
            let got = self.fetch_agreed(ctx, chunk).await?;
            self.manifests.extend(got);
        }

        let mut prev = self.base.as_ref().map(|b| b.hash);
        for (h, m) in &self.manifests {
            m.verify().map_err(|err| SyncerError::Integrity {
                height: *h,
                reason: format!("{err:#}"),
            })?;
            if prev.is_some_and(|p| m.previous_block != p) {
                return Err(SyncerError::Integrity {
                    height: *h,
                    reason: "manifest does not link to the previous one".into(),
                });
            }
            prev = Some(m.hash);
        }
        tracing::info!(
            syncer = self.id,
            from = %self.from,
            to = %self.to,
            proved = self.proved.len(),
            "ISAAC syncer - prepared"
        );
        Ok(())
    }

    /// Handles a `from` manifest that does not link to `base`.
    async fn rollback(&mut self, ctx: &ctx::Ctx, base: &Manifest) -> Result<(), SyncerError> {
        let local = self
            .db
            .manifest_by_height(ctx, base.height)
            .await
            .wrap("db.manifest_by_height()")?;
        // Only a locally committed base can be rolled back.
        if local.as_ref() != Some(base) {
            return Err(SyncerError::Fork { height: self.from });
        }
        tracing::warn!(
            syncer = self.id,
            base = %base.height,
            "ISAAC syncer - local chain diverges from the sources, searching for the common block"
        );
        let Some(common) = rollback::find_common_height(
            ctx,
            &*self.db,
            &self.proved,
            self.threshold,
            self.cfg.request_timeout,
            base.height,
        )
        .await?
        else {
            return Err(SyncerError::Fork {
                height: Height::PRE_GENESIS,
            });
        };
        isaac_storage::clean_by_height(ctx, &*self.db, &*self.block_data, common.next())
            .await
            .wrap("clean_by_height()")?;
        METRICS
            .rolled_back
            .inc_by(u64::try_from(base.height.0 - common.0).unwrap_or(0));
        tracing::warn!(
            syncer = self.id,
            %common,
            "ISAAC syncer - rolled back local blocks above the common block"
        );
        self.base = self
            .db
            .manifest_by_height(ctx, common)
            .await
            .wrap("db.manifest_by_height()")?;
        self.from = common.next();
        self.proved = self.sources.clone();
        Ok(())
    }

    async fn fetch_agreed(
        &mut self,
        ctx: &ctx::Ctx,
        heights: &[Height],
    ) -> Result<BTreeMap<Height, Manifest>, SyncerError> {
        let answers =
            fetch_manifests(ctx, &self.proved, heights, self.cfg.request_timeout).await?;
        let (agreed, nodes) = agree(heights, &answers, self.threshold)?;
        self.proved.retain(|n| nodes.contains(&n.node.address));
        Ok(agreed)
    }

    /// Fetches, validates and commits the blocks of the prepared range.
    /// Calling it again once saved returns the last manifest.
    #[tracing::instrument(level = "debug", skip_all, fields(syncer = self.id, from = %self.from, to = %self.to))]
    pub async fn save(&mut self, ctx: &ctx::Ctx) -> Result<Manifest, SyncerError> {
        match self.state() {
            SyncerState::Prepared => {}
            SyncerState::Saved => {
                return Ok(self.manifests[&self.to].clone());
            }
            state => {
                return Err(anyhow::format_err!("syncer can't be saved in state {state:?}").into())
            }
        }
        self.set_state(SyncerState::Saving);
        let res = self.save_inner(ctx).await;
        self.finish(res, SyncerState::Saved)
    }

    async fn save_inner(&mut self, ctx: &ctx::Ctx) -> Result<Manifest, SyncerError> {
        let heights: Vec<Height> = self.manifests.keys().copied().collect();
        let batch = self.cfg.limit_blocks_per_once.max(1) as usize;
        let chunks: Vec<&[Height]> = heights.chunks(batch).collect();
        let bad = BadSources::default();
        let mut rest = &chunks[..];
        while !rest.is_empty() {
            if self.proved.is_empty() {
                return Err(SyncerError::NoSource);
            }
            // One chunk per proved source at a time.
            let (group, tail) = rest.split_at(self.proved.len().min(rest.len()));
            rest = tail;
            let this = &*self;
            let bad = &bad;
            let fetched: Vec<Vec<Block>> = scope::run!(ctx, |ctx, s| async {
                let tasks: Vec<_> = group
                    .iter()
                    .enumerate()
                    .map(|(i, chunk)| s.spawn(this.fetch_blocks(ctx, i, chunk, bad)))
                    .collect();
                let mut out = vec![];
                for t in tasks {
                    out.push(t.join(ctx).await?);
                }
                Ok(out)
            })
            .await?;
            for block in fetched.iter().flatten() {
                self.commit(ctx, block).await?;
            }
            self.proved
                .retain(|n| !bad.contains(&n.node.address));
        }
        tracing::info!(syncer = self.id, from = %self.from, to = %self.to, "ISAAC syncer - saved");
        Ok(self.manifests[&self.to].clone())
    }

    async fn commit(&self, ctx: &ctx::Ctx, block: &Block) -> Result<(), SyncerError> {
        let local = self
            .db
            .manifest_by_height(ctx, block.height())
            .await
            .wrap("db.manifest_by_height()")?;
        if local.is_some_and(|m| m.hash == block.hash()) {
            return Ok(());
        }
        isaac_storage::store_block(ctx, &*self.db, &*self.block_data, block)
            .await
            .wrap("store_block()")?;
        METRICS.blocks_saved.inc();
        Ok(())
    }

    /// Fetches the blocks at `heights`, starting with the `i`-th proved source
    /// and trying the others in turn. Sources returning invalid blocks are added to `bad`.
    async fn fetch_blocks(
        &self,
        ctx: &ctx::Ctx,
        i: usize,
        heights: &[Height],
        bad: &BadSources,
    ) -> Result<Vec<Block>, SyncerError> {
        let n = self.proved.len();
        let mut reason = "no source returned the blocks".to_owned();
        for k in 0..n {
            let node = &self.proved[(i + k) % n];
            if bad.contains(&node.node.address) {
                continue;
            }
            let res = node
                .channel
                .blocks(&ctx.with_timeout(self.cfg.request_timeout), heights)
                .await;
            if !ctx.is_active() {
                return Err(ctx::Canceled.into());
            }
            let blocks = match res {
                Ok(blocks) => blocks,
                Err(err) => {
                    tracing::debug!(
                        syncer = self.id,
                        node = %node.node.address,
                        "ISAAC syncer - blocks request failed: {err:#}"
                    );
                    continue;
                }
            };
            match self.check_blocks(heights, &blocks) {
                Ok(()) => return Ok(blocks),
                Err(BlockCheck::Missing) => {}
                Err(BlockCheck::Invalid(height, why)) => {
                    tracing::warn!(
                        syncer = self.id,
                        node = %node.node.address,
                        %height,
                        "ISAAC syncer - invalid block, dropping the source: {why}"
                    );
                    reason = why;
                    bad.insert(node.node.address.clone());
                }
            }
        }
        Err(SyncerError::Integrity {
            height: heights[0],
            reason,
        })
    }

    fn check_blocks(&self, heights: &[Height], blocks: &[Block]) -> Result<(), BlockCheck> {
        if blocks.len() != heights.len() {
            return Err(BlockCheck::Missing);
        }
        for (h, b) in heights.iter().zip(blocks) {
            self.check_block(*h, b)
                .map_err(|why| BlockCheck::Invalid(*h, why))?;
        }
        Ok(())
    }

    fn check_block(&self, height: Height, block: &Block) -> Result<(), String> {
        let Some(want) = self.manifests.get(&height) else {
            return Err("unexpected height".into());
        };
        if &block.manifest != want {
            return Err("block does not match the agreed manifest".into());
        }
        block.verify().map_err(|err| format!("{err:#}"))?;
        let Some(accept) = &block.accept_voteproof else {
            return Err("block has no ACCEPT voteproof".into());
        };
        for (name, vp) in [("init", &block.init_voteproof), ("accept", accept)] {
            self.check_voteproof(vp)
                .map_err(|err| format!("{name} voteproof: {err:#}"))?;
        }
        Ok(())
    }

    /// Checks a voteproof of a fetched block against the network id, the
    /// registered keys and the local threshold. Genesis voteproofs are
    /// signed by the genesis node alone, so their threshold is not checked.
    fn check_voteproof(&self, vp: &Voteproof) -> Result<(), VoteproofVerifyError> {
        vp.verify(&self.cfg.network_id)?;
        vp.verify_signers(&self.cfg.keys)?;
        if vp.height <= Height::GENESIS {
            return Ok(());
        }
        vp.verify_threshold(&Threshold::new(
            self.cfg.keys.len() as u64,
            self.cfg.threshold_ratio,
        ))
    }
}

/// Answer of one source: the manifests it returned, by height.
pub(crate) type Answer = (Address, BTreeMap<Height, Manifest>);

/// Requests the manifests at `heights` from every node concurrently.
/// Nodes that fail to answer in time are left out.
pub(crate) async fn fetch_manifests(
    ctx: &ctx::Ctx,
    nodes: &[RemoteNode],
    heights: &[Height],
    timeout: time::Duration,
) -> ctx::Result<Vec<Answer>> {
    let answers = scope::run!(ctx, |ctx, s| async {
        let tasks: Vec<_> = nodes
            .iter()
            .map(|node| {
                s.spawn(async move {
                    let res = node
                        .channel
                        .manifests(&ctx.with_timeout(timeout), heights)
                        .await;
                    match res {
                        Ok(ms) => {
                            let ms = ms
                                .into_iter()
                                .filter(|m| heights.contains(&m.height) && m.verify().is_ok())
                                .map(|m| (m.height, m))
                                .collect();
                            Ok(Some((node.node.address.clone(), ms)))
                        }
                        Err(err) => {
                            tracing::debug!(
                                node = %node.node.address,
                                "ISAAC syncer - manifests request failed: {err:#}"
                            );
                            Ok(None)
                        }
                    }
                })
            })
            .collect();
        let mut answers = vec![];
        for t in tasks {
            answers.extend(t.join(ctx).await?);
        }
        Ok::<_, ctx::Error>(answers)
    })
    .await?;
    if !ctx.is_active() {
        return Err(ctx::Canceled.into());
    }
    Ok(answers)
}

/// Picks, for every height, the manifest returned by at least `threshold`
/// nodes. Returns the agreed manifests and the nodes that agreed on all of them.
pub(crate) fn agree(
    heights: &[Height],
    answers: &[Answer],
    threshold: u64,
) -> Result<(BTreeMap<Height, Manifest>, HashSet<Address>), SyncerError> {
    let mut agreed = BTreeMap::new();
    let mut nodes: Option<HashSet<Address>> = None;
    for h in heights {
        let mut groups: HashMap<Hash, (&Manifest, HashSet<Address>)> = HashMap::new();
        for (addr, ms) in answers {
            if let Some(m) = ms.get(h) {
                groups
                    .entry(m.hash)
                    .or_insert_with(|| (m, HashSet::new()))
                    .1
                    .insert(addr.clone());
            }
        }
        let Some((m, voters)) = groups.into_values().max_by_key(|(_, v)| v.len()) else {
            return Err(SyncerError::Threshold { height: *h });
        };
        if (voters.len() as u64) < threshold {
            return Err(SyncerError::Threshold { height: *h });
        }
        nodes = Some(match nodes {
            None => voters,
            Some(n) => n.intersection(&voters).cloned().collect(),
        });
        agreed.insert(*h, m.clone());
    }
    Ok((agreed, nodes.unwrap_or_default()))
}
