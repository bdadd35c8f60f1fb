//! In-memory database, used by tests and by in-process local networks.
use crate::{check_commit, Database, DatabaseSession, Order};
use isaac_roles::messages::{
    Ballot, Block, BlockDataMap, Hash, Height, Manifest, OperationSeal, Round, Seal, Stage, State,
    Voteproof,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};
use zksync_concurrency::ctx;

#[derive(Debug, Default)]
struct Inner {
    blocks: BTreeMap<Height, Block>,
    heights: HashMap<Hash, Height>,
    /// Seals with their insertion sequence number.
    seals: HashMap<Hash, (u64, Seal)>,
    next_seal: u64,
    /// Operation seals with uncommitted operations, by sequence number.
    staged_seals: BTreeMap<u64, OperationSeal>,
    proposals: BTreeMap<(Height, Round), Ballot>,
    init_voteproofs: BTreeMap<(Height, Round), Voteproof>,
    accept_voteproofs: BTreeMap<(Height, Round), Voteproof>,
    /// Every version of every state, by the height it was written at.
    states: HashMap<String, BTreeMap<Height, State>>,
    operations: HashMap<Hash, Height>,
    operation_facts: HashMap<Hash, Height>,
    maps: BTreeMap<Height, BlockDataMap>,
}

impl Inner {
    fn is_staged(&self, seal: &OperationSeal) -> bool {
        seal.operations
            .iter()
            .any(|op| !self.operations.contains_key(&op.hash))
    }

    /// Rebuilds the staged seal index from the stored seals.
    fn restage_seals(&mut self) {
        let staged: BTreeMap<_, _> = self
            .seals
            .values()
            .filter_map(|(seq, seal)| match seal {
                Seal::Operations(s) if self.is_staged(s) => Some((*seq, s.clone())),
                _ => None,
            })
            .collect();
        self.staged_seals = staged;
    }

    fn voteproofs(&mut self, stage: Stage) -> &mut BTreeMap<(Height, Round), Voteproof> {
        match stage {
            Stage::Accept => &mut self.accept_voteproofs,
            _ => &mut self.init_voteproofs,
        }
    }

    fn commit(&mut self, block: &Block, map: &BlockDataMap) -> anyhow::Result<()> {
        check_commit(self.blocks.values().next_back().map(|b| &b.manifest), block)?;
        anyhow::ensure!(
            map.height == block.height() && map.block == block.hash(),
            "block-data map is for a different block"
        );
        let height = block.height();
        for state in &block.states {
            let mut state = state.clone();
            state.block_hash = Some(block.hash());
            self.states
                .entry(state.key.clone())
                .or_default()
                .insert(height, state);
        }
        for op in &block.operations {
            self.operations.insert(op.hash, height);
            self.operation_facts.insert(op.fact_hash, height);
        }
        let staged = std::mem::take(&mut self.staged_seals);
        self.staged_seals = staged
            .into_iter()
            .filter(|(_, s)| self.is_staged(s))
            .collect();
        let init = &block.init_voteproof;
        self.init_voteproofs
            .insert((init.height, init.round), init.clone());
        if let Some(accept) = &block.accept_voteproof {
            self.accept_voteproofs
                .insert((accept.height, accept.round), accept.clone());
        }
        self.maps.insert(height, map.clone());
        self.heights.insert(block.hash(), height);
        self.blocks.insert(height, block.clone());
        Ok(())
    }

    fn clean_by_height(&mut self, height: Height) {
        for b in self.blocks.split_off(&height).values() {
            self.heights.remove(&b.hash());
        }
        for versions in self.states.values_mut() {
            versions.retain(|h, _| *h < height);
        }
        self.states.retain(|_, v| !v.is_empty());
        self.operations.retain(|_, h| *h < height);
        self.operation_facts.retain(|_, h| *h < height);
        self.init_voteproofs.retain(|(h, _), _| *h < height);
        self.accept_voteproofs.retain(|(h, _), _| *h < height);
        self.maps.retain(|h, _| *h < height);
        self.restage_seals();
    }
}

/// [`Database`] over in-memory maps.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase(Arc<Mutex<Inner>>);

impl InMemoryDatabase {
    /// Constructs an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic while holding it, which already failed the caller.
        self.0.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl Database for InMemoryDatabase {
    async fn last_manifest(&self, _ctx: &ctx::Ctx) -> ctx::Result<Option<Manifest>> {
        Ok(self
            .lock()
            .blocks
            .values()
            .next_back()
            .map(|b| b.manifest.clone()))
    }

    async fn manifest(&self, _ctx: &ctx::Ctx, hash: &Hash) -> ctx::Result<Option<Manifest>> {
        let inner = self.lock();
        Ok(inner
            .heights
            .get(hash)
            .and_then(|h| inner.blocks.get(h))
            .map(|b| b.manifest.clone()))
    }

    async fn manifest_by_height(
        &self,
        _ctx: &ctx::Ctx,
        height: Height,
    ) -> ctx::Result<Option<Manifest>> {
        Ok(self.lock().blocks.get(&height).map(|b| b.manifest.clone()))
    }

    async fn block(&self, _ctx: &ctx::Ctx, hash: &Hash) -> ctx::Result<Option<Block>> {
        let inner = self.lock();
        Ok(inner
            .heights
            .get(hash)
            .and_then(|h| inner.blocks.get(h))
            .cloned())
    }

    async fn block_by_height(&self, _ctx: &ctx::Ctx, height: Height) -> ctx::Result<Option<Block>> {
        Ok(self.lock().blocks.get(&height).cloned())
    }

    async fn seal(&self, _ctx: &ctx::Ctx, hash: &Hash) -> ctx::Result<Option<Seal>> {
        Ok(self.lock().seals.get(hash).map(|(_, s)| s.clone()))
    }

    async fn seals(&self, _ctx: &ctx::Ctx, order: Order) -> ctx::Result<Vec<Seal>> {
        let inner = self.lock();
        let mut seals: Vec<_> = inner.seals.values().collect();
        seals.sort_by_key(|(seq, _)| *seq);
        if order == Order::Descending {
            seals.reverse();
        }
        Ok(seals.into_iter().map(|(_, s)| s.clone()).collect())
    }

    async fn new_seals(&self, _ctx: &ctx::Ctx, seals: &[Seal]) -> ctx::Result<()> {
        let mut inner = self.lock();
        for seal in seals {
            let hash = seal.hash();
            if inner.seals.contains_key(&hash) {
                continue;
            }
            let seq = inner.next_seal;
            inner.next_seal += 1;
            if let Seal::Operations(s) = seal {
                if inner.is_staged(s) {
                    inner.staged_seals.insert(seq, s.clone());
                }
            }
            inner.seals.insert(hash, (seq, seal.clone()));
        }
        Ok(())
    }

    async fn staged_operation_seals(
        &self,
        _ctx: &ctx::Ctx,
        limit: usize,
    ) -> ctx::Result<Vec<OperationSeal>> {
        Ok(self
            .lock()
            .staged_seals
            .values()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn proposal(
        &self,
        _ctx: &ctx::Ctx,
        height: Height,
        round: Round,
    ) -> ctx::Result<Option<Ballot>> {
        Ok(self.lock().proposals.get(&(height, round)).cloned())
    }

    async fn proposals(&self, _ctx: &ctx::Ctx, order: Order) -> ctx::Result<Vec<Ballot>> {
        let inner = self.lock();
        let mut proposals: Vec<_> = inner.proposals.values().cloned().collect();
        if order == Order::Descending {
            proposals.reverse();
        }
        Ok(proposals)
    }

    async fn new_proposal(&self, _ctx: &ctx::Ctx, proposal: &Ballot) -> ctx::Result<()> {
        self.lock()
            .proposals
            .entry((proposal.height(), proposal.round()))
            .or_insert_with(|| proposal.clone());
        Ok(())
    }

    async fn new_init_voteproof(&self, _ctx: &ctx::Ctx, vp: &Voteproof) -> ctx::Result<()> {
        self.lock()
            .init_voteproofs
            .insert((vp.height, vp.round), vp.clone());
        Ok(())
    }

    async fn new_accept_voteproof(&self, _ctx: &ctx::Ctx, vp: &Voteproof) -> ctx::Result<()> {
        self.lock()
            .accept_voteproofs
            .insert((vp.height, vp.round), vp.clone());
        Ok(())
    }

    async fn last_voteproof(
        &self,
        _ctx: &ctx::Ctx,
        stage: Stage,
    ) -> ctx::Result<Option<Voteproof>> {
        Ok(self
            .lock()
            .voteproofs(stage)
            .values()
            .next_back()
            .cloned())
    }

    async fn last_voteproof_of_height(
        &self,
        _ctx: &ctx::Ctx,
        height: Height,
        stage: Stage,
    ) -> ctx::Result<Option<Voteproof>> {
        Ok(self
            .lock()
            .voteproofs(stage)
            .range((height, Round(0))..=(height, Round(u64::MAX)))
            .next_back()
            .map(|(_, vp)| vp.clone()))
    }

    async fn state(&self, _ctx: &ctx::Ctx, key: &str) -> ctx::Result<Option<State>> {
        Ok(self
            .lock()
            .states
            .get(key)
            .and_then(|v| v.values().next_back())
            .cloned())
    }

    async fn new_state(&self, _ctx: &ctx::Ctx, state: &State) -> ctx::Result<()> {
        self.lock()
            .states
            .entry(state.key.clone())
            .or_default()
            .insert(state.height, state.clone());
        Ok(())
    }

    async fn has_operation(&self, _ctx: &ctx::Ctx, hash: &Hash) -> ctx::Result<bool> {
        Ok(self.lock().operations.contains_key(hash))
    }

    async fn has_operation_fact(&self, _ctx: &ctx::Ctx, fact: &Hash) -> ctx::Result<bool> {
        Ok(self.lock().operation_facts.contains_key(fact))
    }

    async fn block_data_map(
        &self,
        _ctx: &ctx::Ctx,
        height: Height,
    ) -> ctx::Result<Option<BlockDataMap>> {
        Ok(self.lock().maps.get(&height).cloned())
    }

    async fn new_session(
        &self,
        _ctx: &ctx::Ctx,
        block: &Block,
    ) -> ctx::Result<Box<dyn DatabaseSession>> {
        Ok(Box::new(InMemorySession {
            db: self.clone(),
            block: block.clone(),
            status: SessionStatus::Open,
        }))
    }

    async fn clean(&self, _ctx: &ctx::Ctx) -> ctx::Result<()> {
        *self.lock() = Inner::default();
        Ok(())
    }

    async fn clean_by_height(&self, _ctx: &ctx::Ctx, height: Height) -> ctx::Result<()> {
        self.lock().clean_by_height(height);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Open,
    Committed,
    Closed,
}

#[derive(Debug)]
struct InMemorySession {
    db: InMemoryDatabase,
    block: Block,
    status: SessionStatus,
}

#[async_trait::async_trait]
impl DatabaseSession for InMemorySession {
    fn block(&self) -> &Block {
        &self.block
    }

    async fn set_block(&mut self, _ctx: &ctx::Ctx, block: Block) -> ctx::Result<()> {
        if self.status != SessionStatus::Open {
            return Err(anyhow::format_err!("session is not open").into());
        }
        if block.height() != self.block.height() {
            return Err(anyhow::format_err!(
                "session is for height {}, got block {}",
                self.block.height(),
                block.height()
            )
            .into());
        }
        self.block = block;
        Ok(())
    }

    async fn commit(&mut self, _ctx: &ctx::Ctx, map: &BlockDataMap) -> ctx::Result<()> {
        if self.status != SessionStatus::Open {
            return Err(anyhow::format_err!("session is not open").into());
        }
        self.db.lock().commit(&self.block, map)?;
        self.status = SessionStatus::Committed;
        Ok(())
    }

    fn close(&mut self) {
        self.status = SessionStatus::Closed;
    }

    fn cancel(&mut self) {
        self.status = SessionStatus::Closed;
    }
}
