//! RocksDB-based implementation of [`Database`].
use anyhow::Context as _;
use isaac_crypto::ByteFmt;
use isaac_roles::messages::{
    Ballot, Block, BlockDataMap, Hash, Height, Manifest, OperationSeal, Round, Seal, Stage, State,
    Voteproof,
};
use isaac_storage::{check_commit, Database, DatabaseSession, Order};
use rocksdb::{Direction, IteratorMode, ReadOptions};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashSet,
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};
use zksync_concurrency::{ctx, scope};

/// Enum used to represent a key in the database. The first byte of an encoded
/// key separates the different stores; heights and rounds are big-endian so
/// that keys of a store sort like the values they encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DatabaseKey<'a> {
    /// Block(height) -> Block
    Block(Height),
    /// Manifest(height) -> Manifest
    Manifest(Height),
    /// BlockHash(hash) -> height
    BlockHash(&'a Hash),
    /// Seal(hash) -> Seal
    Seal(&'a Hash),
    /// SealOrder(sequence number) -> hash of the seal stored at that position
    SealOrder(u64),
    /// Proposal(height, round) -> Ballot
    Proposal(Height, Round),
    /// InitVoteproof(height, round) -> Voteproof
    InitVoteproof(Height, Round),
    /// AcceptVoteproof(height, round) -> Voteproof
    AcceptVoteproof(Height, Round),
    /// State(key, height) -> State
    State(&'a str, Height),
    /// Operation(hash) -> height
    Operation(&'a Hash),
    /// OperationFact(fact hash) -> height
    OperationFact(&'a Hash),
    /// BlockDataMap(height) -> BlockDataMap
    BlockDataMap(Height),
    /// StagedSeal(sequence number) -> hash of an operation seal with uncommitted operations
    StagedSeal(u64),
}

impl DatabaseKey<'_> {
    const BLOCK: u8 = 1;
    const MANIFEST: u8 = 2;
    const BLOCK_HASH: u8 = 3;
    const SEAL: u8 = 4;
    const SEAL_ORDER: u8 = 5;
    const PROPOSAL: u8 = 6;
    const INIT_VOTEPROOF: u8 = 7;
    const ACCEPT_VOTEPROOF: u8 = 8;
    const STATE: u8 = 9;
    const OPERATION: u8 = 10;
    const OPERATION_FACT: u8 = 11;
    const BLOCK_DATA_MAP: u8 = 12;
    const STAGED_SEAL: u8 = 13;
    const LAST: u8 = 14;

    fn prefix(&self) -> u8 {
        match self {
            Self::Block(_) => Self::BLOCK,
            Self::Manifest(_) => Self::MANIFEST,
            Self::BlockHash(_) => Self::BLOCK_HASH,
            Self::Seal(_) => Self::SEAL,
            Self::SealOrder(_) => Self::SEAL_ORDER,
            Self::Proposal(..) => Self::PROPOSAL,
            Self::InitVoteproof(..) => Self::INIT_VOTEPROOF,
            Self::AcceptVoteproof(..) => Self::ACCEPT_VOTEPROOF,
            Self::State(..) => Self::STATE,
            Self::Operation(_) => Self::OPERATION,
            Self::OperationFact(_) => Self::OPERATION_FACT,
            Self::BlockDataMap(_) => Self::BLOCK_DATA_MAP,
            Self::StagedSeal(_) => Self::STAGED_SEAL,
        }
    }

    /// Encodes this key for usage as a RocksDB key.
    fn encode_key(&self) -> Vec<u8> {
        let mut key = vec![self.prefix()];
        match self {
            Self::Block(h) | Self::Manifest(h) | Self::BlockDataMap(h) => {
                key.extend(encode_height(*h));
            }
            Self::BlockHash(hash)
            | Self::Seal(hash)
            | Self::Operation(hash)
            | Self::OperationFact(hash) => key.extend(hash.as_bytes()),
            Self::SealOrder(seq) | Self::StagedSeal(seq) => key.extend(seq.to_be_bytes()),
            Self::Proposal(h, r) | Self::InitVoteproof(h, r) | Self::AcceptVoteproof(h, r) => {
                key.extend(encode_height(*h));
                key.extend(r.0.to_be_bytes());
            }
            Self::State(k, h) => {
                key.extend(state_prefix(k));
                key.extend(encode_height(*h));
            }
        }
        key
    }

    fn voteproof(stage: Stage, height: Height, round: Round) -> DatabaseKey<'static> {
        match stage {
            Stage::Accept => DatabaseKey::AcceptVoteproof(height, round),
            _ => DatabaseKey::InitVoteproof(height, round),
        }
    }
}

/// Order-preserving encoding of a signed height.
fn encode_height(h: Height) -> [u8; 8] {
    ((h.0 as u64) ^ (1 << 63)).to_be_bytes()
}

fn decode_height(raw: &[u8]) -> anyhow::Result<Height> {
    let raw: [u8; 8] = raw.try_into().context("height must be 8 bytes")?;
    Ok(Height((u64::from_be_bytes(raw) ^ (1 << 63)) as i64))
}

/// Part of a state key before the height: the key length then the key.
fn state_prefix(key: &str) -> Vec<u8> {
    let mut raw = (key.len() as u32).to_be_bytes().to_vec();
    raw.extend(key.as_bytes());
    raw
}

fn encode<T: Serialize>(v: &T) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec(v).context("serde_json::to_vec()")
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> anyhow::Result<T> {
    serde_json::from_slice(raw).context("serde_json::from_slice()")
}

/// Key-value pairs with keys in `lower..upper`.
fn scan<'a>(
    db: &'a rocksdb::DB,
    lower: Vec<u8>,
    upper: Vec<u8>,
    order: Order,
) -> impl 'a + Iterator<Item = anyhow::Result<(Box<[u8]>, Box<[u8]>)>> {
    let mut options = ReadOptions::default();
    options.set_iterate_range(lower..upper);
    let mode = match order {
        Order::Ascending => IteratorMode::Start,
        Order::Descending => IteratorMode::End,
    };
    db.iterator_opt(mode, options)
        .map(|res| res.context("RocksDB error"))
}

/// Key-value pairs of one store.
fn scan_prefix(
    db: &rocksdb::DB,
    prefix: u8,
    order: Order,
) -> impl '_ + Iterator<Item = anyhow::Result<(Box<[u8]>, Box<[u8]>)>> {
    scan(db, vec![prefix], vec![prefix + 1], order)
}

fn get<T: DeserializeOwned>(db: &rocksdb::DB, key: DatabaseKey) -> anyhow::Result<Option<T>> {
    let Some(raw) = db.get(key.encode_key()).context("RocksDB error")? else {
        return Ok(None);
    };
    Ok(Some(decode(&raw).with_context(|| format!("{key:?}"))?))
}

/// Hash stored as the value of a seal index.
fn decode_seal_hash(raw: &[u8]) -> anyhow::Result<Hash> {
    ByteFmt::decode(raw).context("seal index value")
}

fn is_committed(db: &rocksdb::DB, op: &Hash) -> anyhow::Result<bool> {
    let key = DatabaseKey::Operation(op).encode_key();
    Ok(db.get(key).context("RocksDB error")?.is_some())
}

fn last<T: DeserializeOwned>(db: &rocksdb::DB, prefix: u8) -> anyhow::Result<Option<T>> {
    match scan_prefix(db, prefix, Order::Descending).next() {
        None => Ok(None),
        Some(res) => Ok(Some(decode(&res?.1)?)),
    }
}

struct Inner {
    /// Sequence number of the next stored seal.
    next_seal: AtomicU64,
    db: RwLock<rocksdb::DB>,
}

/// Main struct for the Storage module, it just contains the database.
/// Every block is written by a [`DatabaseSession`] as a single `WriteBatch`.
#[derive(Clone)]
pub struct RocksDB(Arc<Inner>);

impl fmt::Debug for RocksDB {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("RocksDB")
    }
}

impl RocksDB {
    /// Opens the database at `path`, creating it if missing.
    pub async fn open(path: &Path) -> ctx::Result<Self> {
        let mut options = rocksdb::Options::default();
        options.create_missing_column_families(true);
        options.create_if_missing(true);
        let db = scope::wait_blocking(|| {
            rocksdb::DB::open(&options, path).context("Failed opening RocksDB")
        })
        .await?;
        let next_seal = scope::wait_blocking(|| -> anyhow::Result<u64> {
            let mut it = scan_prefix(&db, DatabaseKey::SEAL_ORDER, Order::Descending);
            let Some(res) = it.next() else {
                return Ok(0);
            };
            let (key, _) = res?;
            let raw: [u8; 8] = key[1..].try_into().context("bad seal order key")?;
            Ok(u64::from_be_bytes(raw) + 1)
        })
        .await?;
        Ok(Self(Arc::new(Inner {
            next_seal: AtomicU64::new(next_seal),
            db: RwLock::new(db),
        })))
    }

    async fn read<T: 'static + Send>(
        &self,
        f: impl Send + FnOnce(&rocksdb::DB) -> anyhow::Result<T>,
    ) -> ctx::Result<T> {
        Ok(scope::wait_blocking(|| f(&self.0.db.read().unwrap())).await?)
    }

    async fn write<T: 'static + Send>(
        &self,
        f: impl Send + FnOnce(&rocksdb::DB) -> anyhow::Result<T>,
    ) -> ctx::Result<T> {
        Ok(scope::wait_blocking(|| f(&self.0.db.write().unwrap())).await?)
    }

    fn commit_blocking(db: &rocksdb::DB, block: &Block, map: &BlockDataMap) -> anyhow::Result<()> {
        let last: Option<Manifest> = last(db, DatabaseKey::MANIFEST)?;
        check_commit(last.as_ref(), block)?;
        anyhow::ensure!(
            map.height == block.height() && map.block == block.hash(),
            "block-data map is for a different block"
        );
        let height = block.height();
        let hash = block.hash();
        let mut batch = rocksdb::WriteBatch::default();
        for state in &block.states {
            let mut state = state.clone();
            state.block_hash = Some(hash);
            batch.put(
                DatabaseKey::State(&state.key, height).encode_key(),
                encode(&state)?,
            );
        }
        let height_raw = encode_height(height);
        for op in &block.operations {
            batch.put(DatabaseKey::Operation(&op.hash).encode_key(), height_raw);
            batch.put(
                DatabaseKey::OperationFact(&op.fact_hash).encode_key(),
                height_raw,
            );
        }
        let included: HashSet<Hash> = block.operations.iter().map(|op| op.hash).collect();
        for res in scan_prefix(db, DatabaseKey::STAGED_SEAL, Order::Ascending) {
            let (key, hash) = res?;
            let hash = decode_seal_hash(&hash)?;
            let Some(Seal::Operations(seal)) = get(db, DatabaseKey::Seal(&hash))? else {
                batch.delete(key);
                continue;
            };
            let mut pending = false;
            for op in &seal.operations {
                if !included.contains(&op.hash) && !is_committed(db, &op.hash)? {
                    pending = true;
                    break;
                }
            }
            if !pending {
                batch.delete(key);
            }
        }
        let init = &block.init_voteproof;
        batch.put(
            DatabaseKey::InitVoteproof(init.height, init.round).encode_key(),
            encode(init)?,
        );
        if let Some(accept) = &block.accept_voteproof {
            batch.put(
                DatabaseKey::AcceptVoteproof(accept.height, accept.round).encode_key(),
                encode(accept)?,
            );
        }
        batch.put(DatabaseKey::BlockDataMap(height).encode_key(), encode(map)?);
        batch.put(DatabaseKey::BlockHash(&hash).encode_key(), height_raw);
        batch.put(
            DatabaseKey::Manifest(height).encode_key(),
            encode(&block.manifest)?,
        );
        batch.put(DatabaseKey::Block(height).encode_key(), encode(block)?);
        db.write(batch).context("Failed writing block to database")
    }

    fn clean_by_height_blocking(db: &rocksdb::DB, height: Height) -> anyhow::Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        let from = encode_height(height);
        for (prefix, upper) in [
            (DatabaseKey::BLOCK, DatabaseKey::BLOCK + 1),
            (DatabaseKey::MANIFEST, DatabaseKey::MANIFEST + 1),
            (DatabaseKey::BLOCK_DATA_MAP, DatabaseKey::BLOCK_DATA_MAP + 1),
            (DatabaseKey::INIT_VOTEPROOF, DatabaseKey::INIT_VOTEPROOF + 1),
            (DatabaseKey::ACCEPT_VOTEPROOF, DatabaseKey::ACCEPT_VOTEPROOF + 1),
        ] {
            let mut lower = vec![prefix];
            lower.extend(from);
            batch.delete_range(lower, vec![upper]);
        }
        for res in scan_prefix(db, DatabaseKey::BLOCK_HASH, Order::Ascending) {
            let (key, value) = res?;
            if decode_height(&value)? >= height {
                batch.delete(key);
            }
        }
        let mut removed = HashSet::new();
        for prefix in [DatabaseKey::OPERATION, DatabaseKey::OPERATION_FACT] {
            for res in scan_prefix(db, prefix, Order::Ascending) {
                let (key, value) = res?;
                if decode_height(&value)? >= height {
                    if prefix == DatabaseKey::OPERATION {
                        removed.insert(decode_seal_hash(&key[1..])?);
                    }
                    batch.delete(key);
                }
            }
        }
        // Seals whose operations were rolled back become proposable again.
        if !removed.is_empty() {
            for res in scan_prefix(db, DatabaseKey::SEAL_ORDER, Order::Ascending) {
                let (key, hash) = res?;
                let raw: [u8; 8] = key[1..].try_into().context("bad seal order key")?;
                let hash = decode_seal_hash(&hash)?;
                let Some(Seal::Operations(seal)) = get(db, DatabaseKey::Seal(&hash))? else {
                    continue;
                };
                if seal.operations.iter().any(|op| removed.contains(&op.hash)) {
                    batch.put(
                        DatabaseKey::StagedSeal(u64::from_be_bytes(raw)).encode_key(),
                        hash.as_bytes(),
                    );
                }
            }
        }
        for res in scan_prefix(db, DatabaseKey::STATE, Order::Ascending) {
            let (key, _) = res?;
            if decode_height(&key[key.len() - 8..])? >= height {
                batch.delete(key);
            }
        }
        db.write(batch).context("Failed removing blocks from database")
    }
}

#[async_trait::async_trait]
impl Database for RocksDB {
    async fn last_manifest(&self, _ctx: &ctx::Ctx) -> ctx::Result<Option<Manifest>> {
        self.read(|db| last(db, DatabaseKey::MANIFEST)).await
    }

    async fn manifest(&self, _ctx: &ctx::Ctx, hash: &Hash) -> ctx::Result<Option<Manifest>> {
        self.read(|db| {
            let Some(raw) = db
                .get(DatabaseKey::BlockHash(hash).encode_key())
                .context("RocksDB error")?
            else {
                return Ok(None);
            };
            get(db, DatabaseKey::Manifest(decode_height(&raw)?))
        })
        .await
    }

    async fn manifest_by_height(
        &self,
        _ctx: &ctx::Ctx,
        height: Height,
    ) -> ctx::Result<Option<Manifest>> {
        self.read(|db| get(db, DatabaseKey::Manifest(height))).await
    }

    async fn block(&self, _ctx: &ctx::Ctx, hash: &Hash) -> ctx::Result<Option<Block>> {
        self.read(|db| {
            let Some(raw) = db
                .get(DatabaseKey::BlockHash(hash).encode_key())
                .context("RocksDB error")?
            else {
                return Ok(None);
            };
            get(db, DatabaseKey::Block(decode_height(&raw)?))
        })
        .await
    }

    async fn block_by_height(&self, _ctx: &ctx::Ctx, height: Height) -> ctx::Result<Option<Block>> {
        self.read(|db| get(db, DatabaseKey::Block(height))).await
    }

    async fn seal(&self, _ctx: &ctx::Ctx, hash: &Hash) -> ctx::Result<Option<Seal>> {
        self.read(|db| get(db, DatabaseKey::Seal(hash))).await
    }

    async fn seals(&self, _ctx: &ctx::Ctx, order: Order) -> ctx::Result<Vec<Seal>> {
        self.read(|db| {
            let mut seals = vec![];
            for res in scan_prefix(db, DatabaseKey::SEAL_ORDER, order) {
                let (_, hash) = res?;
                let hash: Hash = ByteFmt::decode(&hash).context("seal order value")?;
                let seal = get(db, DatabaseKey::Seal(&hash))?
                    .with_context(|| format!("seal {hash} is listed but missing"))?;
                seals.push(seal);
            }
            Ok(seals)
        })
        .await
    }

    async fn new_seals(&self, _ctx: &ctx::Ctx, seals: &[Seal]) -> ctx::Result<()> {
        self.write(|db| {
            let mut batch = rocksdb::WriteBatch::default();
            let mut added = HashSet::new();
            for seal in seals {
                let hash = seal.hash();
                let key = DatabaseKey::Seal(&hash).encode_key();
                if !added.insert(hash) || db.get(&key).context("RocksDB error")?.is_some() {
                    continue;
                }
                let seq = self.0.next_seal.fetch_add(1, Ordering::SeqCst);
                batch.put(key, encode(seal)?);
                batch.put(
                    DatabaseKey::SealOrder(seq).encode_key(),
                    hash.as_bytes(),
                );
                if let Seal::Operations(s) = seal {
                    let mut staged = false;
                    for op in &s.operations {
                        if !is_committed(db, &op.hash)? {
                            staged = true;
                            break;
                        }
                    }
                    if staged {
                        batch.put(
                            DatabaseKey::StagedSeal(seq).encode_key(),
                            hash.as_bytes(),
                        );
                    }
                }
            }
            db.write(batch).context("Failed writing seals to database")
        })
        .await
    }

    async fn staged_operation_seals(
        &self,
        _ctx: &ctx::Ctx,
        limit: usize,
    ) -> ctx::Result<Vec<OperationSeal>> {
        self.read(move |db| {
            let mut seals = vec![];
            for res in scan_prefix(db, DatabaseKey::STAGED_SEAL, Order::Ascending).take(limit) {
                let (_, hash) = res?;
                let hash = decode_seal_hash(&hash)?;
                match get(db, DatabaseKey::Seal(&hash))? {
                    Some(Seal::Operations(s)) => seals.push(s),
                    _ => anyhow::bail!("staged seal {hash} is listed but missing"),
                }
            }
            Ok(seals)
        })
        .await
    }

    async fn proposal(
        &self,
        _ctx: &ctx::Ctx,
        height: Height,
        round: Round,
    ) -> ctx::Result<Option<Ballot>> {
        self.read(|db| get(db, DatabaseKey::Proposal(height, round)))
            .await
    }

    async fn proposals(&self, _ctx: &ctx::Ctx, order: Order) -> ctx::Result<Vec<Ballot>> {
        self.read(|db| {
            scan_prefix(db, DatabaseKey::PROPOSAL, order)
                .map(|res| decode(&res?.1))
                .collect()
        })
        .await
    }

    async fn new_proposal(&self, _ctx: &ctx::Ctx, proposal: &Ballot) -> ctx::Result<()> {
        self.write(|db| {
            let key = DatabaseKey::Proposal(proposal.height(), proposal.round()).encode_key();
            if db.get(&key).context("RocksDB error")?.is_some() {
                return Ok(());
            }
            db.put(key, encode(proposal)?)
                .context("Failed writing proposal to database")
        })
        .await
    }

    async fn new_init_voteproof(&self, _ctx: &ctx::Ctx, vp: &Voteproof) -> ctx::Result<()> {
        self.write(|db| {
            db.put(
                DatabaseKey::InitVoteproof(vp.height, vp.round).encode_key(),
                encode(vp)?,
            )
            .context("Failed writing voteproof to database")
        })
        .await
    }

    async fn new_accept_voteproof(&self, _ctx: &ctx::Ctx, vp: &Voteproof) -> ctx::Result<()> {
        self.write(|db| {
            db.put(
                DatabaseKey::AcceptVoteproof(vp.height, vp.round).encode_key(),
                encode(vp)?,
            )
            .context("Failed writing voteproof to database")
        })
        .await
    }

    async fn last_voteproof(
        &self,
        _ctx: &ctx::Ctx,
        stage: Stage,
    ) -> ctx::Result<Option<Voteproof>> {
        let prefix = DatabaseKey::voteproof(stage, Height(0), Round(0)).prefix();
        self.read(|db| last(db, prefix)).await
    }

    async fn last_voteproof_of_height(
        &self,
        _ctx: &ctx::Ctx,
        height: Height,
        stage: Stage,
    ) -> ctx::Result<Option<Voteproof>> {
        self.read(|db| {
            let lower = DatabaseKey::voteproof(stage, height, Round(0)).encode_key();
            let mut upper = lower[..9].to_vec();
            upper.extend([0xff; 9]);
            match scan(db, lower, upper, Order::Descending).next() {
                None => Ok(None),
                Some(res) => Ok(Some(decode(&res?.1)?)),
            }
        })
        .await
    }

    async fn state(&self, _ctx: &ctx::Ctx, key: &str) -> ctx::Result<Option<State>> {
        self.read(|db| {
            let mut lower = vec![DatabaseKey::STATE];
            lower.extend(state_prefix(key));
            let mut upper = lower.clone();
            upper.extend([0xff; 9]);
            match scan(db, lower, upper, Order::Descending).next() {
                None => Ok(None),
                Some(res) => Ok(Some(decode(&res?.1)?)),
            }
        })
        .await
    }

    async fn new_state(&self, _ctx: &ctx::Ctx, state: &State) -> ctx::Result<()> {
        self.write(|db| {
            db.put(
                DatabaseKey::State(&state.key, state.height).encode_key(),
                encode(state)?,
            )
            .context("Failed writing state to database")
        })
        .await
    }

    async fn has_operation(&self, _ctx: &ctx::Ctx, hash: &Hash) -> ctx::Result<bool> {
        self.read(|db| {
            Ok(db
                .get(DatabaseKey::Operation(hash).encode_key())
                .context("RocksDB error")?
                .is_some())
        })
        .await
    }

    async fn has_operation_fact(&self, _ctx: &ctx::Ctx, fact: &Hash) -> ctx::Result<bool> {
        self.read(|db| {
            Ok(db
                .get(DatabaseKey::OperationFact(fact).encode_key())
                .context("RocksDB error")?
                .is_some())
        })
        .await
    }

    async fn block_data_map(
        &self,
        _ctx: &ctx::Ctx,
        height: Height,
    ) -> ctx::Result<Option<BlockDataMap>> {
        self.read(|db| get(db, DatabaseKey::BlockDataMap(height)))
            .await
    }

    async fn new_session(
        &self,
        _ctx: &ctx::Ctx,
        block: &Block,
    ) -> ctx::Result<Box<dyn DatabaseSession>> {
        Ok(Box::new(RocksDBSession {
            db: self.clone(),
            block: block.clone(),
            status: SessionStatus::Open,
        }))
    }

    async fn clean(&self, _ctx: &ctx::Ctx) -> ctx::Result<()> {
        self.write(|db| {
            let mut batch = rocksdb::WriteBatch::default();
            batch.delete_range(vec![DatabaseKey::BLOCK], vec![DatabaseKey::LAST]);
            db.write(batch).context("Failed cleaning database")?;
            self.0.next_seal.store(0, Ordering::SeqCst);
            Ok(())
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self, _ctx))]
    async fn clean_by_height(&self, _ctx: &ctx::Ctx, height: Height) -> ctx::Result<()> {
        self.write(|db| Self::clean_by_height_blocking(db, height))
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Open,
    Committed,
    Closed,
}

#[derive(Debug)]
struct RocksDBSession {
    db: RocksDB,
    block: Block,
    status: SessionStatus,
}

#[async_trait::async_trait]
impl DatabaseSession for RocksDBSession {
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

    #[tracing::instrument(level = "debug", skip_all, fields(height = %self.block.height()))]
    async fn commit(&mut self, _ctx: &ctx::Ctx, map: &BlockDataMap) -> ctx::Result<()> {
        if self.status != SessionStatus::Open {
            return Err(anyhow::format_err!("session is not open").into());
        }
        let block = &self.block;
        self.db
            .write(|db| RocksDB::commit_blocking(db, block, map))
            .await?;
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
