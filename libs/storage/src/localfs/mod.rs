//! Filesystem block-data store.
//!
//! Every block lives in its own directory, derived from the height padded to
//! 21 characters and split in groups of 3, e.g. height 1234 is stored under
//! `000/000/000/000/000/001/234/`. Each dataset is a zstd-compressed JSON file;
//! `map.json` binds dataset names to their URL and checksum.
//!
//! Sessions write into a temporary directory under `<root>/.tmp/`, which is
//! renamed into place on save and removed on drop otherwise.
use crate::{metrics::METRICS, BlockData, BlockDataSession};
use anyhow::Context as _;
use isaac_crypto::keccak256::Keccak256;
use isaac_roles::{
    messages::{
        Ballot, BlockDataItem, BlockDataMap, Dataset, Height, Manifest, Operation, State,
        SuffrageInfo, Voteproof,
    },
    tree::FixedTree,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use zksync_concurrency::{ctx, scope};


const TEMP_DIR: &str = ".tmp";
const MAP_FILE: &str = "map.json";
const URL_SCHEME: &str = "file://";
const COMPRESSION_LEVEL: i32 = 3;

/// Encodes a dataset value the way it is stored.
pub fn encode<T: Serialize + ?Sized>(v: &T) -> anyhow::Result<Vec<u8>> {
    let raw = serde_json::to_vec(v).context("serde_json::to_vec()")?;
    zstd::encode_all(&raw[..], COMPRESSION_LEVEL).context("zstd::encode_all()")
}

/// Decodes a stored dataset.
pub fn decode<T: DeserializeOwned>(stored: &[u8]) -> anyhow::Result<T> {
    let raw = zstd::decode_all(stored).context("zstd::decode_all()")?;
    serde_json::from_slice(&raw).context("serde_json::from_slice()")
}

/// Hex checksum of stored bytes.
pub fn checksum(stored: &[u8]) -> String {
    Keccak256::new(stored).to_hex()
}

/// Relative directory of the block at `height`.
pub fn height_dir(height: Height) -> PathBuf {
    let padded = format!("{:021}", height.0);
    padded
        .as_bytes()
        .chunks(3)
        // `padded` is ASCII digits and at most one sign.
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect()
}

fn dataset_file(dataset: Dataset) -> String {
    format!("{}.json.zst", dataset.as_str())
}

/// Block-data store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(root.join(TEMP_DIR))
            .with_context(|| format!("create_dir_all({})", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn block_dir(&self, height: Height) -> PathBuf {
        self.root.join(height_dir(height))
    }

    /// Heights of the stored blocks, found by walking the directory tree.
    fn stored_heights_blocking(&self) -> anyhow::Result<Vec<Height>> {
        fn walk(dir: &Path, prefix: &str, depth: usize, out: &mut Vec<i64>) -> anyhow::Result<()> {
            for entry in fs::read_dir(dir).with_context(|| format!("read_dir({})", dir.display()))? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name == TEMP_DIR || !entry.file_type()?.is_dir() {
                    continue;
                }
                let prefix = format!("{prefix}{name}");
                if depth == 1 {
                    if let Ok(h) = prefix.parse() {
                        if entry.path().join(MAP_FILE).exists() {
                            out.push(h);
                        }
                    }
                } else {
                    walk(&entry.path(), &prefix, depth - 1, out)?;
                }
            }
            Ok(())
        }
        let mut out = vec![];
        walk(&self.root, "", 7, &mut out)?;
        out.sort_unstable();
        Ok(out.into_iter().map(Height).collect())
    }

    fn remove_blocking(&self, height: Height) -> anyhow::Result<bool> {
        let dir = self.block_dir(height);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).with_context(|| format!("remove_dir_all({})", dir.display()))?;
        Ok(true)
    }

    fn remove_temp_blocking(&self, height: Height) -> anyhow::Result<()> {
        let prefix = format!("{}-", height.0);
        let temp = self.root.join(TEMP_DIR);
        for entry in fs::read_dir(&temp)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }

    fn path_of_url(&self, url: &str) -> anyhow::Result<PathBuf> {
        let path = PathBuf::from(
            url.strip_prefix(URL_SCHEME)
                .with_context(|| format!("unsupported url {url:?}"))?,
        );
        anyhow::ensure!(
            path.starts_with(&self.root) && !path.components().any(|c| c.as_os_str() == ".."),
            "url {url:?} points outside of the block-data root"
        );
        Ok(path)
    }
}

#[async_trait::async_trait]
impl BlockData for LocalFs {
    async fn new_session(
        &self,
        _ctx: &ctx::Ctx,
        height: Height,
    ) -> ctx::Result<Box<dyn BlockDataSession>> {
        let temp = scope::wait_blocking(|| {
            tempfile::Builder::new()
                .prefix(&format!("{}-", height.0))
                .tempdir_in(self.root.join(TEMP_DIR))
                .context("tempdir_in()")
        })
        .await?;
        Ok(Box::new(LocalFsSession {
            dest: self.block_dir(height),
            height,
            temp: Some(temp),
            written: BTreeMap::new(),
            operations: vec![],
            states: vec![],
            manifest: None,
        }))
    }

    async fn exists(&self, _ctx: &ctx::Ctx, height: Height) -> ctx::Result<bool> {
        let path = self.block_dir(height).join(MAP_FILE);
        Ok(scope::wait_blocking(|| path.exists()).await)
    }

    async fn remove(&self, _ctx: &ctx::Ctx, height: Height) -> ctx::Result<bool> {
        Ok(scope::wait_blocking(|| self.remove_blocking(height)).await?)
    }

    async fn remove_all(&self, _ctx: &ctx::Ctx, height: Height) -> ctx::Result<()> {
        scope::wait_blocking(|| {
            self.remove_blocking(height)?;
            self.remove_temp_blocking(height)
        })
        .await?;
        Ok(())
    }

    async fn clean(&self, _ctx: &ctx::Ctx, remove_root: bool) -> ctx::Result<()> {
        scope::wait_blocking(|| {
            if self.root.exists() {
                fs::remove_dir_all(&self.root).context("remove_dir_all()")?;
            }
            if !remove_root {
                fs::create_dir_all(self.root.join(TEMP_DIR)).context("create_dir_all()")?;
            }
            anyhow::Ok(())
        })
        .await?;
        Ok(())
    }

    async fn clean_by_height(&self, _ctx: &ctx::Ctx, height: Height) -> ctx::Result<()> {
        scope::wait_blocking(|| {
            for h in self.stored_heights_blocking()? {
                if h >= height {
                    self.remove_blocking(h)?;
                }
            }
            anyhow::Ok(())
        })
        .await?;
        Ok(())
    }

    async fn map(&self, _ctx: &ctx::Ctx, height: Height) -> ctx::Result<Option<BlockDataMap>> {
        let path = self.block_dir(height).join(MAP_FILE);
        Ok(scope::wait_blocking(|| {
            if !path.exists() {
                return Ok(None);
            }
            let raw = fs::read(&path).with_context(|| format!("read({})", path.display()))?;
            serde_json::from_slice(&raw).context("serde_json::from_slice()")
        })
        .await?)
    }

    async fn read(&self, _ctx: &ctx::Ctx, url: &str) -> ctx::Result<Vec<u8>> {
        let path = self.path_of_url(url)?;
        Ok(scope::wait_blocking(|| {
            fs::read(&path).with_context(|| format!("read({})", path.display()))
        })
        .await?)
    }
}

/// Session of [`LocalFs`].
#[derive(Debug)]
pub struct LocalFsSession {
    dest: PathBuf,
    height: Height,
    /// `None` once saved or cancelled.
    temp: Option<tempfile::TempDir>,
    /// Checksums of the written datasets.
    written: BTreeMap<Dataset, String>,
    operations: Vec<Operation>,
    states: Vec<State>,
    manifest: Option<Manifest>,
}

impl LocalFsSession {
    fn temp(&self) -> anyhow::Result<&Path> {
        Ok(self
            .temp
            .as_ref()
            .context("block-data session is already closed")?
            .path())
    }

    async fn write_raw(&mut self, dataset: Dataset, stored: Vec<u8>) -> ctx::Result<()> {
        let path = self.temp()?.join(dataset_file(dataset));
        let sum = checksum(&stored);
        scope::wait_blocking(|| {
            fs::write(&path, &stored).with_context(|| format!("write({})", path.display()))
        })
        .await?;
        METRICS.block_data_bytes.inc_by(stored.len() as u64);
        self.written.insert(dataset, sum);
        Ok(())
    }

    async fn write<T: Serialize + Sync + ?Sized>(
        &mut self,
        dataset: Dataset,
        v: &T,
    ) -> ctx::Result<()> {
        self.write_raw(dataset, encode(v)?).await
    }

    fn map(&self) -> anyhow::Result<BlockDataMap> {
        let manifest = self.manifest.as_ref().context("manifest was not written")?;
        let mut items = BTreeMap::new();
        for d in Dataset::ALL {
            let sum = self
                .written
                .get(&d)
                .with_context(|| format!("dataset {d} was not written"))?;
            items.insert(
                d,
                BlockDataItem {
                    url: format!("{URL_SCHEME}{}", self.dest.join(dataset_file(d)).display()),
                    checksum: sum.clone(),
                },
            );
        }
        Ok(BlockDataMap {
            height: self.height,
            block: manifest.hash.clone(),
            items,
        })
    }
}

#[async_trait::async_trait]
impl BlockDataSession for LocalFsSession {
    fn height(&self) -> Height {
        self.height
    }

    async fn set_manifest(&mut self, _ctx: &ctx::Ctx, manifest: &Manifest) -> ctx::Result<()> {
        if manifest.height != self.height {
            return Err(anyhow::format_err!(
                "manifest height {} does not match session height {}",
                manifest.height,
                self.height
            )
            .into());
        }
        self.write(Dataset::Manifest, manifest).await?;
        self.manifest = Some(manifest.clone());
        Ok(())
    }

    async fn add_operations(&mut self, _ctx: &ctx::Ctx, ops: &[Operation]) -> ctx::Result<()> {
        self.operations.extend_from_slice(ops);
        Ok(())
    }

    async fn close_operations(&mut self, _ctx: &ctx::Ctx) -> ctx::Result<()> {
        let ops = std::mem::take(&mut self.operations);
        self.write(Dataset::Operations, &ops).await
    }

    async fn set_operations_tree(&mut self, _ctx: &ctx::Ctx, tree: &FixedTree) -> ctx::Result<()> {
        self.write(Dataset::OperationsTree, tree).await
    }

    async fn add_states(&mut self, _ctx: &ctx::Ctx, states: &[State]) -> ctx::Result<()> {
        self.states.extend_from_slice(states);
        Ok(())
    }

    async fn close_states(&mut self, _ctx: &ctx::Ctx) -> ctx::Result<()> {
        let states = std::mem::take(&mut self.states);
        self.write(Dataset::States, &states).await
    }

    async fn set_states_tree(&mut self, _ctx: &ctx::Ctx, tree: &FixedTree) -> ctx::Result<()> {
        self.write(Dataset::StatesTree, tree).await
    }

    async fn set_init_voteproof(&mut self, _ctx: &ctx::Ctx, vp: &Voteproof) -> ctx::Result<()> {
        self.write(Dataset::InitVoteproof, vp).await
    }

    async fn set_accept_voteproof(
        &mut self,
        _ctx: &ctx::Ctx,
        vp: &Voteproof,
    ) -> ctx::Result<()> {
        self.write(Dataset::AcceptVoteproof, vp).await
    }

    async fn set_suffrage_info(
        &mut self,
        _ctx: &ctx::Ctx,
        info: &SuffrageInfo,
    ) -> ctx::Result<()> {
        self.write(Dataset::SuffrageInfo, info).await
    }

    async fn set_proposal(&mut self, _ctx: &ctx::Ctx, proposal: &Ballot) -> ctx::Result<()> {
        self.write(Dataset::Proposal, proposal).await
    }

    async fn import(&mut self, ctx: &ctx::Ctx, dataset: Dataset, raw: &[u8]) -> ctx::Result<()> {
        if dataset == Dataset::Manifest {
            let manifest: Manifest = decode(raw)?;
            return self.set_manifest(ctx, &manifest).await;
        }
        // Reject undecodable input early rather than at read time.
        zstd::decode_all(raw).context("zstd::decode_all()")?;
        self.write_raw(dataset, raw.to_vec()).await
    }

    async fn done(&mut self, _ctx: &ctx::Ctx) -> ctx::Result<BlockDataMap> {
        Ok(self.map()?)
    }

    async fn save(&mut self, ctx: &ctx::Ctx) -> ctx::Result<BlockDataMap> {
        let map = self.done(ctx).await?;
        let temp = self.temp()?.to_path_buf();
        let map_json = serde_json::to_vec_pretty(&map).context("serde_json::to_vec_pretty()")?;
        scope::wait_blocking(|| {
            fs::write(temp.join(MAP_FILE), &map_json).context("write(map)")?;
            if self.dest.exists() {
                fs::remove_dir_all(&self.dest).context("remove_dir_all(dest)")?;
            }
            if let Some(parent) = self.dest.parent() {
                fs::create_dir_all(parent).context("create_dir_all(parent)")?;
            }
            fs::rename(&temp, &self.dest).context("rename()")
        })
        .await?;
        // The directory was moved away; dropping the handle only attempts a removal.
        self.temp = None;
        METRICS.block_data_saved.inc();
        tracing::debug!(height = %self.height, "ISAAC block-data - session saved");
        Ok(map)
    }

    fn cancel(&mut self) {
        self.temp = None;
        self.operations.clear();
        self.states.clear();
        self.written.clear();
    }
}
