//! Test-only utilities.
use crate::{localfs::LocalFs, store_block, InMemoryDatabase};
use isaac_roles::messages::Block;
use std::sync::Arc;
use zksync_concurrency::ctx;

/// In-memory database with a block-data store in a temporary directory,
/// removed when the store is dropped.
#[derive(Debug, Clone)]
pub struct TestStore {
    /// Database.
    pub db: Arc<InMemoryDatabase>,
    /// Block-data store.
    pub block_data: Arc<LocalFs>,
    dir: Arc<tempfile::TempDir>,
}

impl TestStore {
    /// Constructs an empty store.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self {
            db: Arc::new(InMemoryDatabase::new()),
            block_data: Arc::new(LocalFs::open(dir.path()).unwrap()),
            dir: Arc::new(dir),
        }
    }

    /// Root directory of the block-data store.
    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Stores finalized blocks, in order.
    pub async fn put_blocks(&self, ctx: &ctx::Ctx, blocks: &[Block]) -> ctx::Result<()> {
        for b in blocks {
            store_block(ctx, &*self.db, &*self.block_data, b).await?;
        }
        Ok(())
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}
