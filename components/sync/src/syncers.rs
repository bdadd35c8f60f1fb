//! Coordinator chaining syncers over the requested ranges.
use crate::{metrics::METRICS, GeneralSyncer, SyncerConfig, SyncerError};
use isaac_network::RemoteNode;
use isaac_roles::{
    messages::{Height, Manifest},
    node::Keyring,
    policy::{LocalPolicy, POLICY_STATE_KEY},
};
use isaac_storage::{BlockData, Database};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use zksync_concurrency::{ctx, error::Wrap as _, scope, sync, time};

/// Delay before retrying a failed sync.
const RETRY_DELAY: time::Duration = time::Duration::seconds(1);

/// Notification emitted by [`Syncers::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Local chain reached the requested height.
    Finished(Height),
    /// A sync attempt failed; it will be retried.
    Failed(String),
}

#[derive(Debug, Clone)]
struct Request {
    to: Height,
    sources: Vec<RemoteNode>,
}

/// Catches the local chain up with the highest requested height.
///
/// Every attempt splits the missing range into syncers of at most
/// `limit_blocks_per_syncer` blocks. A syncer prepares while its predecessor
/// saves; it starts saving only once its predecessor has saved.
#[derive(Debug)]
pub struct Syncers {
    db: Arc<dyn Database>,
    block_data: Arc<dyn BlockData>,
    policy: Arc<LocalPolicy>,
    keys: Keyring,
    target: sync::watch::Sender<Option<Request>>,
    synced: sync::watch::Sender<Option<Manifest>>,
    events: ctx::channel::UnboundedSender<SyncEvent>,
    next_id: AtomicU64,
}

impl Syncers {
    /// Constructs a coordinator reporting to `events`. Fetched blocks must be
    /// voted by the nodes of `keys`.
    pub fn new(
        db: Arc<dyn Database>,
        block_data: Arc<dyn BlockData>,
        policy: Arc<LocalPolicy>,
        keys: Keyring,
        events: ctx::channel::UnboundedSender<SyncEvent>,
    ) -> Self {
        Self {
            db,
            block_data,
            policy,
            keys,
            target: sync::watch::channel(None).0,
            synced: sync::watch::channel(None).0,
            events,
            next_id: AtomicU64::new(0),
        }
    }

    /// Requests the blocks up to `to` from `sources`.
    /// Returns false if an equal or higher target is already requested.
    pub fn add(&self, to: Height, sources: Vec<RemoteNode>) -> bool {
        let added = self.target.send_if_modified(|t| match t {
            Some(r) if r.to >= to => false,
            _ => {
                *t = Some(Request { to, sources });
                true
            }
        });
        if added {
            METRICS.target_height.set(to.0);
            tracing::debug!(%to, "ISAAC syncers - new target");
        }
        added
    }

    /// Highest requested height.
    pub fn target(&self) -> Option<Height> {
        self.target.borrow().as_ref().map(|r| r.to)
    }

    /// Last manifest the coordinator has committed or found locally.
    pub fn subscribe(&self) -> sync::watch::Receiver<Option<Manifest>> {
        self.synced.subscribe()
    }

    /// Whether the requested target has been reached.
    pub fn is_finished(&self) -> bool {
        let Some(target) = self.target() else {
            return true;
        };
        self.synced
            .borrow()
            .as_ref()
            .is_some_and(|m| m.height >= target)
    }

    /// Runs the coordinator until `ctx` is canceled.
    pub async fn run(&self, ctx: &ctx::Ctx) -> anyhow::Result<()> {
        match self.run_inner(ctx).await {
            Ok(()) | Err(ctx::Error::Canceled(_)) => Ok(()),
            Err(ctx::Error::Internal(err)) => Err(err),
        }
    }

    async fn run_inner(&self, ctx: &ctx::Ctx) -> ctx::Result<()> {
        let mut target = self.target.subscribe();
        loop {
            let base = self
                .db
                .last_manifest(ctx)
                .await
                .wrap("db.last_manifest()")?;
            self.synced.send_replace(base.clone());
            let local = base
                .as_ref()
                .map_or(Height::PRE_GENESIS.prev(), |m| m.height);
            let req = sync::wait_for_some(ctx, &mut target, |t| {
                t.as_ref().filter(|r| r.to > local).cloned()
            })
            .await?;
            match self.sync(ctx, base, &req).await {
                Ok(last) => {
                    self.synced.send_replace(Some(last.clone()));
                    if self.target().is_some_and(|t| t > last.height) {
                        continue;
                    }
                    let policy = self
                        .db
                        .state(ctx, POLICY_STATE_KEY)
                        .await
                        .wrap("db.state()")?;
                    if self.policy.reload(policy.as_ref())? {
                        tracing::info!("ISAAC syncers - policy reloaded");
                    }
                    tracing::info!(height = %last.height, "ISAAC syncers - finished");
                    self.events.send(SyncEvent::Finished(last.height));
                }
                Err(SyncerError::Internal(ctx::Error::Canceled(err))) => return Err(err.into()),
                Err(err) => {
                    tracing::warn!(to = %req.to, "ISAAC syncers - sync failed: {err:#}");
                    self.events.send(SyncEvent::Failed(format!("{err:#}")));
                    ctx.sleep(RETRY_DELAY).await?;
                }
            }
        }
    }

    async fn sync(
        &self,
        ctx: &ctx::Ctx,
        base: Option<Manifest>,
        req: &Request,
    ) -> Result<Manifest, SyncerError> {
        let policy = self.policy.snapshot();
        let cfg = SyncerConfig::new(&policy, self.keys.clone());
        let from = base
            .as_ref()
            .map_or(Height::PRE_GENESIS, |m| m.height.next());
        let ranges = split_range(from, req.to, policy.limit_blocks_per_syncer);
        scope::run!(ctx, |ctx, s| async {
            let mut base = base;
            let mut saving: Option<scope::JoinHandle<'_, Manifest>> = None;
            for (from, to) in ranges {
                let mut syncer = GeneralSyncer::new(
                    self.next_id.fetch_add(1, Ordering::Relaxed),
                    from,
                    to,
                    base.clone(),
                    req.sources.clone(),
                    self.db.clone(),
                    self.block_data.clone(),
                    cfg.clone(),
                )?;
                syncer.prepare(ctx).await?;
                base = syncer.last_manifest().cloned();
                if let Some(prev) = saving.take() {
                    prev.join(ctx).await?;
                }
                saving = Some(s.spawn(async move { syncer.save(ctx).await }));
            }
            let Some(last) = saving else {
                return Err(SyncerError::InvalidRange { from, to: req.to });
            };
            Ok(last.join(ctx).await?)
        })
        .await
    }
}

/// Splits `[from, to]` into consecutive ranges of at most `limit` heights.
fn split_range(from: Height, to: Height, limit: u64) -> Vec<(Height, Height)> {
    let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
    let mut ranges = vec![];
    let mut start = from.0;
    while start <= to.0 {
        let end = start.saturating_add(limit - 1).min(to.0);
        ranges.push((Height(start), Height(end)));
        start = end + 1;
    }
    ranges
}
