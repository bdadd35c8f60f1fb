//! Operation processors: how operations of a proposal change the states.
use crate::state_pool::StatePool;
use isaac_roles::{
    messages::{Operation, StateValue},
    policy::{LocalPolicy, PolicyUpdate, POLICY_STATE_KEY},
};
use serde::Deserialize;
use std::{collections::BTreeMap, fmt, sync::Arc};
use zksync_concurrency::{ctx, error::Wrap};

/// Kind of the operations writing a single state.
pub const KV_SET: &str = "kv-set";
/// Kind of the operations overriding the network-wide policy.
pub const POLICY_UPDATE: &str = "policy-update";

/// Error returned by [`OperationProcessor::process`].
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The operation is skipped; the block is built without it.
    #[error("ignored: {0}")]
    Ignore(String),
    /// Internal error; the proposal cannot be processed.
    #[error(transparent)]
    Internal(#[from] ctx::Error),
}

impl Wrap for ProcessError {
    fn with_wrap<C: fmt::Display + Send + Sync + 'static, F: FnOnce() -> C>(
        self,
        f: F,
    ) -> Self {
        match self {
            ProcessError::Internal(err) => ProcessError::Internal(err.with_wrap(f)),
            err => err,
        }
    }
}

impl ProcessError {
    fn ignore(reason: impl fmt::Display) -> Self {
        Self::Ignore(reason.to_string())
    }
}

/// Applies operations of one kind.
#[async_trait::async_trait]
pub trait OperationProcessor: 'static + fmt::Debug + Send + Sync {
    /// Kind of the operations handled.
    fn kind(&self) -> &'static str;
    /// Applies `op` to the states in `pool`.
    async fn process(
        &self,
        ctx: &ctx::Ctx,
        op: &Operation,
        pool: &mut StatePool,
    ) -> Result<(), ProcessError>;
}

/// Registry of processors by operation kind.
#[derive(Debug, Default)]
pub struct OperationProcessors(BTreeMap<&'static str, Arc<dyn OperationProcessor>>);

impl OperationProcessors {
    /// Registry with the built-in processors.
    pub fn new(policy: Arc<LocalPolicy>) -> Self {
        let mut this = Self::default();
        this.register(Arc::new(KvSet));
        this.register(Arc::new(PolicyUpdater { policy }));
        this
    }

    /// Registers a processor, replacing the one of the same kind.
    pub fn register(&mut self, p: Arc<dyn OperationProcessor>) {
        self.0.insert(p.kind(), p);
    }

    /// Applies `op` with the processor of its kind.
    /// Operations of unknown kinds are ignored.
    pub async fn process(
        &self,
        ctx: &ctx::Ctx,
        op: &Operation,
        pool: &mut StatePool,
    ) -> Result<(), ProcessError> {
        let Some(p) = self.0.get(op.fact.kind.as_str()) else {
            return Err(ProcessError::ignore(format_args!(
                "unknown operation kind {:?}",
                op.fact.kind
            )));
        };
        p.process(ctx, op, pool).await
    }
}

/// Body of a `kv-set` operation.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct KvSetBody {
    key: String,
    value: StateValue,
}

/// Writes one state.
#[derive(Debug)]
struct KvSet;

#[async_trait::async_trait]
impl OperationProcessor for KvSet {
    fn kind(&self) -> &'static str {
        KV_SET
    }

    async fn process(
        &self,
        ctx: &ctx::Ctx,
        op: &Operation,
        pool: &mut StatePool,
    ) -> Result<(), ProcessError> {
        let body: KvSetBody =
            serde_json::from_value(op.fact.body.clone()).map_err(ProcessError::ignore)?;
        if body.key.is_empty() || body.key == POLICY_STATE_KEY {
            return Err(ProcessError::ignore(format_args!(
                "reserved key {:?}",
                body.key
            )));
        }
        let state = pool.get(ctx, &body.key).await.wrap("pool.get()")?;
        pool.set(ctx, state.with_value(body.value, op.hash))
            .await
            .wrap("pool.set()")?;
        Ok(())
    }
}

/// Merges policy overrides into the `policy` state.
#[derive(Debug)]
struct PolicyUpdater {
    policy: Arc<LocalPolicy>,
}

#[async_trait::async_trait]
impl OperationProcessor for PolicyUpdater {
    fn kind(&self) -> &'static str {
        POLICY_UPDATE
    }

    async fn process(
        &self,
        ctx: &ctx::Ctx,
        op: &Operation,
        pool: &mut StatePool,
    ) -> Result<(), ProcessError> {
        let serde_json::Value::Object(update) = &op.fact.body else {
            return Err(ProcessError::ignore("policy update is not an object"));
        };
        let state = pool
            .get(ctx, POLICY_STATE_KEY)
            .await
            .wrap("pool.get()")?;
        let mut merged = match &state.value {
            Some(StateValue::Hinted(serde_json::Value::Object(m))) => m.clone(),
            None => serde_json::Map::new(),
            Some(v) => {
                // Committed states are produced by this processor only.
                return Err(ctx::Error::Internal(anyhow::format_err!(
                    "policy state has unexpected value {v:?}"
                ))
                .into());
            }
        };
        for (k, v) in update {
            if !v.is_null() {
                merged.insert(k.clone(), v.clone());
            }
        }
        let merged = serde_json::Value::Object(merged);
        let parsed: PolicyUpdate =
            serde_json::from_value(merged.clone()).map_err(ProcessError::ignore)?;
        let mut next = self.policy.snapshot();
        parsed.apply(&mut next);
        next.verify().map_err(|err| ProcessError::ignore(format_args!("{err:#}")))?;
        pool.set(ctx, state.with_value(StateValue::Hinted(merged), op.hash))
            .await
            .wrap("pool.set()")?;
        Ok(())
    }
}
