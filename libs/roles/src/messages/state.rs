//! State key-values written by operations.
use super::{Hash, Height};
use serde::{Deserialize, Serialize};
use zksync_concurrency::time;

/// Value of a state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StateValue {
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Integer.
    Number(i64),
    /// UTF-8 string.
    String(String),
    /// Duration.
    Duration(#[serde(with = "crate::serde_ms")] time::Duration),
    /// Structured value.
    Hinted(serde_json::Value),
    /// List of values.
    Slice(Vec<StateValue>),
}

/// A state key-value together with its position in the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Key.
    pub key: String,
    /// Value; `None` for a key never written.
    pub value: Option<StateValue>,
    /// Height of the block which last wrote the state.
    pub height: Height,
    /// Height of the block which wrote the previous value.
    pub previous_height: Height,
    /// Operations which touched the state in `height`.
    pub operations: Vec<Hash>,
    /// Hash of the block at `height`; not covered by `hash`, since the
    /// block hash itself commits to the state hash.
    pub block_hash: Option<Hash>,
    /// Content hash.
    pub hash: Hash,
}

#[derive(Serialize)]
struct StateBody<'a> {
    key: &'a str,
    value: &'a Option<StateValue>,
    height: Height,
    previous_height: Height,
    operations: &'a [Hash],
}

impl State {
    /// Zero-valued state for a key never written.
    pub fn empty(key: impl Into<String>) -> Self {
        let mut s = Self {
            key: key.into(),
            value: None,
            height: Height::PRE_GENESIS,
            previous_height: Height::PRE_GENESIS,
            operations: vec![],
            block_hash: None,
            hash: Hash::default(),
        };
        s.hash = s.compute_hash();
        s
    }

    /// Computes the content hash.
    pub fn compute_hash(&self) -> Hash {
        Hash::of(&StateBody {
            key: &self.key,
            value: &self.value,
            height: self.height,
            previous_height: self.previous_height,
            operations: &self.operations,
        })
    }

    /// Returns a copy of this state with a new value, to be written at `height`
    /// by operation `op`. The hash is recomputed when the state is stamped.
    pub fn with_value(&self, value: StateValue, op: Hash) -> Self {
        let mut s = self.clone();
        s.value = Some(value);
        if !s.operations.contains(&op) {
            s.operations.push(op);
        }
        s
    }

    /// Places the state at `height` and recomputes its hash.
    /// `previous` is the committed version of the same key.
    pub fn stamp(&mut self, height: Height, previous: &State) {
        self.height = height;
        self.previous_height = previous.height;
        self.block_hash = None;
        self.hash = self.compute_hash();
    }

    /// Checks the content hash.
    pub fn verify(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.compute_hash() == self.hash,
            "state {:?}: hash mismatch",
            self.key
        );
        Ok(())
    }
}
