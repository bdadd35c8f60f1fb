//! Read-through write buffer over the committed states, used while preparing one block.
use isaac_roles::messages::{Height, Operation, State};
use isaac_storage::Database;
use std::{collections::BTreeMap, sync::Arc};
use zksync_concurrency::{ctx, error::Wrap as _};

/// States read and written while applying the operations of one proposal.
///
/// Nothing written here is visible to anyone else until the block is committed.
#[derive(Debug)]
pub struct StatePool {
    db: Arc<dyn Database>,
    /// Committed versions of the keys read so far.
    committed: BTreeMap<String, State>,
    updated: BTreeMap<String, State>,
    added_operations: Vec<Operation>,
}

impl StatePool {
    /// Constructs an empty pool over `db`.
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            committed: BTreeMap::new(),
            updated: BTreeMap::new(),
            added_operations: vec![],
        }
    }

    /// Buffered write of `key` if any, else its committed state, else an empty state.
    pub async fn get(&mut self, ctx: &ctx::Ctx, key: &str) -> ctx::Result<State> {
        if let Some(s) = self.updated.get(key) {
            return Ok(s.clone());
        }
        Ok(self.committed(ctx, key).await?.clone())
    }

    async fn committed(&mut self, ctx: &ctx::Ctx, key: &str) -> ctx::Result<&State> {
        if !self.committed.contains_key(key) {
            let s = self
                .db
                .state(ctx, key)
                .await
                .wrap("db.state()")?
                .map(|mut s| {
                    // Operations of the committing block are tracked per block.
                    s.operations.clear();
                    s
                })
                .unwrap_or_else(|| State::empty(key));
            self.committed.insert(key.to_owned(), s);
        }
        Ok(&self.committed[key])
    }

    /// Records a new version of a state obtained from [`StatePool::get`].
    /// Writing back the committed value cancels a previous write.
    pub async fn set(&mut self, ctx: &ctx::Ctx, state: State) -> ctx::Result<()> {
        let committed = self.committed(ctx, &state.key).await?;
        if committed.value == state.value {
            self.updated.remove(&state.key);
        } else {
            self.updated.insert(state.key.clone(), state);
        }
        Ok(())
    }

    /// Records an operation synthesized while applying the proposal.
    pub fn add_operation(&mut self, op: Operation) {
        self.added_operations.push(op);
    }

    /// Buffered writes, by key.
    pub fn updates(&self) -> Vec<State> {
        self.updated.values().cloned().collect()
    }

    /// Buffered writes placed at `height`, by key.
    pub fn stamped(&self, height: Height) -> Vec<State> {
        self.updated
            .values()
            .map(|s| {
                let mut s = s.clone();
                // Every updated key has been read before, so its committed version is cached.
                let prev = self
                    .committed
                    .get(&s.key)
                    .cloned()
                    .unwrap_or_else(|| State::empty(s.key.clone()));
                s.stamp(height, &prev);
                s
            })
            .collect()
    }

    /// Operations synthesized while applying the proposal.
    pub fn added_operations(&self) -> &[Operation] {
        &self.added_operations
    }

    /// Whether any state has been written.
    pub fn is_updated(&self) -> bool {
        !self.updated.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isaac_roles::messages::StateValue;
    use isaac_storage::InMemoryDatabase;
    use pretty_assertions::assert_eq;
    use rand::Rng as _;

    #[tokio::test]
    async fn test_read_through_and_noop_writes() {
        let ctx = &ctx::test_root(&ctx::RealClock);
        let rng = &mut ctx.rng();
        let db = Arc::new(InMemoryDatabase::new());
        let mut committed = State::empty("a").with_value(StateValue::Number(1), rng.gen());
        committed.stamp(Height(3), &State::empty("a"));
        db.new_state(ctx, &committed).await.unwrap();
        let mut pool = StatePool::new(db);

        let a = pool.get(ctx, "a").await.unwrap();
        assert_eq!(Some(StateValue::Number(1)), a.value);
        assert!(a.operations.is_empty());
        assert_eq!(State::empty("b"), pool.get(ctx, "b").await.unwrap());
        assert!(!pool.is_updated());

        let op = rng.gen();
        pool.set(ctx, a.with_value(StateValue::Number(2), op)).await.unwrap();
        assert!(pool.is_updated());
        assert_eq!(Some(StateValue::Number(2)), pool.get(ctx, "a").await.unwrap().value);

        let stamped = pool.stamped(Height(5));
        assert_eq!(1, stamped.len());
        assert_eq!(Height(5), stamped[0].height);
        assert_eq!(Height(3), stamped[0].previous_height);
        assert_eq!(vec![op], stamped[0].operations);
        stamped[0].verify().unwrap();

        // Restoring the committed value is a no-op write.
        let a = pool.get(ctx, "a").await.unwrap();
        pool.set(ctx, a.with_value(StateValue::Number(1), op)).await.unwrap();
        assert!(!pool.is_updated());
        assert!(pool.updates().is_empty());
    }
}
