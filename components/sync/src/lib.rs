//! Catch-up synchronization of an ISAAC node.
//!
//! A [`GeneralSyncer`] fetches and validates the blocks of a height range from
//! a set of source nodes and commits them into local storage. [`Syncers`]
//! chains syncers over the ranges requested while the node is behind.

mod metrics;
mod rollback;
mod syncer;
mod syncers;
pub mod testonly;
#[cfg(test)]
mod tests;

pub use syncer::{GeneralSyncer, SyncerConfig, SyncerState};
pub use syncers::{SyncEvent, Syncers};

use isaac_roles::messages::Height;
use zksync_concurrency::{ctx, error::Wrap};

/// Error returned by syncers.
#[derive(Debug, thiserror::Error)]
pub enum SyncerError {
    /// Source nodes did not agree on a manifest.
    #[error("no threshold agreement on the manifest at {height}")]
    Threshold {
        /// Height of the manifest.
        height: Height,
    },
    /// A source returned an invalid item and no other source had a valid one.
    #[error("invalid data at {height}: {reason}")]
    Integrity {
        /// Height of the item.
        height: Height,
        /// What was wrong.
        reason: String,
    },
    /// Local chain diverges from the sources and cannot be rolled back.
    #[error("unrecoverable fork at {height}")]
    Fork {
        /// Lowest height known to diverge.
        height: Height,
    },
    /// No source nodes left to fetch from.
    #[error("no source nodes")]
    NoSource,
    /// Requested range is empty.
    #[error("invalid range [{from}, {to}]")]
    InvalidRange {
        /// First height.
        from: Height,
        /// Last height.
        to: Height,
    },
    /// Internal error.
    #[error(transparent)]
    Internal(#[from] ctx::Error),
}

impl Wrap for SyncerError {
    fn with_wrap<C: std::fmt::Display + Send + Sync + 'static, F: FnOnce() -> C>(
        self,
        f: F,
    ) -> Self {
        match self {
            SyncerError::Internal(err) => SyncerError::Internal(err.with_wrap(f)),
            err => err,
        }
    }
}

impl From<ctx::Canceled> for SyncerError {
    fn from(err: ctx::Canceled) -> Self {
        Self::Internal(err.into())
    }
}

impl From<anyhow::Error> for SyncerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.into())
    }
}
