//! Error types surfaced at the scope/pool boundary. Internal bookkeeping
//! (mappings, identity maps, locks, overlays) is built to never fail —
//! errors only originate from backend callbacks (transaction creation,
//! commit, rollback, restoration), which is why they all carry an
//! [`anyhow::Error`] as their source.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to begin a backend transaction for scope {scope:?}")]
    BeginTransaction {
        scope: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("restoration callback failed")]
    Restore(#[source] anyhow::Error),

    #[error("source flush hook failed")]
    Flush(#[source] anyhow::Error),

    #[error("backend rollback failed for scope {scope:?}")]
    Rollback {
        scope: String,
        #[source]
        source: anyhow::Error,
    },

    /// One or more backend transactions committed before another one
    /// failed. The already-committed scopes are not rolled back: this
    /// crate does not implement distributed two-phase commit, and the
    /// split-brain risk here is explicit rather than silently hidden.
    #[error("partial commit: {failed:?} failed after {committed:?} already committed")]
    PartialCommit {
        committed: Vec<String>,
        failed: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("pool write-set entry is not bound to any storage owned by this pool's scopes")]
    UnboundWriteSetEntry,
}

pub type CoreResult<T> = Result<T, CoreError>;
