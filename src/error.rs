// src/error.rs
//! Error taxonomy shared by the harvest core.
//!
//! Fetch failures and validation rejections are *values* that flow through
//! the scheduler and the run summary. Only [`StoreError`] is allowed to abort
//! a run, because continuing without durable state risks silent data loss.

use std::path::PathBuf;

/// Persistence failure on the outcome store or the merge store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encoding row for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("decoding {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("persisting temp file into {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Run-level failure surfaced by the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("no sources requested")]
    NoSources,
}
