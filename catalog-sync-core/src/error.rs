use std::path::PathBuf;

use thiserror::Error;

/// Invalid run-level configuration. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid engine setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("`keep` and `drop` field sets are mutually exclusive")]
    KeepAndDrop,
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to open input {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("input was declared as a JSON array but does not start with `[`")]
    NotAnArray,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint {path:?} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report artifact {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialise report entry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("result spool stopped after an earlier write error")]
    SpoolStopped,
}

/// Errors that stop a whole run. Per-item failures never surface here.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to open remote session for worker {worker_id}: {source}")]
    Session {
        worker_id: usize,
        #[source]
        source: crate::contract::SessionError,
    },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("worker task panicked: {0}")]
    Worker(String),
}

impl SyncError {
    /// True when the run could not start at all.
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            SyncError::Config(_)
                | SyncError::Session { .. }
                | SyncError::Source(SourceError::Open { .. })
                | SyncError::Source(SourceError::NotAnArray)
                | SyncError::Checkpoint(CheckpointError::Corrupt { .. })
        )
    }
}
