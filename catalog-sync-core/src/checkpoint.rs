//! Resumable progress: a contiguous low-watermark over input offsets, and a
//! small checkpoint file written atomically (temp file + rename).
//!
//! Workers finish operations out of order, so the persisted offset is the
//! highest one such that every offset at or below it has a terminal result.
//! After a crash at most the operations past that offset are reprocessed.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::contract::OperationKey;
use crate::error::CheckpointError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence: u64,
    /// Every input offset at or below this one is done.
    pub offset: u64,
    pub key: Option<OperationKey>,
    pub input: Option<PathBuf>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Progress {
    /// Lowest offset that is not yet complete.
    next: u64,
    done: BTreeMap<u64, Option<OperationKey>>,
    last_key: Option<OperationKey>,
}

impl Progress {
    fn drain(&mut self) {
        while let Some(entry) = self.done.first_entry() {
            if *entry.key() != self.next {
                break;
            }
            if let Some(key) = entry.remove() {
                self.last_key = Some(key);
            }
            self.next += 1;
        }
    }
}

/// Tracks which offsets have a terminal outcome.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    inner: Mutex<Progress>,
}

impl ProgressTracker {
    /// Starts tracking with every offset below `next` already complete.
    pub fn starting_at(next: u64) -> Self {
        Self {
            inner: Mutex::new(Progress {
                next,
                ..Progress::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn complete(&self, offset: u64, key: Option<OperationKey>) {
        let mut progress = self.lock();
        if offset < progress.next {
            return;
        }
        progress.done.insert(offset, key);
        progress.drain();
    }

    /// Marks offsets that will never reach a worker (unparsable, dropped).
    pub fn complete_range(&self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        let mut progress = self.lock();
        if range.start <= progress.next {
            progress.next = progress.next.max(range.end);
            let next = progress.next;
            progress.done.retain(|&o, _| o >= next);
        } else {
            for offset in range {
                progress.done.insert(offset, None);
            }
        }
        progress.drain();
    }

    /// Highest offset with everything at or below it complete.
    pub fn watermark(&self) -> Option<(u64, Option<OperationKey>)> {
        let progress = self.lock();
        progress
            .next
            .checked_sub(1)
            .map(|offset| (offset, progress.last_key.clone()))
    }

    /// Completed offsets still waiting on an earlier one.
    pub fn pending(&self) -> usize {
        self.lock().done.len()
    }
}

/// Loads and persists the checkpoint file. Only one task may own it.
#[derive(Debug)]
pub struct CheckpointManager {
    path: PathBuf,
    input: Option<PathBuf>,
    sequence: u64,
    last: Option<Checkpoint>,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>, input: Option<PathBuf>) -> Self {
        Self {
            path: path.into(),
            input,
            sequence: 0,
            last: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last(&self) -> Option<&Checkpoint> {
        self.last.as_ref()
    }

    /// Reads the checkpoint file if there is one. A checkpoint recorded for a
    /// different input is ignored, but its sequence number is carried on.
    pub fn load(&mut self) -> Result<Option<Checkpoint>, CheckpointError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No checkpoint found; starting from the beginning");
                return Ok(None);
            }
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let checkpoint: Checkpoint =
            serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Corrupt {
                path: self.path.clone(),
                source,
            })?;

        if self.input.is_some() && checkpoint.input.is_some() && checkpoint.input != self.input {
            warn!(
                path = %self.path.display(),
                recorded = ?checkpoint.input,
                current = ?self.input,
                "Checkpoint belongs to a different input; ignoring it"
            );
            self.sequence = checkpoint.sequence;
            return Ok(None);
        }

        info!(
            path = %self.path.display(),
            offset = checkpoint.offset,
            sequence = checkpoint.sequence,
            "Resuming from checkpoint"
        );
        self.sequence = checkpoint.sequence;
        self.last = Some(checkpoint.clone());
        Ok(Some(checkpoint))
    }

    /// Persists `offset` if it is past the last saved one. Returns the new
    /// checkpoint, or `None` when nothing advanced.
    pub fn save(
        &mut self,
        offset: u64,
        key: Option<OperationKey>,
    ) -> Result<Option<&Checkpoint>, CheckpointError> {
        if self.last.as_ref().is_some_and(|last| offset <= last.offset) {
            return Ok(None);
        }

        let sequence = self.sequence + 1;
        let checkpoint = Checkpoint {
            sequence,
            offset,
            key,
            input: self.input.clone(),
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&checkpoint).map_err(|source| CheckpointError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &bytes).map_err(|source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), offset, sequence, "Checkpoint written");
        self.sequence = sequence;
        self.last = Some(checkpoint);
        Ok(self.last.as_ref())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
