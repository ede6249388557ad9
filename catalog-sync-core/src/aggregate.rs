//! Thread-safe collection of terminal item results.
//!
//! Counters are atomics; the per-item results live behind one mutex, either
//! in memory or streamed straight to NDJSON files for runs too large to
//! hold.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::error;

use crate::error::ReportError;
use crate::report::{export_entry, FAILED_FILE, SKIPPED_FILE, SUCCEEDED_FILE};
use crate::result::{ItemOutcome, ItemResult, RunStats};

/// In-memory results, partitioned by outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Buckets {
    pub succeeded: Vec<ItemResult>,
    pub failed: Vec<ItemResult>,
    pub skipped: Vec<ItemResult>,
}

impl Buckets {
    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &ItemResult> {
        self.succeeded
            .iter()
            .chain(self.failed.iter())
            .chain(self.skipped.iter())
    }
}

struct Spool {
    succeeded: BufWriter<File>,
    failed: BufWriter<File>,
    skipped: BufWriter<File>,
    first_error: Option<ReportError>,
    broken: bool,
}

impl Spool {
    /// Truncates the files for a fresh run; `append` keeps what an earlier,
    /// checkpointed run already wrote.
    fn open(dir: &Path, append: bool) -> Result<Self, ReportError> {
        let open = |name: &str| -> Result<BufWriter<File>, ReportError> {
            let path = dir.join(name);
            let file = if append {
                OpenOptions::new().create(true).append(true).open(&path)
            } else {
                File::create(&path)
            };
            file.map(BufWriter::new)
                .map_err(|source| ReportError::Io { path, source })
        };
        fs::create_dir_all(dir).map_err(|source| ReportError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            succeeded: open(SUCCEEDED_FILE)?,
            failed: open(FAILED_FILE)?,
            skipped: open(SKIPPED_FILE)?,
            first_error: None,
            broken: false,
        })
    }

    fn append(&mut self, result: &ItemResult) {
        if self.broken || result.interrupted {
            return;
        }
        let writer = match result.outcome {
            ItemOutcome::Succeeded => &mut self.succeeded,
            ItemOutcome::Failed => &mut self.failed,
            ItemOutcome::Skipped => &mut self.skipped,
        };
        let written = serde_json::to_writer(&mut *writer, &export_entry(result))
            .map_err(ReportError::from)
            .and_then(|()| {
                writer.write_all(b"\n").map_err(|source| ReportError::Io {
                    path: PathBuf::from(outcome_file(result.outcome)),
                    source,
                })
            });
        if let Err(e) = written {
            error!(error = %e, "Failed to spool item result; further results are not spooled");
            self.first_error = Some(e);
            self.broken = true;
        }
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        if self.broken {
            return Err(self.first_error.take().unwrap_or(ReportError::SpoolStopped));
        }
        for (writer, name) in [
            (&mut self.succeeded, SUCCEEDED_FILE),
            (&mut self.failed, FAILED_FILE),
            (&mut self.skipped, SKIPPED_FILE),
        ] {
            writer.flush().map_err(|source| ReportError::Io {
                path: PathBuf::from(name),
                source,
            })?;
        }
        Ok(())
    }
}

fn outcome_file(outcome: ItemOutcome) -> &'static str {
    match outcome {
        ItemOutcome::Succeeded => SUCCEEDED_FILE,
        ItemOutcome::Failed => FAILED_FILE,
        ItemOutcome::Skipped => SKIPPED_FILE,
    }
}

enum Store {
    Memory(Buckets),
    Spool(Spool),
}

pub struct ResultAggregator {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    retried: AtomicU64,
    remote_calls: AtomicU64,
    cancelled: AtomicBool,
    started_at: DateTime<Utc>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    store: Mutex<Store>,
}

impl ResultAggregator {
    fn with_store(store: Store) -> Self {
        Self {
            attempted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            remote_calls: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            started_at: Utc::now(),
            finished_at: Mutex::new(None),
            store: Mutex::new(store),
        }
    }

    pub fn in_memory() -> Self {
        Self::with_store(Store::Memory(Buckets::default()))
    }

    /// Streams results to `succeeded.ndjson`, `failed.ndjson` and
    /// `skipped.ndjson` under `dir` as they are recorded. A resumed run
    /// passes `append` so earlier lines survive.
    pub fn spooled(dir: &Path, append: bool) -> Result<Self, ReportError> {
        Ok(Self::with_store(Store::Spool(Spool::open(dir, append)?)))
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_spooled(&self) -> bool {
        matches!(*self.store(), Store::Spool(_))
    }

    /// Records one terminal result. Safe to call from any worker.
    pub fn record(&self, result: ItemResult) {
        let counter = match result.outcome {
            ItemOutcome::Succeeded => &self.succeeded,
            ItemOutcome::Failed => &self.failed,
            ItemOutcome::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.attempted.fetch_add(1, Ordering::Relaxed);
        self.remote_calls
            .fetch_add(u64::from(result.attempts), Ordering::Relaxed);
        if result.retry_count > 0 {
            self.retried.fetch_add(1, Ordering::Relaxed);
        }

        match &mut *self.store() {
            Store::Memory(buckets) => match result.outcome {
                ItemOutcome::Succeeded => buckets.succeeded.push(result),
                ItemOutcome::Failed => buckets.failed.push(result),
                ItemOutcome::Skipped => buckets.skipped.push(result),
            },
            Store::Spool(spool) => spool.append(&result),
        }
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Stamps the end of the run. Later calls keep the first timestamp.
    pub fn finish(&self) {
        let mut finished = self
            .finished_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        finished.get_or_insert_with(Utc::now);
    }

    pub fn stats(&self) -> RunStats {
        RunStats {
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            remote_calls: self.remote_calls.load(Ordering::Relaxed),
            started_at: Some(self.started_at),
            finished_at: *self
                .finished_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Runs `f` over the in-memory results. `None` when spooling.
    pub fn with_results<T>(&self, f: impl FnOnce(&Buckets) -> T) -> Option<T> {
        match &*self.store() {
            Store::Memory(buckets) => Some(f(buckets)),
            Store::Spool(_) => None,
        }
    }

    /// Moves the in-memory results out, leaving the store empty.
    pub fn take_results(&self) -> Option<Buckets> {
        match &mut *self.store() {
            Store::Memory(buckets) => Some(std::mem::take(buckets)),
            Store::Spool(_) => None,
        }
    }

    /// Flushes spooled files; a no-op for in-memory results. Once a write
    /// has failed every later flush fails too.
    pub fn flush(&self) -> Result<(), ReportError> {
        match &mut *self.store() {
            Store::Memory(_) => Ok(()),
            Store::Spool(spool) => spool.flush(),
        }
    }
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::in_memory()
    }
}
