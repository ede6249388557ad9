//! High-level pipeline: orchestrates read → validate → call → record for one run.
//!
//! This module wires every engine component for a single synchronisation run:
//!   - Loads the checkpoint (if configured) and resumes the source right after it
//!   - Reads records on a blocking thread, validates them and feeds a bounded queue
//!   - Drives the worker pool, which paces calls through the shared rate limiter
//!   - Persists the low watermark periodically from one checkpoint task
//!   - Writes exports and the summary once the pool has drained
//!
//! # Major Types
//! - [`SynchroniseConfig`]: input, engine settings and output location for a run
//! - [`SynchroniseReport`]: the run summary plus in-memory results for callers and tests
//!
//! # Error Handling
//! Per-item failures never become `Err`: they are recorded as `Failed` or
//! `Skipped` results. `Err` is reserved for conditions that stop the run,
//! see [`SyncError::is_fatal_config`].
//!
//! # Navigation
//! - Main entrypoint: [`synchronise`]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::{Buckets, ResultAggregator};
use crate::checkpoint::{Checkpoint, CheckpointManager, ProgressTracker};
use crate::config::EngineConfig;
use crate::contract::{Operation, SessionFactory};
use crate::error::{CheckpointError, ConfigError, SourceError, SyncError};
use crate::pool::{PoolContext, WorkerPool};
use crate::rate_limit::RateLimiter;
use crate::report::{ReportEmitter, RunSummary};
use crate::result::ItemResult;
use crate::retry::RetryPolicy;
use crate::source::{RecordSource, SourceOptions, SourceStats};
use crate::validate::Validator;

/// Where the records come from and how they become operations.
#[derive(Debug, Clone)]
pub struct InputSpec {
    pub path: PathBuf,
    pub options: SourceOptions,
    pub validator: Validator,
}

impl InputSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            options: SourceOptions::default(),
            validator: Validator::default(),
        }
    }
}

/// The top-level synchronise configuration.
#[derive(Debug, Clone)]
pub struct SynchroniseConfig {
    pub input: InputSpec,
    pub engine: EngineConfig,
    /// Directory for exports and the summary. Nothing is written when unset.
    pub output_dir: Option<PathBuf>,
    /// Stream results to disk as they arrive instead of holding them.
    pub spool: bool,
}

impl SynchroniseConfig {
    pub fn new(input: InputSpec, engine: EngineConfig) -> Self {
        Self {
            input,
            engine,
            output_dir: None,
            spool: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        if self.spool && self.output_dir.is_none() {
            return Err(ConfigError::invalid("output.spool", "requires an output directory"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct SynchroniseReport {
    pub run_id: Uuid,
    pub summary: RunSummary,
    /// Per-item results, unless they were spooled to disk.
    pub results: Option<Buckets>,
    pub checkpoint: Option<Checkpoint>,
}

/// Runs one synchronisation to completion or cancellation.
///
/// `cancel` stops the run cooperatively: in-flight calls finish, queued
/// operations stay unprocessed and the checkpoint covers only what completed.
pub async fn synchronise(
    config: &SynchroniseConfig,
    factory: &dyn SessionFactory,
    cancel: CancellationToken,
) -> Result<SynchroniseReport, SyncError> {
    config.validate()?;
    let engine = &config.engine;
    let run_id = Uuid::new_v4();
    info!(%run_id, input = %config.input.path.display(), "[SYNC] Starting synchronisation run");
    engine.trace_loaded();

    let mut checkpoints = engine
        .checkpoint_path
        .as_ref()
        .map(|path| CheckpointManager::new(path, Some(config.input.path.clone())));
    let resume_after = match checkpoints.as_mut() {
        Some(manager) => manager.load()?.map(|c| c.offset),
        None => None,
    };

    let options = SourceOptions {
        resume_after,
        ..config.input.options.clone()
    };
    let source = RecordSource::open(&config.input.path, options)?;

    let aggregator = Arc::new(match (&config.output_dir, config.spool) {
        (Some(dir), true) => ResultAggregator::spooled(dir, resume_after.is_some()).map_err(SyncError::from)?,
        _ => ResultAggregator::in_memory(),
    });
    let progress = Arc::new(ProgressTracker::starting_at(resume_after.map_or(0, |o| o + 1)));
    let run_cancel = cancel.child_token();

    let ctx = Arc::new(PoolContext {
        limiter: Arc::new(RateLimiter::from_config(engine)),
        policy: RetryPolicy::from_config(engine),
        call_timeout: engine.per_call_timeout(),
        dry_run: engine.dry_run,
        aggregator: aggregator.clone(),
        progress: progress.clone(),
        cancel: run_cancel.clone(),
    });
    let (tx, rx) = mpsc::channel::<Operation>(engine.queue_capacity());
    let pool = WorkerPool::spawn(factory, engine.workers, rx, ctx)?;

    let producer = {
        let validator = config.input.validator.clone();
        let aggregator = aggregator.clone();
        let progress = progress.clone();
        let cancel = run_cancel.clone();
        tokio::task::spawn_blocking(move || produce(source, &validator, &tx, &aggregator, &progress, &cancel))
    };

    let stop_checkpoints = CancellationToken::new();
    let checkpoint_task = checkpoints.map(|manager| {
        tokio::spawn(checkpoint_loop(
            manager,
            progress.clone(),
            aggregator.clone(),
            engine.checkpoint_interval(),
            stop_checkpoints.clone(),
        ))
    });
    let deadline = engine.run_timeout().map(|budget| spawn_deadline(budget, run_cancel.clone()));

    let pool_result = pool.join().await;
    let produced = producer
        .await
        .map_err(|e| SyncError::Worker(format!("reader thread: {e}")))?;
    if let Some(deadline) = deadline {
        deadline.abort();
    }
    stop_checkpoints.cancel();
    let checkpoint = match checkpoint_task {
        Some(task) => task
            .await
            .map_err(|e| SyncError::Worker(format!("checkpoint task: {e}")))??,
        None => None,
    };
    let processed = pool_result?;
    let source_stats = produced?;

    if run_cancel.is_cancelled() {
        warn!(%run_id, "[SYNC] Run was cancelled before the input was exhausted");
        aggregator.mark_cancelled();
    }
    aggregator.finish();

    let mut summary = RunSummary::new(
        run_id,
        aggregator.stats(),
        source_stats,
        checkpoint.as_ref().map(|c| c.offset),
    );
    if let Some(dir) = &config.output_dir {
        if let Err(e) = ReportEmitter::new(dir)
            .appending(resume_after.is_some())
            .emit(&aggregator, &mut summary) {
            error!(%run_id, error = %e, "[SYNC][ERROR] Failed to write reports");
            return Err(e.into());
        }
    }

    info!(
        %run_id,
        processed,
        succeeded = summary.stats.succeeded,
        failed = summary.stats.failed,
        skipped = summary.stats.skipped,
        remote_calls = summary.stats.remote_calls,
        duration_secs = summary.duration_secs,
        "[SYNC] Synchronisation run finished"
    );

    Ok(SynchroniseReport {
        run_id,
        summary,
        results: aggregator.take_results(),
        checkpoint,
    })
}

/// Reader side of the queue. Runs on a blocking thread; `blocking_send`
/// parks it while the workers are behind.
fn produce<R: std::io::Read>(
    mut source: RecordSource<R>,
    validator: &Validator,
    tx: &mpsc::Sender<Operation>,
    aggregator: &ResultAggregator,
    progress: &ProgressTracker,
    cancel: &CancellationToken,
) -> Result<SourceStats, SourceError> {
    let mut expected = source.next_offset();
    while !cancel.is_cancelled() {
        let record = match source.next_record() {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "[SYNC][ERROR] Input stream failed; stopping the reader");
                return Err(e);
            }
        };
        // Offsets between the last record and this one were unparsable or dropped.
        progress.complete_range(expected..record.offset);
        expected = record.offset + 1;

        match validator.validate(record) {
            Ok(op) => {
                if tx.blocking_send(op).is_err() {
                    debug!("Queue closed; reader stopping");
                    break;
                }
            }
            Err(rejected) => {
                let offset = rejected.offset;
                debug!(offset, error = %rejected.error, "Record rejected");
                aggregator.record(ItemResult::skipped(rejected, validator.key_field()));
                progress.complete(offset, None);
            }
        }
    }
    if !cancel.is_cancelled() {
        progress.complete_range(expected..source.next_offset());
    }
    let stats = source.stats();
    info!(
        emitted = stats.emitted,
        parse_errors = stats.parse_errors,
        dropped = stats.dropped_missing_required,
        resumed_past = stats.resumed_past,
        "[SYNC] Input exhausted"
    );
    Ok(stats)
}

/// Spooled results up to the watermark reach disk before the checkpoint
/// names it, so a crash between the two never loses an export line.
fn persist(
    manager: &mut CheckpointManager,
    progress: &ProgressTracker,
    aggregator: &ResultAggregator,
) -> Result<(), CheckpointError> {
    if let Some((offset, key)) = progress.watermark() {
        if let Err(e) = aggregator.flush() {
            warn!(offset, error = %e, "Result spool not flushed; checkpoint left where it was");
            return Ok(());
        }
        if manager.save(offset, key)?.is_some() {
            debug!(offset, pending = progress.pending(), "Checkpoint advanced");
        }
    }
    Ok(())
}

/// The only writer of the checkpoint file. Saves on every tick and once
/// more when stopped; a failed periodic save is retried on the next tick.
async fn checkpoint_loop(
    mut manager: CheckpointManager,
    progress: Arc<ProgressTracker>,
    aggregator: Arc<ResultAggregator>,
    every: Duration,
    stop: CancellationToken,
) -> Result<Option<Checkpoint>, CheckpointError> {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = persist(&mut manager, &progress, &aggregator) {
                    warn!(path = %manager.path().display(), error = %e, "Periodic checkpoint failed");
                }
            }
            _ = stop.cancelled() => break,
        }
    }
    persist(&mut manager, &progress, &aggregator)?;
    if let Some(last) = manager.last() {
        info!(path = %manager.path().display(), offset = last.offset, sequence = last.sequence, "Checkpoint saved");
    }
    Ok(manager.last().cloned())
}

fn spawn_deadline(budget: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(budget).await;
        warn!(budget_secs = budget.as_secs_f64(), "[SYNC] Run timeout reached; cancelling");
        cancel.cancel();
    })
}
