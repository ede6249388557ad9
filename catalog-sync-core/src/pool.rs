//! # pool: fixed-size worker pool
//!
//! `W` tokio tasks share one bounded queue. Every worker owns the session
//! it opened from the [`SessionFactory`] and runs each operation it receives
//! through the [`RetryController`], then records the result and marks the
//! operation's input offset complete. An operation interrupted by
//! cancellation is recorded but stays pending for the checkpoint.
//!
//! Sessions are opened before any task is spawned, so a factory failure
//! aborts the run before a single operation is processed.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::aggregate::ResultAggregator;
use crate::checkpoint::ProgressTracker;
use crate::contract::{Operation, RemoteCall, SessionFactory};
use crate::error::SyncError;
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryController, RetryPolicy};

/// State shared by every worker of one run.
pub struct PoolContext {
    pub limiter: Arc<RateLimiter>,
    pub policy: RetryPolicy,
    pub call_timeout: Duration,
    pub dry_run: bool,
    pub aggregator: Arc<ResultAggregator>,
    pub progress: Arc<ProgressTracker>,
    pub cancel: CancellationToken,
}

type SharedQueue = Arc<Mutex<mpsc::Receiver<Operation>>>;

pub struct WorkerPool {
    handles: Vec<JoinHandle<u64>>,
}

impl WorkerPool {
    /// Opens one session per worker and starts the workers on `queue`.
    pub fn spawn(
        factory: &dyn SessionFactory,
        workers: usize,
        queue: mpsc::Receiver<Operation>,
        ctx: Arc<PoolContext>,
    ) -> Result<Self, SyncError> {
        let mut sessions = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            match factory.open_session(worker_id) {
                Ok(session) => sessions.push(session),
                Err(source) => {
                    error!(worker_id, error = %source, "Failed to open remote session");
                    return Err(SyncError::Session { worker_id, source });
                }
            }
        }

        let queue: SharedQueue = Arc::new(Mutex::new(queue));
        let handles = sessions
            .into_iter()
            .enumerate()
            .map(|(worker_id, session)| {
                tokio::spawn(worker_loop(worker_id, session, queue.clone(), ctx.clone()))
            })
            .collect();
        info!(workers, "Worker pool started");
        Ok(Self { handles })
    }

    /// Waits for every worker to exit. Returns the number of operations
    /// the pool processed.
    pub async fn join(self) -> Result<u64, SyncError> {
        let mut processed = 0;
        let mut first_panic = None;
        for joined in join_all(self.handles).await {
            match joined {
                Ok(n) => processed += n,
                Err(e) => {
                    error!(error = %e, "Worker task did not complete");
                    first_panic.get_or_insert_with(|| e.to_string());
                }
            }
        }
        match first_panic {
            Some(msg) => Err(SyncError::Worker(msg)),
            None => Ok(processed),
        }
    }
}

async fn next_operation(queue: &SharedQueue, cancel: &CancellationToken) -> Option<Operation> {
    let mut rx = queue.lock().await;
    tokio::select! {
        op = rx.recv() => op,
        _ = cancel.cancelled() => None,
    }
}

async fn worker_loop(
    worker_id: usize,
    session: Box<dyn RemoteCall>,
    queue: SharedQueue,
    ctx: Arc<PoolContext>,
) -> u64 {
    let controller = RetryController {
        policy: &ctx.policy,
        limiter: &ctx.limiter,
        call_timeout: ctx.call_timeout,
        dry_run: ctx.dry_run,
        cancel: &ctx.cancel,
    };
    let mut processed = 0u64;
    while !ctx.cancel.is_cancelled() {
        let Some(op) = next_operation(&queue, &ctx.cancel).await else {
            break;
        };
        let offset = op.offset;
        let key = op.key.clone();
        let result = controller.execute(session.as_ref(), op).await;
        debug!(worker_id, key = %key, outcome = ?result.outcome, attempts = result.attempts, "Operation finished");
        let interrupted = result.interrupted;
        ctx.aggregator.record(result);
        if interrupted {
            // Left pending: the checkpoint must not move past it.
            debug!(worker_id, key = %key, offset, "Operation interrupted; not marking it complete");
        } else {
            ctx.progress.complete(offset, Some(key));
        }
        processed += 1;
    }
    debug!(worker_id, processed, cancelled = ctx.cancel.is_cancelled(), "Worker exiting");
    processed
}
