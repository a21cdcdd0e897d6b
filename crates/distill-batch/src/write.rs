//! Transactional write batcher.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::BatchError;

/// One logical write: a closure applied inside an open transaction.
pub type WriteOp = Box<
    dyn for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<(), sqlx::Error>>
        + Send
        + 'static,
>;

/// Tunables for [`WriteBatcher`].
#[derive(Debug, Clone)]
pub struct WriteBatcherConfig {
    /// Closures per transaction.
    pub batch_size: usize,
    /// Upper bound on how long a submitted closure waits before the timer
    /// flushes it.
    pub flush_interval: Duration,
    /// Concurrent committing flushes. Bounding this bounds the number of
    /// closures the batcher can hold in flight, which is the back-pressure
    /// on producers.
    pub max_inflight_flushes: usize,
}

impl Default for WriteBatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            flush_interval: Duration::from_millis(100),
            max_inflight_flushes: 4,
        }
    }
}

/// Counters tallied by the write batcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatcherStats {
    pub batches_committed: u64,
    pub ops_applied: u64,
    pub commit_failures: u64,
}

type Waiter = oneshot::Sender<Result<(), BatchError>>;

/// Groups persistence closures into single SQLite transactions.
///
/// Closures run in submission order within their transaction. Every
/// submitter of a batch observes the same commit result; there is no
/// per-closure rollback. Single-writer stores gain a lot from amortizing
/// the write lock this way while each logical write stays serialisable.
pub struct WriteBatcher {
    pool: SqlitePool,
    config: WriteBatcherConfig,
    pending: Mutex<Vec<(WriteOp, Waiter)>>,
    stats: Arc<Mutex<WriteBatcherStats>>,
    flush_gate: Arc<Semaphore>,
    closed: AtomicBool,
    timer_cancel: CancellationToken,
    tasks: TaskTracker,
}

impl WriteBatcher {
    /// Create the batcher and start its background flush timer.
    pub fn new(pool: SqlitePool, config: WriteBatcherConfig) -> Arc<Self> {
        let batcher = Arc::new(Self {
            pool,
            pending: Mutex::new(Vec::with_capacity(config.batch_size)),
            stats: Arc::new(Mutex::new(WriteBatcherStats::default())),
            flush_gate: Arc::new(Semaphore::new(config.max_inflight_flushes.max(1))),
            closed: AtomicBool::new(false),
            timer_cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            config,
        });

        let timer = Arc::clone(&batcher);
        batcher.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(timer.config.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => timer.flush(),
                    _ = timer.timer_cancel.cancelled() => break,
                }
            }
        });

        batcher
    }

    /// Submit one write closure and wait for its transaction to commit.
    pub async fn submit(
        &self,
        cancel: &CancellationToken,
        op: WriteOp,
    ) -> Result<(), BatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BatchError::Closed);
        }

        let (reply, rx) = oneshot::channel();
        let full = {
            let mut pending = self.pending.lock();
            pending.push((op, reply));
            if pending.len() >= self.config.batch_size {
                Some(mem::replace(
                    &mut *pending,
                    Vec::with_capacity(self.config.batch_size),
                ))
            } else {
                None
            }
        };
        if let Some(batch) = full {
            self.dispatch(batch);
        } else if self.closed.load(Ordering::Acquire) {
            // Lost the race with close(): its flush may have run before
            // this closure landed, so flush again rather than strand it.
            self.flush();
        }

        tokio::select! {
            res = rx => res.unwrap_or(Err(BatchError::Closed)),
            _ = cancel.cancelled() => Err(BatchError::Cancelled),
        }
    }

    /// Flush whatever is pending. A flush with nothing pending is a no-op.
    pub fn flush(&self) {
        let batch = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return;
            }
            mem::replace(&mut *pending, Vec::with_capacity(self.config.batch_size))
        };
        self.dispatch(batch);
    }

    fn dispatch(&self, batch: Vec<(WriteOp, Waiter)>) {
        let pool = self.pool.clone();
        let stats = Arc::clone(&self.stats);
        let gate = Arc::clone(&self.flush_gate);
        self.tasks.spawn(async move {
            let _permit = gate.acquire().await.ok();
            let size = batch.len();
            debug!(size, "committing write batch");

            let (ops, waiters): (Vec<_>, Vec<_>) = batch.into_iter().unzip();
            let result = commit_all(&pool, ops).await;

            {
                let mut stats = stats.lock();
                match &result {
                    Ok(()) => {
                        stats.batches_committed += 1;
                        stats.ops_applied += size as u64;
                    }
                    Err(_) => stats.commit_failures += 1,
                }
            }
            match &result {
                Ok(()) => {
                    metrics::counter!("write_batches_committed_total").increment(1);
                    metrics::counter!("write_ops_applied_total").increment(size as u64);
                }
                Err(e) => {
                    metrics::counter!("write_batch_failures_total").increment(1);
                    warn!(size, error = %e, "write batch failed");
                }
            }

            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        });
    }

    /// Stop accepting submissions, flush the pending buffer, and wait for
    /// every in-flight commit to finish.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flush();
        self.timer_cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    pub fn stats(&self) -> WriteBatcherStats {
        self.stats.lock().clone()
    }
}

async fn commit_all(pool: &SqlitePool, ops: Vec<WriteOp>) -> Result<(), BatchError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| BatchError::Commit(e.to_string()))?;
    for op in ops {
        // Closures execute in submission order; the first failure rolls
        // the whole transaction back.
        op(&mut tx)
            .await
            .map_err(|e| BatchError::Commit(e.to_string()))?;
    }
    tx.commit()
        .await
        .map_err(|e| BatchError::Commit(e.to_string()))
}
