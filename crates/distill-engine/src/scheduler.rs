//! Worker pool.
//!
//! A fixed set of cooperative workers draining the job queue. Each worker
//! leases, dispatches to the registered handler for the job's type,
//! heartbeats while the handler runs, and completes or fails the job on
//! return. Handlers run inside their own task so a panic fails the job,
//! not the worker; the queue's lease expiry covers workers that die
//! entirely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use distill_store::{Job, JobQueue, JobType};
use hashbrown::HashMap;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::handler::JobHandler;

const IDLE_BACKOFF_MIN: Duration = Duration::from_millis(50);
const IDLE_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Summary returned when the pool drains out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub panics: u64,
    pub elapsed: Duration,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    panics: AtomicU64,
}

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    worker_count: usize,
    lease_duration: Duration,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, worker_count: usize, lease_duration: Duration) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            worker_count: worker_count.max(1),
            lease_duration,
        }
    }

    /// Register the handler for one job type. The scheduler knows nothing
    /// else about the handler.
    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    /// Run until `cancel` fires. Workers finish their current job and
    /// stop leasing new ones.
    pub async fn run(&self, cancel: CancellationToken) -> RunSummary {
        self.run_tracked(cancel, &TaskTracker::new()).await
    }

    /// Like [`WorkerPool::run`], but spawns the worker tasks on `tracker`
    /// so an owner holding the tracker can join them independently of
    /// this future (the engine's close path relies on this).
    pub async fn run_tracked(&self, cancel: CancellationToken, tracker: &TaskTracker) -> RunSummary {
        let started = Instant::now();
        let counters = Arc::new(Counters::default());
        let handlers = Arc::new(self.handlers.clone());

        let mut workers = Vec::with_capacity(self.worker_count);
        for index in 0..self.worker_count {
            let queue = Arc::clone(&self.queue);
            let handlers = Arc::clone(&handlers);
            let counters = Arc::clone(&counters);
            let cancel = cancel.clone();
            let lease_duration = self.lease_duration;
            workers.push(tracker.spawn(worker_loop(
                index,
                queue,
                handlers,
                counters,
                cancel,
                lease_duration,
            )));
        }
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "worker task join failed");
            }
        }

        let summary = RunSummary {
            processed: counters.processed.load(Ordering::Relaxed),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            panics: counters.panics.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
        };
        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            panics = summary.panics,
            "worker pool stopped"
        );
        summary
    }
}

async fn worker_loop(
    index: usize,
    queue: Arc<JobQueue>,
    handlers: Arc<HashMap<JobType, Arc<dyn JobHandler>>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    lease_duration: Duration,
) {
    let owner = format!("worker-{index}");
    let mut idle_backoff = IDLE_BACKOFF_MIN;

    while !cancel.is_cancelled() {
        let job = match queue.lease(&owner, lease_duration).await {
            Ok(job) => job,
            Err(e) => {
                warn!(worker = %owner, error = %e, "lease failed");
                if sleep_or_cancel(&cancel, idle_backoff).await {
                    break;
                }
                idle_backoff = (idle_backoff * 2).min(IDLE_BACKOFF_MAX);
                continue;
            }
        };

        match job {
            None => {
                let jittered = idle_backoff.mul_f64(rand::rng().random_range(0.5..1.5));
                if sleep_or_cancel(&cancel, jittered).await {
                    break;
                }
                idle_backoff = (idle_backoff * 2).min(IDLE_BACKOFF_MAX);
            }
            Some(job) => {
                idle_backoff = IDLE_BACKOFF_MIN;
                process_job(&owner, &queue, &handlers, &counters, &cancel, lease_duration, job)
                    .await;
            }
        }
    }
    debug!(worker = %owner, "worker stopped");
}

/// Returns true when cancelled.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancel.cancelled() => true,
    }
}

async fn process_job(
    owner: &str,
    queue: &Arc<JobQueue>,
    handlers: &Arc<HashMap<JobType, Arc<dyn JobHandler>>>,
    counters: &Arc<Counters>,
    cancel: &CancellationToken,
    lease_duration: Duration,
    job: Job,
) {
    counters.processed.fetch_add(1, Ordering::Relaxed);

    let Some(handler) = handlers.get(&job.job_type) else {
        let err = EngineError::UnknownJobType(job.job_type.as_str());
        warn!(job = %job.id, error = %err, "dropping job");
        record_failure(queue, counters, &job.id, &err).await;
        return;
    };

    // Heartbeat at half the lease period while the handler runs.
    let heartbeat_cancel = CancellationToken::new();
    let heartbeat = {
        let queue = Arc::clone(queue);
        let id = job.id.clone();
        let owner = owner.to_string();
        let stop = heartbeat_cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(lease_duration / 2);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = queue.heartbeat(&id, &owner, lease_duration).await {
                            warn!(job = %id, error = %e, "heartbeat failed");
                        }
                    }
                    _ = stop.cancelled() => break,
                }
            }
        })
    };

    // The handler runs in its own task so a panic unwinds that task only.
    let outcome = {
        let handler = Arc::clone(handler);
        let job = job.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { handler.handle(&cancel, &job).await }).await
    };

    heartbeat_cancel.cancel();
    let _ = heartbeat.await;

    match outcome {
        Ok(Ok(())) => {
            if let Err(e) = queue.complete(&job.id).await {
                warn!(job = %job.id, error = %e, "completion failed");
            } else {
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(Err(err)) => {
            debug!(job = %job.id, error = %err, "handler error");
            record_failure(queue, counters, &job.id, &err).await;
        }
        Err(join_err) => {
            counters.panics.fetch_add(1, Ordering::Relaxed);
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(job = %job.id, error = %join_err, "handler panicked");
            if let Err(e) = queue.fail(&job.id, "handler panicked", true).await {
                warn!(job = %job.id, error = %e, "failure record failed");
            }
        }
    }
}

async fn record_failure(
    queue: &Arc<JobQueue>,
    counters: &Arc<Counters>,
    job_id: &str,
    err: &EngineError,
) {
    counters.failed.fetch_add(1, Ordering::Relaxed);
    if let Err(e) = queue
        .fail(job_id, &err.to_string(), err.is_retryable())
        .await
    {
        warn!(job = %job_id, error = %e, "failure record failed");
    }
}
