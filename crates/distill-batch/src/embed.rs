//! Embedding micro-batcher.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::BatchError;

/// Hard cap on items per batch call, matching the embedding endpoint's
/// documented maximum.
pub const MAX_BATCH_CAP: usize = 100;

/// The multi-item embedding endpoint, as seen by the batcher.
///
/// Implementations carry their own model selection; the batcher only
/// shuttles texts and vectors. Response slot `i` must correspond to input
/// slot `i`.
#[async_trait]
pub trait EmbedBackend: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, BatchError>;
}

/// Tunables for [`EmbedBatcher`].
#[derive(Debug, Clone)]
pub struct EmbedBatcherConfig {
    /// Items per batch call; clamped to [`MAX_BATCH_CAP`].
    pub max_batch_size: usize,
    /// Upper bound on how long a sparse submission waits before being
    /// flushed by the background timer.
    pub flush_interval: Duration,
}

impl Default for EmbedBatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: MAX_BATCH_CAP,
            flush_interval: Duration::from_millis(500),
        }
    }
}

/// Counters tallied by the batcher, readable at any time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedBatcherStats {
    pub batches_sent: u64,
    pub items_embedded: u64,
    pub items_errored: u64,
    pub api_time: Duration,
}

struct PendingEmbed {
    kind: String,
    id: String,
    text: String,
    reply: oneshot::Sender<Result<Vec<f64>, BatchError>>,
}

/// Coalesces per-item embedding requests into bounded batch calls.
///
/// Each submit appends to the pending buffer; the submit that fills the
/// buffer flushes it synchronously, and a background timer flushes
/// whatever is pending every `flush_interval` so sparse traffic still has
/// bounded latency. A failed batch call propagates the same error to every
/// waiter in that batch.
pub struct EmbedBatcher {
    backend: Arc<dyn EmbedBackend>,
    config: EmbedBatcherConfig,
    pending: Mutex<Vec<PendingEmbed>>,
    // Tallied under its own lock so dispatch tasks never contend with
    // submitters on the pending buffer.
    stats: Arc<Mutex<EmbedBatcherStats>>,
    closed: AtomicBool,
    timer_cancel: CancellationToken,
    tasks: TaskTracker,
}

impl EmbedBatcher {
    /// Create the batcher and start its background flush timer.
    pub fn new(backend: Arc<dyn EmbedBackend>, config: EmbedBatcherConfig) -> Arc<Self> {
        let config = EmbedBatcherConfig {
            max_batch_size: config.max_batch_size.clamp(1, MAX_BATCH_CAP),
            ..config
        };
        let batcher = Arc::new(Self {
            backend,
            pending: Mutex::new(Vec::with_capacity(config.max_batch_size)),
            stats: Arc::new(Mutex::new(EmbedBatcherStats::default())),
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

    /// Submit one item and wait for its vector.
    ///
    /// Blocks until the item's batch completes, the caller's token fires,
    /// or the batcher shuts down underneath the waiter.
    pub async fn submit(
        &self,
        cancel: &CancellationToken,
        kind: &str,
        id: &str,
        text: String,
    ) -> Result<Vec<f64>, BatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BatchError::Closed);
        }

        let (reply, rx) = oneshot::channel();
        let full = {
            let mut pending = self.pending.lock();
            pending.push(PendingEmbed {
                kind: kind.to_string(),
                id: id.to_string(),
                text,
                reply,
            });
            if pending.len() >= self.config.max_batch_size {
                Some(mem::replace(
                    &mut *pending,
                    Vec::with_capacity(self.config.max_batch_size),
                ))
            } else {
                None
            }
        };
        if let Some(batch) = full {
            self.dispatch(batch);
        } else if self.closed.load(Ordering::Acquire) {
            // Lost the race with close(): its flush may have run before
            // this item landed, so flush again rather than strand it.
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
            mem::replace(
                &mut *pending,
                Vec::with_capacity(self.config.max_batch_size),
            )
        };
        self.dispatch(batch);
    }

    fn dispatch(&self, batch: Vec<PendingEmbed>) {
        let backend = Arc::clone(&self.backend);
        let stats = Arc::clone(&self.stats);
        self.tasks.spawn(async move {
            let size = batch.len();
            debug!(size, "dispatching embedding batch");

            let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
            let start = Instant::now();
            let result = backend.embed_batch(&texts).await;
            let elapsed = start.elapsed();

            let result = match result {
                Ok(vectors) if vectors.len() == size => Ok(vectors),
                Ok(vectors) => Err(BatchError::Mismatch {
                    expected: size,
                    got: vectors.len(),
                }),
                Err(e) => Err(e),
            };

            {
                let mut stats = stats.lock();
                stats.batches_sent += 1;
                stats.api_time += elapsed;
                match &result {
                    Ok(_) => stats.items_embedded += size as u64,
                    Err(_) => stats.items_errored += size as u64,
                }
            }
            metrics::counter!("embed_batches_sent_total").increment(1);
            metrics::histogram!("embed_batch_api_seconds").record(elapsed.as_secs_f64());

            match result {
                Ok(vectors) => {
                    metrics::counter!("embed_items_total", "result" => "ok")
                        .increment(size as u64);
                    for (item, vector) in batch.into_iter().zip(vectors) {
                        // A waiter that timed out dropped its receiver; the
                        // send then fails and that is fine.
                        let _ = item.reply.send(Ok(vector));
                    }
                }
                Err(e) => {
                    metrics::counter!("embed_items_total", "result" => "error")
                        .increment(size as u64);
                    warn!(size, error = %e, "embedding batch failed");
                    for item in batch {
                        debug!(kind = %item.kind, id = %item.id, "failing batched item");
                        let _ = item.reply.send(Err(e.clone()));
                    }
                }
            }
        });
    }

    /// Stop accepting submissions, flush the pending buffer, and wait for
    /// every in-flight dispatch to finish.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flush();
        self.timer_cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    pub fn stats(&self) -> EmbedBatcherStats {
        self.stats.lock().clone()
    }

    /// Items sitting in the pending buffer, not yet dispatched.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}
