//! Engine assembly and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use distill_batch::{
    EmbedBatcher, EmbedBatcherConfig, EmbedBatcherStats, WriteBatcher, WriteBatcherConfig,
    WriteBatcherStats,
};
use distill_core::ControllerSnapshot;
use distill_llm::LlmApi;
use distill_store::{AnalysisType, JobQueue, JobType, QueueStats, TargetKind};
use distill_throttle::{
    AdaptiveSemaphore, ConcurrencyController, RateController, RateLimiter,
};
use hashbrown::HashMap;
use parking_lot::RwLock;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::analysis::{AnalysisHandler, ExtractorRegistry, LocalExtractor};
use crate::config::EngineConfig;
use crate::embed::{EmbedHandler, LlmEmbedBackend};
use crate::envelope::HandlerEnvelope;
use crate::error::EngineError;
use crate::handler::{AnalysisPayload, EmbedPayload};
use crate::metrics::{EngineMetrics, MetricsSnapshot, RequestClass};
use crate::scheduler::{RunSummary, WorkerPool};
use crate::text::{TextCache, TextSource};

/// Point-in-time view of the whole engine, logged on close.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub queue: QueueStats,
    pub controllers: Vec<ControllerSnapshot>,
    pub embed_batcher: EmbedBatcherStats,
    pub write_batcher: Option<WriteBatcherStats>,
    pub metrics: MetricsSnapshot,
}

/// The engine: every limiter, controller, batcher, queue, and handler as
/// one explicitly constructed object.
pub struct Engine {
    config: EngineConfig,
    pool: SqlitePool,
    queue: Arc<JobQueue>,
    llm: Arc<dyn LlmApi>,
    text: Arc<dyn TextSource>,
    cache: Arc<TextCache>,

    semaphore: Arc<AdaptiveSemaphore>,
    concurrency: Option<Arc<ConcurrencyController>>,
    analysis_limiter: Arc<RateLimiter>,
    embed_limiter: Arc<RateLimiter>,
    analysis_rate: Option<Arc<RateController>>,
    embed_rate: Option<Arc<RateController>>,

    embed_batcher: Arc<EmbedBatcher>,
    writer: Option<Arc<WriteBatcher>>,

    extractors: ExtractorRegistry,
    metrics: Arc<EngineMetrics>,

    root: CancellationToken,
    /// Worker tasks from every `run` invocation; joined by `close`.
    workers: TaskTracker,
    /// Controller tickers.
    background: TaskTracker,
}

impl Engine {
    /// Build the engine and start its background controllers.
    pub fn new(
        pool: SqlitePool,
        llm: Arc<dyn LlmApi>,
        text: Arc<dyn TextSource>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let root = CancellationToken::new();
        let background = TaskTracker::new();
        let metrics = Arc::new(EngineMetrics::new());
        let cache = Arc::new(TextCache::new(4096));

        let queue = Arc::new(JobQueue::new(pool.clone(), config.queue.clone()));

        // In-flight plane: one semaphore, one controller, shared by both
        // classes.
        let semaphore = AdaptiveSemaphore::new(config.resolved_max_in_flight());
        let concurrency = if config.disable_adaptive {
            None
        } else {
            let controller = Arc::new(ConcurrencyController::new(
                Arc::clone(&semaphore),
                config.concurrency_config(),
            ));
            background.spawn(Arc::clone(&controller).run(root.child_token()));
            Some(controller)
        };

        // Rate plane: one limiter and (when adaptive) one controller per
        // request class.
        let (analysis_limiter, analysis_rate) = Self::rate_plane(
            "analysis",
            config.analysis_rpm,
            config.analysis_rate.clone().with_cadence(config.controller_cadence),
            &root,
            &background,
        );
        let (embed_limiter, embed_rate) = Self::rate_plane(
            "embedding",
            config.embed_rpm,
            config.embed_rate.clone().with_cadence(config.controller_cadence),
            &root,
            &background,
        );

        let embed_backend =
            LlmEmbedBackend::new(Arc::clone(&llm), config.embedding_model.clone());
        let embed_batcher = EmbedBatcher::new(
            embed_backend,
            EmbedBatcherConfig {
                max_batch_size: config.embedding_batch_size,
                flush_interval: config.embed_flush_interval,
            },
        );

        let writer = config.use_batch_writer.then(|| {
            WriteBatcher::new(
                pool.clone(),
                WriteBatcherConfig {
                    batch_size: config.batch_size,
                    flush_interval: config.flush_interval,
                    ..WriteBatcherConfig::default()
                },
            )
        });

        Arc::new(Self {
            config,
            pool,
            queue,
            llm,
            text,
            cache,
            semaphore,
            concurrency,
            analysis_limiter,
            embed_limiter,
            analysis_rate,
            embed_rate,
            embed_batcher,
            writer,
            extractors: Arc::new(RwLock::new(HashMap::new())),
            metrics,
            root,
            workers: TaskTracker::new(),
            background,
        })
    }

    fn rate_plane(
        class: &'static str,
        fixed_rpm: u32,
        adaptive: distill_throttle::RateControllerConfig,
        root: &CancellationToken,
        background: &TaskTracker,
    ) -> (Arc<RateLimiter>, Option<Arc<RateController>>) {
        if fixed_rpm > 0 {
            (Arc::new(RateLimiter::new(fixed_rpm)), None)
        } else {
            let limiter = Arc::new(RateLimiter::new(0));
            let controller = Arc::new(RateController::new(class, Arc::clone(&limiter), adaptive));
            background.spawn(Arc::clone(&controller).run(root.child_token()));
            (limiter, Some(controller))
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn write_batcher(&self) -> Option<&Arc<WriteBatcher>> {
        self.writer.as_ref()
    }

    pub fn embed_batcher(&self) -> &Arc<EmbedBatcher> {
        &self.embed_batcher
    }

    /// Register a local extractor for an analysis type name; jobs of that
    /// type bypass the model endpoint.
    pub fn register_extractor(&self, name: &str, extractor: Arc<dyn LocalExtractor>) {
        self.extractors
            .write()
            .insert(name.to_string(), extractor);
    }

    /// Enqueue one analysis job, deduplicated on (type, episode).
    pub async fn enqueue_analysis(
        &self,
        analysis_type: &AnalysisType,
        episode_id: &str,
    ) -> Result<(String, bool), EngineError> {
        let payload = AnalysisPayload {
            analysis_type_id: analysis_type.id.clone(),
            episode_id: episode_id.to_string(),
        };
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| EngineError::Payload(e.to_string()))?;
        Ok(self
            .queue
            .enqueue(JobType::Analysis, &payload.job_key(), &bytes)
            .await?)
    }

    /// Enqueue one embedding job, deduplicated on (kind, id, model).
    pub async fn enqueue_embedding(
        &self,
        kind: TargetKind,
        target_id: &str,
    ) -> Result<(String, bool), EngineError> {
        let payload = EmbedPayload {
            target_kind: kind.as_str().to_string(),
            target_id: target_id.to_string(),
        };
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| EngineError::Payload(e.to_string()))?;
        let key = payload.job_key(&self.config.embedding_model);
        Ok(self.queue.enqueue(JobType::Embedding, &key, &bytes).await?)
    }

    fn build_pool(&self) -> WorkerPool {
        let adaptive_semaphore =
            (!self.config.disable_adaptive).then(|| Arc::clone(&self.semaphore));

        let analysis = AnalysisHandler::new(
            self.pool.clone(),
            Arc::clone(&self.llm),
            Arc::clone(&self.text),
            Arc::clone(&self.cache),
            self.writer.clone(),
            Arc::clone(&self.extractors),
            self.config.analysis_model.clone(),
            Arc::clone(&self.metrics),
        );
        let analysis_envelope = HandlerEnvelope::new(
            RequestClass::Analysis,
            analysis,
            adaptive_semaphore.clone(),
            Arc::clone(&self.analysis_limiter),
            self.concurrency.clone(),
            self.analysis_rate.clone(),
            Arc::clone(&self.metrics),
        );

        let embed = EmbedHandler::new(
            self.pool.clone(),
            Arc::clone(&self.embed_batcher),
            Arc::clone(&self.text),
            Arc::clone(&self.cache),
            self.writer.clone(),
            self.config.embedding_model.clone(),
            Arc::clone(&self.metrics),
        );
        let embed_envelope = HandlerEnvelope::new(
            RequestClass::Embedding,
            embed,
            adaptive_semaphore,
            Arc::clone(&self.embed_limiter),
            self.concurrency.clone(),
            self.embed_rate.clone(),
            Arc::clone(&self.metrics),
        );

        let mut pool = WorkerPool::new(
            Arc::clone(&self.queue),
            self.config.worker_count,
            self.config.lease_duration,
        );
        pool.register(JobType::Analysis, analysis_envelope);
        pool.register(JobType::Embedding, embed_envelope);
        pool
    }

    /// Run the worker pool until `cancel` fires or the engine is closed.
    ///
    /// The caller's token is linked to the engine's root token, so
    /// [`Engine::close`] stops these workers no matter which token the
    /// caller passed. Worker tasks land on the engine's tracker, which is
    /// what lets `close` join them.
    pub async fn run(&self, cancel: CancellationToken) -> RunSummary {
        let linked = self.root.child_token();
        let forward = {
            let linked = linked.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => linked.cancel(),
                    _ = linked.cancelled() => {}
                }
            })
        };

        let summary = self
            .build_pool()
            .run_tracked(linked.clone(), &self.workers)
            .await;

        linked.cancel();
        let _ = forward.await;
        summary
    }

    /// Run the worker pool until the queue has no pending or leased work
    /// left, then stop it.
    pub async fn run_until_drained(&self) -> Result<RunSummary, EngineError> {
        let cancel = self.root.child_token();
        let watcher = {
            let queue = Arc::clone(&self.queue);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    match queue.stats().await {
                        Ok(stats) if stats.pending == 0 && stats.leased == 0 => {
                            debug!(?stats, "queue drained");
                            cancel.cancel();
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(error = %e, "stats poll failed");
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
        };

        let summary = self.run(cancel).await;
        let _ = watcher.await;
        Ok(summary)
    }

    /// Current engine-wide snapshot.
    pub async fn snapshot(&self) -> Result<EngineSnapshot, EngineError> {
        let mut controllers = Vec::new();
        if let Some(c) = &self.concurrency {
            controllers.push(c.snapshot());
        }
        if let Some(r) = &self.analysis_rate {
            controllers.push(r.snapshot());
        }
        if let Some(r) = &self.embed_rate {
            controllers.push(r.snapshot());
        }
        Ok(EngineSnapshot {
            queue: self.queue.stats().await?,
            controllers,
            embed_batcher: self.embed_batcher.stats(),
            write_batcher: self.writer.as_ref().map(|w| w.stats()),
            metrics: self.metrics.snapshot(),
        })
    }

    /// Shut everything down in dependency order: stop leasing, join the
    /// workers, drain both batchers, stop the controllers, and log a
    /// final snapshot. Idempotent.
    pub async fn close(&self) -> Result<EngineSnapshot, EngineError> {
        // Workers go first: cancellation unwinds their in-flight waits,
        // and the batchers must still be alive while that happens. Only
        // a drained pool makes it safe to close the batchers.
        self.root.cancel();
        self.workers.close();
        self.workers.wait().await;

        self.embed_batcher.close().await;
        if let Some(writer) = &self.writer {
            writer.close().await;
        }
        self.background.close();
        self.background.wait().await;

        let snapshot = self.snapshot().await?;
        info!(
            pending = snapshot.queue.pending,
            done = snapshot.queue.done,
            dead = snapshot.queue.dead,
            batches_sent = snapshot.embed_batcher.batches_sent,
            "engine closed"
        );
        for controller in &snapshot.controllers {
            info!(
                name = %controller.name,
                limit = controller.limit,
                adjustments = controller.adjustments,
                decision = %controller.last_decision,
                "controller final state"
            );
        }
        Ok(snapshot)
    }
}
