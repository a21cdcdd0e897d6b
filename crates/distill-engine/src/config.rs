//! Engine configuration.

use std::time::Duration;

use distill_store::QueueConfig;
use distill_throttle::{ConcurrencyControllerConfig, RateControllerConfig};

/// The engine's configuration surface.
///
/// Everything has a default tuned for a large local corpus against a
/// hosted model endpoint; tests dial the timers down.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker pool size; the upper bound on concurrent handler
    /// executions.
    pub worker_count: usize,
    /// Lease duration for claimed jobs; heartbeats extend it at half this
    /// cadence.
    pub lease_duration: Duration,

    pub analysis_model: String,
    pub embedding_model: String,

    /// Route persistence closures through the transactional write
    /// batcher.
    pub use_batch_writer: bool,
    /// Write batcher: closures per transaction.
    pub batch_size: usize,
    /// Write batcher: timer flush interval.
    pub flush_interval: Duration,

    /// Embedding batcher: items per batch call (capped at 100).
    pub embedding_batch_size: usize,
    /// Embedding batcher: timer flush interval.
    pub embed_flush_interval: Duration,

    /// Fixed analysis rate cap in requests per minute; 0 means adaptive.
    pub analysis_rpm: u32,
    /// Fixed embedding rate cap in requests per minute; 0 means adaptive.
    pub embed_rpm: u32,
    /// Disable in-flight (semaphore) throttling entirely.
    pub disable_adaptive: bool,

    /// In-flight ceiling for the adaptive semaphore; 0 means
    /// `worker_count`.
    pub max_in_flight: usize,
    pub min_in_flight: usize,
    /// Cadence shared by both controllers.
    pub controller_cadence: Duration,

    /// Rate-controller tuning per request class, used when the class's
    /// rpm is adaptive.
    pub analysis_rate: RateControllerConfig,
    pub embed_rate: RateControllerConfig,

    pub queue: QueueConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 50,
            lease_duration: Duration::from_secs(30),
            analysis_model: "gemini-2.5-flash".to_string(),
            embedding_model: "gemini-embedding-001".to_string(),
            use_batch_writer: true,
            batch_size: 25,
            flush_interval: Duration::from_millis(100),
            embedding_batch_size: 100,
            embed_flush_interval: Duration::from_millis(500),
            analysis_rpm: 0,
            embed_rpm: 0,
            disable_adaptive: false,
            max_in_flight: 0,
            min_in_flight: 1,
            controller_cadence: Duration::from_secs(1),
            analysis_rate: RateControllerConfig::default(),
            embed_rate: RateControllerConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_models(
        mut self,
        analysis_model: impl Into<String>,
        embedding_model: impl Into<String>,
    ) -> Self {
        self.analysis_model = analysis_model.into();
        self.embedding_model = embedding_model.into();
        self
    }

    pub fn with_batch_writer(mut self, enabled: bool) -> Self {
        self.use_batch_writer = enabled;
        self
    }

    pub fn with_write_batching(mut self, batch_size: usize, flush_interval: Duration) -> Self {
        self.batch_size = batch_size;
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_embedding_batching(
        mut self,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        self.embedding_batch_size = batch_size;
        self.embed_flush_interval = flush_interval;
        self
    }

    pub fn with_fixed_rpm(mut self, analysis_rpm: u32, embed_rpm: u32) -> Self {
        self.analysis_rpm = analysis_rpm;
        self.embed_rpm = embed_rpm;
        self
    }

    pub fn with_adaptive_disabled(mut self) -> Self {
        self.disable_adaptive = true;
        self
    }

    pub fn with_controller_cadence(mut self, cadence: Duration) -> Self {
        self.controller_cadence = cadence;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub(crate) fn resolved_max_in_flight(&self) -> usize {
        if self.max_in_flight == 0 {
            self.worker_count
        } else {
            self.max_in_flight
        }
    }

    pub(crate) fn concurrency_config(&self) -> ConcurrencyControllerConfig {
        ConcurrencyControllerConfig::default()
            .with_cadence(self.controller_cadence)
            .with_min_limit(self.min_in_flight.max(1))
            .with_max_limit(self.resolved_max_in_flight())
    }
}
