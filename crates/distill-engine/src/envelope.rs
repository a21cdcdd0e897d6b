//! Handler envelope: the uniform wrapper around every handler.
//!
//! Acquires the in-flight semaphore (when adaptive concurrency is on),
//! awaits the class's rate limiter, times the inner call, classifies the
//! result, and feeds the observation to both controllers. One envelope
//! exists per request class so the controllers' signals stay unmixed.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use distill_core::Outcome;
use distill_store::Job;
use distill_throttle::{AdaptiveSemaphore, ConcurrencyController, RateController, RateLimiter};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::handler::JobHandler;
use crate::metrics::{EngineMetrics, Phase, RequestClass};

pub struct HandlerEnvelope {
    class: RequestClass,
    inner: Arc<dyn JobHandler>,
    semaphore: Option<Arc<AdaptiveSemaphore>>,
    limiter: Arc<RateLimiter>,
    concurrency: Option<Arc<ConcurrencyController>>,
    rate: Option<Arc<RateController>>,
    metrics: Arc<EngineMetrics>,
}

impl HandlerEnvelope {
    pub fn new(
        class: RequestClass,
        inner: Arc<dyn JobHandler>,
        semaphore: Option<Arc<AdaptiveSemaphore>>,
        limiter: Arc<RateLimiter>,
        concurrency: Option<Arc<ConcurrencyController>>,
        rate: Option<Arc<RateController>>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            class,
            inner,
            semaphore,
            limiter,
            concurrency,
            rate,
            metrics,
        })
    }
}

#[async_trait]
impl JobHandler for HandlerEnvelope {
    async fn handle(&self, cancel: &CancellationToken, job: &Job) -> Result<(), EngineError> {
        let _permit = match &self.semaphore {
            Some(semaphore) => Some(semaphore.acquire(cancel).await?),
            None => None,
        };
        self.limiter.acquire(cancel).await?;

        self.metrics.record_job(self.class);
        let start = Instant::now();
        let result = self.inner.handle(cancel, job).await;
        let elapsed = start.elapsed();

        // The caller's own cancellation is not a signal about the
        // endpoint; it neither counts against the controllers nor as an
        // outcome.
        let cancelled = matches!(&result, Err(e) if e.is_cancellation());
        if !cancelled {
            let outcome = Outcome::of(&result);
            self.metrics.record_outcome(self.class, outcome);
            self.metrics.record_phase(self.class, Phase::Overall, elapsed);
            if let Some(concurrency) = &self.concurrency {
                concurrency.observe(elapsed, outcome);
            }
            if let Some(rate) = &self.rate {
                rate.observe(outcome);
            }
        }

        result
    }
}
