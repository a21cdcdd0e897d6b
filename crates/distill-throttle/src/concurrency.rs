//! AIMD concurrency controller.

use std::sync::Arc;
use std::time::Duration;

use distill_core::{ControllerSnapshot, ObservationWindow, Outcome};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::semaphore::AdaptiveSemaphore;

/// Tunables for [`ConcurrencyController`].
#[derive(Debug, Clone)]
pub struct ConcurrencyControllerConfig {
    /// Tick cadence.
    pub cadence: Duration,
    /// Lowest limit the controller will contract to.
    pub min_limit: usize,
    /// Highest limit the controller will expand to; also the initial limit.
    pub max_limit: usize,
    /// Multiplicative decrease factor applied on congestion.
    pub decrease_factor: f64,
    /// Proportional increase per calm tick, as a fraction of the current
    /// limit (at least one unit is always added).
    pub increase_pct: f64,
    /// Error ratio at or above which the window counts as congested.
    pub error_ratio_threshold: f64,
    /// EWMA smoothing weight given to the new window mean.
    pub ewma_alpha: f64,
    /// Congestion when the EWMA exceeds this multiple of the baseline.
    pub latency_degraded_factor: f64,
}

impl Default for ConcurrencyControllerConfig {
    fn default() -> Self {
        Self {
            cadence: Duration::from_secs(1),
            min_limit: 1,
            max_limit: 50,
            decrease_factor: 0.85,
            increase_pct: 0.12,
            error_ratio_threshold: 0.08,
            ewma_alpha: 0.2,
            latency_degraded_factor: 3.0,
        }
    }
}

impl ConcurrencyControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn with_min_limit(mut self, min: usize) -> Self {
        self.min_limit = min;
        self
    }

    pub fn with_max_limit(mut self, max: usize) -> Self {
        self.max_limit = max;
        self
    }

    pub fn with_decrease_factor(mut self, factor: f64) -> Self {
        self.decrease_factor = factor;
        self
    }

    pub fn with_increase_pct(mut self, pct: f64) -> Self {
        self.increase_pct = pct;
        self
    }

    pub fn with_error_ratio_threshold(mut self, threshold: f64) -> Self {
        self.error_ratio_threshold = threshold;
        self
    }
}

#[derive(Debug)]
struct ControllerInner {
    ewma_ms: f64,
    /// Minimum positive EWMA ever observed; the uncongested latency floor.
    baseline_ms: f64,
    adjustments: u64,
    last_decision: String,
}

/// Periodic ticker that resizes an [`AdaptiveSemaphore`] from observed
/// outcomes.
///
/// The controller starts at `max_limit` and only contracts on demonstrated
/// stress: a transport-class outcome in the window, an error ratio at or
/// above the threshold, or a smoothed latency well above the best observed
/// baseline. Calm windows expand the limit proportionally.
pub struct ConcurrencyController {
    semaphore: Arc<AdaptiveSemaphore>,
    window: Mutex<ObservationWindow>,
    inner: Mutex<ControllerInner>,
    config: ConcurrencyControllerConfig,
}

impl ConcurrencyController {
    pub fn new(semaphore: Arc<AdaptiveSemaphore>, config: ConcurrencyControllerConfig) -> Self {
        semaphore.set_limit(config.max_limit);
        Self {
            semaphore,
            window: Mutex::new(ObservationWindow::new()),
            inner: Mutex::new(ControllerInner {
                ewma_ms: 0.0,
                baseline_ms: 0.0,
                adjustments: 0,
                last_decision: "init".to_string(),
            }),
            config,
        }
    }

    /// Record one handler invocation outcome.
    pub fn observe(&self, latency: Duration, outcome: Outcome) {
        self.window.lock().record(outcome, latency);
    }

    /// Run one control decision over the drained window. Called from the
    /// ticker loop; public so tests can drive decisions deterministically.
    pub fn tick(&self) {
        let stats = self.window.lock().drain();
        let mut inner = self.inner.lock();

        if stats.total() == 0 {
            inner.last_decision = "hold (empty window)".to_string();
            return;
        }

        let mean_ms = stats.latency_sum().as_secs_f64() * 1e3 / stats.total() as f64;
        inner.ewma_ms = if inner.ewma_ms == 0.0 {
            mean_ms
        } else {
            (1.0 - self.config.ewma_alpha) * inner.ewma_ms + self.config.ewma_alpha * mean_ms
        };
        if inner.ewma_ms > 0.0 && (inner.baseline_ms == 0.0 || inner.ewma_ms < inner.baseline_ms) {
            inner.baseline_ms = inner.ewma_ms;
        }

        let latency_degraded = inner.baseline_ms > 0.0
            && inner.ewma_ms > self.config.latency_degraded_factor * inner.baseline_ms;
        let congested = stats.transport_errors() > 0
            || stats.error_ratio() >= self.config.error_ratio_threshold
            || latency_degraded;

        let limit = self.semaphore.limit();
        let new_limit = if congested {
            ((limit as f64 * self.config.decrease_factor).floor() as usize)
                .max(self.config.min_limit)
        } else {
            let step = ((limit as f64 * self.config.increase_pct).ceil() as usize).max(1);
            limit.saturating_add(step).min(self.config.max_limit)
        };

        let verb = if congested { "decrease" } else { "increase" };
        inner.last_decision = format!(
            "{verb} {limit} -> {new_limit} ({}, ewma={:.1}ms baseline={:.1}ms)",
            stats.summary(),
            inner.ewma_ms,
            inner.baseline_ms,
        );

        if new_limit != limit {
            inner.adjustments += 1;
            self.semaphore.set_limit(new_limit);
            metrics::counter!("throttle_concurrency_adjustments_total", "direction" => verb)
                .increment(1);
        }
        debug!(decision = %inner.last_decision, "concurrency controller tick");
    }

    /// Drive ticks at the configured cadence until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.cadence);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick completes immediately; skip it so the
        // first real decision covers a full window.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                _ = cancel.cancelled() => break,
            }
        }
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        let inner = self.inner.lock();
        ControllerSnapshot {
            name: "concurrency".to_string(),
            limit: self.semaphore.limit() as u64,
            min_limit: self.config.min_limit as u64,
            max_limit: self.config.max_limit as u64,
            in_flight: Some(self.semaphore.in_flight() as u64),
            ewma_ms: (inner.ewma_ms > 0.0).then_some(inner.ewma_ms),
            adjustments: inner.adjustments,
            last_decision: inner.last_decision.clone(),
        }
    }
}
