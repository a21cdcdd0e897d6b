//! Multiplicative-decrease / slow-start rate controller.

use std::sync::Arc;
use std::time::Duration;

use distill_core::{ControllerSnapshot, ObservationWindow, Outcome};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::limiter::RateLimiter;

/// Tunables for [`RateController`].
#[derive(Debug, Clone)]
pub struct RateControllerConfig {
    /// Tick cadence.
    pub cadence: Duration,
    pub min_rpm: u32,
    pub max_rpm: u32,
    /// Initial rate. Defaults to `max_rpm` when zero.
    pub start_rpm: u32,
    /// Multiplicative decrease applied on congestion.
    pub decrease_factor: f64,
    /// Ramp factor while below `slow_start_until_rpm`.
    pub slow_start_factor: f64,
    /// Ramp factor once past slow start.
    pub increase_factor: f64,
    /// Boundary between the two ramp regimes. Defaults to half of
    /// `max_rpm` when zero.
    pub slow_start_until_rpm: u32,
    /// Error ratio at or above which the window counts as congested.
    pub error_ratio_threshold: f64,
}

impl Default for RateControllerConfig {
    fn default() -> Self {
        Self {
            cadence: Duration::from_secs(1),
            min_rpm: 60,
            max_rpm: 3000,
            start_rpm: 0,
            decrease_factor: 0.5,
            slow_start_factor: 2.0,
            increase_factor: 1.25,
            slow_start_until_rpm: 0,
            error_ratio_threshold: 0.08,
        }
    }
}

impl RateControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn with_min_rpm(mut self, rpm: u32) -> Self {
        self.min_rpm = rpm;
        self
    }

    pub fn with_max_rpm(mut self, rpm: u32) -> Self {
        self.max_rpm = rpm;
        self
    }

    pub fn with_start_rpm(mut self, rpm: u32) -> Self {
        self.start_rpm = rpm;
        self
    }

    pub fn with_decrease_factor(mut self, factor: f64) -> Self {
        self.decrease_factor = factor;
        self
    }

    pub fn with_slow_start_until_rpm(mut self, rpm: u32) -> Self {
        self.slow_start_until_rpm = rpm;
        self
    }

    fn resolved_start(&self) -> u32 {
        if self.start_rpm == 0 {
            self.max_rpm
        } else {
            self.start_rpm.clamp(self.min_rpm, self.max_rpm)
        }
    }

    fn resolved_slow_start_until(&self) -> u32 {
        if self.slow_start_until_rpm == 0 {
            self.max_rpm / 2
        } else {
            self.slow_start_until_rpm
        }
    }
}

#[derive(Debug)]
struct RateInner {
    adjustments: u64,
    last_decision: String,
}

/// Periodic ticker that retunes a [`RateLimiter`] from error-class signals.
///
/// Unlike the concurrency controller, latency is never consulted: the
/// endpoint's own rejection classes (429, timeout, network, 5xx) are the
/// whole congestion signal. One instance exists per request class so the
/// classes never share state.
pub struct RateController {
    name: String,
    limiter: Arc<RateLimiter>,
    window: Mutex<ObservationWindow>,
    inner: Mutex<RateInner>,
    config: RateControllerConfig,
}

impl RateController {
    pub fn new(name: impl Into<String>, limiter: Arc<RateLimiter>, config: RateControllerConfig) -> Self {
        limiter.set_rpm(config.resolved_start());
        Self {
            name: name.into(),
            limiter,
            window: Mutex::new(ObservationWindow::new()),
            inner: Mutex::new(RateInner {
                adjustments: 0,
                last_decision: "init".to_string(),
            }),
            config,
        }
    }

    /// Record one request outcome for this class.
    pub fn observe(&self, outcome: Outcome) {
        self.window.lock().record(outcome, Duration::ZERO);
    }

    /// Run one control decision over the drained window.
    pub fn tick(&self) {
        let stats = self.window.lock().drain();
        let mut inner = self.inner.lock();

        if stats.total() == 0 {
            inner.last_decision = "hold (empty window)".to_string();
            return;
        }

        let congested = stats.transport_errors() > 0
            || stats.error_ratio() >= self.config.error_ratio_threshold;

        let rpm = self.limiter.rpm();
        let (new_rpm, verb) = if congested {
            let next = ((rpm as f64 * self.config.decrease_factor).floor() as u32)
                .clamp(self.config.min_rpm, self.config.max_rpm);
            (next, "decrease")
        } else if stats.ok() > 0 {
            let factor = if rpm < self.config.resolved_slow_start_until() {
                self.config.slow_start_factor
            } else {
                self.config.increase_factor
            };
            let next = ((rpm as f64 * factor).ceil() as u32)
                .clamp(self.config.min_rpm, self.config.max_rpm);
            (next, "increase")
        } else {
            (rpm, "hold")
        };

        inner.last_decision = format!("{verb} {rpm} -> {new_rpm} rpm ({})", stats.summary());
        if new_rpm != rpm {
            inner.adjustments += 1;
            self.limiter.set_rpm(new_rpm);
            metrics::counter!(
                "throttle_rate_adjustments_total",
                "class" => self.name.clone(),
                "direction" => verb,
            )
            .increment(1);
        }
        debug!(class = %self.name, decision = %inner.last_decision, "rate controller tick");
    }

    /// Drive ticks at the configured cadence until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.cadence);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
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
            name: format!("rate:{}", self.name),
            limit: self.limiter.rpm() as u64,
            min_limit: self.config.min_rpm as u64,
            max_limit: self.config.max_rpm as u64,
            in_flight: None,
            ewma_ms: None,
            adjustments: inner.adjustments,
            last_decision: inner.last_decision.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(config: RateControllerConfig) -> RateController {
        let limiter = Arc::new(RateLimiter::new(0));
        RateController::new("test", limiter, config)
    }

    #[test]
    fn starts_at_max_by_default() {
        let c = controller(RateControllerConfig::default().with_max_rpm(1000));
        assert_eq!(c.snapshot().limit, 1000);
    }

    #[test]
    fn empty_window_holds() {
        let c = controller(RateControllerConfig::default().with_max_rpm(1000));
        c.tick();
        assert_eq!(c.snapshot().limit, 1000);
        assert!(c.snapshot().last_decision.contains("hold"));
    }

    #[test]
    fn congestion_decreases_to_min() {
        let c = controller(
            RateControllerConfig::default()
                .with_max_rpm(1000)
                .with_start_rpm(1000)
                .with_min_rpm(100)
                .with_decrease_factor(0.6),
        );

        let mut ticks = 0;
        while c.snapshot().limit > 100 {
            c.observe(Outcome::RateLimited);
            c.tick();
            ticks += 1;
            assert!(ticks <= 10, "should reach the floor within 10 ticks");
        }
        assert_eq!(c.snapshot().limit, 100);
    }

    #[test]
    fn slow_start_then_gentle_ramp() {
        let c = controller(
            RateControllerConfig::default()
                .with_min_rpm(100)
                .with_max_rpm(4000)
                .with_start_rpm(200)
                .with_slow_start_until_rpm(1000),
        );
        assert_eq!(c.snapshot().limit, 200);

        // Below the slow-start boundary: doubles.
        c.observe(Outcome::Ok);
        c.tick();
        assert_eq!(c.snapshot().limit, 400);
        c.observe(Outcome::Ok);
        c.tick();
        assert_eq!(c.snapshot().limit, 800);
        c.observe(Outcome::Ok);
        c.tick();
        assert_eq!(c.snapshot().limit, 1600);

        // Past it: 1.25x.
        c.observe(Outcome::Ok);
        c.tick();
        assert_eq!(c.snapshot().limit, 2000);
    }

    #[test]
    fn ramp_clamps_to_max() {
        let c = controller(
            RateControllerConfig::default()
                .with_max_rpm(1000)
                .with_start_rpm(900),
        );
        c.observe(Outcome::Ok);
        c.tick();
        assert_eq!(c.snapshot().limit, 1000);
    }

    #[test]
    fn latency_is_never_a_signal() {
        // Only outcomes count; a window of slow successes still ramps.
        let c = controller(
            RateControllerConfig::default()
                .with_max_rpm(2000)
                .with_start_rpm(500),
        );
        for _ in 0..50 {
            c.observe(Outcome::Ok);
        }
        c.tick();
        assert!(c.snapshot().last_decision.starts_with("increase"));
    }

    #[test]
    fn error_only_window_without_transport_class() {
        // 100% Other errors breaches the ratio threshold.
        let c = controller(
            RateControllerConfig::default()
                .with_max_rpm(1000)
                .with_start_rpm(1000)
                .with_min_rpm(100),
        );
        c.observe(Outcome::Other);
        c.tick();
        assert_eq!(c.snapshot().limit, 500);
    }
}
