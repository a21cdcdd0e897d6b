//! Fixed-cadence observation windows.
//!
//! Controllers accumulate per-outcome counts and a latency sum between
//! ticks, then drain the window on each tick and decide from the drained
//! snapshot. The window itself is not synchronized; callers wrap it in the
//! lock of their choice.

use std::time::Duration;

use crate::outcome::Outcome;

/// Mutable accumulator for one controller window.
#[derive(Debug, Default)]
pub struct ObservationWindow {
    counts: [u64; 6],
    latency_sum: Duration,
}

impl ObservationWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation.
    pub fn record(&mut self, outcome: Outcome, latency: Duration) {
        self.counts[outcome.index()] += 1;
        self.latency_sum += latency;
    }

    /// Total observations currently in the window.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Drain the window, returning the accumulated stats and resetting all
    /// counters to zero.
    pub fn drain(&mut self) -> WindowStats {
        let stats = WindowStats {
            counts: self.counts,
            latency_sum: self.latency_sum,
        };
        self.counts = [0; 6];
        self.latency_sum = Duration::ZERO;
        stats
    }
}

/// Immutable snapshot of one drained window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStats {
    counts: [u64; 6],
    latency_sum: Duration,
}

impl WindowStats {
    /// An empty window.
    pub fn empty() -> Self {
        Self {
            counts: [0; 6],
            latency_sum: Duration::ZERO,
        }
    }

    pub fn count(&self, outcome: Outcome) -> u64 {
        self.counts[outcome.index()]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn ok(&self) -> u64 {
        self.count(Outcome::Ok)
    }

    /// Observations of any failure class.
    pub fn errors(&self) -> u64 {
        self.total() - self.ok()
    }

    /// Observations of transport-level congestion classes.
    pub fn transport_errors(&self) -> u64 {
        Outcome::ALL
            .iter()
            .filter(|o| o.is_transport())
            .map(|o| self.count(*o))
            .sum()
    }

    /// Fraction of the window that failed, in `[0, 1]`. Zero for an empty
    /// window.
    pub fn error_ratio(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.errors() as f64 / total as f64
        }
    }

    pub fn latency_sum(&self) -> Duration {
        self.latency_sum
    }

    /// Mean latency over the window, or `None` when the window was empty.
    pub fn mean_latency(&self) -> Option<Duration> {
        let total = self.total();
        if total == 0 {
            None
        } else {
            Some(self.latency_sum / total as u32)
        }
    }

    /// Compact `ok=.. rl=.. to=.. net=.. srv=.. other=..` rendering used in
    /// controller decision strings.
    pub fn summary(&self) -> String {
        format!(
            "ok={} rl={} to={} net={} srv={} other={}",
            self.count(Outcome::Ok),
            self.count(Outcome::RateLimited),
            self.count(Outcome::Timeout),
            self.count(Outcome::NetError),
            self.count(Outcome::ServerError),
            self.count(Outcome::Other),
        )
    }
}
