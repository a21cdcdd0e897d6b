//! In-process metrics plane.
//!
//! Counters live in atomics so the hot path never takes a lock, and the
//! same observations are mirrored to the `metrics` facade for whatever
//! recorder the host process installs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use distill_core::Outcome;

/// The two request classes whose controller signals stay unmixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    Analysis,
    Embedding,
}

impl RequestClass {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestClass::Analysis => "analysis",
            RequestClass::Embedding => "embedding",
        }
    }
}

/// Phases a handler invocation is broken into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    DbRead,
    TextBuild,
    Api,
    Parse,
    DbWrite,
    Overall,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::DbRead,
        Phase::TextBuild,
        Phase::Api,
        Phase::Parse,
        Phase::DbWrite,
        Phase::Overall,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::DbRead => "db_read",
            Phase::TextBuild => "text_build",
            Phase::Api => "api",
            Phase::Parse => "parse",
            Phase::DbWrite => "db_write",
            Phase::Overall => "overall",
        }
    }

    fn index(self) -> usize {
        match self {
            Phase::DbRead => 0,
            Phase::TextBuild => 1,
            Phase::Api => 2,
            Phase::Parse => 3,
            Phase::DbWrite => 4,
            Phase::Overall => 5,
        }
    }
}

#[derive(Debug, Default)]
struct ClassMetrics {
    outcomes: [AtomicU64; 6],
    phase_nanos: [AtomicU64; 6],
    jobs: AtomicU64,
}

impl ClassMetrics {
    fn snapshot(&self) -> ClassSnapshot {
        let mut outcomes = [0u64; 6];
        for (slot, counter) in outcomes.iter_mut().zip(&self.outcomes) {
            *slot = counter.load(Ordering::Relaxed);
        }
        let mut phase_seconds = [0f64; 6];
        for (slot, counter) in phase_seconds.iter_mut().zip(&self.phase_nanos) {
            *slot = counter.load(Ordering::Relaxed) as f64 / 1e9;
        }
        ClassSnapshot {
            outcomes,
            phase_seconds,
            jobs: self.jobs.load(Ordering::Relaxed),
        }
    }
}

/// Read-only view of one class's counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassSnapshot {
    outcomes: [u64; 6],
    phase_seconds: [f64; 6],
    pub jobs: u64,
}

impl ClassSnapshot {
    pub fn outcome(&self, outcome: Outcome) -> u64 {
        self.outcomes[outcome.index()]
    }

    pub fn ok(&self) -> u64 {
        self.outcome(Outcome::Ok)
    }

    pub fn errors(&self) -> u64 {
        self.outcomes.iter().sum::<u64>() - self.ok()
    }

    pub fn phase_seconds(&self, phase: Phase) -> f64 {
        self.phase_seconds[phase.index()]
    }
}

/// Combined engine metrics, one [`ClassMetrics`] per request class.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    analysis: ClassMetrics,
    embedding: ClassMetrics,
}

/// Snapshot of both classes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub analysis: ClassSnapshot,
    pub embedding: ClassSnapshot,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn class(&self, class: RequestClass) -> &ClassMetrics {
        match class {
            RequestClass::Analysis => &self.analysis,
            RequestClass::Embedding => &self.embedding,
        }
    }

    pub fn record_job(&self, class: RequestClass) {
        self.class(class).jobs.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("engine_jobs_total", "class" => class.as_str()).increment(1);
    }

    pub fn record_outcome(&self, class: RequestClass, outcome: Outcome) {
        self.class(class).outcomes[outcome.index()].fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "engine_outcomes_total",
            "class" => class.as_str(),
            "outcome" => outcome.as_str(),
        )
        .increment(1);
    }

    pub fn record_phase(&self, class: RequestClass, phase: Phase, elapsed: Duration) {
        self.class(class).phase_nanos[phase.index()]
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        metrics::histogram!(
            "engine_phase_seconds",
            "class" => class.as_str(),
            "phase" => phase.as_str(),
        )
        .record(elapsed.as_secs_f64());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            analysis: self.analysis.snapshot(),
            embedding: self.embedding.snapshot(),
        }
    }
}

/// Times one phase and records it on drop-free happy paths.
pub(crate) struct PhaseTimer<'m> {
    metrics: &'m EngineMetrics,
    class: RequestClass,
    phase: Phase,
    start: std::time::Instant,
}

impl<'m> PhaseTimer<'m> {
    pub(crate) fn start(metrics: &'m EngineMetrics, class: RequestClass, phase: Phase) -> Self {
        Self {
            metrics,
            class,
            phase,
            start: std::time::Instant::now(),
        }
    }

    pub(crate) fn finish(self) {
        self.metrics
            .record_phase(self.class, self.phase, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_accumulate_per_class() {
        let metrics = EngineMetrics::new();
        metrics.record_outcome(RequestClass::Analysis, Outcome::Ok);
        metrics.record_outcome(RequestClass::Analysis, Outcome::RateLimited);
        metrics.record_outcome(RequestClass::Embedding, Outcome::Ok);

        let snap = metrics.snapshot();
        assert_eq!(snap.analysis.ok(), 1);
        assert_eq!(snap.analysis.outcome(Outcome::RateLimited), 1);
        assert_eq!(snap.analysis.errors(), 1);
        assert_eq!(snap.embedding.ok(), 1);
        assert_eq!(snap.embedding.errors(), 0);
    }

    #[test]
    fn phases_accumulate_seconds() {
        let metrics = EngineMetrics::new();
        metrics.record_phase(RequestClass::Embedding, Phase::Api, Duration::from_millis(250));
        metrics.record_phase(RequestClass::Embedding, Phase::Api, Duration::from_millis(750));

        let snap = metrics.snapshot();
        let api = snap.embedding.phase_seconds(Phase::Api);
        assert!((api - 1.0).abs() < 1e-6, "api seconds {api}");
        assert_eq!(snap.analysis.phase_seconds(Phase::Api), 0.0);
    }

    #[test]
    fn phase_timer_records_on_finish() {
        let metrics = EngineMetrics::new();
        let timer = PhaseTimer::start(&metrics, RequestClass::Analysis, Phase::DbRead);
        timer.finish();
        assert!(metrics.snapshot().analysis.phase_seconds(Phase::DbRead) >= 0.0);
    }
}
