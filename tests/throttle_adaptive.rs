//! Adaptive back-pressure under sustained endpoint stress.

mod support;

use std::time::Duration;

use distill_core::Outcome;
use distill_store::{AnalysisType, OutputKind};
use distill_throttle::RateControllerConfig;
use support::{fast_config, fixture, StubLlm};

#[tokio::test]
async fn sustained_429_drives_rate_to_floor_and_jobs_dead() {
    let mut config = fast_config();
    config.queue.max_attempts = 4;
    config.analysis_rate = RateControllerConfig::default()
        .with_cadence(Duration::from_millis(25))
        .with_start_rpm(1000)
        .with_max_rpm(1000)
        .with_min_rpm(100)
        .with_decrease_factor(0.6);

    let fx = fixture(StubLlm::status(429), config).await;
    let analysis_type = AnalysisType::insert(
        &fx.pool,
        "summary",
        "Summarize: {{episode}}",
        OutputKind::Freeform,
        None,
        None,
        false,
    )
    .await
    .unwrap();

    for episode in ["ep-1", "ep-2", "ep-3"] {
        fx.engine
            .enqueue_analysis(&analysis_type, episode)
            .await
            .unwrap();
    }

    let summary = fx.engine.run_until_drained().await.unwrap();
    assert_eq!(summary.succeeded, 0);
    // 3 jobs x 4 attempts.
    assert_eq!(summary.failed, 12);

    let stats = fx.engine.queue().stats().await.unwrap();
    assert_eq!(stats.dead, 3);
    assert_eq!(stats.pending, 0);

    // Every job carries the rate-limited classification in its error.
    let errors: Vec<String> =
        sqlx::query_scalar("SELECT COALESCE(last_error, '') FROM jobs WHERE status = 'dead'")
            .fetch_all(&fx.pool)
            .await
            .unwrap();
    assert_eq!(errors.len(), 3);
    for error in &errors {
        assert_eq!(Outcome::classify(error), Outcome::RateLimited);
    }

    let snapshot = fx.engine.close().await.unwrap();

    // 1000 -> 600 -> 360 -> 216 -> 129 -> 100: at most ten decrease
    // ticks, and the floor holds.
    let rate = snapshot
        .controllers
        .iter()
        .find(|c| c.name == "rate:analysis")
        .expect("analysis rate controller");
    assert_eq!(rate.limit, 100);
    assert!(rate.adjustments >= 5, "adjustments {}", rate.adjustments);

    // The concurrency controller contracted from its ceiling too.
    let concurrency = snapshot
        .controllers
        .iter()
        .find(|c| c.name == "concurrency")
        .unwrap();
    assert!(
        concurrency.limit < concurrency.max_limit,
        "limit {} vs max {}",
        concurrency.limit,
        concurrency.max_limit
    );

    // Metrics counted every attempt as rate limited.
    assert_eq!(
        snapshot.metrics.analysis.outcome(Outcome::RateLimited),
        12
    );
    assert_eq!(snapshot.metrics.analysis.ok(), 0);
}

#[tokio::test]
async fn disable_adaptive_skips_in_flight_throttling() {
    let mut config = fast_config();
    config.disable_adaptive = true;

    let fx = fixture(StubLlm::text("ok"), config).await;
    let analysis_type = AnalysisType::insert(
        &fx.pool,
        "summary",
        "Summarize: {{episode}}",
        OutputKind::Freeform,
        None,
        None,
        false,
    )
    .await
    .unwrap();

    fx.engine
        .enqueue_analysis(&analysis_type, "ep-1")
        .await
        .unwrap();
    let summary = fx.engine.run_until_drained().await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let snapshot = fx.engine.close().await.unwrap();
    assert!(snapshot
        .controllers
        .iter()
        .all(|c| c.name != "concurrency"));
}

#[tokio::test]
async fn fixed_rpm_disables_the_rate_controller() {
    let mut config = fast_config();
    config.analysis_rpm = 600_000;
    config.embed_rpm = 600_000;

    let fx = fixture(StubLlm::text("ok"), config).await;
    let analysis_type = AnalysisType::insert(
        &fx.pool,
        "summary",
        "Summarize: {{episode}}",
        OutputKind::Freeform,
        None,
        None,
        false,
    )
    .await
    .unwrap();

    fx.engine
        .enqueue_analysis(&analysis_type, "ep-1")
        .await
        .unwrap();
    fx.engine.run_until_drained().await.unwrap();

    let snapshot = fx.engine.close().await.unwrap();
    assert!(snapshot.controllers.iter().all(|c| !c.name.starts_with("rate:")));
}
