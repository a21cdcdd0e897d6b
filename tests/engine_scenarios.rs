//! End-to-end scenarios: enqueue, drain, and inspect the store.

mod support;

use std::time::Duration;

use distill_store::{
    vector, AnalysisRun, AnalysisType, Embedding, Facet, JobType, OutputKind, RunStatus,
    TargetKind,
};
use support::{fast_config, fixture, StubLlm};

async fn freeform_type(pool: &sqlx::SqlitePool, name: &str) -> AnalysisType {
    AnalysisType::insert(
        pool,
        name,
        "Summarize: {{episode}}",
        OutputKind::Freeform,
        None,
        None,
        false,
    )
    .await
    .expect("analysis type")
}

#[tokio::test]
async fn single_successful_analysis() {
    let fx = fixture(StubLlm::text("a fine summary"), fast_config()).await;
    let analysis_type = freeform_type(&fx.pool, "summary").await;

    let (_, inserted) = fx
        .engine
        .enqueue_analysis(&analysis_type, "ep-1")
        .await
        .unwrap();
    assert!(inserted);

    let summary = fx.engine.run_until_drained().await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.succeeded, 1);

    let run = AnalysisRun::find(&fx.pool, &analysis_type.id, "ep-1")
        .await
        .unwrap()
        .expect("exactly one analysis run");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output_text.as_deref(), Some("a fine summary"));
    assert!(run.completed_at.is_some());

    assert_eq!(fx.llm.generate_count(), 1);

    // Give the controllers a couple of ticks past the drain, then check
    // the decision is calm: hold or increase, never decrease.
    tokio::time::sleep(Duration::from_millis(120)).await;
    let snapshot = fx.engine.close().await.unwrap();
    let concurrency = snapshot
        .controllers
        .iter()
        .find(|c| c.name == "concurrency")
        .expect("concurrency controller snapshot");
    assert!(
        concurrency.last_decision.starts_with("hold")
            || concurrency.last_decision.starts_with("increase"),
        "unexpected decision: {}",
        concurrency.last_decision
    );
}

#[tokio::test]
async fn completed_analysis_is_never_rerun() {
    let fx = fixture(StubLlm::text("once only"), fast_config()).await;
    let analysis_type = freeform_type(&fx.pool, "summary").await;

    // Duplicate enqueue is dropped at the queue.
    let (_, first) = fx
        .engine
        .enqueue_analysis(&analysis_type, "ep-1")
        .await
        .unwrap();
    let (_, second) = fx
        .engine
        .enqueue_analysis(&analysis_type, "ep-1")
        .await
        .unwrap();
    assert!(first);
    assert!(!second);

    fx.engine.run_until_drained().await.unwrap();
    assert_eq!(fx.llm.generate_count(), 1);

    // Force a second execution of equivalent work past the queue-level
    // dedupe: the handler must observe the completed run and return
    // early without another model call.
    let payload = serde_json::json!({
        "analysis_type_id": analysis_type.id,
        "episode_id": "ep-1",
    });
    let (_, inserted) = fx
        .engine
        .queue()
        .enqueue(
            JobType::Analysis,
            "rerun-probe",
            payload.to_string().as_bytes(),
        )
        .await
        .unwrap();
    assert!(inserted);

    let summary = fx.engine.run_until_drained().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(fx.llm.generate_count(), 1, "no second generate call");

    let run = AnalysisRun::find(&fx.pool, &analysis_type.id, "ep-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output_text.as_deref(), Some("once only"));
    assert_eq!(run.retry_count, 0);
}

#[tokio::test]
async fn blocked_response_is_terminal_success() {
    let fx = fixture(StubLlm::blocked("SAFETY"), fast_config()).await;
    let analysis_type = freeform_type(&fx.pool, "summary").await;

    fx.engine
        .enqueue_analysis(&analysis_type, "ep-1")
        .await
        .unwrap();
    let summary = fx.engine.run_until_drained().await.unwrap();

    // The outer job completes; blocked is not an error.
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);

    let run = AnalysisRun::find(&fx.pool, &analysis_type.id, "ep-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Blocked);
    assert_eq!(run.blocked_reason.as_deref(), Some("SAFETY"));
    assert_eq!(run.output_text, None);

    let stats = fx.engine.queue().stats().await.unwrap();
    assert_eq!(stats.done, 1);
    assert_eq!(stats.dead, 0);
}

#[tokio::test]
async fn structured_output_writes_facets() {
    let output = r#"```json
{"people": [{"name": "Ada"}, {"name": "Grace"}], "mood": "warm"}
```"#;
    let fx = fixture(StubLlm::text(output), fast_config()).await;
    let analysis_type = AnalysisType::insert(
        &fx.pool,
        "entities",
        "Extract entities: {{episode}}",
        OutputKind::Structured,
        Some(serde_json::json!({
            "person": "people[].name",
            "mood": "mood",
        })),
        Some(serde_json::json!({"type": "object"})),
        true,
    )
    .await
    .unwrap();

    fx.engine
        .enqueue_analysis(&analysis_type, "ep-7")
        .await
        .unwrap();
    fx.engine.run_until_drained().await.unwrap();

    let run = AnalysisRun::find(&fx.pool, &analysis_type.id, "ep-7")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let facets = Facet::list_for_run(&fx.pool, &run.id).await.unwrap();
    let mut values: Vec<(String, String)> = facets
        .iter()
        .map(|f| (f.facet_type.clone(), f.value.clone()))
        .collect();
    values.sort();
    assert_eq!(
        values,
        vec![
            ("mood".to_string(), "warm".to_string()),
            ("person".to_string(), "Ada".to_string()),
            ("person".to_string(), "Grace".to_string()),
        ]
    );
    assert!(facets.iter().all(|f| f.episode_id == "ep-7"));
}

#[tokio::test]
async fn embedding_jobs_persist_packed_vectors() {
    let fx = fixture(StubLlm::text("unused"), fast_config()).await;
    fx.text.set_episode("ep-1", "a long talk about ships");

    fx.engine
        .enqueue_embedding(TargetKind::Episode, "ep-1")
        .await
        .unwrap();
    fx.engine
        .enqueue_embedding(TargetKind::Person, "alice")
        .await
        .unwrap();

    let summary = fx.engine.run_until_drained().await.unwrap();
    assert_eq!(summary.succeeded, 2);

    let row = Embedding::get(&fx.pool, TargetKind::Episode, "ep-1", "gemini-embedding-001")
        .await
        .unwrap()
        .expect("episode embedding row");
    assert_eq!(row.dimension as usize, fx.llm.dimension);
    assert_eq!(row.vector.len() as i64, 8 * row.dimension);
    assert_eq!(vector::unpack(&row.vector).unwrap(), vec![0.5; 4]);
    assert_eq!(row.text_hash.len(), 64);

    assert!(Embedding::get(&fx.pool, TargetKind::Person, "alice", "gemini-embedding-001")
        .await
        .unwrap()
        .is_some());

    // Re-enqueueing the same triple is dropped at the queue.
    let (_, inserted) = fx
        .engine
        .enqueue_embedding(TargetKind::Episode, "ep-1")
        .await
        .unwrap();
    assert!(!inserted);
}

#[tokio::test]
async fn empty_text_skips_cleanly() {
    let fx = fixture(StubLlm::text("unused"), fast_config()).await;
    fx.text.set_episode("hollow", "   ");

    fx.engine
        .enqueue_embedding(TargetKind::Episode, "hollow")
        .await
        .unwrap();
    let summary = fx.engine.run_until_drained().await.unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(fx.llm.embed_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(Embedding::get(&fx.pool, TargetKind::Episode, "hollow", "gemini-embedding-001")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn engine_close_is_idempotent_and_reports() {
    let fx = fixture(StubLlm::text("fin"), fast_config()).await;
    let analysis_type = freeform_type(&fx.pool, "summary").await;
    fx.engine
        .enqueue_analysis(&analysis_type, "ep-1")
        .await
        .unwrap();
    fx.engine.run_until_drained().await.unwrap();

    let first = fx.engine.close().await.unwrap();
    assert_eq!(first.queue.done, 1);
    assert_eq!(first.metrics.analysis.ok(), 1);

    let second = fx.engine.close().await.unwrap();
    assert_eq!(second.queue.done, 1);
}
