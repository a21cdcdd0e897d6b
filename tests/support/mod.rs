//! Shared fixtures for the integration suites: a scriptable model
//! endpoint, an in-memory text source, and an engine wired against a
//! temporary on-disk store.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use distill_engine::{Engine, EngineConfig, EngineError, TextSource};
use distill_llm::{
    Candidate, Content, GenerateRequest, GenerateResponse, LlmApi, LlmError, PromptFeedback,
};
use distill_store::QueueConfig;
use distill_throttle::RateControllerConfig;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// What the stub endpoint does on each generate call.
#[derive(Debug, Clone)]
pub enum GenerateBehavior {
    /// Return this text.
    Text(String),
    /// Return an empty candidate list with this block reason.
    Blocked(String),
    /// Fail with this HTTP status.
    Status(u16),
}

/// Scriptable in-process model endpoint.
pub struct StubLlm {
    pub generate_calls: AtomicUsize,
    pub embed_calls: AtomicUsize,
    pub embed_batch_sizes: Mutex<Vec<usize>>,
    behavior: Mutex<GenerateBehavior>,
    pub dimension: usize,
}

impl StubLlm {
    pub fn with_behavior(behavior: GenerateBehavior) -> Arc<Self> {
        Arc::new(Self {
            generate_calls: AtomicUsize::new(0),
            embed_calls: AtomicUsize::new(0),
            embed_batch_sizes: Mutex::new(Vec::new()),
            behavior: Mutex::new(behavior),
            dimension: 4,
        })
    }

    pub fn text(output: &str) -> Arc<Self> {
        Self::with_behavior(GenerateBehavior::Text(output.to_string()))
    }

    pub fn blocked(reason: &str) -> Arc<Self> {
        Self::with_behavior(GenerateBehavior::Blocked(reason.to_string()))
    }

    pub fn status(code: u16) -> Arc<Self> {
        Self::with_behavior(GenerateBehavior::Status(code))
    }

    pub fn generate_count(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }
}

fn status_error(code: u16) -> LlmError {
    let message = match code {
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "error",
    };
    LlmError::Status {
        code,
        message: message.to_string(),
    }
}

#[async_trait]
impl LlmApi for StubLlm {
    async fn generate(
        &self,
        _model: &str,
        _request: GenerateRequest,
    ) -> Result<GenerateResponse, LlmError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior.lock().unwrap().clone() {
            GenerateBehavior::Text(text) => Ok(GenerateResponse {
                candidates: vec![Candidate {
                    content: Some(Content::text(text)),
                }],
                prompt_feedback: None,
                usage_metadata: None,
            }),
            GenerateBehavior::Blocked(reason) => Ok(GenerateResponse {
                candidates: vec![],
                prompt_feedback: Some(PromptFeedback {
                    block_reason: Some(reason),
                }),
                usage_metadata: None,
            }),
            GenerateBehavior::Status(code) => Err(status_error(code)),
        }
    }

    async fn embed_batch(
        &self,
        _model: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f64>>, LlmError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        self.embed_batch_sizes.lock().unwrap().push(texts.len());
        if let GenerateBehavior::Status(code) = *self.behavior.lock().unwrap() {
            return Err(status_error(code));
        }
        Ok(texts.iter().map(|_| vec![0.5; self.dimension]).collect())
    }
}

/// Text builders backed by a map, with deterministic defaults for ids the
/// map does not know.
#[derive(Default)]
pub struct MemoryTextSource {
    pub episodes: Mutex<std::collections::HashMap<String, String>>,
}

impl MemoryTextSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_episode(&self, id: &str, text: &str) {
        self.episodes
            .lock()
            .unwrap()
            .insert(id.to_string(), text.to_string());
    }

    fn episode(&self, id: &str) -> String {
        self.episodes
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| format!("episode {id}: two people talk about the weather"))
    }
}

#[async_trait]
impl TextSource for MemoryTextSource {
    async fn episode_text(&self, id: &str) -> Result<String, EngineError> {
        Ok(self.episode(id))
    }
    async fn episode_text_masked(&self, id: &str) -> Result<String, EngineError> {
        Ok(format!("[masked] {}", self.episode(id)))
    }
    async fn turn_quality_text(&self, id: &str) -> Result<String, EngineError> {
        Ok(format!("turns of {id}"))
    }
    async fn facet_text(&self, id: &str) -> Result<String, EngineError> {
        Ok(format!("facet {id}"))
    }
    async fn person_text(&self, id: &str) -> Result<String, EngineError> {
        Ok(format!("person {id}"))
    }
    async fn document_text(&self, key: &str) -> Result<String, EngineError> {
        Ok(format!("document {key}"))
    }
}

/// Engine plus the pieces tests assert against.
pub struct Fixture {
    pub _dir: TempDir,
    pub pool: SqlitePool,
    pub llm: Arc<StubLlm>,
    pub text: Arc<MemoryTextSource>,
    pub engine: Arc<Engine>,
}

/// Config with all timers dialed down for tests.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::new()
        .with_worker_count(4)
        .with_controller_cadence(Duration::from_millis(40))
        .with_write_batching(25, Duration::from_millis(20))
        .with_embedding_batching(100, Duration::from_millis(20))
        .with_lease_duration(Duration::from_secs(5));
    config.queue = QueueConfig {
        max_attempts: 3,
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(5),
    };
    config.analysis_rate = RateControllerConfig::default()
        .with_cadence(Duration::from_millis(40))
        .with_min_rpm(60)
        .with_max_rpm(600_000);
    config.embed_rate = RateControllerConfig::default()
        .with_cadence(Duration::from_millis(40))
        .with_min_rpm(60)
        .with_max_rpm(600_000);
    config
}

pub async fn fixture(llm: Arc<StubLlm>, config: EngineConfig) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = distill_store::connect(&dir.path().join("distill.db"), 8)
        .await
        .expect("store");
    let text = MemoryTextSource::new();
    let engine = Engine::new(
        pool.clone(),
        Arc::clone(&llm) as Arc<dyn LlmApi>,
        Arc::clone(&text) as Arc<dyn TextSource>,
        config,
    );
    Fixture {
        _dir: dir,
        pool,
        llm,
        text,
        engine,
    }
}
