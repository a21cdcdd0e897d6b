//! Embedding handler: resolve text -> batch embed -> pack -> upsert.

use std::sync::Arc;

use async_trait::async_trait;
use distill_batch::{BatchError, EmbedBackend, EmbedBatcher, WriteBatcher};
use distill_llm::LlmApi;
use distill_store::{vector, Embedding, Job, TargetKind};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::EngineError;
use crate::handler::{decode_payload, EmbedPayload, JobHandler};
use crate::metrics::{EngineMetrics, Phase, PhaseTimer, RequestClass};
use crate::text::{TextCache, TextSource};

/// Bridges the model endpoint into the batcher's backend seam.
pub(crate) struct LlmEmbedBackend {
    api: Arc<dyn LlmApi>,
    model: String,
}

impl LlmEmbedBackend {
    pub(crate) fn new(api: Arc<dyn LlmApi>, model: String) -> Arc<Self> {
        Arc::new(Self { api, model })
    }
}

#[async_trait]
impl EmbedBackend for LlmEmbedBackend {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, BatchError> {
        self.api
            .embed_batch(&self.model, texts)
            .await
            // The rendered message keeps the HTTP detail, so outcome
            // classification still sees 429s and 5xxs through the batcher.
            .map_err(|e| BatchError::Backend(e.to_string()))
    }
}

fn sha256_hex(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub struct EmbedHandler {
    pool: SqlitePool,
    batcher: Arc<EmbedBatcher>,
    text: Arc<dyn TextSource>,
    cache: Arc<TextCache>,
    writer: Option<Arc<WriteBatcher>>,
    model: String,
    metrics: Arc<EngineMetrics>,
}

impl EmbedHandler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pool: SqlitePool,
        batcher: Arc<EmbedBatcher>,
        text: Arc<dyn TextSource>,
        cache: Arc<TextCache>,
        writer: Option<Arc<WriteBatcher>>,
        model: String,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            batcher,
            text,
            cache,
            writer,
            model,
            metrics,
        })
    }

    async fn target_text(&self, kind: TargetKind, id: &str) -> Result<String, EngineError> {
        match kind {
            TargetKind::Episode => self.cache.episode_text(self.text.as_ref(), id).await,
            TargetKind::Facet => self.text.facet_text(id).await,
            TargetKind::Person => self.text.person_text(id).await,
            TargetKind::Document => self.text.document_text(id).await,
        }
    }

    async fn persist(
        &self,
        cancel: &CancellationToken,
        kind: TargetKind,
        target_id: &str,
        blob: Vec<u8>,
        dimension: i64,
        text_hash: String,
    ) -> Result<(), EngineError> {
        match &self.writer {
            Some(writer) => {
                let model = self.model.clone();
                let target_id = target_id.to_string();
                writer
                    .submit(
                        cancel,
                        Box::new(move |conn| {
                            Box::pin(async move {
                                Embedding::upsert_tx(
                                    conn, kind, &target_id, &model, &blob, dimension, &text_hash,
                                )
                                .await
                            })
                        }),
                    )
                    .await?;
            }
            None => {
                Embedding::upsert(
                    &self.pool, kind, target_id, &self.model, &blob, dimension, &text_hash,
                )
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for EmbedHandler {
    async fn handle(&self, cancel: &CancellationToken, job: &Job) -> Result<(), EngineError> {
        let payload: EmbedPayload = decode_payload(job)?;
        let kind = TargetKind::parse(&payload.target_kind).ok_or_else(|| {
            EngineError::Payload(format!("unknown target kind {:?}", payload.target_kind))
        })?;

        let build_timer =
            PhaseTimer::start(&self.metrics, RequestClass::Embedding, Phase::TextBuild);
        let text = self.target_text(kind, &payload.target_id).await?;
        build_timer.finish();

        if text.trim().is_empty() {
            debug!(kind = kind.as_str(), id = %payload.target_id, "empty text; skipping embed");
            return Ok(());
        }

        let api_timer = PhaseTimer::start(&self.metrics, RequestClass::Embedding, Phase::Api);
        let result = self
            .batcher
            .submit(cancel, kind.as_str(), &payload.target_id, text.clone())
            .await;
        api_timer.finish();
        let values = result?;

        let blob = vector::pack(&values);
        let dimension = values.len() as i64;
        let text_hash = sha256_hex(&text);

        let write_timer =
            PhaseTimer::start(&self.metrics, RequestClass::Embedding, Phase::DbWrite);
        let persisted = self
            .persist(cancel, kind, &payload.target_id, blob, dimension, text_hash)
            .await;
        write_timer.finish();
        persisted
    }
}
