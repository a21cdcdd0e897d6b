//! Analysis handler: read -> prompt -> model (or local extractor) ->
//! facets -> persist.

use std::sync::Arc;

use async_trait::async_trait;
use distill_batch::WriteBatcher;
use distill_llm::{GenerateRequest, LlmApi};
use distill_store::{
    AnalysisRun, AnalysisType, BeginRun, Facet, Job, OutputKind,
};
use futures::future;
use hashbrown::HashMap;
use parking_lot::RwLock;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::extract;
use crate::handler::{decode_payload, AnalysisPayload, JobHandler};
use crate::metrics::{EngineMetrics, Phase, PhaseTimer, RequestClass};
use crate::text::{TextCache, TextSource};

/// Analysis computed locally instead of through the model endpoint.
///
/// Registering an extractor under an analysis type's name makes jobs of
/// that type bypass the LLM entirely.
#[async_trait]
pub trait LocalExtractor: Send + Sync {
    async fn extract(&self, episode_id: &str, input_text: &str) -> Result<String, EngineError>;
}

/// Shared registry of local extractors, keyed by analysis-type name.
pub(crate) type ExtractorRegistry = Arc<RwLock<HashMap<String, Arc<dyn LocalExtractor>>>>;

/// The placeholder the episode text is substituted into.
const EPISODE_PLACEHOLDER: &str = "{{episode}}";

pub struct AnalysisHandler {
    pool: SqlitePool,
    llm: Arc<dyn LlmApi>,
    text: Arc<dyn TextSource>,
    cache: Arc<TextCache>,
    writer: Option<Arc<WriteBatcher>>,
    extractors: ExtractorRegistry,
    model: String,
    metrics: Arc<EngineMetrics>,
}

impl AnalysisHandler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pool: SqlitePool,
        llm: Arc<dyn LlmApi>,
        text: Arc<dyn TextSource>,
        cache: Arc<TextCache>,
        writer: Option<Arc<WriteBatcher>>,
        extractors: ExtractorRegistry,
        model: String,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            llm,
            text,
            cache,
            writer,
            extractors,
            model,
            metrics,
        })
    }

    /// Select the text builder by analysis-type name. The default episode
    /// builder is the only cached path.
    async fn input_text(
        &self,
        type_name: &str,
        episode_id: &str,
    ) -> Result<String, EngineError> {
        match type_name {
            "pii" | "pii_facets" => self.text.episode_text_masked(episode_id).await,
            "turn_quality" => self.text.turn_quality_text(episode_id).await,
            _ => self.cache.episode_text(self.text.as_ref(), episode_id).await,
        }
    }

    async fn call_model(
        &self,
        analysis_type: &AnalysisType,
        prompt: String,
    ) -> Result<distill_llm::GenerateResponse, EngineError> {
        let mut request = GenerateRequest::from_prompt(prompt);
        if analysis_type.output_kind == OutputKind::Structured {
            request = request.with_json_output(analysis_type.response_schema.clone());
        }
        if analysis_type.minimal_thinking {
            request = request.with_minimal_thinking();
        }
        Ok(self.llm.generate(&self.model, request).await?)
    }

    /// Extract facets from structured output and persist them. Failures
    /// here warn and return; the textual output has independent value and
    /// the run still completes.
    async fn write_facets(
        &self,
        cancel: &CancellationToken,
        analysis_type: &AnalysisType,
        run: &AnalysisRun,
        output: &str,
    ) {
        let Some(spec) = &analysis_type.facet_spec else {
            return;
        };

        let parse_timer = PhaseTimer::start(&self.metrics, RequestClass::Analysis, Phase::Parse);
        let parsed = extract::parse_structured(output);
        parse_timer.finish();

        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(run = %run.id, error = %e, "facet extraction skipped: unparseable output");
                return;
            }
        };

        let mut facets = Vec::new();
        for (facet_type, path) in extract::facet_mappings(spec) {
            for value in extract::extract_path(&parsed, &path) {
                facets.push((facet_type.clone(), value));
            }
        }
        if facets.is_empty() {
            return;
        }

        let write_timer = PhaseTimer::start(&self.metrics, RequestClass::Analysis, Phase::DbWrite);
        let result = self.persist_facets(cancel, run, facets).await;
        write_timer.finish();
        if let Err(e) = result {
            warn!(run = %run.id, error = %e, "facet persistence failed");
        }
    }

    async fn persist_facets(
        &self,
        cancel: &CancellationToken,
        run: &AnalysisRun,
        facets: Vec<(String, String)>,
    ) -> Result<(), EngineError> {
        match &self.writer {
            Some(writer) => {
                let submits = facets.into_iter().map(|(facet_type, value)| {
                    let run_id = run.id.clone();
                    let episode_id = run.episode_id.clone();
                    writer.submit(
                        cancel,
                        Box::new(move |conn| {
                            Box::pin(async move {
                                Facet::insert_tx(conn, &run_id, &episode_id, &facet_type, &value)
                                    .await
                            })
                        }),
                    )
                });
                for result in future::join_all(submits).await {
                    result?;
                }
            }
            None => {
                let mut conn = self.pool.acquire().await.map_err(distill_store::StoreError::from)?;
                for (facet_type, value) in facets {
                    Facet::insert_tx(&mut conn, &run.id, &run.episode_id, &facet_type, &value)
                        .await
                        .map_err(distill_store::StoreError::from)?;
                }
            }
        }
        Ok(())
    }

    async fn run_analysis(
        &self,
        cancel: &CancellationToken,
        payload: &AnalysisPayload,
        analysis_type: &AnalysisType,
        run: &AnalysisRun,
    ) -> Result<(), EngineError> {
        let build_timer =
            PhaseTimer::start(&self.metrics, RequestClass::Analysis, Phase::TextBuild);
        let episode_text = self
            .input_text(&analysis_type.name, &payload.episode_id)
            .await?;
        build_timer.finish();

        let prompt = analysis_type
            .prompt_template
            .replace(EPISODE_PLACEHOLDER, &episode_text);

        let local = {
            let registry = self.extractors.read();
            registry.get(&analysis_type.name).cloned()
        };

        let output = match local {
            Some(extractor) => {
                debug!(analysis_type = %analysis_type.name, episode = %payload.episode_id,
                    "running local extractor");
                extractor.extract(&payload.episode_id, &episode_text).await?
            }
            None => {
                let api_timer =
                    PhaseTimer::start(&self.metrics, RequestClass::Analysis, Phase::Api);
                let response = self.call_model(analysis_type, prompt).await;
                api_timer.finish();
                let response = response?;

                if let Some(reason) = response.block_reason() {
                    debug!(run = %run.id, reason, "analysis blocked by safety filter");
                    AnalysisRun::mark_blocked(&self.pool, &run.id, reason).await?;
                    return Ok(());
                }
                response.text().ok_or(EngineError::EmptyOutput)?
            }
        };

        if analysis_type.output_kind == OutputKind::Structured {
            self.write_facets(cancel, analysis_type, run, &output).await;
        }

        let write_timer = PhaseTimer::start(&self.metrics, RequestClass::Analysis, Phase::DbWrite);
        AnalysisRun::mark_completed(&self.pool, &run.id, &output).await?;
        write_timer.finish();
        Ok(())
    }
}

#[async_trait]
impl JobHandler for AnalysisHandler {
    async fn handle(&self, cancel: &CancellationToken, job: &Job) -> Result<(), EngineError> {
        let payload: AnalysisPayload = decode_payload(job)?;

        let read_timer = PhaseTimer::start(&self.metrics, RequestClass::Analysis, Phase::DbRead);
        let analysis_type = AnalysisType::get(&self.pool, &payload.analysis_type_id).await?;
        let begun =
            AnalysisRun::begin(&self.pool, &payload.analysis_type_id, &payload.episode_id)
                .await?;
        read_timer.finish();

        let run = match begun {
            BeginRun::AlreadyTerminal(existing) => {
                debug!(
                    analysis_type = %analysis_type.name,
                    episode = %payload.episode_id,
                    status = ?existing.status,
                    "analysis already terminal; skipping"
                );
                return Ok(());
            }
            BeginRun::Started(run) => run,
        };

        match self.run_analysis(cancel, &payload, &analysis_type, &run).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Leave the failure on the run row; the job queue decides
                // whether the job itself retries.
                if !e.is_cancellation() {
                    if let Err(mark) =
                        AnalysisRun::mark_failed(&self.pool, &run.id, &e.to_string()).await
                    {
                        warn!(run = %run.id, error = %mark, "could not record run failure");
                    }
                }
                Err(e)
            }
        }
    }
}
