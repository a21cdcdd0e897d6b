//! Handler contract and job payloads.

use async_trait::async_trait;
use distill_store::Job;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

/// One job execution. The scheduler dispatches on the job's type tag and
/// is otherwise oblivious to handler internals; new job types are added by
/// registering a handler, not by touching the scheduler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, cancel: &CancellationToken, job: &Job) -> Result<(), EngineError>;
}

/// Payload of an analysis job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisPayload {
    pub analysis_type_id: String,
    pub episode_id: String,
}

impl AnalysisPayload {
    /// The enqueue-level idempotency key for this work.
    pub fn job_key(&self) -> String {
        format!("analysis:{}:{}", self.analysis_type_id, self.episode_id)
    }
}

/// Payload of an embedding job. The target kind travels as its string
/// form so payloads stay readable in the jobs table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmbedPayload {
    pub target_kind: String,
    pub target_id: String,
}

impl EmbedPayload {
    pub fn job_key(&self, model: &str) -> String {
        format!("embed:{}:{}:{}", self.target_kind, self.target_id, model)
    }
}

/// Decode a job payload, mapping malformed bytes to the non-retryable
/// payload error.
pub(crate) fn decode_payload<T: DeserializeOwned>(job: &Job) -> Result<T, EngineError> {
    serde_json::from_slice(&job.payload)
        .map_err(|e| EngineError::Payload(format!("job {}: {e}", job.id)))
}
