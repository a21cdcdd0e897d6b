//! The model endpoint seam.

use async_trait::async_trait;

use crate::error::LlmError;
use crate::types::{GenerateRequest, GenerateResponse};

/// The two operations the engine needs from the model endpoint.
///
/// The engine holds this as a trait object so tests (and alternative
/// transports) can substitute implementations without touching the
/// handlers. For embeddings, response slot `i` answers input slot `i`.
#[async_trait]
pub trait LlmApi: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        request: GenerateRequest,
    ) -> Result<GenerateResponse, LlmError>;

    async fn embed_batch(&self, model: &str, texts: &[String])
        -> Result<Vec<Vec<f64>>, LlmError>;
}
