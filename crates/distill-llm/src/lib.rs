//! LLM transport.
//!
//! Two operations against a remote model endpoint: single-prompt
//! generation and multi-item embedding. Both retry HTTP 429/5xx and
//! transport failures with bounded exponential-with-jitter back-off;
//! anything surviving the retries is returned to the caller, whose error
//! message carries enough of the HTTP detail for downstream outcome
//! classification.
//!
//! [`LlmApi`] is the seam the engine consumes; [`LlmClient`] is the real
//! HTTP implementation, and tests substitute stubs.

mod api;
mod client;
mod error;
mod types;

pub use api::LlmApi;
pub use client::{Auth, LlmClient, LlmClientConfig, RetryPolicy, TokenProvider};
pub use error::LlmError;
pub use types::{
    default_safety_settings, BatchEmbedRequest, BatchEmbedResponse, Candidate, Content,
    ContentEmbedding, EmbedContentRequest, GenerateRequest, GenerateResponse, GenerationConfig,
    Part, PromptFeedback, SafetySetting, ThinkingConfig, UsageMetadata,
};
