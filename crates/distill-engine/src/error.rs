use distill_batch::BatchError;
use distill_llm::LlmError;
use distill_store::StoreError;
use distill_throttle::ThrottleError;
use thiserror::Error;

/// Errors surfaced by handlers and the engine.
///
/// The `Display` rendering feeds outcome classification, so wrapped errors
/// keep their full message text.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("llm: {0}")]
    Llm(#[from] LlmError),

    #[error("batch: {0}")]
    Batch(#[from] BatchError),

    #[error("throttle: {0}")]
    Throttle(#[from] ThrottleError),

    /// The job payload could not be decoded; retrying cannot help.
    #[error("malformed payload: {0}")]
    Payload(String),

    /// The model produced no text and no block reason.
    #[error("empty model output")]
    EmptyOutput,

    /// Structured output that did not parse as JSON.
    #[error("structured output parse: {0}")]
    Parse(String),

    /// An external text builder failed.
    #[error("text build: {0}")]
    TextBuild(String),

    /// No handler registered for the job's type.
    #[error("no handler registered for job type {0}")]
    UnknownJobType(&'static str),
}

impl EngineError {
    /// Whether the job queue should retry a job that failed with this
    /// error. Malformed payloads and unregistered types never heal on
    /// retry; everything else might (the model is not deterministic, and
    /// transport conditions change).
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            EngineError::Payload(_) | EngineError::UnknownJobType(_)
        )
    }

    /// Whether this error is shutdown surfacing through the handler, as
    /// opposed to a real failure. A batcher reporting `Closed` is the
    /// same shutdown race seen from the other side; neither says anything
    /// about the endpoint, so neither feeds the controllers.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            EngineError::Throttle(ThrottleError::Cancelled)
                | EngineError::Batch(BatchError::Cancelled)
                | EngineError::Batch(BatchError::Closed)
        )
    }
}
