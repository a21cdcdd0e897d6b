use thiserror::Error;

/// Transport-level failures.
///
/// `Display` output is load-bearing: the controllers classify outcomes by
/// substring, so the HTTP status code and the underlying I/O detail are
/// always included in the rendered message.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("auth: {0}")]
    Auth(String),
}

impl LlmError {
    /// Whether the retry loop should try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Status { code, .. } => *code == 429 || (500..600).contains(code),
            LlmError::Transport(_) => true,
            LlmError::Decode(_) | LlmError::Auth(_) => false,
        }
    }
}
