//! HTTP client with bounded jittered retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::api::LlmApi;
use crate::error::LlmError;
use crate::types::{
    BatchEmbedRequest, BatchEmbedResponse, GenerateRequest, GenerateResponse,
};

/// Source of bearer tokens for deployments that do not use query-string
/// keys.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, LlmError>;
}

/// How requests authenticate.
#[derive(Clone)]
pub enum Auth {
    /// API key appended to the query string.
    QueryKey(String),
    /// Bearer token fetched per request from a provider.
    Bearer(Arc<dyn TokenProvider>),
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::QueryKey(_) => f.write_str("Auth::QueryKey(..)"),
            Auth::Bearer(_) => f.write_str("Auth::Bearer(..)"),
        }
    }
}

/// Bounded exponential back-off with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero-based), jittered to
    /// 50-150% of the exponential step.
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(retry.min(16)));
        exp.min(self.cap).mul_f64(rand::rng().random_range(0.5..1.5))
    }
}

/// Tunables for [`LlmClient`].
#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for LlmClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// The real HTTP transport.
#[derive(Debug, Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    config: LlmClientConfig,
    auth: Auth,
}

impl LlmClient {
    pub fn new(config: LlmClientConfig, auth: Auth) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { http, config, auth })
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, LlmError>
    where
        B: serde::Serialize,
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        let mut last_err: Option<LlmError> = None;

        for attempt in 0..self.config.retry.max_attempts {
            if attempt > 0 {
                let delay = self.config.retry.delay(attempt - 1);
                debug!(path, attempt, delay_ms = delay.as_millis() as u64, "retrying request");
                tokio::time::sleep(delay).await;
            }

            match self.post_once(&url, body).await {
                Ok(value) => {
                    if attempt > 0 {
                        metrics::counter!("llm_retries_recovered_total").increment(1);
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => {
                    warn!(path, attempt, error = %err, "retryable request failure");
                    metrics::counter!("llm_request_retries_total").increment(1);
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or(LlmError::Auth("retry loop without attempts".to_string())))
    }

    async fn post_once<B, T>(&self, url: &str, body: &B) -> Result<T, LlmError>
    where
        B: serde::Serialize,
        T: DeserializeOwned,
    {
        let mut request = self.http.post(url).json(body);
        request = match &self.auth {
            Auth::QueryKey(key) => request.query(&[("key", key.as_str())]),
            Auth::Bearer(provider) => request.bearer_auth(provider.token().await?),
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            let message = message.chars().take(512).collect::<String>();
            return Err(LlmError::Status {
                code: status.as_u16(),
                message: format!(
                    "{} {}",
                    status.canonical_reason().unwrap_or("error"),
                    message
                ),
            });
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl LlmApi for LlmClient {
    async fn generate(
        &self,
        model: &str,
        request: GenerateRequest,
    ) -> Result<GenerateResponse, LlmError> {
        self.post_json(&format!("models/{model}:generateContent"), &request)
            .await
    }

    async fn embed_batch(
        &self,
        model: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f64>>, LlmError> {
        let request = BatchEmbedRequest::new(model, texts);
        let response: BatchEmbedResponse = self
            .post_json(&format!("models/{model}:batchEmbedContents"), &request)
            .await?;
        Ok(response.embeddings.into_iter().map(|e| e.values).collect())
    }
}
