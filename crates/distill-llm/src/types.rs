//! Wire types for the model endpoint.

use serde::{Deserialize, Serialize};

/// One text part of a content block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Part {
    pub text: String,
}

/// A content block: an optional role and its parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Some("user".to_string()),
            parts: vec![Part { text: text.into() }],
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            role: None,
            parts: vec![Part { text: text.into() }],
        }
    }
}

/// One safety category override.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

/// The engine analyzes arbitrary user conversations, so every category is
/// explicitly relaxed and blocking is surfaced through the prompt feedback
/// instead of silent truncation.
pub fn default_safety_settings() -> Vec<SafetySetting> {
    [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ]
    .into_iter()
    .map(|category| SafetySetting {
        category: category.to_string(),
        threshold: "BLOCK_NONE".to_string(),
    })
    .collect()
}

/// Thinking-budget override; zero asks for minimal deliberation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    pub thinking_budget: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

/// A generation request.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub safety_settings: Vec<SafetySetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

impl GenerateRequest {
    /// A single-prompt request with the engine's default safety settings.
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            contents: vec![Content::user(prompt)],
            safety_settings: default_safety_settings(),
            generation_config: None,
        }
    }

    /// Ask for JSON-only output, optionally constrained by a schema.
    pub fn with_json_output(mut self, schema: Option<serde_json::Value>) -> Self {
        let config = self.generation_config.get_or_insert_with(Default::default);
        config.response_mime_type = Some("application/json".to_string());
        config.response_schema = schema;
        self
    }

    /// Ask for minimal model deliberation.
    pub fn with_minimal_thinking(mut self) -> Self {
        let config = self.generation_config.get_or_insert_with(Default::default);
        config.thinking_config = Some(ThinkingConfig { thinking_budget: 0 });
        self
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: Option<u64>,
    #[serde(default)]
    pub candidates_token_count: Option<u64>,
}

/// A generation response.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
}

impl GenerateResponse {
    /// Concatenated text of the first candidate, or `None` when the
    /// response carries no usable output.
    pub fn text(&self) -> Option<String> {
        let candidate = self.candidates.first()?;
        let content = candidate.content.as_ref()?;
        if content.parts.is_empty() {
            return None;
        }
        let joined: String = content
            .parts
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("");
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }

    /// The block reason reported by the endpoint's safety filter, if any.
    pub fn block_reason(&self) -> Option<&str> {
        self.prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmbedContentRequest {
    pub model: String,
    pub content: Content,
}

/// A multi-item embedding request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchEmbedRequest {
    pub requests: Vec<EmbedContentRequest>,
}

impl BatchEmbedRequest {
    pub fn new(model: &str, texts: &[String]) -> Self {
        Self {
            requests: texts
                .iter()
                .map(|text| EmbedContentRequest {
                    model: format!("models/{model}"),
                    content: Content::text(text.clone()),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContentEmbedding {
    pub values: Vec<f64>,
}

/// A multi-item embedding response; slot `i` answers input slot `i`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchEmbedResponse {
    #[serde(default)]
    pub embeddings: Vec<ContentEmbedding>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization_is_camel_case() {
        let request = GenerateRequest::from_prompt("Summarize: hello")
            .with_json_output(Some(serde_json::json!({"type": "object"})))
            .with_minimal_thinking();
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][0]["text"], "Summarize: hello");
        assert_eq!(json["safetySettings"][0]["threshold"], "BLOCK_NONE");
        assert_eq!(
            json["generationConfig"]["responseMimeType"],
            "application/json"
        );
        assert_eq!(json["generationConfig"]["thinkingConfig"]["thinkingBudget"], 0);
    }

    #[test]
    fn plain_request_omits_generation_config() {
        let json = serde_json::to_value(GenerateRequest::from_prompt("hi")).unwrap();
        assert!(json.get("generationConfig").is_none());
    }

    #[test]
    fn response_text_joins_parts() {
        let response: GenerateResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "a "}, {"text": "summary"}]}}],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 3}
        }))
        .unwrap();
        assert_eq!(response.text().as_deref(), Some("a summary"));
        assert_eq!(response.block_reason(), None);
        assert_eq!(
            response.usage_metadata.unwrap().prompt_token_count,
            Some(12)
        );
    }

    #[test]
    fn blocked_response_has_no_text() {
        let response: GenerateResponse = serde_json::from_value(serde_json::json!({
            "candidates": [],
            "promptFeedback": {"blockReason": "SAFETY"}
        }))
        .unwrap();
        assert_eq!(response.text(), None);
        assert_eq!(response.block_reason(), Some("SAFETY"));
    }

    #[test]
    fn batch_embed_request_prefixes_model() {
        let request = BatchEmbedRequest::new("embed-1", &["x".to_string(), "y".to_string()]);
        assert_eq!(request.requests.len(), 2);
        assert_eq!(request.requests[0].model, "models/embed-1");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["requests"][1]["content"]["parts"][0]["text"], "y");
    }

    #[test]
    fn embed_response_preserves_slot_order() {
        let response: BatchEmbedResponse = serde_json::from_value(serde_json::json!({
            "embeddings": [{"values": [1.0, 2.0]}, {"values": [3.0, 4.0]}]
        }))
        .unwrap();
        assert_eq!(response.embeddings[0].values, vec![1.0, 2.0]);
        assert_eq!(response.embeddings[1].values, vec![3.0, 4.0]);
    }
}
