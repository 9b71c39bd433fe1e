//! HTTP backend for the Gemini `generateContent` REST endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::chain::{BackendChain, FallbackPolicy};
use super::usage::TokenUsage;
use super::{Completion, InferenceBackend, InferenceError, ResponseFormat, Result};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const MAX_ERROR_BODY_LEN: usize = 200;

/// Error bodies can echo request content; keep them short and secret-free.
fn sanitize_error_body(body: &str) -> String {
    const SECRET_MARKERS: &[&str] = &["api_key", "apikey", "key=", "bearer", "secret", "aiza"];

    let truncated: String = body.chars().take(MAX_ERROR_BODY_LEN).collect();
    let lower = truncated.to_lowercase();
    if SECRET_MARKERS.iter().any(|m| lower.contains(m)) {
        return "(response body redacted)".to_string();
    }
    truncated
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateResponse {
    fn usage(&self) -> Option<TokenUsage> {
        self.usage_metadata
            .as_ref()
            .map(|u| TokenUsage::new(u.prompt_token_count, u.candidates_token_count))
    }

    fn into_completion(self) -> Option<Completion> {
        let usage = self.usage();
        let content = self.candidates.into_iter().next()?.content?;
        let text: String = content.parts.into_iter().filter_map(|p| p.text).collect();
        if text.trim().is_empty() {
            None
        } else {
            Some(Completion::new(text, usage))
        }
    }
}

/// Rate limits and server errors are worth another try; other statuses are not.
fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// One Gemini model reached over HTTPS.
pub struct GeminiBackend {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl GeminiBackend {
    pub fn new(
        client: reqwest::Client,
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }

    fn failure(&self, message: impl Into<String>) -> InferenceError {
        InferenceError::Backend {
            backend: self.model.clone(),
            message: message.into(),
        }
    }

    fn transient(&self, message: impl Into<String>) -> InferenceError {
        InferenceError::Transient {
            backend: self.model.clone(),
            message: message.into(),
        }
    }
}

/// Build an HTTP client with a request timeout.
pub fn create_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| InferenceError::Backend {
            backend: "http".to_string(),
            message: format!("failed to create HTTP client: {e}"),
        })
}

/// One Gemini backend per model id in `policy`, sharing a client.
pub fn build_chain(policy: &FallbackPolicy, api_base: &str, api_key: &str) -> Result<BackendChain> {
    let timeout = Duration::from_millis(policy.call_timeout_ms);
    let client = create_http_client(timeout)?;
    let backends = policy
        .order
        .iter()
        .map(|model| {
            Arc::new(GeminiBackend::new(client.clone(), api_base, api_key, model.as_str()))
                as Arc<dyn InferenceBackend>
        })
        .collect();
    Ok(BackendChain::new(backends, timeout).with_retry(policy.retry))
}

#[async_trait]
impl InferenceBackend for GeminiBackend {
    fn id(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, format: ResponseFormat) -> Result<Completion> {
        let body = GenerateRequest {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                response_mime_type: format.mime_type(),
            },
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let retryable = is_retryable_network_error(&e);
                let message = format!("request failed: {}", e.without_url());
                if retryable {
                    self.transient(message)
                } else {
                    self.failure(message)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("HTTP {}: {}", status.as_u16(), sanitize_error_body(&text));
            return Err(if is_retryable_status(status.as_u16()) {
                self.transient(message)
            } else {
                self.failure(message)
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| self.failure(format!("unreadable response: {}", e.without_url())))?;
        parsed
            .into_completion()
            .ok_or_else(|| self.failure("response had no text candidates"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::RetryPolicy;

    #[test]
    fn request_body_shape() {
        let body = GenerateRequest {
            contents: [Content {
                parts: [Part { text: "scan this" }],
            }],
            generation_config: GenerationConfig {
                response_mime_type: ResponseFormat::Json.mime_type(),
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["text"], "scan this");
        assert_eq!(
            json["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }

    #[test]
    fn response_text_joins_parts() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"{\"a\":"},{"text":"1}"}]}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        let completion = parsed.into_completion().unwrap();
        assert_eq!(completion.text, "{\"a\":1}");
        assert!(completion.usage.is_none());
    }

    #[test]
    fn usage_metadata_is_carried() {
        let raw = r#"{
            "candidates": [{"content": {"parts": [{"text": "ok"}]}}],
            "usageMetadata": {"promptTokenCount": 1200, "candidatesTokenCount": 85, "totalTokenCount": 1285}
        }"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        let completion = parsed.into_completion().unwrap();
        assert_eq!(completion.usage, Some(TokenUsage::new(1200, 85)));
    }

    #[test]
    fn rate_limits_and_server_errors_are_retryable() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn empty_candidates_yield_none() {
        let parsed: GenerateResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert!(parsed.into_completion().is_none());
        let parsed: GenerateResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert!(parsed.into_completion().is_none());
    }

    #[test]
    fn error_bodies_are_truncated_and_redacted() {
        let long = "x".repeat(1_000);
        assert_eq!(sanitize_error_body(&long).len(), MAX_ERROR_BODY_LEN);
        assert_eq!(
            sanitize_error_body("invalid API_KEY supplied"),
            "(response body redacted)"
        );
    }

    #[test]
    fn endpoint_joins_model() {
        let backend = GeminiBackend::new(
            reqwest::Client::new(),
            "https://example.test/v1beta/",
            "k",
            "gemini-flash-latest",
        );
        assert_eq!(
            backend.endpoint(),
            "https://example.test/v1beta/models/gemini-flash-latest:generateContent"
        );
        assert_eq!(backend.id(), "gemini-flash-latest");
    }

    #[test]
    fn build_chain_preserves_policy_order() {
        let policy = FallbackPolicy::new(["m1", "m2", "m3"], 10_000).with_retry(RetryPolicy::none());
        let chain = build_chain(&policy, DEFAULT_API_BASE, "k").unwrap();
        assert_eq!(chain.policy(), policy);
    }
}
