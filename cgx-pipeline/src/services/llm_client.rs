//! External AI capability
//!
//! Two seams, both async traits so tests can substitute in-process mocks:
//! - `CompletionProvider`: structured (JSON schema) text for a prompt
//! - `EmbeddingProvider`: one vector per input text
//!
//! `OpenAiClient` implements both against any OpenAI-compatible API. Requests are
//! paced with a token-bucket limiter; retries belong to the callers.

use async_trait::async_trait;
use cgx_common::config::ProviderSettings;
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("cgx-pipeline/", env!("CARGO_PKG_VERSION"));

/// External AI provider errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Response did not parse or failed schema validation
    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    #[error("No API key configured")]
    MissingApiKey,

    #[error("Client configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Timeouts, network faults, 429, 5xx and malformed output are worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Network(_)
            | ProviderError::Timeout
            | ProviderError::RateLimited(_)
            | ProviderError::MalformedOutput(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::MissingApiKey | ProviderError::Config(_) => false,
        }
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            ProviderError::RateLimited(body)
        } else {
            ProviderError::Api {
                status: status.as_u16(),
                message: body,
            }
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// One structured-output request
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    /// Name of the JSON schema (e.g. "conversation_summary")
    pub schema_name: String,
    pub schema: Value,
    /// Overrides the provider's default chat model
    pub model: Option<String>,
}

/// Produces structured text for a prompt
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Returns the raw JSON text of the structured response
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError>;
}

/// Produces vectors for texts
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// One vector per text, same order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    /// Largest number of texts accepted by one `embed` call
    fn max_batch_size(&self) -> usize {
        256
    }
}

type DirectLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// OpenAI-compatible chat completion and embedding client
pub struct OpenAiClient {
    http_client: Client,
    api_key: String,
    base_url: String,
    chat_model: String,
    embedding_model: String,
    embedding_batch_size: usize,
    rate_limiter: DirectLimiter,
}

impl OpenAiClient {
    pub fn new(settings: &ProviderSettings, api_key: String) -> Result<Self, ProviderError> {
        if api_key.trim().is_empty() {
            return Err(ProviderError::MissingApiKey);
        }

        let http_client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Config(e.to_string()))?;

        let per_second = NonZeroU32::new(settings.requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            http_client,
            api_key,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            chat_model: settings.chat_model.clone(),
            embedding_model: settings.embedding_model.clone(),
            embedding_batch_size: settings.embedding_batch_size.max(1),
            rate_limiter: RateLimiter::direct(Quota::per_second(per_second)),
        })
    }

    async fn post_json(&self, path: &str, payload: &Value) -> Result<Value, ProviderError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::from_status(status, body));
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedOutput(format!("response is not JSON: {}", e)))
    }
}

/// Chat completion payload with a strict JSON-schema response format
pub fn build_completion_payload(model: &str, request: &CompletionRequest) -> Value {
    json!({
        "model": model,
        "messages": [
            {"role": "system", "content": request.system},
            {"role": "user", "content": request.user}
        ],
        "response_format": {
            "type": "json_schema",
            "json_schema": {
                "name": request.schema_name,
                "strict": true,
                "schema": request.schema
            }
        }
    })
}

/// Content of the first choice; refusals count as malformed output
pub fn parse_completion_response(response: &Value) -> Result<String, ProviderError> {
    let message = &response["choices"][0]["message"];
    if let Some(refusal) = message["refusal"].as_str() {
        return Err(ProviderError::MalformedOutput(format!("model refused: {}", refusal)));
    }
    message["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ProviderError::MalformedOutput("no message content in response".to_string()))
}

/// Vectors from an `/embeddings` response, ordered by `index`
pub fn parse_embedding_response(response: &Value, expected: usize) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = response["data"]
        .as_array()
        .ok_or_else(|| ProviderError::MalformedOutput("no data array in response".to_string()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item["index"].as_u64().map(|i| i as usize).unwrap_or(position);
        let vector = item["embedding"]
            .as_array()
            .ok_or_else(|| ProviderError::MalformedOutput(format!("item {} has no embedding", index)))?
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| ProviderError::MalformedOutput(format!("item {} has a non-numeric component", index)))
            })
            .collect::<Result<Vec<f32>, _>>()?;
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(index, _)| *index);

    if indexed.len() != expected {
        return Err(ProviderError::MalformedOutput(format!(
            "expected {} embeddings, got {}",
            expected,
            indexed.len()
        )));
    }

    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[async_trait]
impl CompletionProvider for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        let model = request.model.as_deref().unwrap_or(&self.chat_model);
        let payload = build_completion_payload(model, request);

        tracing::debug!(model, schema = %request.schema_name, "Sending completion request");
        let response = self.post_json("/chat/completions", &payload).await?;
        parse_completion_response(&response)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let payload = json!({
            "model": self.embedding_model,
            "input": texts,
        });

        tracing::debug!(model = %self.embedding_model, count = texts.len(), "Sending embedding request");
        let response = self.post_json("/embeddings", &payload).await?;
        parse_embedding_response(&response, texts.len())
    }

    fn max_batch_size(&self) -> usize {
        self.embedding_batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::RateLimited("slow down".into()).is_transient());
        assert!(ProviderError::MalformedOutput("bad json".into()).is_transient());
        assert!(ProviderError::Api { status: 503, message: String::new() }.is_transient());
        assert!(!ProviderError::Api { status: 400, message: String::new() }.is_transient());
        assert!(!ProviderError::Api { status: 401, message: String::new() }.is_transient());
        assert!(!ProviderError::MissingApiKey.is_transient());
    }

    #[test]
    fn test_429_maps_to_rate_limited() {
        let err = ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, "quota".into());
        assert_eq!(err, ProviderError::RateLimited("quota".into()));
    }

    #[test]
    fn test_completion_payload_uses_strict_schema() {
        let request = CompletionRequest {
            system: "sys".into(),
            user: "usr".into(),
            schema_name: "conversation_summary".into(),
            schema: json!({"type": "object"}),
            model: None,
        };
        let payload = build_completion_payload("gpt-4o-mini", &request);

        assert_eq!(payload["model"], "gpt-4o-mini");
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1]["content"], "usr");
        assert_eq!(payload["response_format"]["json_schema"]["strict"], true);
        assert_eq!(payload["response_format"]["json_schema"]["name"], "conversation_summary");
    }

    #[test]
    fn test_parse_completion_content_and_refusal() {
        let ok = json!({"choices": [{"message": {"content": "{\"a\":1}", "refusal": null}}]});
        assert_eq!(parse_completion_response(&ok).unwrap(), "{\"a\":1}");

        let refused = json!({"choices": [{"message": {"content": null, "refusal": "no"}}]});
        assert!(matches!(
            parse_completion_response(&refused),
            Err(ProviderError::MalformedOutput(_))
        ));
    }

    #[test]
    fn test_parse_embeddings_reorders_by_index() {
        let response = json!({"data": [
            {"index": 1, "embedding": [3.0, 4.0]},
            {"index": 0, "embedding": [1.0, 2.0]}
        ]});
        let vectors = parse_embedding_response(&response, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 2.0], vec![3.0, 4.0]]);

        assert!(parse_embedding_response(&response, 3).is_err());
    }

    #[test]
    fn test_empty_api_key_is_rejected() {
        let result = OpenAiClient::new(&ProviderSettings::default(), "  ".to_string());
        assert!(matches!(result, Err(ProviderError::MissingApiKey)));
    }
}
