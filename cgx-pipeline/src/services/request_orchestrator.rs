//! Request orchestrator
//!
//! Issues a batch of structured-output requests with at most `max_parallel_requests`
//! in flight (`buffer_unordered`), retries transient failures with exponential
//! backoff, and returns one outcome per input in input order. Results land in a
//! pre-sized slot vector by index. Progress is reported from the collecting loop,
//! so item futures share nothing.
//!
//! A request that exhausts its retries is recorded as `ItemOutcome::Failed` for that
//! item only. Cancellation stops new requests from starting; requests already in
//! flight finish.

use crate::services::llm_client::{CompletionProvider, CompletionRequest, ProviderError};
use crate::utils::{retry_transient, Backoff};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A response type with a JSON schema and a validation step
pub trait StructuredOutput: Sized + Send + 'static {
    /// Schema name sent to the provider
    const SCHEMA_NAME: &'static str;

    fn schema() -> Value;

    /// Parse and validate raw provider output; the error text is logged
    fn parse(raw: &str) -> Result<Self, String>;
}

/// Deserialize a JSON response body, mapping serde errors to text
pub fn parse_json<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {}", e))
}

/// One prompt: fixed system instruction plus user content
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Per-item result of a batch
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome<T> {
    Done(T),
    /// Retries exhausted or permanent error
    Failed(ProviderError),
    /// Never started because the batch was cancelled
    Skipped,
}

impl<T> ItemOutcome<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            ItemOutcome::Done(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, ItemOutcome::Done(_))
    }

    /// Short reason for exclusion manifests
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            ItemOutcome::Done(_) => None,
            ItemOutcome::Failed(e) => Some(e.to_string()),
            ItemOutcome::Skipped => Some("cancelled before request was sent".to_string()),
        }
    }
}

/// Progress callback: (completed, total)
pub type ProgressFn<'a> = dyn Fn(usize, usize) + Send + Sync + 'a;

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_parallel_requests: usize,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Overrides the provider's default model
    pub model: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_requests: 24,
            max_retries: 3,
            backoff: Backoff::default(),
            model: None,
        }
    }
}

/// Bounded-concurrency structured request runner
#[derive(Clone)]
pub struct RequestOrchestrator {
    provider: Arc<dyn CompletionProvider>,
    config: OrchestratorConfig,
}

impl RequestOrchestrator {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: OrchestratorConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run a batch; output has exactly one entry per prompt, in prompt order
    pub async fn run<T: StructuredOutput>(
        &self,
        prompts: Vec<Prompt>,
        cancel_token: &CancellationToken,
        progress: Option<&ProgressFn<'_>>,
    ) -> Vec<ItemOutcome<T>> {
        let total = prompts.len();
        let concurrency = self.config.max_parallel_requests.max(1);

        tracing::debug!(
            schema = T::SCHEMA_NAME,
            total,
            concurrency,
            "Starting request batch"
        );

        let mut slots: Vec<ItemOutcome<T>> = (0..total).map(|_| ItemOutcome::Skipped).collect();

        // Item futures own their inputs; nothing borrowed from this frame is polled by the stream
        let orchestrator = self.clone();
        let token = cancel_token.clone();
        let mut results = stream::iter(prompts.into_iter().enumerate())
            .map(move |(index, prompt)| orchestrator.clone().item::<T>(index, prompt, token.clone()))
            .buffer_unordered(concurrency);

        let mut completed = 0;
        while let Some((index, outcome)) = results.next().await {
            if !matches!(outcome, ItemOutcome::Skipped) {
                completed += 1;
                if let Some(report) = progress {
                    report(completed, total);
                }
            }
            slots[index] = outcome;
        }

        let succeeded = slots.iter().filter(|o| o.is_done()).count();
        tracing::info!(
            schema = T::SCHEMA_NAME,
            total,
            succeeded,
            failed = total - succeeded,
            "Request batch finished"
        );

        slots
    }

    fn item<T: StructuredOutput>(
        self,
        index: usize,
        prompt: Prompt,
        cancel_token: CancellationToken,
    ) -> BoxFuture<'static, (usize, ItemOutcome<T>)> {
        async move {
            if cancel_token.is_cancelled() {
                return (index, ItemOutcome::Skipped);
            }

            match self.execute::<T>(index, prompt).await {
                Ok(value) => (index, ItemOutcome::Done(value)),
                Err(e) => {
                    tracing::warn!(
                        schema = T::SCHEMA_NAME,
                        item = index,
                        error = %e,
                        "Request failed after retries"
                    );
                    (index, ItemOutcome::Failed(e))
                }
            }
        }
        .boxed()
    }

    async fn execute<T: StructuredOutput>(&self, index: usize, prompt: Prompt) -> Result<T, ProviderError> {
        let request = CompletionRequest {
            system: prompt.system,
            user: prompt.user,
            schema_name: T::SCHEMA_NAME.to_string(),
            schema: T::schema(),
            model: self.config.model.clone(),
        };
        let operation_name = format!("{}[{}]", T::SCHEMA_NAME, index);

        retry_transient(
            &operation_name,
            self.config.max_retries,
            self.config.backoff,
            ProviderError::is_transient,
            || {
                let provider = Arc::clone(&self.provider);
                let request = request.clone();
                async move {
                    let raw = provider.complete(&request).await?;
                    T::parse(&raw).map_err(ProviderError::MalformedOutput)
                }
            },
        )
        .await
    }
}
