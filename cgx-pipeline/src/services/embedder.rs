//! Embedder
//!
//! Splits texts into provider-sized sub-batches, embeds them under the same
//! bounded concurrency and retry policy as the request orchestrator, and stitches
//! the vectors back in input order. A failed sub-batch fails only its own items.

use crate::models::CanonicalConversation;
use crate::services::enricher::truncate_chars;
use crate::services::llm_client::{EmbeddingProvider, ProviderError};
use crate::utils::{retry_transient, Backoff};
use futures::future::FutureExt;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Text embedded for a conversation
///
/// `<title>\nTags: <tags>\nSummary: <summary>\nConversation: <markdown prefix>`
pub fn embedding_text(conversation: &CanonicalConversation, budget: usize) -> String {
    let (markdown, _) = truncate_chars(&conversation.markdown, budget);
    format!(
        "{}\nTags: {}\nSummary: {}\nConversation: {}",
        conversation.title,
        conversation.tags_or_empty().join(", "),
        conversation.summary.as_deref().unwrap_or(""),
        markdown
    )
}

/// Vectors for a batch of texts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingBatch {
    /// One slot per input text; `None` where embedding failed
    pub vectors: Vec<Option<Vec<f32>>>,
    /// (input index, reason)
    pub failures: Vec<(usize, String)>,
    /// Dimensionality shared by every returned vector
    pub dim: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct EmbedderConfig {
    pub max_parallel_requests: usize,
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            max_parallel_requests: 24,
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    config: EmbedderConfig,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: EmbedderConfig) -> Self {
        Self { provider, config }
    }

    /// Embed texts, same order as input
    pub async fn embed(&self, texts: &[String], cancel_token: &CancellationToken) -> EmbeddingBatch {
        let batch_size = self.provider.max_batch_size().max(1);
        let concurrency = self.config.max_parallel_requests.max(1);
        let mut slots: Vec<Result<Vec<f32>, String>> =
            (0..texts.len()).map(|_| Err("not embedded".to_string())).collect();

        // Sub-batch futures own their texts; nothing borrowed from this frame is polled by the stream
        let chunks: Vec<Vec<String>> = texts.chunks(batch_size).map(<[String]>::to_vec).collect();
        let provider = Arc::clone(&self.provider);
        let config = self.config.clone();
        let token = cancel_token.clone();
        let mut results = stream::iter(chunks.into_iter().enumerate())
            .map(move |(chunk_index, chunk)| {
                let provider = Arc::clone(&provider);
                let config = config.clone();
                let token = token.clone();
                async move {
                    let offset = chunk_index * batch_size;
                    let len = chunk.len();
                    if token.is_cancelled() {
                        return (offset, len, Err("cancelled before request was sent".to_string()));
                    }
                    let result = Self::embed_chunk(provider, &config, chunk_index, chunk)
                        .await
                        .map_err(|e| e.to_string());
                    (offset, len, result)
                }
                .boxed()
            })
            .buffer_unordered(concurrency);

        while let Some((offset, len, result)) = results.next().await {
            match result {
                Ok(vectors) => {
                    for (i, vector) in vectors.into_iter().enumerate() {
                        slots[offset + i] = Ok(vector);
                    }
                }
                Err(reason) => {
                    tracing::warn!(
                        offset,
                        len,
                        error = %reason,
                        "Embedding sub-batch failed"
                    );
                    for slot in &mut slots[offset..offset + len] {
                        *slot = Err(reason.clone());
                    }
                }
            }
        }

        let batch = Self::enforce_dimension(slots);
        tracing::info!(
            total = texts.len(),
            failed = batch.failures.len(),
            dim = ?batch.dim,
            "Embedding finished"
        );
        batch
    }

    /// Embed every conversation's representative text in place
    ///
    /// Returns (conversation id, reason) for each conversation left without a vector.
    pub async fn embed_conversations(
        &self,
        conversations: &mut [CanonicalConversation],
        budget: usize,
        cancel_token: &CancellationToken,
    ) -> (Option<usize>, Vec<(String, String)>) {
        let texts: Vec<String> = conversations.iter().map(|c| embedding_text(c, budget)).collect();
        let batch = self.embed(&texts, cancel_token).await;

        let mut failures = Vec::new();
        for (index, (conversation, vector)) in conversations.iter_mut().zip(batch.vectors).enumerate() {
            match vector {
                Some(v) => conversation.embedding = Some(v),
                None => {
                    let reason = batch
                        .failures
                        .iter()
                        .find(|(i, _)| *i == index)
                        .map(|(_, r)| r.clone())
                        .unwrap_or_else(|| "not embedded".to_string());
                    failures.push((conversation.conversation_id.clone(), reason));
                }
            }
        }
        (batch.dim, failures)
    }

    async fn embed_chunk(
        provider: Arc<dyn EmbeddingProvider>,
        config: &EmbedderConfig,
        chunk_index: usize,
        chunk: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let operation_name = format!("embeddings[{}]", chunk_index);
        let chunk = Arc::new(chunk);

        retry_transient(
            &operation_name,
            config.max_retries,
            config.backoff,
            ProviderError::is_transient,
            || {
                let provider = Arc::clone(&provider);
                let chunk = Arc::clone(&chunk);
                async move {
                    let vectors = provider.embed(&chunk).await?;
                    if vectors.len() != chunk.len() {
                        return Err(ProviderError::MalformedOutput(format!(
                            "expected {} embeddings, got {}",
                            chunk.len(),
                            vectors.len()
                        )));
                    }
                    Ok(vectors)
                }
            },
        )
        .await
    }

    /// The first vector (input order) fixes the dimension; mismatches fail
    fn enforce_dimension(slots: Vec<Result<Vec<f32>, String>>) -> EmbeddingBatch {
        let dim = slots
            .iter()
            .find_map(|s| s.as_ref().ok().filter(|v| !v.is_empty()).map(Vec::len));

        let mut batch = EmbeddingBatch {
            dim,
            ..Default::default()
        };
        for (index, slot) in slots.into_iter().enumerate() {
            match slot {
                Ok(vector) if Some(vector.len()) == dim => batch.vectors.push(Some(vector)),
                Ok(vector) => {
                    batch.failures.push((
                        index,
                        format!("embedding has dimension {}, expected {:?}", vector.len(), dim),
                    ));
                    batch.vectors.push(None);
                }
                Err(reason) => {
                    batch.failures.push((index, reason));
                    batch.vectors.push(None);
                }
            }
        }
        batch
    }
}
