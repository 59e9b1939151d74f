//! Shared test helpers: mock AI providers, in-memory database, export builders

#![allow(dead_code)]

use async_trait::async_trait;
use cgx_common::events::EventBus;
use cgx_pipeline::models::PipelineOptions;
use cgx_pipeline::services::{
    CompletionProvider, CompletionRequest, EmbeddingProvider, PipelineCoordinator, ProviderError,
};
use cgx_pipeline::AppState;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Marker that makes the mock completion provider return unparseable output
pub const FAIL_SUMMARY: &str = "FAIL_SUMMARY";

/// Completion mock
///
/// Summaries get three fixed tags; cluster labels are titled after the first
/// `group-*` word found in the prompt.
#[derive(Default)]
pub struct MockCompletion {
    pub calls: AtomicUsize,
}

#[async_trait]
impl CompletionProvider for MockCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        match request.schema_name.as_str() {
            "conversation_summary" => {
                if request.user.contains(FAIL_SUMMARY) {
                    return Ok("this is not json".to_string());
                }
                let group = group_word(&request.user).unwrap_or("misc");
                Ok(json!({
                    "summary": format!("A conversation about {}.", group),
                    "tags": [group, "Testing ", "notes"]
                })
                .to_string())
            }
            "conversation_cluster_summary" => {
                let group = group_word(&request.user).unwrap_or("misc");
                Ok(json!({
                    "title": format!("All about {}", group),
                    "description": format!("Conversations that mention {}.", group)
                })
                .to_string())
            }
            other => Err(ProviderError::Api {
                status: 400,
                message: format!("unknown schema {}", other),
            }),
        }
    }
}

fn group_word(text: &str) -> Option<&str> {
    text.split(|c: char| c.is_whitespace() || c == '*' || c == '"')
        .find(|w| w.starts_with("group-"))
}

/// Embedding mock keyed on the conversation title (first line of the text)
///
/// Titles without a vector fail their whole sub-batch with a permanent error.
pub struct MockEmbedder {
    pub vectors: HashMap<String, Vec<f32>>,
    pub batch_size: usize,
    /// Cancelled as soon as the first embedding request arrives
    pub cancel_on_call: Option<CancellationToken>,
    pub calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(vectors: HashMap<String, Vec<f32>>) -> Self {
        Self {
            vectors,
            batch_size: 256,
            cancel_on_call: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_on_call = Some(token);
        self
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = &self.cancel_on_call {
            token.cancel();
        }

        texts
            .iter()
            .map(|text| {
                let title = text.lines().next().unwrap_or_default();
                self.vectors.get(title).cloned().ok_or_else(|| ProviderError::Api {
                    status: 400,
                    message: format!("no vector for {}", title),
                })
            })
            .collect()
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }
}

pub async fn test_pool() -> SqlitePool {
    cgx_pipeline::db::init_memory_pool().await.unwrap()
}

/// Fast, deterministic options for tests
pub fn test_options() -> PipelineOptions {
    PipelineOptions {
        max_parallel_requests: 4,
        random_seed: Some(7),
        max_retries: 1,
        initial_backoff_ms: 1,
        ..Default::default()
    }
}

pub fn coordinator(pool: &SqlitePool, event_bus: &EventBus, embedder: MockEmbedder) -> PipelineCoordinator {
    PipelineCoordinator::new(
        pool.clone(),
        event_bus.clone(),
        Arc::new(MockCompletion::default()),
        Arc::new(embedder),
    )
}

pub async fn test_app_state(embedder: MockEmbedder) -> AppState {
    let pool = test_pool().await;
    let event_bus = EventBus::new(1000);
    let coordinator = Arc::new(coordinator(&pool, &event_bus, embedder));
    AppState::new(pool, event_bus, coordinator).with_pipeline_defaults(test_options())
}

/// One message in export form
pub fn export_message(id: &str, role: &str, text: &str, create_time: f64) -> Value {
    json!({
        "id": id,
        "author": {"role": role},
        "create_time": create_time,
        "content": {"content_type": "text", "parts": [text]}
    })
}

/// A single-chain conversation alternating user/assistant turns
pub fn linear_conversation(conversation_id: &str, title: &str, texts: &[&str]) -> Value {
    let mut mapping = serde_json::Map::new();
    for (i, text) in texts.iter().enumerate() {
        let node_id = format!("{}-n{}", conversation_id, i);
        let parent = (i > 0).then(|| format!("{}-n{}", conversation_id, i - 1));
        let children: Vec<String> = if i + 1 < texts.len() {
            vec![format!("{}-n{}", conversation_id, i + 1)]
        } else {
            Vec::new()
        };
        let role = if i % 2 == 0 { "user" } else { "assistant" };

        mapping.insert(
            node_id.clone(),
            json!({
                "id": node_id,
                "parent": parent,
                "children": children,
                "message": export_message(&format!("{}-m{}", conversation_id, i), role, text, (i + 1) as f64)
            }),
        );
    }

    json!({
        "conversation_id": conversation_id,
        "title": title,
        "create_time": 1.0,
        "update_time": 2.0,
        "mapping": Value::Object(mapping)
    })
}

/// Ten conversations in two well-separated 2-D groups
///
/// `group-a-*` sits near (1, 0), `group-b-*` near (0, 10).
pub fn two_group_corpus() -> (Vec<Value>, HashMap<String, Vec<f32>>) {
    let mut export = Vec::new();
    let mut vectors = HashMap::new();

    for i in 0..5 {
        let offset = i as f32 * 0.01;

        let a_title = format!("group-a-{}", i);
        export.push(linear_conversation(
            &format!("a{}", i),
            &a_title,
            &["tell me about group-a things", "sure, group-a is about this"],
        ));
        vectors.insert(a_title, vec![1.0 + offset, offset]);

        let b_title = format!("group-b-{}", i);
        export.push(linear_conversation(
            &format!("b{}", i),
            &b_title,
            &["and group-b?", "group-b is different"],
        ));
        vectors.insert(b_title, vec![offset, 10.0 + offset]);
    }

    (export, vectors)
}
