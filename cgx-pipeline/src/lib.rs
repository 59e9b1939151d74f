//! cgx-pipeline library interface
//!
//! Chat-archive pipeline: canonicalize exported conversation trees, enrich them
//! with AI summaries and embeddings, cluster them and lay them out in 2-D. The
//! same operations back the HTTP service and the offline `run` command.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use cgx_common::events::EventBus;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::models::PipelineOptions;
use crate::services::PipelineCoordinator;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    pub coordinator: Arc<PipelineCoordinator>,
    /// Defaults that request options are overlaid onto
    pub pipeline_defaults: PipelineOptions,
    /// Cancellation tokens for active runs; at most one entry
    pub cancellation_tokens: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
    pub startup_time: DateTime<Utc>,
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(db: SqlitePool, event_bus: EventBus, coordinator: Arc<PipelineCoordinator>) -> Self {
        Self {
            db,
            event_bus,
            coordinator,
            pipeline_defaults: PipelineOptions::default(),
            cancellation_tokens: Arc::new(RwLock::new(HashMap::new())),
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_pipeline_defaults(mut self, defaults: PipelineOptions) -> Self {
        self.pipeline_defaults = defaults;
        self
    }

    /// Request cancellation of every active run
    pub async fn cancel_active_runs(&self) {
        for (run_id, token) in self.cancellation_tokens.read().await.iter() {
            tracing::info!(run_id = %run_id, "Cancelling active run");
            token.cancel();
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::pipeline_routes())
        .route("/pipeline/events", get(api::pipeline_event_stream))
        .merge(api::cluster_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
