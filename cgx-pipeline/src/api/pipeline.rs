//! Pipeline run API handlers
//!
//! POST /pipeline/runs, GET /pipeline/runs/:run_id, POST /pipeline/runs/:run_id/cancel

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    models::{PipelineOptions, PipelineRun, RunState},
    AppState,
};

/// POST /pipeline/runs request
#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    /// Raw export entries, one per conversation
    pub export: Vec<Value>,
    /// Overrides applied on top of the service's pipeline defaults
    #[serde(default)]
    pub options: Option<Value>,
}

/// POST /pipeline/runs response
#[derive(Debug, Serialize)]
pub struct StartRunResponse {
    pub run_id: Uuid,
    pub state: RunState,
    pub conversation_count: usize,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// POST /pipeline/runs/:run_id/cancel response
#[derive(Debug, Serialize)]
pub struct CancelRunResponse {
    pub run_id: Uuid,
    /// State when cancellation was requested; the run stops at the next stage boundary
    pub state: RunState,
    pub cancellation_requested: bool,
}

/// Overlay request options onto the service defaults
///
/// Keys absent from `overrides` keep the default's value, so a request can set
/// just `random_seed` without resetting a TOML-configured concurrency limit.
pub fn merge_options(defaults: &PipelineOptions, overrides: Option<Value>) -> Result<PipelineOptions, String> {
    let Some(overrides) = overrides else {
        return Ok(defaults.clone());
    };
    let Value::Object(overrides) = overrides else {
        return Err("options must be a JSON object".to_string());
    };

    let mut merged = serde_json::to_value(defaults).map_err(|e| e.to_string())?;
    if let Value::Object(base) = &mut merged {
        base.extend(overrides);
    }

    let options: PipelineOptions = serde_json::from_value(merged).map_err(|e| e.to_string())?;
    options.validate()?;
    Ok(options)
}

/// POST /pipeline/runs
///
/// Start a run in the background. Returns 202 with the run id, or 409 when a
/// run is already active.
pub async fn start_run(
    State(state): State<AppState>,
    Json(request): Json<StartRunRequest>,
) -> ApiResult<(StatusCode, Json<StartRunResponse>)> {
    if request.export.is_empty() {
        return Err(ApiError::BadRequest(
            "export must contain at least one conversation".to_string(),
        ));
    }

    let options = merge_options(&state.pipeline_defaults, request.options)
        .map_err(|e| ApiError::BadRequest(format!("Invalid options: {}", e)))?;

    // Check-and-register under one write lock so two requests cannot both start
    let mut tokens = state.cancellation_tokens.write().await;
    if let Some(active) = tokens.keys().next() {
        return Err(ApiError::Conflict(format!(
            "Pipeline run already active: {}",
            active
        )));
    }

    let run = PipelineRun::new(options);
    crate::db::runs::save_run(&state.db, &run).await?;

    let cancel_token = CancellationToken::new();
    tokens.insert(run.run_id, cancel_token.clone());
    drop(tokens);

    let response = StartRunResponse {
        run_id: run.run_id,
        state: run.state,
        conversation_count: request.export.len(),
        started_at: run.started_at,
    };

    tracing::info!(
        run_id = %run.run_id,
        conversations = response.conversation_count,
        "Pipeline run accepted"
    );

    let export = request.export;
    tokio::spawn(async move {
        let run_id = run.run_id;
        let finished = state.coordinator.execute_run(run, &export, cancel_token).await;

        state.cancellation_tokens.write().await.remove(&run_id);

        if let Some(message) = &finished.error_message {
            *state.last_error.write().await = Some(format!("Run {} failed: {}", run_id, message));
        }

        tracing::info!(
            run_id = %run_id,
            state = ?finished.state,
            status = ?finished.status,
            "Background pipeline task finished"
        );
    });

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /pipeline/runs/:run_id
///
/// Run state, progress, counts and the exclusion manifest.
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<PipelineRun>> {
    let run = crate::db::runs::load_run(&state.db, run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Pipeline run not found: {}", run_id)))?;

    tracing::debug!(run_id = %run_id, state = ?run.state, "Status query");
    Ok(Json(run))
}

/// POST /pipeline/runs/:run_id/cancel
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<CancelRunResponse>> {
    let token = state.cancellation_tokens.read().await.get(&run_id).cloned();

    let run = crate::db::runs::load_run(&state.db, run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Pipeline run not found: {}", run_id)))?;

    let Some(token) = token else {
        return Err(ApiError::BadRequest(format!(
            "Pipeline run is not active (state: {})",
            run.state.as_str()
        )));
    };

    token.cancel();
    tracing::info!(run_id = %run_id, state = ?run.state, "Cancellation requested");

    Ok(Json(CancelRunResponse {
        run_id,
        state: run.state,
        cancellation_requested: true,
    }))
}

/// Build pipeline run routes
pub fn pipeline_routes() -> Router<AppState> {
    Router::new()
        .route("/pipeline/runs", post(start_run))
        .route("/pipeline/runs/:run_id", get(get_run))
        .route("/pipeline/runs/:run_id/cancel", post(cancel_run))
}
