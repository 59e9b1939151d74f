//! Pipeline coordinator
//!
//! Drives one run through every stage:
//! CANONICALIZING → ENRICHING → EMBEDDING → CLUSTERING → LABELING → PROJECTING →
//! PERSISTING → COMPLETED
//!
//! Each stage lives in its own `phase_*` module. Cancellation is observed between
//! stages: the in-flight batch finishes, then the run stops without writing a
//! solution. Conversation rows are written as stages finish; the solution is
//! written in a single transaction by the last stage.

use crate::models::{CanonicalConversation, ClusterSolution, PipelineOptions, PipelineRun, RunProgress, RunState};
use crate::services::cluster_engine::ClusterError;
use crate::services::embedder::{Embedder, EmbedderConfig};
use crate::services::enricher::Enricher;
use crate::services::llm_client::{CompletionProvider, EmbeddingProvider};
use crate::services::request_orchestrator::{OrchestratorConfig, RequestOrchestrator};
use crate::utils::Backoff;
use cgx_common::events::{CgxEvent, EventBus};
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod phase_canonicalizing;
mod phase_clustering;
mod phase_embedding;
mod phase_enriching;
mod phase_labeling;
mod phase_persisting;
mod phase_projecting;

/// Run-level failures; the run ends FAILED and no solution is written
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Clustering precondition failed: {0}")]
    Clustering(#[from] ClusterError),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] cgx_common::Error),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Working data carried from stage to stage
struct RunContext {
    start_time: Instant,
    enricher: Enricher,
    embedder: Embedder,
    conversations: Vec<CanonicalConversation>,
    solution: Option<ClusterSolution>,
    random_seed: u64,
}

/// Pipeline coordinator service
pub struct PipelineCoordinator {
    db: SqlitePool,
    event_bus: EventBus,
    completion_provider: Arc<dyn CompletionProvider>,
    embedding_provider: Arc<dyn EmbeddingProvider>,
}

impl PipelineCoordinator {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        completion_provider: Arc<dyn CompletionProvider>,
        embedding_provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            db,
            event_bus,
            completion_provider,
            embedding_provider,
        }
    }

    /// Run the whole pipeline and return the committed solution
    pub async fn run_pipeline(
        &self,
        export: &[Value],
        options: PipelineOptions,
        cancel_token: CancellationToken,
    ) -> Result<ClusterSolution, PipelineError> {
        let (_, result) = self.execute(PipelineRun::new(options), export, cancel_token).await;
        result?.ok_or(PipelineError::Cancelled)
    }

    /// Execute a run to a terminal state
    ///
    /// Errors are recorded on the returned run (state FAILED, `error_message`) and
    /// broadcast; they are not returned.
    pub async fn execute_run(
        &self,
        run: PipelineRun,
        export: &[Value],
        cancel_token: CancellationToken,
    ) -> PipelineRun {
        self.execute(run, export, cancel_token).await.0
    }

    async fn execute(
        &self,
        mut run: PipelineRun,
        export: &[Value],
        cancel_token: CancellationToken,
    ) -> (PipelineRun, Result<Option<ClusterSolution>, PipelineError>) {
        tracing::info!(
            run_id = %run.run_id,
            conversations = export.len(),
            "Starting pipeline run"
        );

        self.event_bus.emit_lossy(CgxEvent::PipelineRunStarted {
            run_id: run.run_id,
            conversation_count: export.len(),
            timestamp: Utc::now(),
        });

        let result = self.drive(&mut run, export, &cancel_token).await;

        match &result {
            Ok(Some(solution)) => {
                run.complete(solution.cluster_solution_id.clone());
                run.update_progress(1, 1, "Pipeline completed");
                tracing::info!(
                    run_id = %run.run_id,
                    cluster_solution_id = %solution.cluster_solution_id,
                    status = ?run.status,
                    excluded = run.exclusions.len(),
                    duration_seconds = run.duration_seconds(),
                    "Pipeline run completed"
                );
                self.event_bus.emit_lossy(CgxEvent::PipelineRunCompleted {
                    run_id: run.run_id,
                    status: run.status.map(|s| s.as_str()).unwrap_or_default().to_string(),
                    cluster_solution_id: solution.cluster_solution_id.clone(),
                    conversations_clustered: run.counts.conversations_clustered,
                    conversations_excluded: run.exclusions.len(),
                    duration_seconds: run.duration_seconds(),
                    timestamp: Utc::now(),
                });
            }
            Ok(None) => {
                let stopped_at = run.state;
                run.cancel();
                tracing::info!(run_id = %run.run_id, stage = ?stopped_at, "Pipeline run cancelled");
                self.event_bus.emit_lossy(CgxEvent::PipelineRunCancelled {
                    run_id: run.run_id,
                    state: stopped_at.as_str().to_string(),
                    timestamp: Utc::now(),
                });
            }
            Err(e) => {
                let stage = run.state;
                run.fail(e.to_string());
                tracing::error!(run_id = %run.run_id, stage = ?stage, error = %e, "Pipeline run failed");
                self.event_bus.emit_lossy(CgxEvent::PipelineRunFailed {
                    run_id: run.run_id,
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }

        if let Err(e) = crate::db::runs::save_run(&self.db, &run).await {
            tracing::error!(run_id = %run.run_id, error = %e, "Failed to save final run state");
        }

        (run, result)
    }

    /// Stages in order; `Ok(None)` means cancellation was observed between stages
    async fn drive(
        &self,
        run: &mut PipelineRun,
        export: &[Value],
        cancel_token: &CancellationToken,
    ) -> Result<Option<ClusterSolution>, PipelineError> {
        run.options.validate().map_err(PipelineError::InvalidOptions)?;
        let mut ctx = self.context_for(&run.options);

        self.phase_canonicalizing(run, &mut ctx, export).await?;
        if cancel_token.is_cancelled() {
            return Ok(None);
        }

        self.phase_enriching(run, &mut ctx, cancel_token).await?;
        if cancel_token.is_cancelled() {
            return Ok(None);
        }

        self.phase_embedding(run, &mut ctx, cancel_token).await?;
        if cancel_token.is_cancelled() {
            return Ok(None);
        }

        self.phase_clustering(run, &mut ctx).await?;
        if cancel_token.is_cancelled() {
            return Ok(None);
        }

        self.phase_labeling(run, &mut ctx, cancel_token).await?;
        if cancel_token.is_cancelled() {
            return Ok(None);
        }

        self.phase_projecting(run, &mut ctx).await?;
        if cancel_token.is_cancelled() {
            return Ok(None);
        }

        // Past this point the solution is committed
        self.phase_persisting(run, &mut ctx).await?;

        Ok(ctx.solution)
    }

    fn context_for(&self, options: &PipelineOptions) -> RunContext {
        let backoff = Backoff::new(options.initial_backoff_ms, Backoff::default().max_ms);

        let orchestrator = RequestOrchestrator::new(
            self.completion_provider.clone(),
            OrchestratorConfig {
                max_parallel_requests: options.max_parallel_requests,
                max_retries: options.max_retries,
                backoff,
                model: None,
            },
        );
        let embedder = Embedder::new(
            self.embedding_provider.clone(),
            EmbedderConfig {
                max_parallel_requests: options.max_parallel_requests,
                max_retries: options.max_retries,
                backoff,
            },
        );

        let random_seed = options.random_seed.unwrap_or_else(rand::random);

        RunContext {
            start_time: Instant::now(),
            enricher: Enricher::new(orchestrator, options.max_chars_per_context),
            embedder,
            conversations: Vec::new(),
            solution: None,
            random_seed,
        }
    }

    /// Persist the run and broadcast its progress at a stage boundary
    async fn enter_stage(
        &self,
        run: &mut PipelineRun,
        ctx: &RunContext,
        state: RunState,
        total: usize,
        operation: &str,
    ) -> Result<(), PipelineError> {
        run.transition_to(state);
        run.update_progress(0, total, operation);
        crate::db::runs::save_run(&self.db, run).await?;
        self.broadcast_progress(run, ctx.start_time);

        tracing::info!(run_id = %run.run_id, stage = ?state, total, "{}", operation);
        Ok(())
    }

    fn broadcast_progress(&self, run: &PipelineRun, start_time: Instant) {
        self.event_bus.emit_lossy(CgxEvent::PipelineProgressUpdate {
            run_id: run.run_id,
            state: run.state.as_str().to_string(),
            current: run.progress.current,
            total: run.progress.total,
            percentage: run.progress.percentage as f32,
            current_operation: run.progress.current_operation.clone(),
            elapsed_seconds: start_time.elapsed().as_secs(),
            estimated_remaining_seconds: run.progress.estimated_remaining_seconds,
            timestamp: Utc::now(),
        });
    }

    /// Per-item progress callback for batch stages
    fn item_progress(&self, run: &PipelineRun, operation: &str) -> impl Fn(usize, usize) + Send + Sync {
        let event_bus = self.event_bus.clone();
        let run_id = run.run_id;
        let state = run.state.as_str().to_string();
        let started_at = run.started_at;
        let operation = operation.to_string();

        move |current, total| {
            let progress = RunProgress::at(current, total, operation.as_str(), started_at);
            event_bus.emit_lossy(CgxEvent::PipelineProgressUpdate {
                run_id,
                state: state.clone(),
                current: progress.current,
                total: progress.total,
                percentage: progress.percentage as f32,
                current_operation: progress.current_operation,
                elapsed_seconds: progress.elapsed_seconds,
                estimated_remaining_seconds: progress.estimated_remaining_seconds,
                timestamp: Utc::now(),
            });
        }
    }
}
