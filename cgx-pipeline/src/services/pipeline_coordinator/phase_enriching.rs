//! ENRICHING: summary and tags per conversation
//!
//! Failures leave `summary`/`tags` null; the conversation still gets clustered
//! with an empty tag set.

use super::{PipelineCoordinator, PipelineError, RunContext};
use crate::models::{PipelineRun, RunState};
use crate::services::request_orchestrator::ProgressFn;
use tokio_util::sync::CancellationToken;

const OPERATION: &str = "Summarizing conversations";

impl PipelineCoordinator {
    pub(super) async fn phase_enriching(
        &self,
        run: &mut PipelineRun,
        ctx: &mut RunContext,
        cancel_token: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let total = ctx.conversations.len();
        self.enter_stage(run, ctx, RunState::Enriching, total, OPERATION).await?;

        let progress = self.item_progress(run, OPERATION);
        let progress: &ProgressFn<'_> = &progress;
        let report = ctx
            .enricher
            .enrich_summaries(&mut ctx.conversations, cancel_token, Some(progress))
            .await;

        if cancel_token.is_cancelled() {
            return Ok(());
        }

        for (conversation_id, reason) in &report.failures {
            tracing::warn!(
                run_id = %run.run_id,
                conversation_id = %conversation_id,
                error = %reason,
                "Summary enrichment failed, leaving summary and tags empty"
            );
        }
        run.counts.enrichment_failures = report.failures.len();

        for conversation in ctx.conversations.iter().filter(|c| c.summary.is_some()) {
            crate::db::conversations::update_enrichment(
                &self.db,
                &conversation.conversation_id,
                conversation.summary.as_deref(),
                conversation.tags.as_deref(),
            )
            .await?;
        }

        run.update_progress(total, total, "Conversations summarized");
        self.broadcast_progress(run, ctx.start_time);
        Ok(())
    }
}
