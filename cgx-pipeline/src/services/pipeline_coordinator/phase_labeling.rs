//! LABELING: title and description per cluster
//!
//! Failed labels stay null; the solution is still written.

use super::{PipelineCoordinator, PipelineError, RunContext};
use crate::models::{PipelineRun, RunState};
use crate::services::request_orchestrator::ProgressFn;
use tokio_util::sync::CancellationToken;

const OPERATION: &str = "Labeling clusters";

impl PipelineCoordinator {
    pub(super) async fn phase_labeling(
        &self,
        run: &mut PipelineRun,
        ctx: &mut RunContext,
        cancel_token: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let total = ctx.solution.as_ref().map_or(0, |s| s.clusters.len());
        self.enter_stage(run, ctx, RunState::Labeling, total, OPERATION).await?;

        let solution = ctx
            .solution
            .as_mut()
            .ok_or_else(|| PipelineError::Internal("No cluster solution to label".to_string()))?;

        let progress = self.item_progress(run, OPERATION);
        let progress: &ProgressFn<'_> = &progress;
        let report = ctx
            .enricher
            .label_clusters(&mut solution.clusters, &ctx.conversations, cancel_token, Some(progress))
            .await;

        if cancel_token.is_cancelled() {
            return Ok(());
        }

        for (cluster_id, reason) in &report.failures {
            tracing::warn!(
                run_id = %run.run_id,
                cluster_id = %cluster_id,
                error = %reason,
                "Cluster labeling failed, leaving label empty"
            );
        }
        run.counts.label_failures = report.failures.len();

        run.update_progress(total, total, "Clusters labeled");
        self.broadcast_progress(run, ctx.start_time);
        Ok(())
    }
}
