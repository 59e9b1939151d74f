//! PERSISTING: write the solution in one transaction
//!
//! A failure here aborts the run; earlier solutions are untouched.

use super::{PipelineCoordinator, PipelineError, RunContext};
use crate::models::{ConversationPoint, PipelineRun, RunState};
use std::collections::HashMap;

impl PipelineCoordinator {
    pub(super) async fn phase_persisting(
        &self,
        run: &mut PipelineRun,
        ctx: &mut RunContext,
    ) -> Result<(), PipelineError> {
        let total = ctx.solution.as_ref().map_or(0, |s| s.clusters.len());
        self.enter_stage(run, ctx, RunState::Persisting, total, "Writing cluster solution")
            .await?;

        let solution = ctx
            .solution
            .as_ref()
            .ok_or_else(|| PipelineError::Internal("No cluster solution to persist".to_string()))?;

        let by_id: HashMap<&str, _> = ctx
            .conversations
            .iter()
            .map(|c| (c.conversation_id.as_str(), c))
            .collect();

        let points: Vec<ConversationPoint> = solution
            .clusters
            .iter()
            .flat_map(|cluster| {
                cluster.member_conversation_ids.iter().map(|id| {
                    let conversation = by_id.get(id.as_str());
                    ConversationPoint {
                        conversation_id: id.clone(),
                        title: conversation.map(|c| c.title.clone()).unwrap_or_default(),
                        cluster_id: Some(cluster.cluster_id.clone()),
                        umap_x: conversation.and_then(|c| c.umap_x),
                        umap_y: conversation.and_then(|c| c.umap_y),
                    }
                })
            })
            .collect();

        crate::db::clusters::save_solution(&self.db, solution, &points).await?;

        run.update_progress(total, total, "Cluster solution written");
        self.broadcast_progress(run, ctx.start_time);
        Ok(())
    }
}
