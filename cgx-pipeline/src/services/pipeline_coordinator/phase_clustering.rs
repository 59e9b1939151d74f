//! CLUSTERING: partition embedded conversations and compute metrics
//!
//! CPU-bound; runs on the blocking pool. A precondition failure aborts the run.

use super::{PipelineCoordinator, PipelineError, RunContext};
use crate::models::{PipelineRun, RunState};
use crate::services::cluster_engine::{cluster, ClusterInput, ClusterParams};

impl PipelineCoordinator {
    pub(super) async fn phase_clustering(
        &self,
        run: &mut PipelineRun,
        ctx: &mut RunContext,
    ) -> Result<(), PipelineError> {
        let inputs: Vec<ClusterInput> = ctx
            .conversations
            .iter()
            .filter_map(|c| {
                c.embedding.as_ref().map(|embedding| ClusterInput {
                    conversation_id: c.conversation_id.clone(),
                    embedding: embedding.clone(),
                    tags: c.tags_or_empty().to_vec(),
                })
            })
            .collect();
        let total = inputs.len();

        self.enter_stage(run, ctx, RunState::Clustering, total, "Clustering conversations")
            .await?;

        let params = ClusterParams {
            n_clusters: run.options.n_clusters,
            n_centroid_docs: run.options.n_centroid_docs,
            max_tags_per_cluster: run.options.max_tags_per_cluster,
            random_seed: ctx.random_seed,
        };
        tracing::info!(
            run_id = %run.run_id,
            random_seed = ctx.random_seed,
            seed_pinned = run.options.random_seed.is_some(),
            "Clustering seed"
        );

        let mut solution = tokio::task::spawn_blocking(move || cluster(&inputs, &params))
            .await
            .map_err(|e| PipelineError::Internal(format!("Clustering task failed: {}", e)))??;
        solution.run_id = Some(run.run_id);

        run.counts.conversations_clustered = total;
        run.update_progress(total, total, format!("Formed {} clusters", solution.n_clusters));
        self.broadcast_progress(run, ctx.start_time);

        ctx.solution = Some(solution);
        Ok(())
    }
}
