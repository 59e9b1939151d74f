//! PROJECTING: 2-D coordinates for conversations and cluster centroids

use super::{PipelineCoordinator, PipelineError, RunContext};
use crate::models::{CentroidProjection, PipelineRun, RunState};
use crate::services::projection::{member_mean_coordinates, project, ProjectionParams};
use std::collections::HashMap;

impl PipelineCoordinator {
    pub(super) async fn phase_projecting(
        &self,
        run: &mut PipelineRun,
        ctx: &mut RunContext,
    ) -> Result<(), PipelineError> {
        // Positions in ctx.conversations of every clustered conversation
        let embedded: Vec<usize> = ctx
            .conversations
            .iter()
            .enumerate()
            .filter(|(_, c)| c.embedding.is_some())
            .map(|(i, _)| i)
            .collect();
        let total = embedded.len();
        self.enter_stage(run, ctx, RunState::Projecting, total, "Projecting to 2-D")
            .await?;

        let solution = ctx
            .solution
            .as_mut()
            .ok_or_else(|| PipelineError::Internal("No cluster solution to project".to_string()))?;

        let vectors: Vec<Vec<f32>> = embedded
            .iter()
            .filter_map(|&i| ctx.conversations[i].embedding.clone())
            .collect();
        let point_index: HashMap<&str, usize> = embedded
            .iter()
            .enumerate()
            .map(|(point, &i)| (ctx.conversations[i].conversation_id.as_str(), point))
            .collect();
        let groups: Vec<Vec<usize>> = solution
            .clusters
            .iter()
            .map(|c| {
                c.member_conversation_ids
                    .iter()
                    .filter_map(|id| point_index.get(id.as_str()).copied())
                    .collect()
            })
            .collect();
        let centroids: Vec<Vec<f32>> = solution.clusters.iter().map(|c| c.centroid_embedding.clone()).collect();
        let mode = run.options.centroid_projection;
        let params = ProjectionParams::with_seed(ctx.random_seed);

        let (coords, centroid_coords) = tokio::task::spawn_blocking(move || {
            let refs: Vec<&[f32]> = vectors.iter().map(Vec::as_slice).collect();
            let coords = project(&refs, &params);
            let centroid_coords = match mode {
                CentroidProjection::MemberMean => member_mean_coordinates(&coords, &groups),
                CentroidProjection::Independent => {
                    let refs: Vec<&[f32]> = centroids.iter().map(Vec::as_slice).collect();
                    project(&refs, &params)
                }
            };
            (coords, centroid_coords)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("Projection task failed: {}", e)))?;

        for (cluster, [x, y]) in solution.clusters.iter_mut().zip(centroid_coords) {
            cluster.centroid_umap_x = Some(x);
            cluster.centroid_umap_y = Some(y);
        }
        for (&i, [x, y]) in embedded.iter().zip(coords) {
            ctx.conversations[i].umap_x = Some(x);
            ctx.conversations[i].umap_y = Some(y);
        }

        run.update_progress(total, total, "Projection finished");
        self.broadcast_progress(run, ctx.start_time);
        Ok(())
    }
}
