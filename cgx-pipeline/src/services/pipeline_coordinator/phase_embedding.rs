//! EMBEDDING: one vector per conversation
//!
//! Conversations whose sub-batch failed are excluded from clustering.

use super::{PipelineCoordinator, PipelineError, RunContext};
use crate::models::{PipelineRun, RunState};
use tokio_util::sync::CancellationToken;

impl PipelineCoordinator {
    pub(super) async fn phase_embedding(
        &self,
        run: &mut PipelineRun,
        ctx: &mut RunContext,
        cancel_token: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let total = ctx.conversations.len();
        self.enter_stage(run, ctx, RunState::Embedding, total, "Embedding conversations")
            .await?;

        let (dim, failures) = ctx
            .embedder
            .embed_conversations(&mut ctx.conversations, run.options.max_chars_per_context, cancel_token)
            .await;

        if cancel_token.is_cancelled() {
            return Ok(());
        }

        for (conversation_id, reason) in failures.iter() {
            tracing::warn!(
                run_id = %run.run_id,
                conversation_id = %conversation_id,
                error = %reason,
                "Embedding failed, excluding conversation from clustering"
            );
            run.exclude(conversation_id.clone(), RunState::Embedding, reason.clone());
        }
        run.counts.embedding_failures = failures.len();

        for conversation in &ctx.conversations {
            if let Some(embedding) = &conversation.embedding {
                crate::db::conversations::update_embedding(&self.db, &conversation.conversation_id, embedding)
                    .await?;
            }
        }

        tracing::info!(
            run_id = %run.run_id,
            dim = ?dim,
            embedded = total - failures.len(),
            failed = failures.len(),
            "Embedding finished"
        );
        run.update_progress(total, total, "Conversations embedded");
        self.broadcast_progress(run, ctx.start_time);
        Ok(())
    }
}
