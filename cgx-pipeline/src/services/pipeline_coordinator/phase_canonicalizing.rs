//! CANONICALIZING: export entries → canonical transcripts
//!
//! Malformed conversations are excluded with their parse error; the rest are
//! written to the conversations table one row at a time.

use super::{PipelineCoordinator, PipelineError, RunContext};
use crate::models::{PipelineRun, RunState};
use crate::services::tree_canonicalizer::canonicalize;
use serde_json::Value;
use std::collections::HashSet;

impl PipelineCoordinator {
    pub(super) async fn phase_canonicalizing(
        &self,
        run: &mut PipelineRun,
        ctx: &mut RunContext,
        export: &[Value],
    ) -> Result<(), PipelineError> {
        let total = export.len();
        self.enter_stage(run, ctx, RunState::Canonicalizing, total, "Canonicalizing conversation trees")
            .await?;

        let outcome = canonicalize(export);
        for failure in &outcome.failures {
            run.exclude(failure.display_id(), RunState::Canonicalizing, failure.error.to_string());
        }

        let mut seen = HashSet::new();
        let mut conversations = Vec::with_capacity(outcome.conversations.len());
        for conversation in outcome.conversations {
            if !seen.insert(conversation.conversation_id.clone()) {
                tracing::warn!(
                    run_id = %run.run_id,
                    conversation_id = %conversation.conversation_id,
                    "Duplicate conversation id in export, keeping the first"
                );
                run.exclude(
                    conversation.conversation_id,
                    RunState::Canonicalizing,
                    "duplicate conversation id",
                );
                continue;
            }
            crate::db::conversations::upsert_conversation(&self.db, &conversation).await?;
            conversations.push(conversation);
        }

        run.counts.conversations_submitted = total;
        run.counts.conversations_canonicalized = conversations.len();
        run.update_progress(total, total, "Conversation trees canonicalized");
        self.broadcast_progress(run, ctx.start_time);

        tracing::info!(
            run_id = %run.run_id,
            canonicalized = conversations.len(),
            excluded = run.exclusions.len(),
            "Canonicalization finished"
        );

        ctx.conversations = conversations;
        Ok(())
    }
}
