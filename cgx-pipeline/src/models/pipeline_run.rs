//! Pipeline run state machine
//!
//! A run progresses through:
//! CANONICALIZING → ENRICHING → EMBEDDING → CLUSTERING → LABELING → PROJECTING →
//! PERSISTING → COMPLETED
//!
//! and may end early in CANCELLED or FAILED.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PipelineOptions;

/// Pipeline run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    /// Tree → canonical transcript
    Canonicalizing,
    /// Summaries and tags
    Enriching,
    /// Vector embeddings
    Embedding,
    /// Partitioning and metrics
    Clustering,
    /// Cluster titles and descriptions
    Labeling,
    /// 2-D layout
    Projecting,
    /// Solution write
    Persisting,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Canonicalizing => "CANONICALIZING",
            RunState::Enriching => "ENRICHING",
            RunState::Embedding => "EMBEDDING",
            RunState::Clustering => "CLUSTERING",
            RunState::Labeling => "LABELING",
            RunState::Projecting => "PROJECTING",
            RunState::Persisting => "PERSISTING",
            RunState::Completed => "COMPLETED",
            RunState::Cancelled => "CANCELLED",
            RunState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CANONICALIZING" => RunState::Canonicalizing,
            "ENRICHING" => RunState::Enriching,
            "EMBEDDING" => RunState::Embedding,
            "CLUSTERING" => RunState::Clustering,
            "LABELING" => RunState::Labeling,
            "PROJECTING" => RunState::Projecting,
            "PERSISTING" => RunState::Persisting,
            "COMPLETED" => RunState::Completed,
            "CANCELLED" => RunState::Cancelled,
            "FAILED" => RunState::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Cancelled | RunState::Failed
        )
    }
}

/// Outcome of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    /// Every conversation made it into the solution
    Success,
    /// A solution was written but some conversations were excluded
    Partial,
    /// No solution was written
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "SUCCESS",
            RunStatus::Partial => "PARTIAL",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "SUCCESS" => RunStatus::Success,
            "PARTIAL" => RunStatus::Partial,
            "FAILED" => RunStatus::Failed,
            _ => return None,
        })
    }
}

/// A conversation left out of the solution, and why
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    /// Conversation id, or `#<index>` when the export entry had none
    pub conversation_id: String,
    /// Stage that dropped it
    pub stage: RunState,
    pub reason: String,
}

/// Per-run counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCounts {
    pub conversations_submitted: usize,
    pub conversations_canonicalized: usize,
    pub enrichment_failures: usize,
    pub embedding_failures: usize,
    pub conversations_clustered: usize,
    pub label_failures: usize,
}

/// Progress tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    /// Items completed in the current stage
    pub current: usize,
    /// Items in the current stage
    pub total: usize,
    /// Percentage complete (0.0 - 100.0)
    pub percentage: f64,
    pub current_operation: String,
    pub elapsed_seconds: u64,
    /// None if unknown
    pub estimated_remaining_seconds: Option<u64>,
}

impl Default for RunProgress {
    fn default() -> Self {
        Self {
            current: 0,
            total: 0,
            percentage: 0.0,
            current_operation: String::from("Initializing..."),
            elapsed_seconds: 0,
            estimated_remaining_seconds: None,
        }
    }
}

impl RunProgress {
    /// Progress snapshot with elapsed time and a linear remaining-time estimate
    pub fn at(current: usize, total: usize, operation: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        let percentage = if total > 0 {
            (current as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let elapsed_seconds = (Utc::now() - started_at).num_seconds().max(0) as u64;

        let estimated_remaining_seconds = if current > 0 && total > current {
            let rate = elapsed_seconds as f64 / current as f64;
            Some(((total - current) as f64 * rate) as u64)
        } else {
            None
        };

        Self {
            current,
            total,
            percentage,
            current_operation: operation.into(),
            elapsed_seconds,
            estimated_remaining_seconds,
        }
    }
}

/// One pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub state: RunState,
    /// Set once the run is terminal
    pub status: Option<RunStatus>,
    pub options: PipelineOptions,
    pub progress: RunProgress,
    pub counts: RunCounts,
    pub exclusions: Vec<Exclusion>,
    pub cluster_solution_id: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(options: PipelineOptions) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            state: RunState::Canonicalizing,
            status: None,
            options,
            progress: RunProgress::default(),
            counts: RunCounts::default(),
            exclusions: Vec::new(),
            cluster_solution_id: None,
            error_message: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Transition to new state; terminal states stamp `ended_at`
    pub fn transition_to(&mut self, new_state: RunState) {
        self.state = new_state;

        if new_state.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
    }

    /// Update progress and the remaining-time estimate
    pub fn update_progress(&mut self, current: usize, total: usize, operation: impl Into<String>) {
        self.progress = RunProgress::at(current, total, operation, self.started_at);
    }

    pub fn exclude(&mut self, conversation_id: impl Into<String>, stage: RunState, reason: impl Into<String>) {
        self.exclusions.push(Exclusion {
            conversation_id: conversation_id.into(),
            stage,
            reason: reason.into(),
        });
    }

    /// Mark the run finished with a solution
    pub fn complete(&mut self, cluster_solution_id: String) {
        self.cluster_solution_id = Some(cluster_solution_id);
        self.status = Some(if self.exclusions.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::Partial
        });
        self.transition_to(RunState::Completed);
    }

    /// Mark the run aborted without a solution
    pub fn fail(&mut self, error_message: impl Into<String>) {
        self.error_message = Some(error_message.into());
        self.status = Some(RunStatus::Failed);
        self.transition_to(RunState::Failed);
    }

    /// Mark the run cancelled; no solution is written
    pub fn cancel(&mut self) {
        self.status = Some(RunStatus::Failed);
        self.transition_to(RunState::Cancelled);
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn duration_seconds(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_seconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_string() {
        for state in [
            RunState::Canonicalizing,
            RunState::Labeling,
            RunState::Persisting,
            RunState::Cancelled,
        ] {
            assert_eq!(RunState::parse(state.as_str()), Some(state));
        }
        assert_eq!(
            serde_json::to_value(RunState::Enriching).unwrap(),
            serde_json::json!("ENRICHING")
        );
    }

    #[test]
    fn test_complete_with_exclusions_is_partial() {
        let mut run = PipelineRun::new(PipelineOptions::default());
        run.exclude("c1", RunState::Embedding, "embedding failed");
        run.complete("kmeans_2_x".to_string());

        assert_eq!(run.status, Some(RunStatus::Partial));
        assert!(run.is_terminal());
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn test_complete_without_exclusions_is_success() {
        let mut run = PipelineRun::new(PipelineOptions::default());
        run.complete("kmeans_2_x".to_string());
        assert_eq!(run.status, Some(RunStatus::Success));
    }

    #[test]
    fn test_progress_percentage() {
        let mut run = PipelineRun::new(PipelineOptions::default());
        run.update_progress(5, 20, "Enriching");
        assert!((run.progress.percentage - 25.0).abs() < 1e-9);

        run.update_progress(0, 0, "Idle");
        assert_eq!(run.progress.percentage, 0.0);
        assert!(run.progress.estimated_remaining_seconds.is_none());
    }
}
