//! Data models for the pipeline service

pub mod cluster;
pub mod conversation;
pub mod options;
pub mod pipeline_run;

pub use cluster::{Cluster, ClusterSolution, ClusterSolutionSummary, ConversationPoint};
pub use conversation::{
    CanonicalConversation, ConversationNode, NodeMapping, NodeMessage, Role, TranscriptMessage,
};
pub use options::{CentroidProjection, PipelineOptions};
pub use pipeline_run::{Exclusion, PipelineRun, RunCounts, RunProgress, RunState, RunStatus};
