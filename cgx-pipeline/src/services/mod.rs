//! Pipeline services
//!
//! Leaves first: canonicalization, the AI provider seam, request orchestration,
//! enrichment, embedding, clustering and projection. The coordinator sequences
//! them into one run.

pub mod cluster_engine;
pub mod embedder;
pub mod enricher;
pub mod llm_client;
pub mod pipeline_coordinator;
pub mod projection;
pub mod request_orchestrator;
pub mod tree_canonicalizer;

pub use cluster_engine::{cluster, ClusterError, ClusterInput, ClusterParams};
pub use embedder::{embedding_text, Embedder, EmbedderConfig, EmbeddingBatch};
pub use enricher::{ClusterLabel, ConversationSummary, Enricher, EnrichmentReport};
pub use llm_client::{CompletionProvider, CompletionRequest, EmbeddingProvider, OpenAiClient, ProviderError};
pub use pipeline_coordinator::{PipelineCoordinator, PipelineError};
pub use projection::{project, ProjectionParams};
pub use request_orchestrator::{ItemOutcome, OrchestratorConfig, Prompt, RequestOrchestrator};
pub use tree_canonicalizer::{canonicalize, CanonicalizeError, CanonicalizeOutcome};
