//! Pipeline run options
//!
//! Passed explicitly into every coordinator call; defaults may come from the
//! `[pipeline]` table of the TOML config.

use serde::{Deserialize, Serialize};

/// Where centroid 2-D coordinates come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CentroidProjection {
    /// Mean of the member conversations' projected coordinates
    #[default]
    MemberMean,
    /// Separate fit over the centroid vectors
    Independent,
}

/// Options for one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOptions {
    /// Maximum AI requests in flight (default: 24)
    #[serde(default = "default_max_parallel_requests")]
    pub max_parallel_requests: usize,

    /// Transcript characters sent for summarization and embedding (default: 4000)
    #[serde(default = "default_max_chars_per_context")]
    pub max_chars_per_context: usize,

    /// Cluster count; computed from N when unset
    #[serde(default)]
    pub n_clusters: Option<usize>,

    /// Representative conversations per cluster (default: 8)
    #[serde(default = "default_n_centroid_docs")]
    pub n_centroid_docs: usize,

    /// Tag-count entries kept per cluster (default: 15)
    #[serde(default = "default_max_tags_per_cluster")]
    pub max_tags_per_cluster: usize,

    /// Clustering/projection seed; drawn from OS entropy when unset
    #[serde(default)]
    pub random_seed: Option<u64>,

    #[serde(default)]
    pub centroid_projection: CentroidProjection,

    /// Retries per AI request after the first attempt (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff before the first retry, doubled per attempt (default: 500ms)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_parallel_requests: default_max_parallel_requests(),
            max_chars_per_context: default_max_chars_per_context(),
            n_clusters: None,
            n_centroid_docs: default_n_centroid_docs(),
            max_tags_per_cluster: default_max_tags_per_cluster(),
            random_seed: None,
            centroid_projection: CentroidProjection::default(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
        }
    }
}

impl PipelineOptions {
    /// Reject values that can never produce a run
    pub fn validate(&self) -> Result<(), String> {
        if self.max_parallel_requests == 0 {
            return Err("max_parallel_requests must be at least 1".to_string());
        }
        if self.max_chars_per_context == 0 {
            return Err("max_chars_per_context must be at least 1".to_string());
        }
        if self.n_centroid_docs == 0 {
            return Err("n_centroid_docs must be at least 1".to_string());
        }
        Ok(())
    }
}

fn default_max_parallel_requests() -> usize {
    24
}

fn default_max_chars_per_context() -> usize {
    4_000
}

fn default_n_centroid_docs() -> usize {
    8
}

fn default_max_tags_per_cluster() -> usize {
    15
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let options: PipelineOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, PipelineOptions::default());
        assert_eq!(options.max_parallel_requests, 24);
        assert_eq!(options.max_chars_per_context, 4000);
        assert_eq!(options.centroid_projection, CentroidProjection::MemberMean);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let options = PipelineOptions {
            max_parallel_requests: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
        assert!(PipelineOptions::default().validate().is_ok());
    }
}
