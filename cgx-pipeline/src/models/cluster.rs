//! Cluster solution data model

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Algorithm tag recorded with every solution
pub const KMEANS_ALGORITHM: &str = "minibatch_kmeans";

/// One cluster of a solution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Unique within its solution (`cluster_00`, `cluster_01`, ...)
    pub cluster_id: String,
    pub member_conversation_ids: Vec<String>,
    /// Members nearest the centroid, nearest first
    pub centroid_conversation_ids: Vec<String>,
    #[serde(default, skip_serializing)]
    pub centroid_embedding: Vec<f32>,
    /// Tag → count over members, highest counts first, capped
    pub tag_counts: IndexMap<String, usize>,
    pub mean_cosine_similarity: f32,
    pub cluster_radius: f32,
    pub silhouette_score: f32,
    pub centroid_umap_x: Option<f32>,
    pub centroid_umap_y: Option<f32>,
    pub cluster_label: Option<String>,
    pub cluster_description: Option<String>,
}

impl Cluster {
    pub fn cluster_size(&self) -> usize {
        self.member_conversation_ids.len()
    }
}

/// A complete partition of the clustered conversations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSolution {
    pub cluster_solution_id: String,
    pub algorithm: String,
    pub n_clusters: usize,
    /// Seed actually used, so the partition can be replayed
    pub random_seed: u64,
    pub embedding_dim: usize,
    pub run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub clusters: Vec<Cluster>,
}

impl ClusterSolution {
    pub fn summary(&self) -> ClusterSolutionSummary {
        ClusterSolutionSummary {
            cluster_solution_id: self.cluster_solution_id.clone(),
            algorithm: self.algorithm.clone(),
            n_clusters: self.n_clusters,
            random_seed: self.random_seed,
            embedding_dim: self.embedding_dim,
            run_id: self.run_id,
            created_at: self.created_at,
        }
    }
}

/// Solution header without its clusters (listing endpoint)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSolutionSummary {
    pub cluster_solution_id: String,
    pub algorithm: String,
    pub n_clusters: usize,
    pub random_seed: u64,
    pub embedding_dim: usize,
    pub run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Conversation row as returned for a solution's scatter plot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationPoint {
    pub conversation_id: String,
    pub title: String,
    pub cluster_id: Option<String>,
    pub umap_x: Option<f32>,
    pub umap_y: Option<f32>,
}

/// Build a solution id: `kmeans_<K>_<UTC timestamp>_<8 hex>`
pub fn new_solution_id(n_clusters: usize, created_at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "kmeans_{}_{}_{}",
        n_clusters,
        created_at.format("%Y%m%dT%H%M%SZ"),
        &suffix[..8]
    )
}

/// Cluster id for index `n` of `k`, zero-padded to the width of `k - 1`
pub fn cluster_id_for(n: usize, k: usize) -> String {
    let width = k.saturating_sub(1).to_string().len();
    format!("cluster_{:0width$}", n, width = width)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_ids_are_padded_to_widest_index() {
        assert_eq!(cluster_id_for(0, 1), "cluster_0");
        assert_eq!(cluster_id_for(3, 10), "cluster_3");
        assert_eq!(cluster_id_for(3, 11), "cluster_03");
        assert_eq!(cluster_id_for(10, 11), "cluster_10");
    }

    #[test]
    fn test_solution_ids_are_unique() {
        let now = Utc::now();
        let a = new_solution_id(4, now);
        let b = new_solution_id(4, now);

        assert!(a.starts_with("kmeans_4_"));
        assert_ne!(a, b);
        assert_eq!(a.rsplit('_').next().map(str::len), Some(8));
    }
}
