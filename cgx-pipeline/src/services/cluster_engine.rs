//! Cluster engine
//!
//! Seeded mini-batch k-means over conversation embeddings, followed by per-cluster
//! metrics: representative (centroid) conversations, mean cosine similarity to the
//! centroid, radius, silhouette and capped tag counts.
//!
//! Everything here is synchronous CPU work. Callers on the async runtime should run
//! [`cluster`] inside `tokio::task::spawn_blocking`.

use crate::models::cluster::{cluster_id_for, new_solution_id, KMEANS_ALGORITHM};
use crate::models::{Cluster, ClusterSolution};
use chrono::Utc;
use indexmap::IndexMap;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;

/// Ceiling for the computed default cluster count
pub const MAX_DEFAULT_CLUSTERS: usize = 24;

const N_INIT: usize = 3;
const BATCH_SIZE: usize = 1024;
const MAX_ITERATIONS: usize = 100;
const CONVERGENCE_TOLERANCE: f32 = 1e-6;

/// Clustering preconditions
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClusterError {
    #[error("At least 2 embedded conversations are required, got {0}")]
    TooFewPoints(usize),

    #[error("Cluster count must be at least 1")]
    ZeroClusters,

    #[error("Cluster count {k} must be smaller than the number of conversations ({n})")]
    TooManyClusters { k: usize, n: usize },

    #[error("Embedding for {conversation_id} has dimension {found}, expected {expected}")]
    InconsistentDimensions {
        conversation_id: String,
        expected: usize,
        found: usize,
    },

    #[error("Embeddings have zero dimensions")]
    EmptyEmbedding,
}

/// One conversation to be clustered
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterInput {
    pub conversation_id: String,
    pub embedding: Vec<f32>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterParams {
    pub n_clusters: Option<usize>,
    pub n_centroid_docs: usize,
    pub max_tags_per_cluster: usize,
    pub random_seed: u64,
}

/// Result of the partitioning step
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    /// Cluster index per point
    pub labels: Vec<usize>,
    /// Mean of each cluster's members
    pub centroids: Vec<Vec<f32>>,
}

/// `min(ceil(sqrt(n)), 24, n - 1)`, never below 1
pub fn default_k(n: usize) -> usize {
    let root = (n as f64).sqrt().ceil() as usize;
    root.min(MAX_DEFAULT_CLUSTERS).min(n.saturating_sub(1)).max(1)
}

/// Validate an explicit cluster count or compute the default
pub fn resolve_k(requested: Option<usize>, n: usize) -> Result<usize, ClusterError> {
    match requested {
        None => Ok(default_k(n)),
        Some(0) => Err(ClusterError::ZeroClusters),
        Some(k) if k >= n => Err(ClusterError::TooManyClusters { k, n }),
        Some(k) => Ok(k),
    }
}

/// Partition the inputs and compute every cluster's metrics
pub fn cluster(inputs: &[ClusterInput], params: &ClusterParams) -> Result<ClusterSolution, ClusterError> {
    let n = inputs.len();
    if n < 2 {
        return Err(ClusterError::TooFewPoints(n));
    }
    let dim = inputs[0].embedding.len();
    if dim == 0 {
        return Err(ClusterError::EmptyEmbedding);
    }
    if let Some(bad) = inputs.iter().find(|i| i.embedding.len() != dim) {
        return Err(ClusterError::InconsistentDimensions {
            conversation_id: bad.conversation_id.clone(),
            expected: dim,
            found: bad.embedding.len(),
        });
    }
    let k = resolve_k(params.n_clusters, n)?;

    tracing::info!(n, k, dim, seed = params.random_seed, "Clustering conversations");

    let points: Vec<&[f32]> = inputs.iter().map(|i| i.embedding.as_slice()).collect();
    let partition = minibatch_kmeans(&points, k, params.random_seed);
    let members = members_by_cluster(&partition.labels, k);
    let silhouettes = silhouette_by_cluster(&points, &partition.labels, &members);

    let clusters = members
        .iter()
        .enumerate()
        .map(|(c, member_indices)| {
            let centroid = &partition.centroids[c];
            let distances: Vec<f32> = member_indices
                .iter()
                .map(|&i| euclidean(points[i], centroid))
                .collect();

            let mut ranked: Vec<usize> = (0..member_indices.len()).collect();
            ranked.sort_by(|&a, &b| distances[a].total_cmp(&distances[b]));

            let (mean_cosine_similarity, cluster_radius) = if member_indices.len() == 1 {
                (1.0, 0.0)
            } else {
                let cosine_sum: f32 = member_indices.iter().map(|&i| cosine(points[i], centroid)).sum();
                (
                    cosine_sum / member_indices.len() as f32,
                    distances.iter().copied().fold(0.0, f32::max),
                )
            };

            Cluster {
                cluster_id: cluster_id_for(c, k),
                member_conversation_ids: member_indices
                    .iter()
                    .map(|&i| inputs[i].conversation_id.clone())
                    .collect(),
                centroid_conversation_ids: ranked
                    .iter()
                    .take(params.n_centroid_docs)
                    .map(|&r| inputs[member_indices[r]].conversation_id.clone())
                    .collect(),
                centroid_embedding: centroid.clone(),
                tag_counts: tag_counts(member_indices.iter().map(|&i| &inputs[i].tags), params.max_tags_per_cluster),
                mean_cosine_similarity,
                cluster_radius,
                silhouette_score: silhouettes[c],
                centroid_umap_x: None,
                centroid_umap_y: None,
                cluster_label: None,
                cluster_description: None,
            }
        })
        .collect();

    let created_at = Utc::now();
    Ok(ClusterSolution {
        cluster_solution_id: new_solution_id(k, created_at),
        algorithm: KMEANS_ALGORITHM.to_string(),
        n_clusters: k,
        random_seed: params.random_seed,
        embedding_dim: dim,
        run_id: None,
        created_at,
        clusters,
    })
}

/// Mini-batch k-means with k-means++ seeding
///
/// Runs `N_INIT` seeded restarts and keeps the lowest-inertia one. The returned
/// partition has no empty clusters and its centroids are exact member means.
pub fn minibatch_kmeans(points: &[&[f32]], k: usize, seed: u64) -> Partition {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut best: Option<(f32, Vec<Vec<f32>>)> = None;

    for _ in 0..N_INIT {
        let centers = fit_once(points, k, &mut rng);
        let labels = assign(points, &centers);
        let inertia: f32 = labels
            .iter()
            .enumerate()
            .map(|(i, &c)| squared_euclidean(points[i], &centers[c]))
            .sum();
        if best.as_ref().map_or(true, |(b, _)| inertia < *b) {
            best = Some((inertia, centers));
        }
    }

    let centers = best.map(|(_, c)| c).unwrap_or_default();
    let mut labels = assign(points, &centers);
    repair_empty_clusters(points, &centers, &mut labels, k);
    let centroids = member_means(points, &labels, k);

    Partition { labels, centroids }
}

fn fit_once(points: &[&[f32]], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let mut centers = kmeans_plus_plus(points, k, rng);
    let mut counts = vec![0usize; k];
    let batch_size = BATCH_SIZE.min(points.len());

    for _ in 0..MAX_ITERATIONS {
        let batch: Vec<usize> = sample(rng, points.len(), batch_size).into_vec();
        let batch_points: Vec<&[f32]> = batch.iter().map(|&i| points[i]).collect();
        let labels = assign(&batch_points, &centers);

        let mut shift = 0.0f32;
        for (point, &c) in batch_points.iter().zip(&labels) {
            counts[c] += 1;
            let eta = 1.0 / counts[c] as f32;
            for (center_value, &x) in centers[c].iter_mut().zip(point.iter()) {
                let delta = eta * (x - *center_value);
                *center_value += delta;
                shift += delta * delta;
            }
        }

        if shift < CONVERGENCE_TOLERANCE {
            break;
        }
    }
    centers
}

fn kmeans_plus_plus(points: &[&[f32]], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let mut centers: Vec<Vec<f32>> = Vec::with_capacity(k);
    centers.push(points[rng.gen_range(0..points.len())].to_vec());

    while centers.len() < k {
        let weights: Vec<f32> = points
            .par_iter()
            .map(|p| {
                centers
                    .iter()
                    .map(|c| squared_euclidean(p, c))
                    .fold(f32::INFINITY, f32::min)
            })
            .collect();

        // All remaining weight zero means duplicates only; any point will do
        let next = match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(rng),
            Err(_) => rng.gen_range(0..points.len()),
        };
        centers.push(points[next].to_vec());
    }
    centers
}

/// Nearest center per point (ties go to the lowest index)
fn assign(points: &[&[f32]], centers: &[Vec<f32>]) -> Vec<usize> {
    points
        .par_iter()
        .map(|p| {
            let mut best = 0;
            let mut best_distance = f32::INFINITY;
            for (c, center) in centers.iter().enumerate() {
                let d = squared_euclidean(p, center);
                if d < best_distance {
                    best_distance = d;
                    best = c;
                }
            }
            best
        })
        .collect()
}

/// Give every empty cluster the point farthest from its center, taken from a
/// cluster that can spare one
fn repair_empty_clusters(points: &[&[f32]], centers: &[Vec<f32>], labels: &mut [usize], k: usize) {
    loop {
        let mut sizes = vec![0usize; k];
        for &c in labels.iter() {
            sizes[c] += 1;
        }
        let Some(empty) = sizes.iter().position(|&s| s == 0) else {
            return;
        };

        let donor = (0..points.len())
            .filter(|&i| sizes[labels[i]] > 1)
            .max_by(|&a, &b| {
                squared_euclidean(points[a], &centers[labels[a]])
                    .total_cmp(&squared_euclidean(points[b], &centers[labels[b]]))
            });

        match donor {
            Some(i) => {
                tracing::debug!(cluster = empty, point = i, "Reassigning point to empty cluster");
                labels[i] = empty;
            }
            // Unreachable while k < n
            None => return,
        }
    }
}

fn member_means(points: &[&[f32]], labels: &[usize], k: usize) -> Vec<Vec<f32>> {
    let dim = points.first().map_or(0, |p| p.len());
    let mut sums = vec![vec![0.0f64; dim]; k];
    let mut counts = vec![0usize; k];

    for (point, &c) in points.iter().zip(labels) {
        counts[c] += 1;
        for (sum, &x) in sums[c].iter_mut().zip(point.iter()) {
            *sum += x as f64;
        }
    }

    sums.into_iter()
        .zip(counts)
        .map(|(sum, count)| {
            let count = count.max(1) as f64;
            sum.into_iter().map(|s| (s / count) as f32).collect()
        })
        .collect()
}

fn members_by_cluster(labels: &[usize], k: usize) -> Vec<Vec<usize>> {
    let mut members = vec![Vec::new(); k];
    for (i, &c) in labels.iter().enumerate() {
        members[c].push(i);
    }
    members
}

/// Mean point silhouette per cluster; singleton clusters score 0
fn silhouette_by_cluster(points: &[&[f32]], labels: &[usize], members: &[Vec<usize>]) -> Vec<f32> {
    let point_scores: Vec<f32> = (0..points.len())
        .into_par_iter()
        .map(|i| {
            let own = labels[i];
            if members[own].len() <= 1 {
                return 0.0;
            }

            let mean_distance = |cluster: &[usize]| -> f32 {
                let (sum, count) = cluster
                    .iter()
                    .filter(|&&j| j != i)
                    .fold((0.0f32, 0usize), |(s, n), &j| (s + euclidean(points[i], points[j]), n + 1));
                if count == 0 {
                    0.0
                } else {
                    sum / count as f32
                }
            };

            let a = mean_distance(&members[own]);
            let b = members
                .iter()
                .enumerate()
                .filter(|(c, m)| *c != own && !m.is_empty())
                .map(|(_, m)| mean_distance(m))
                .fold(f32::INFINITY, f32::min);

            let denominator = a.max(b);
            if !b.is_finite() || denominator <= 0.0 {
                0.0
            } else {
                (b - a) / denominator
            }
        })
        .collect();

    members
        .iter()
        .map(|m| {
            if m.len() <= 1 {
                0.0
            } else {
                m.iter().map(|&i| point_scores[i]).sum::<f32>() / m.len() as f32
            }
        })
        .collect()
}

/// Tag occurrences across members, highest first then alphabetical, capped
fn tag_counts<'a>(member_tags: impl Iterator<Item = &'a Vec<String>>, cap: usize) -> IndexMap<String, usize> {
    let mut counts: IndexMap<String, usize> = IndexMap::new();
    for tag in member_tags.flatten() {
        *counts.entry(tag.clone()).or_insert(0) += 1;
    }

    let mut sorted: Vec<(String, usize)> = counts.into_iter().collect();
    sorted.sort_by(|(ta, ca), (tb, cb)| cb.cmp(ca).then_with(|| ta.cmp(tb)));
    sorted.into_iter().take(cap).collect()
}

pub fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    squared_euclidean(a, b).sqrt()
}

/// Cosine similarity; 0 when either vector has zero norm
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
    }
}
