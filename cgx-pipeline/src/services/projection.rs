//! 2-D projection of embeddings (UMAP semantics)
//!
//! Builds a fuzzy k-nearest-neighbour graph, then lays it out in the plane with
//! seeded stochastic gradient descent: attraction along graph edges, repulsion
//! from negative samples. Coordinates are for visualization only; their absolute
//! values carry no meaning.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Layout parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionParams {
    pub n_neighbors: usize,
    pub n_epochs: usize,
    pub negative_sample_rate: usize,
    pub learning_rate: f32,
    pub random_seed: u64,
}

impl ProjectionParams {
    pub fn with_seed(random_seed: u64) -> Self {
        Self {
            n_neighbors: 15,
            n_epochs: 200,
            negative_sample_rate: 5,
            learning_rate: 1.0,
            random_seed,
        }
    }
}

// Curve parameters for min_dist = 0.1, spread = 1.0
const CURVE_A: f32 = 1.577;
const CURVE_B: f32 = 0.895;
const GRADIENT_CLIP: f32 = 4.0;
const INIT_RANGE: f32 = 10.0;
const SIGMA_SEARCH_STEPS: usize = 64;

/// Project points to 2-D, same order as input
pub fn project(points: &[&[f32]], params: &ProjectionParams) -> Vec<[f32; 2]> {
    match points.len() {
        0 => return Vec::new(),
        1 => return vec![[0.0, 0.0]],
        2 => return vec![[-1.0, 0.0], [1.0, 0.0]],
        _ => {}
    }

    let k = params.n_neighbors.clamp(1, points.len() - 1);
    let neighbors = nearest_neighbors(points, k);
    let edges = fuzzy_graph(&neighbors, k);

    tracing::debug!(points = points.len(), k, edges = edges.len(), "Fitting 2-D layout");
    layout(points.len(), &edges, params)
}

/// Mean projected position of each group of point indices
pub fn member_mean_coordinates(coords: &[[f32; 2]], groups: &[Vec<usize>]) -> Vec<[f32; 2]> {
    groups
        .iter()
        .map(|group| {
            if group.is_empty() {
                return [0.0, 0.0];
            }
            let (sx, sy) = group
                .iter()
                .fold((0.0f32, 0.0f32), |(x, y), &i| (x + coords[i][0], y + coords[i][1]));
            [sx / group.len() as f32, sy / group.len() as f32]
        })
        .collect()
}

/// `k` nearest (index, distance) per point, nearest first, excluding itself
fn nearest_neighbors(points: &[&[f32]], k: usize) -> Vec<Vec<(usize, f32)>> {
    points
        .par_iter()
        .enumerate()
        .map(|(i, p)| {
            let mut distances: Vec<(usize, f32)> = points
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(j, q)| (j, super::cluster_engine::euclidean(p, q)))
                .collect();
            distances.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            distances.truncate(k);
            distances
        })
        .collect()
}

/// Symmetrized membership strengths: w = a + b - a·b
fn fuzzy_graph(neighbors: &[Vec<(usize, f32)>], k: usize) -> Vec<(usize, usize, f32)> {
    let target = (k as f32).log2().max(1e-3);
    let mut directed: BTreeMap<(usize, usize), f32> = BTreeMap::new();

    for (i, row) in neighbors.iter().enumerate() {
        let rho = row.iter().map(|(_, d)| *d).find(|d| *d > 0.0).unwrap_or(0.0);
        let sigma = find_sigma(row, rho, target);
        for &(j, d) in row {
            let weight = (-((d - rho).max(0.0)) / sigma).exp();
            directed.insert((i, j), weight);
        }
    }

    let mut symmetric: BTreeMap<(usize, usize), f32> = BTreeMap::new();
    for (&(i, j), &w) in &directed {
        let key = (i.min(j), i.max(j));
        if symmetric.contains_key(&key) {
            continue;
        }
        let reverse = directed.get(&(j, i)).copied().unwrap_or(0.0);
        symmetric.insert(key, w + reverse - w * reverse);
    }

    symmetric
        .into_iter()
        .filter(|(_, w)| *w > 0.0)
        .map(|((i, j), w)| (i, j, w))
        .collect()
}

/// Binary search for the bandwidth whose total membership equals log2(k)
fn find_sigma(row: &[(usize, f32)], rho: f32, target: f32) -> f32 {
    let (mut low, mut high, mut mid) = (0.0f32, f32::INFINITY, 1.0f32);

    for _ in 0..SIGMA_SEARCH_STEPS {
        let total: f32 = row
            .iter()
            .map(|(_, d)| (-((d - rho).max(0.0)) / mid).exp())
            .sum();
        if (total - target).abs() < 1e-5 {
            break;
        }
        if total > target {
            high = mid;
            mid = (low + high) / 2.0;
        } else {
            low = mid;
            mid = if high.is_infinite() { mid * 2.0 } else { (low + high) / 2.0 };
        }
    }
    mid.max(1e-6)
}

fn layout(n: usize, edges: &[(usize, usize, f32)], params: &ProjectionParams) -> Vec<[f32; 2]> {
    let mut rng = StdRng::seed_from_u64(params.random_seed);
    let mut coords: Vec<[f32; 2]> = (0..n)
        .map(|_| {
            [
                rng.gen_range(-INIT_RANGE..INIT_RANGE),
                rng.gen_range(-INIT_RANGE..INIT_RANGE),
            ]
        })
        .collect();

    let max_weight = edges.iter().map(|e| e.2).fold(0.0f32, f32::max);
    if max_weight <= 0.0 {
        return coords;
    }

    for epoch in 0..params.n_epochs {
        let alpha = params.learning_rate * (1.0 - epoch as f32 / params.n_epochs as f32);

        for &(i, j, w) in edges {
            if rng.gen::<f32>() > w / max_weight {
                continue;
            }

            let d2 = squared_distance(coords[i], coords[j]);
            if d2 > 0.0 {
                let coefficient = -2.0 * CURVE_A * CURVE_B * d2.powf(CURVE_B - 1.0)
                    / (1.0 + CURVE_A * d2.powf(CURVE_B));
                for axis in 0..2 {
                    let grad = clip(coefficient * (coords[i][axis] - coords[j][axis]));
                    coords[i][axis] += alpha * grad;
                    coords[j][axis] -= alpha * grad;
                }
            }

            for _ in 0..params.negative_sample_rate {
                let other = rng.gen_range(0..n);
                if other == i {
                    continue;
                }
                let d2 = squared_distance(coords[i], coords[other]);
                for axis in 0..2 {
                    let grad = if d2 > 0.0 {
                        let coefficient = 2.0 * CURVE_B / ((0.001 + d2) * (1.0 + CURVE_A * d2.powf(CURVE_B)));
                        clip(coefficient * (coords[i][axis] - coords[other][axis]))
                    } else {
                        GRADIENT_CLIP
                    };
                    coords[i][axis] += alpha * grad;
                }
            }
        }
    }
    coords
}

fn squared_distance(a: [f32; 2], b: [f32; 2]) -> f32 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)
}

fn clip(value: f32) -> f32 {
    value.clamp(-GRADIENT_CLIP, GRADIENT_CLIP)
}
