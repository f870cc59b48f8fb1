//! Two-stage dimensionality reduction.
//!
//! Stage one is PCA by randomized subspace iteration down to the compact
//! analysis space. Stage two is a neighbourhood-preserving layout (fuzzy kNN
//! graph + SGD with negative sampling) from the compact space to 3D, seeded
//! with the leading principal components. Display coordinates are rescaled
//! per axis into `[0, 100]`.
//!
//! Everything here is pure and CPU bound; callers run it on a blocking thread.

use std::collections::HashMap;

use anyhow::{Result, bail};
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rayon::prelude::*;

use super::params::PipelineParams;

pub const DISPLAY_DIMS: usize = 3;
const LAYOUT_A: f64 = 1.577;
const LAYOUT_B: f64 = 0.895;
const GRADIENT_CLIP: f64 = 4.0;
const INIT_SPREAD: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct Reduction {
    /// `n x compact_dims` analysis coordinates.
    pub compact: Array2<f64>,
    /// `n x 3` display coordinates, each within `[0, 100]`.
    pub display: Array2<f64>,
}

/// Reduces raw embeddings. All vectors must share one dimension.
///
/// # Errors
/// Empty input or ragged vectors.
pub fn reduce(vectors: &[Vec<f32>], params: &PipelineParams) -> Result<Reduction> {
    let n = vectors.len();
    if n == 0 {
        bail!("cannot reduce an empty sample");
    }
    let dim = vectors[0].len();
    if dim == 0 || vectors.iter().any(|v| v.len() != dim) {
        bail!("embeddings must share a non-zero dimension");
    }

    let mut data = Array2::<f64>::zeros((n, dim));
    for (mut row, vector) in data.axis_iter_mut(Axis(0)).zip(vectors) {
        for (cell, value) in row.iter_mut().zip(vector) {
            *cell = f64::from(*value);
        }
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let components = params.compact_dims.min(dim).min(n).max(1);
    let compact = pca(data.view(), components, params.pca_power_iterations, &mut rng);

    let init = initial_layout(compact.view(), &mut rng);
    let display = if n < 4 {
        init
    } else {
        let neighbors = params.layout_neighbors.min(n - 1).max(1);
        let laid_out = layout(
            compact.view(),
            init.clone(),
            neighbors,
            params.layout_epochs,
            params.layout_negative_samples,
            &mut rng,
        );
        if laid_out.iter().all(|v| v.is_finite()) {
            laid_out
        } else {
            tracing::warn!("layout produced non-finite coordinates, using principal components");
            init
        }
    };

    Ok(Reduction {
        compact,
        display: rescale_unit_cube(display),
    })
}

/// Projects mean-centred rows onto the top `k` principal directions,
/// ordered by explained variance.
pub fn pca(data: ArrayView2<'_, f64>, k: usize, iterations: usize, rng: &mut StdRng) -> Array2<f64> {
    let (n, d) = data.dim();
    let k = k.min(d).max(1);
    let mean = data.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(d));
    let centered = &data - &mean;

    let mut basis = Array2::from_shape_fn((d, k), |_| rng.random_range(-1.0..1.0));
    orthonormalize_columns(&mut basis);
    for _ in 0..iterations {
        let projected = centered.dot(&basis);
        basis = centered.t().dot(&projected);
        orthonormalize_columns(&mut basis);
    }

    let scores = centered.dot(&basis);
    let mut order: Vec<(usize, f64)> = scores
        .axis_iter(Axis(1))
        .map(|column| column.iter().map(|v| v * v).sum::<f64>())
        .enumerate()
        .collect();
    order.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut sorted = Array2::<f64>::zeros((n, k));
    for (target, (source, _)) in order.into_iter().enumerate() {
        sorted.column_mut(target).assign(&scores.column(source));
    }
    sorted
}

/// Modified Gram-Schmidt; near-zero columns are zeroed.
fn orthonormalize_columns(matrix: &mut Array2<f64>) {
    let cols = matrix.ncols();
    for j in 0..cols {
        for i in 0..j {
            let previous = matrix.column(i).to_owned();
            let projection = previous.dot(&matrix.column(j));
            let mut column = matrix.column_mut(j);
            column.scaled_add(-projection, &previous);
        }
        let norm = matrix.column(j).dot(&matrix.column(j)).sqrt();
        let mut column = matrix.column_mut(j);
        if norm < 1e-10 {
            column.fill(0.0);
        } else {
            column.mapv_inplace(|v| v / norm);
        }
    }
}

/// First three compact coordinates scaled to `[-INIT_SPREAD, INIT_SPREAD]`,
/// padded with zeros, plus a tiny jitter so coincident points can separate.
fn initial_layout(compact: ArrayView2<'_, f64>, rng: &mut StdRng) -> Array2<f64> {
    let n = compact.nrows();
    let take = compact.ncols().min(DISPLAY_DIMS);
    let mut init = Array2::<f64>::zeros((n, DISPLAY_DIMS));
    init.slice_mut(s![.., ..take])
        .assign(&compact.slice(s![.., ..take]));

    for mut column in init.axis_iter_mut(Axis(1)) {
        let max_abs = column.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        if max_abs > 1e-12 {
            column.mapv_inplace(|v| v / max_abs * INIT_SPREAD);
        }
    }
    init.mapv_inplace(|v| v + rng.random_range(-1e-4..1e-4));
    init
}

/// `k` nearest neighbours of every row as `(index, distance)`, closest first.
pub fn nearest_neighbors(points: ArrayView2<'_, f64>, k: usize) -> Vec<Vec<(usize, f64)>> {
    let n = points.nrows();
    (0..n)
        .into_par_iter()
        .map(|i| {
            let row = points.row(i);
            let mut distances: Vec<(usize, f64)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| {
                    let d = row
                        .iter()
                        .zip(points.row(j).iter())
                        .map(|(a, b)| (a - b).powi(2))
                        .sum::<f64>()
                        .sqrt();
                    (j, d)
                })
                .collect();
            distances.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            distances.truncate(k);
            distances
        })
        .collect()
}

/// Symmetrised fuzzy membership graph as `(i, j, weight)` with `i < j`.
pub fn fuzzy_graph(neighbors: &[Vec<(usize, f64)>], k: usize) -> Vec<(usize, usize, f64)> {
    #[allow(clippy::cast_precision_loss)]
    let target = (k as f64).log2().max(0.0);
    let mut directed: HashMap<(usize, usize), f64> = HashMap::new();

    for (i, row) in neighbors.iter().enumerate() {
        let rho = row
            .iter()
            .map(|(_, d)| *d)
            .find(|d| *d > 0.0)
            .unwrap_or(0.0);
        let sigma = find_bandwidth(row, rho, target);
        for &(j, d) in row {
            let weight = (-(d - rho).max(0.0) / sigma).exp();
            directed.insert((i, j), weight);
        }
    }

    let mut edges: HashMap<(usize, usize), f64> = HashMap::new();
    for (&(i, j), &w) in &directed {
        let key = (i.min(j), i.max(j));
        if edges.contains_key(&key) {
            continue;
        }
        let reverse = directed.get(&(j, i)).copied().unwrap_or(0.0);
        edges.insert(key, w + reverse - w * reverse);
    }

    let mut edges: Vec<(usize, usize, f64)> = edges
        .into_iter()
        .filter(|(_, w)| *w > 0.0)
        .map(|((i, j), w)| (i, j, w))
        .collect();
    edges.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    edges
}

fn find_bandwidth(row: &[(usize, f64)], rho: f64, target: f64) -> f64 {
    let mut low = 0.0;
    let mut high = f64::INFINITY;
    let mut sigma = 1.0;
    for _ in 0..64 {
        let total: f64 = row
            .iter()
            .map(|(_, d)| (-(d - rho).max(0.0) / sigma).exp())
            .sum();
        if (total - target).abs() < 1e-5 {
            break;
        }
        if total > target {
            high = sigma;
            sigma = (low + high) / 2.0;
        } else {
            low = sigma;
            sigma = if high.is_finite() {
                (low + high) / 2.0
            } else {
                sigma * 2.0
            };
        }
    }
    sigma.max(1e-8)
}

/// Optimises the 3D embedding against the fuzzy graph of `compact`.
pub fn layout(
    compact: ArrayView2<'_, f64>,
    mut embedding: Array2<f64>,
    neighbors: usize,
    epochs: usize,
    negative_samples: usize,
    rng: &mut StdRng,
) -> Array2<f64> {
    let n = compact.nrows();
    let knn = nearest_neighbors(compact, neighbors);
    let edges = fuzzy_graph(&knn, neighbors);
    let max_weight = edges.iter().map(|e| e.2).fold(0.0_f64, f64::max);
    if edges.is_empty() || max_weight <= 0.0 {
        return embedding;
    }

    let epochs = epochs.max(1);
    for epoch in 0..epochs {
        #[allow(clippy::cast_precision_loss)]
        let learning_rate = 1.0 - epoch as f64 / epochs as f64;
        for &(i, j, weight) in &edges {
            if rng.random::<f64>() > weight / max_weight {
                continue;
            }
            attract(&mut embedding, i, j, learning_rate);
            for _ in 0..negative_samples {
                let other = rng.random_range(0..n);
                if other != i {
                    repel(&mut embedding, i, other, learning_rate);
                }
            }
        }
    }
    embedding
}

fn squared_distance(embedding: &Array2<f64>, i: usize, j: usize) -> f64 {
    embedding
        .row(i)
        .iter()
        .zip(embedding.row(j).iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum()
}

fn attract(embedding: &mut Array2<f64>, i: usize, j: usize, learning_rate: f64) {
    let dist2 = squared_distance(embedding, i, j);
    if dist2 <= 0.0 {
        return;
    }
    let coefficient = -2.0 * LAYOUT_A * LAYOUT_B * dist2.powf(LAYOUT_B - 1.0)
        / (1.0 + LAYOUT_A * dist2.powf(LAYOUT_B));
    for dim in 0..DISPLAY_DIMS {
        let delta = embedding[[i, dim]] - embedding[[j, dim]];
        let gradient = (coefficient * delta).clamp(-GRADIENT_CLIP, GRADIENT_CLIP) * learning_rate;
        embedding[[i, dim]] += gradient;
        embedding[[j, dim]] -= gradient;
    }
}

fn repel(embedding: &mut Array2<f64>, i: usize, other: usize, learning_rate: f64) {
    let dist2 = squared_distance(embedding, i, other);
    if dist2 <= 0.0 {
        return;
    }
    let coefficient = 2.0 * LAYOUT_B / ((0.001 + dist2) * (1.0 + LAYOUT_A * dist2.powf(LAYOUT_B)));
    for dim in 0..DISPLAY_DIMS {
        let delta = embedding[[i, dim]] - embedding[[other, dim]];
        let gradient = (coefficient * delta).clamp(-GRADIENT_CLIP, GRADIENT_CLIP) * learning_rate;
        embedding[[i, dim]] += gradient;
    }
}

/// Per-axis min-max into `[0, 100]`; a constant axis maps to 50.
#[must_use]
pub fn rescale_unit_cube(mut coords: Array2<f64>) -> Array2<f64> {
    for mut column in coords.axis_iter_mut(Axis(1)) {
        let min = column.iter().copied().fold(f64::INFINITY, f64::min);
        let max = column.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = max - min;
        if !range.is_finite() || range < 1e-12 {
            column.fill(50.0);
        } else {
            column.mapv_inplace(|v| ((v - min) / range * 100.0).clamp(0.0, 100.0));
        }
    }
    coords
}
