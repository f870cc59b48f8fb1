//! Centroid clustering on the compact analysis space.
//!
//! k is chosen by mean silhouette over candidate counts, outliers are flagged
//! by distance and by cluster size, and surviving clusters are renumbered
//! `0..C-1` by descending size with [`OUTLIER_CLUSTER_ID`] for the rest.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{SeedableRng, rngs::StdRng, seq::index::sample};
use tracing::debug;

use super::params::PipelineParams;
use crate::util::kmeans::{KMeans, distance_sq};

pub const OUTLIER_CLUSTER_ID: i32 = -1;

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterGeometry {
    pub cluster_id: i32,
    /// Row indices of member points.
    pub members: Vec<usize>,
    /// Mean of members in the compact space.
    pub compact_centroid: Vec<f64>,
    /// Mean of members in display space.
    pub display_centroid: [f64; 3],
    pub coherence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clustering {
    /// Cluster id per point, or [`OUTLIER_CLUSTER_ID`].
    pub assignments: Vec<i32>,
    pub confidences: Vec<f64>,
    pub clusters: Vec<ClusterGeometry>,
    pub chosen_k: usize,
    pub silhouette: f64,
}

impl Clustering {
    #[must_use]
    pub fn outlier_count(&self) -> usize {
        self.assignments
            .iter()
            .filter(|&&id| id == OUTLIER_CLUSTER_ID)
            .count()
    }
}

/// Clusters `compact` and derives per-cluster display geometry from `display`.
///
/// Both matrices must have one row per point.
#[must_use]
pub fn cluster(
    compact: ArrayView2<'_, f64>,
    display: ArrayView2<'_, f64>,
    params: &PipelineParams,
) -> Clustering {
    let n = compact.nrows();
    if n == 0 {
        return Clustering {
            assignments: vec![],
            confidences: vec![],
            clusters: vec![],
            chosen_k: 0,
            silhouette: 0.0,
        };
    }

    let min_size = params.min_cluster_size(n);
    let upper = params.max_clusters.min(n / min_size.max(1)).min(n);
    let lower = params.min_clusters.min(upper).max(1);
    let mut rng = StdRng::seed_from_u64(params.seed);
    let scored = score_subsample(n, params.silhouette_sample, &mut rng);

    let mut best: Option<(KMeans, f64)> = None;
    for k in lower..=upper.max(lower) {
        let model = KMeans::fit(compact, k, params.kmeans_max_iterations, &mut rng);
        let score = mean_silhouette(compact, &model.assignments, model.k(), &scored);
        debug!(k, silhouette = score, inertia = model.inertia, "scored cluster count");
        if best.as_ref().is_none_or(|(_, s)| score > *s + 1e-12) {
            best = Some((model, score));
        }
    }
    let Some((model, silhouette)) = best else {
        return Clustering {
            assignments: vec![OUTLIER_CLUSTER_ID; n],
            confidences: vec![0.0; n],
            clusters: vec![],
            chosen_k: 0,
            silhouette: 0.0,
        };
    };
    let chosen_k = model.k();

    let distances: Vec<f64> = compact
        .axis_iter(Axis(0))
        .zip(&model.assignments)
        .map(|(point, &c)| distance_sq(point, model.centroids.row(c)).sqrt())
        .collect();

    // 距離による外れ値判定
    let mut raw: Vec<Option<usize>> = model.assignments.iter().map(|&c| Some(c)).collect();
    for c in 0..chosen_k {
        let members: Vec<usize> = (0..n).filter(|&i| model.assignments[i] == c).collect();
        let (mean, std) = mean_std(members.iter().map(|&i| distances[i]));
        let threshold = mean + params.outlier_z_threshold * std;
        if std > 0.0 {
            for &i in &members {
                if distances[i] > threshold {
                    raw[i] = None;
                }
            }
        }
    }

    // 小さすぎるクラスタを解散（最小 k を割らない範囲で）
    loop {
        let mut sizes: Vec<(usize, usize)> = (0..chosen_k)
            .map(|c| (c, raw.iter().filter(|a| **a == Some(c)).count()))
            .filter(|(_, size)| *size > 0)
            .collect();
        if sizes.len() <= params.min_clusters {
            break;
        }
        sizes.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        match sizes.first() {
            Some(&(c, size)) if size < min_size => {
                for slot in raw.iter_mut().filter(|a| **a == Some(c)) {
                    *slot = None;
                }
            }
            _ => break,
        }
    }

    // 件数の多い順に 0..C-1 へ振り直す
    let mut surviving: Vec<(usize, usize)> = (0..chosen_k)
        .map(|c| (c, raw.iter().filter(|a| **a == Some(c)).count()))
        .filter(|(_, size)| *size > 0)
        .collect();
    surviving.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut remap = vec![None; chosen_k];
    for (new_id, (old, _)) in surviving.iter().enumerate() {
        remap[*old] = Some(new_id);
    }

    let assignments: Vec<i32> = raw
        .iter()
        .map(|slot| {
            slot.and_then(|c| remap[c])
                .and_then(|id| i32::try_from(id).ok())
                .unwrap_or(OUTLIER_CLUSTER_ID)
        })
        .collect();

    let clusters: Vec<ClusterGeometry> = (0..surviving.len())
        .map(|new_id| {
            let id = i32::try_from(new_id).unwrap_or(i32::MAX);
            let members: Vec<usize> = (0..n).filter(|&i| assignments[i] == id).collect();
            let compact_centroid = centroid(compact, &members);
            let display_centroid = centroid(display, &members);
            let coherence = coherence(compact, &members, compact_centroid.view());
            ClusterGeometry {
                cluster_id: id,
                members,
                compact_centroid: compact_centroid.to_vec(),
                display_centroid: [
                    display_centroid.get(0).copied().unwrap_or(50.0),
                    display_centroid.get(1).copied().unwrap_or(50.0),
                    display_centroid.get(2).copied().unwrap_or(50.0),
                ],
                coherence,
            }
        })
        .collect();

    let confidences = confidences(compact, &assignments, &clusters, &distances);

    Clustering {
        assignments,
        confidences,
        clusters,
        chosen_k,
        silhouette,
    }
}

fn score_subsample(n: usize, limit: usize, rng: &mut StdRng) -> Vec<usize> {
    if n <= limit {
        return (0..n).collect();
    }
    let mut picked = sample(rng, n, limit).into_vec();
    picked.sort_unstable();
    picked
}

/// Mean silhouette over `scored` points. Single-cluster models score -1 so
/// any real partition wins.
#[allow(clippy::cast_precision_loss)]
pub fn mean_silhouette(
    data: ArrayView2<'_, f64>,
    assignments: &[usize],
    k: usize,
    scored: &[usize],
) -> f64 {
    if k < 2 || scored.is_empty() {
        return -1.0;
    }
    let mut total = 0.0;
    for &i in scored {
        let mut sums = vec![0.0; k];
        let mut counts = vec![0_usize; k];
        for &j in scored {
            if i == j {
                continue;
            }
            sums[assignments[j]] += distance_sq(data.row(i), data.row(j)).sqrt();
            counts[assignments[j]] += 1;
        }
        let own = assignments[i];
        if counts[own] == 0 {
            continue;
        }
        let a = sums[own] / counts[own] as f64;
        let b = (0..k)
            .filter(|&c| c != own && counts[c] > 0)
            .map(|c| sums[c] / counts[c] as f64)
            .fold(f64::INFINITY, f64::min);
        if b.is_finite() {
            let denom = a.max(b);
            if denom > 0.0 {
                total += (b - a) / denom;
            }
        }
    }
    total / scored.len() as f64
}

#[allow(clippy::cast_precision_loss)]
fn mean_std(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let values: Vec<f64> = values.collect();
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

fn centroid(data: ArrayView2<'_, f64>, members: &[usize]) -> Array1<f64> {
    if members.is_empty() {
        return Array1::zeros(data.ncols());
    }
    let selected = data.select(Axis(0), members);
    selected
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(data.ncols()))
}

/// Mean cosine similarity of members to their centroid, floored at zero.
#[allow(clippy::cast_precision_loss)]
fn coherence(data: ArrayView2<'_, f64>, members: &[usize], centre: ArrayView1<'_, f64>) -> f64 {
    if members.is_empty() {
        return 0.0;
    }
    let total: f64 = members
        .iter()
        .map(|&i| cosine_similarity(data.row(i), centre))
        .sum();
    (total / members.len() as f64).clamp(0.0, 1.0)
}

pub fn cosine_similarity(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    let dot = a.dot(&b);
    let norm = a.dot(&a).sqrt() * b.dot(&b).sqrt();
    if norm <= f64::EPSILON { 0.0 } else { dot / norm }
}

/// `1 / (1 + d / mean_d)` against the final cluster centroid; outliers score
/// against the nearest surviving centroid with halved confidence.
#[allow(clippy::cast_precision_loss)]
fn confidences(
    compact: ArrayView2<'_, f64>,
    assignments: &[i32],
    clusters: &[ClusterGeometry],
    kmeans_distances: &[f64],
) -> Vec<f64> {
    if clusters.is_empty() {
        return vec![0.0; assignments.len()];
    }
    let centroids = Array2::from_shape_fn(
        (clusters.len(), compact.ncols()),
        |(c, j)| clusters[c].compact_centroid[j],
    );
    let mean_distance: Vec<f64> = clusters
        .iter()
        .map(|cluster| {
            let centre = centroids.row(usize::try_from(cluster.cluster_id).unwrap_or(0));
            let total: f64 = cluster
                .members
                .iter()
                .map(|&i| distance_sq(compact.row(i), centre).sqrt())
                .sum();
            total / cluster.members.len().max(1) as f64
        })
        .collect();

    assignments
        .iter()
        .enumerate()
        .map(|(i, &id)| {
            let (cluster, penalty) = match usize::try_from(id) {
                Ok(c) => (c, 1.0),
                Err(_) => {
                    let (nearest, _) = crate::util::kmeans::nearest(compact.row(i), centroids.view());
                    (nearest, 0.5)
                }
            };
            let d = distance_sq(compact.row(i), centroids.row(cluster)).sqrt();
            let scale = if mean_distance[cluster] > 0.0 {
                mean_distance[cluster]
            } else {
                kmeans_distances.iter().sum::<f64>() / kmeans_distances.len().max(1) as f64
            };
            let raw = if scale > 0.0 { 1.0 / (1.0 + d / scale) } else { 1.0 };
            (raw * penalty).clamp(0.0, 1.0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use rand::Rng;

    /// Well-separated gaussian-ish blobs in 6D plus a display copy.
    fn blobs(sizes: &[usize], seed: u64) -> (Array2<f64>, Array2<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let n: usize = sizes.iter().sum();
        let mut compact = Array2::<f64>::zeros((n, 6));
        let mut row = 0;
        for (blob, &size) in sizes.iter().enumerate() {
            for _ in 0..size {
                for j in 0..6 {
                    let centre = if j == blob % 6 { 10.0 } else { 0.0 };
                    compact[[row, j]] = centre + rng.random_range(-0.5..0.5);
                }
                row += 1;
            }
        }
        let display = compact.slice(ndarray::s![.., ..3]).mapv(|v| (v + 1.0) * 8.0);
        (compact, display)
    }

    #[test]
    fn finds_separated_groups_with_contiguous_ids() {
        let (compact, display) = blobs(&[40, 30, 20, 25], 5);

        let result = cluster(compact.view(), display.view(), &PipelineParams::default());

        let ids: BTreeSet<i32> = result
            .assignments
            .iter()
            .copied()
            .filter(|&id| id != OUTLIER_CLUSTER_ID)
            .collect();
        let expected: BTreeSet<i32> = (0..result.clusters.len() as i32).collect();
        assert_eq!(ids, expected);
        assert!((3..=15).contains(&result.clusters.len()));
        assert!(result.silhouette > 0.5);
    }

    #[test]
    fn clusters_are_ordered_by_size() {
        let (compact, display) = blobs(&[10, 50, 30], 9);

        let result = cluster(compact.view(), display.view(), &PipelineParams::default());

        let sizes: Vec<usize> = result.clusters.iter().map(|c| c.members.len()).collect();
        assert!(sizes.windows(2).all(|w| w[0] >= w[1]), "{sizes:?}");
    }

    #[test]
    fn centroids_ignore_outliers() {
        let (mut compact, mut display) = blobs(&[30, 30, 30], 2);
        // 1点だけ極端に遠い点を足す
        compact[[0, 5]] = 400.0;
        display[[0, 0]] = 100.0;

        let result = cluster(compact.view(), display.view(), &PipelineParams::default());

        assert_eq!(result.assignments[0], OUTLIER_CLUSTER_ID);
        assert!(result.outlier_count() >= 1);
        for geometry in &result.clusters {
            assert!(!geometry.members.contains(&0));
            let members = display.select(Axis(0), &geometry.members);
            let expected = members.mean_axis(Axis(0)).unwrap();
            assert!((geometry.display_centroid[0] - expected[0]).abs() < 1e-9);
        }
    }

    #[test]
    fn confidence_and_coherence_are_bounded() {
        let (compact, display) = blobs(&[25, 25, 25], 4);

        let result = cluster(compact.view(), display.view(), &PipelineParams::default());

        assert!(result.confidences.iter().all(|c| (0.0..=1.0).contains(c)));
        assert!(result
            .clusters
            .iter()
            .all(|c| (0.0..=1.0).contains(&c.coherence)));
    }

    #[test]
    fn tiny_sample_still_assigns_every_point() {
        let (compact, display) = blobs(&[4, 4, 3], 1);

        let result = cluster(compact.view(), display.view(), &PipelineParams::default());

        assert_eq!(result.assignments.len(), 11);
        assert!(!result.clusters.is_empty());
    }

    #[test]
    fn duplicate_rows_keep_the_minimum_cluster_count() {
        let compact = Array2::from_elem((40, 20), 0.5);
        let display = Array2::from_elem((40, 3), 50.0);
        let params = PipelineParams::default();

        let result = cluster(compact.view(), display.view(), &params);

        assert_eq!(result.chosen_k, params.min_clusters);
        assert_eq!(result.clusters.len(), params.min_clusters);
        let members: usize = result.clusters.iter().map(|c| c.members.len()).sum();
        assert_eq!(members + result.outlier_count(), 40);
    }

    #[test]
    fn same_seed_is_deterministic() {
        let (compact, display) = blobs(&[20, 20, 20], 8);
        let params = PipelineParams::default();

        let a = cluster(compact.view(), display.view(), &params);
        let b = cluster(compact.view(), display.view(), &params);

        assert_eq!(a.assignments, b.assignments);
    }

    #[test]
    fn silhouette_rewards_separation() {
        let data = ndarray::array![[0.0], [0.1], [10.0], [10.1]];
        let scored = [0, 1, 2, 3];

        let good = mean_silhouette(data.view(), &[0, 0, 1, 1], 2, &scored);
        let bad = mean_silhouette(data.view(), &[0, 1, 0, 1], 2, &scored);

        assert!(good > 0.9);
        assert!(bad < 0.0);
    }
}
