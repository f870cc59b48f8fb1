use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::{Rng, rngs::StdRng};

/// Lloyd's k-means with k-means++ seeding over the rows of a matrix.
#[derive(Debug, Clone)]
pub struct KMeans {
    pub centroids: Array2<f64>,
    pub assignments: Vec<usize>,
    pub inertia: f64,
}

impl KMeans {
    /// Runs k-means on `data` (one point per row).
    ///
    /// `k` is clamped to the number of points. Empty clusters are re-seeded with
    /// the point farthest from its centroid among clusters that can spare one,
    /// so every returned cluster owns at least one point whenever `k <= n`,
    /// duplicate rows included.
    pub fn fit(data: ArrayView2<'_, f64>, k: usize, max_iterations: usize, rng: &mut StdRng) -> Self {
        let n = data.nrows();
        if n == 0 || k == 0 {
            return Self {
                centroids: Array2::zeros((0, data.ncols())),
                assignments: vec![],
                inertia: 0.0,
            };
        }

        let k = k.min(n);
        let mut centroids = plus_plus_init(data, k, rng);
        let mut assignments = vec![usize::MAX; n];

        for _ in 0..max_iterations {
            let mut changed = false;
            for (i, point) in data.axis_iter(Axis(0)).enumerate() {
                let (best, best_dist) = nearest(point, centroids.view());
                // 同距離なら現在の割り当てを維持する
                let current = assignments[i];
                if current < k && distance_sq(point, centroids.row(current)) <= best_dist {
                    continue;
                }
                if current != best {
                    assignments[i] = best;
                    changed = true;
                }
            }

            let mut sums = Array2::<f64>::zeros(centroids.raw_dim());
            let mut counts = vec![0_usize; k];
            for (i, point) in data.axis_iter(Axis(0)).enumerate() {
                let cluster = assignments[i];
                let mut row = sums.row_mut(cluster);
                row += &point;
                counts[cluster] += 1;
            }

            for cluster in 0..k {
                if counts[cluster] > 0 {
                    #[allow(clippy::cast_precision_loss)]
                    let count = counts[cluster] as f64;
                    let mean = sums.row(cluster).mapv(|v| v / count);
                    centroids.row_mut(cluster).assign(&mean);
                } else if let Some(far) =
                    farthest_point(data, centroids.view(), &assignments, &counts)
                {
                    counts[assignments[far]] -= 1;
                    counts[cluster] = 1;
                    centroids.row_mut(cluster).assign(&data.row(far));
                    assignments[far] = cluster;
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }

        let inertia = data
            .axis_iter(Axis(0))
            .zip(&assignments)
            .map(|(point, &cluster)| distance_sq(point, centroids.row(cluster)))
            .sum();

        Self {
            centroids,
            assignments,
            inertia,
        }
    }

    #[must_use]
    pub fn k(&self) -> usize {
        self.centroids.nrows()
    }
}

fn plus_plus_init(data: ArrayView2<'_, f64>, k: usize, rng: &mut StdRng) -> Array2<f64> {
    let n = data.nrows();
    let mut centroids = Array2::<f64>::zeros((k, data.ncols()));
    let first = rng.random_range(0..n);
    centroids.row_mut(0).assign(&data.row(first));

    let mut closest: Vec<f64> = data
        .axis_iter(Axis(0))
        .map(|point| distance_sq(point, data.row(first)))
        .collect();

    for c in 1..k {
        let total: f64 = closest.iter().sum();
        let chosen = if total <= f64::EPSILON {
            rng.random_range(0..n)
        } else {
            let mut target = rng.random::<f64>() * total;
            let mut picked = n - 1;
            for (i, weight) in closest.iter().enumerate() {
                if target < *weight {
                    picked = i;
                    break;
                }
                target -= weight;
            }
            picked
        };
        centroids.row_mut(c).assign(&data.row(chosen));
        for (i, point) in data.axis_iter(Axis(0)).enumerate() {
            let d = distance_sq(point, data.row(chosen));
            if d < closest[i] {
                closest[i] = d;
            }
        }
    }

    centroids
}

fn farthest_point(
    data: ArrayView2<'_, f64>,
    centroids: ArrayView2<'_, f64>,
    assignments: &[usize],
    counts: &[usize],
) -> Option<usize> {
    data.axis_iter(Axis(0))
        .zip(assignments)
        .enumerate()
        .filter(|(_, (_, cluster))| **cluster < centroids.nrows() && counts[**cluster] > 1)
        .map(|(i, (point, &cluster))| (i, distance_sq(point, centroids.row(cluster))))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

/// Index of and squared distance to the closest centroid.
pub fn nearest(point: ArrayView1<'_, f64>, centroids: ArrayView2<'_, f64>) -> (usize, f64) {
    let mut best = 0;
    let mut best_dist = f64::MAX;
    for (j, centroid) in centroids.axis_iter(Axis(0)).enumerate() {
        let dist = distance_sq(point, centroid);
        if dist < best_dist {
            best_dist = dist;
            best = j;
        }
    }
    (best, best_dist)
}

pub fn distance_sq(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}
