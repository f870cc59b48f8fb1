use serde::{Deserialize, Serialize};

/// Numeric hyperparameters shared by the reduction and clustering stages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineParams {
    /// Dimensionality of the compact analysis space.
    pub compact_dims: usize,
    pub pca_power_iterations: usize,
    pub min_clusters: usize,
    pub max_clusters: usize,
    pub kmeans_max_iterations: usize,
    /// Upper bound on points scored when comparing candidate cluster counts.
    pub silhouette_sample: usize,
    pub outlier_z_threshold: f64,
    pub layout_neighbors: usize,
    pub layout_epochs: usize,
    pub layout_negative_samples: usize,
    pub seed: u64,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            compact_dims: 20,
            pca_power_iterations: 12,
            min_clusters: 3,
            max_clusters: 15,
            kmeans_max_iterations: 100,
            silhouette_sample: 600,
            outlier_z_threshold: 2.5,
            layout_neighbors: 15,
            layout_epochs: 200,
            layout_negative_samples: 5,
            seed: 42,
        }
    }
}

impl PipelineParams {
    /// Copy with the seed mixed with a per-session value.
    #[must_use]
    pub fn with_session_seed(mut self, session_seed: u64) -> Self {
        self.seed ^= session_seed.rotate_left(17);
        self
    }

    /// Clusters smaller than this are dissolved into outliers.
    #[must_use]
    pub fn min_cluster_size(&self, n: usize) -> usize {
        (n / 100).max(3)
    }
}
