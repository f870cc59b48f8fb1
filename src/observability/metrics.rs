/// Prometheusメトリクス定義。
use std::sync::Arc;

use prometheus::{
    Counter, Gauge, Histogram, HistogramOpts, Registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_with_registry,
};

#[derive(Debug, Clone)]
pub struct Metrics {
    // セッション
    pub sessions_started: Counter,
    pub sessions_reused: Counter,
    pub sessions_completed: Counter,
    pub sessions_failed: Counter,
    pub sessions_cancelled: Counter,
    pub scheduling_failures: Counter,

    // 埋め込み・ラベリング
    pub embeddings_computed: Counter,
    pub embedding_cache_hits: Counter,
    pub embedding_failures: Counter,
    pub label_fallbacks: Counter,

    // フェーズ所要時間
    pub vectorize_duration: Histogram,
    pub reduce_duration: Histogram,
    pub cluster_duration: Histogram,
    pub label_duration: Histogram,
    pub session_duration: Histogram,

    pub active_workers: Gauge,
}

impl Metrics {
    /// 指定レジストリにメトリクスを登録する。
    ///
    /// # Errors
    /// 同名メトリクスが既に登録されている場合。
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let phase_buckets = vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];
        let session_buckets = vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 2400.0];

        Ok(Self {
            sessions_started: register_counter_with_registry!(
                "opinion_map_sessions_started_total",
                "Sessions created and handed to the scheduler",
                registry
            )?,
            sessions_reused: register_counter_with_registry!(
                "opinion_map_sessions_reused_total",
                "Start requests answered with an already active session",
                registry
            )?,
            sessions_completed: register_counter_with_registry!(
                "opinion_map_sessions_completed_total",
                "Sessions that reached completed",
                registry
            )?,
            sessions_failed: register_counter_with_registry!(
                "opinion_map_sessions_failed_total",
                "Sessions that ended in failed",
                registry
            )?,
            sessions_cancelled: register_counter_with_registry!(
                "opinion_map_sessions_cancelled_total",
                "Sessions stopped at a phase boundary after cancellation",
                registry
            )?,
            scheduling_failures: register_counter_with_registry!(
                "opinion_map_scheduling_failures_total",
                "Worker enqueue attempts rejected by the scheduler",
                registry
            )?,
            embeddings_computed: register_counter_with_registry!(
                "opinion_map_embeddings_computed_total",
                "Embeddings fetched from the provider",
                registry
            )?,
            embedding_cache_hits: register_counter_with_registry!(
                "opinion_map_embedding_cache_hits_total",
                "Embeddings served from the cache",
                registry
            )?,
            embedding_failures: register_counter_with_registry!(
                "opinion_map_embedding_failures_total",
                "Posts excluded because their embedding batch failed",
                registry
            )?,
            label_fallbacks: register_counter_with_registry!(
                "opinion_map_label_fallbacks_total",
                "Clusters labelled with the generic placeholder",
                registry
            )?,
            vectorize_duration: register_histogram_with_registry!(
                HistogramOpts::new(
                    "opinion_map_vectorize_duration_seconds",
                    "Vectorizing phase duration"
                )
                .buckets(phase_buckets.clone()),
                registry
            )?,
            reduce_duration: register_histogram_with_registry!(
                HistogramOpts::new(
                    "opinion_map_reduce_duration_seconds",
                    "Reducing phase duration"
                )
                .buckets(phase_buckets.clone()),
                registry
            )?,
            cluster_duration: register_histogram_with_registry!(
                HistogramOpts::new(
                    "opinion_map_cluster_duration_seconds",
                    "Clustering phase duration"
                )
                .buckets(phase_buckets.clone()),
                registry
            )?,
            label_duration: register_histogram_with_registry!(
                HistogramOpts::new(
                    "opinion_map_label_duration_seconds",
                    "Labeling phase duration"
                )
                .buckets(phase_buckets),
                registry
            )?,
            session_duration: register_histogram_with_registry!(
                HistogramOpts::new(
                    "opinion_map_session_duration_seconds",
                    "Wall time from claim to terminal state"
                )
                .buckets(session_buckets),
                registry
            )?,
            active_workers: register_gauge_with_registry!(
                "opinion_map_active_workers",
                "Worker runs currently executing",
                registry
            )?,
        })
    }
}
