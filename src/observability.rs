pub mod metrics;
pub(crate) mod tracing;

use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Encoder, Registry, TextEncoder};

pub use self::metrics::Metrics;

/// Telemetry（メトリクスとトレーシング）を管理する構造体。
#[derive(Debug, Clone)]
pub struct Telemetry {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl Telemetry {
    /// トレーシングを初期化し、専用レジストリにメトリクスを登録する。
    ///
    /// # Errors
    /// サブスクライバ初期化またはメトリクス登録に失敗した場合。
    pub fn new(otel_endpoint: Option<&str>, sampling_ratio: f64) -> Result<Self> {
        tracing::init(otel_endpoint, sampling_ratio)?;
        Self::without_tracing()
    }

    /// サブスクライバを触らずにメトリクスだけを用意する（テスト用途）。
    ///
    /// # Errors
    /// メトリクス登録に失敗した場合。
    pub fn without_tracing() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(
            Metrics::new(Arc::clone(&registry)).context("failed to register metrics")?,
        );
        Ok(Self { registry, metrics })
    }

    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    #[must_use]
    pub fn metrics_arc(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn record_ready_probe(&self, ready: bool) {
        ::tracing::debug!(ready, "ready probe");
    }

    pub fn record_live_probe(&self) {
        ::tracing::trace!("live probe");
    }

    /// 専用レジストリの内容を Prometheus テキスト形式で返す。
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(error) = encoder.encode(&metric_families, &mut buffer) {
            ::tracing::warn!(error = %error, "failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
