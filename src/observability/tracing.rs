use anyhow::{Context, Error, Result};
use once_cell::sync::OnceCell;
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    trace::{RandomIdGenerator, Sampler, SdkTracer, SdkTracerProvider},
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Tracing サブスクライバを一度だけ初期化する。
///
/// エンドポイントが与えられた場合は OTLP エクスポーターを重ね、
/// 構築に失敗した場合は JSON ログのみで起動する。
///
/// # Errors
/// サブスクライバの初期化に失敗した場合はエラーを返す。
pub(crate) fn init(otel_endpoint: Option<&str>, sampling_ratio: f64) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .json()
            .flatten_event(true);

        let exporter = otel_endpoint.map(|endpoint| (endpoint, init_tracer(endpoint, sampling_ratio)));

        match exporter {
            Some((endpoint, Ok(tracer))) => {
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(otel_layer)
                    .try_init()
                    .map_err(|e| Error::msg(e.to_string()))?;
                info!(otel_enabled = true, endpoint = %endpoint, sampling_ratio, "tracing initialized");
            }
            fallback => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .try_init()
                    .map_err(|e| Error::msg(e.to_string()))?;
                if let Some((endpoint, Err(error))) = fallback {
                    warn!(
                        otel_enabled = false,
                        endpoint = %endpoint,
                        error = %error,
                        "tracing initialized without OpenTelemetry (exporter init failed)"
                    );
                } else {
                    info!(otel_enabled = false, "tracing initialized");
                }
            }
        }

        Ok::<(), Error>(())
    })?;
    Ok(())
}

fn init_tracer(endpoint: &str, sampling_ratio: f64) -> Result<SdkTracer> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("failed to build OTLP span exporter")?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", "opinion-map-worker"),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build();

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::TraceIdRatioBased(sampling_ratio.clamp(0.0, 1.0)))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = tracer_provider.tracer("opinion-map-worker");
    global::set_tracer_provider(tracer_provider);

    Ok(tracer)
}
