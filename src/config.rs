use std::{env, net::SocketAddr, num::NonZeroUsize, time::Duration};

use thiserror::Error;

use crate::pipeline::params::PipelineParams;

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    http_bind: SocketAddr,
    database_url: String,
    database_auto_migrate: bool,
    database_max_connections: u32,
    database_min_connections: u32,
    database_acquire_timeout: Duration,
    database_idle_timeout: Duration,
    database_max_lifetime: Duration,
    embedding_base_url: String,
    embedding_api_key: Option<String>,
    embedding_model: String,
    embedding_batch_size: NonZeroUsize,
    embedding_max_concurrency: NonZeroUsize,
    embedding_timeout: Duration,
    llm_base_url: String,
    llm_api_key: Option<String>,
    llm_model: String,
    llm_max_concurrency: NonZeroUsize,
    llm_timeout: Duration,
    scheduler_publish_url: String,
    scheduler_token: Option<String>,
    scheduler_signing_key: Option<String>,
    worker_callback_url: String,
    worker_shared_secret: Option<String>,
    http_max_retries: usize,
    http_backoff_base_ms: u64,
    http_backoff_cap_ms: u64,
    min_viable_posts: usize,
    max_sample_size: usize,
    worker_lease: Duration,
    session_retention_days: u32,
    otel_exporter_endpoint: Option<String>,
    otel_sampling_ratio: f64,
    pipeline: PipelineParams,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// Reads and validates the worker configuration from the process environment.
    ///
    /// # Errors
    /// Returns [`ConfigError::Missing`] when a required variable is unset and
    /// [`ConfigError::Invalid`] when a value fails to parse or violates a bound.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env_var("DATABASE_URL")?;
        let http_bind = parse_socket_addr("OPINION_MAP_HTTP_BIND", "0.0.0.0:9010")?;
        let database_auto_migrate = parse_bool("DATABASE_AUTO_MIGRATE", false)?;

        // Database connection pool
        let database_max_connections = parse_u32("DATABASE_MAX_CONNECTIONS", 20)?;
        let database_min_connections = parse_u32("DATABASE_MIN_CONNECTIONS", 2)?;
        let database_acquire_timeout = parse_duration_secs("DATABASE_ACQUIRE_TIMEOUT_SECS", 30)?;
        let database_idle_timeout = parse_duration_secs("DATABASE_IDLE_TIMEOUT_SECS", 600)?;
        let database_max_lifetime = parse_duration_secs("DATABASE_MAX_LIFETIME_SECS", 1800)?;

        // Embedding provider
        let embedding_base_url = env_var("EMBEDDING_BASE_URL")?;
        let embedding_api_key = env::var("EMBEDDING_API_KEY").ok();
        let embedding_model = env::var("EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let embedding_batch_size = parse_non_zero_usize("EMBEDDING_BATCH_SIZE", 100)?;
        let embedding_max_concurrency = parse_non_zero_usize("EMBEDDING_MAX_CONCURRENCY", 4)?;
        let embedding_timeout = parse_duration_secs("EMBEDDING_TIMEOUT_SECS", 60)?;

        // Language model
        let llm_base_url = env_var("LLM_BASE_URL")?;
        let llm_api_key = env::var("LLM_API_KEY").ok();
        let llm_model = env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let llm_max_concurrency = parse_non_zero_usize("LLM_MAX_CONCURRENCY", 4)?;
        let llm_timeout = parse_duration_secs("LLM_TIMEOUT_SECS", 60)?;

        // Scheduler and worker callback
        let scheduler_publish_url = env_var("SCHEDULER_PUBLISH_URL")?;
        let scheduler_token = env::var("SCHEDULER_TOKEN").ok();
        let scheduler_signing_key = env::var("SCHEDULER_SIGNING_KEY").ok();
        let worker_callback_url = env_var("WORKER_CALLBACK_URL")?;
        let worker_shared_secret = env::var("WORKER_SHARED_SECRET").ok();

        // Retry settings (exponential backoff + jitter)
        let http_max_retries = parse_usize("HTTP_MAX_RETRIES", 3)?;
        let http_backoff_base_ms = parse_u64("HTTP_BACKOFF_BASE_MS", 250)?;
        let http_backoff_cap_ms = parse_u64("HTTP_BACKOFF_CAP_MS", 10000)?;

        // Session limits
        let min_viable_posts = parse_usize("MIN_VIABLE_POSTS", 10)?;
        if min_viable_posts == 0 {
            return Err(ConfigError::Invalid {
                name: "MIN_VIABLE_POSTS",
                source: anyhow::anyhow!("must be greater than zero"),
            });
        }
        let max_sample_size = parse_usize("MAX_SAMPLE_SIZE", 5000)?;
        if max_sample_size < min_viable_posts {
            return Err(ConfigError::Invalid {
                name: "MAX_SAMPLE_SIZE",
                source: anyhow::anyhow!("must not be below MIN_VIABLE_POSTS ({min_viable_posts})"),
            });
        }
        let worker_lease = parse_duration_secs("WORKER_LEASE_SECS", 900)?;
        let session_retention_days = parse_u32("SESSION_RETENTION_DAYS", 30)?;

        // OpenTelemetry settings
        let otel_exporter_endpoint = env::var("OTEL_EXPORTER_ENDPOINT").ok();
        let otel_sampling_ratio = parse_f64("OTEL_SAMPLING_RATIO", 1.0)?;

        let pipeline = parse_pipeline_params()?;

        Ok(Self {
            http_bind,
            database_url,
            database_auto_migrate,
            database_max_connections,
            database_min_connections,
            database_acquire_timeout,
            database_idle_timeout,
            database_max_lifetime,
            embedding_base_url,
            embedding_api_key,
            embedding_model,
            embedding_batch_size,
            embedding_max_concurrency,
            embedding_timeout,
            llm_base_url,
            llm_api_key,
            llm_model,
            llm_max_concurrency,
            llm_timeout,
            scheduler_publish_url,
            scheduler_token,
            scheduler_signing_key,
            worker_callback_url,
            worker_shared_secret,
            http_max_retries,
            http_backoff_base_ms,
            http_backoff_cap_ms,
            min_viable_posts,
            max_sample_size,
            worker_lease,
            session_retention_days,
            otel_exporter_endpoint,
            otel_sampling_ratio,
            pipeline,
        })
    }

    #[must_use]
    pub fn http_bind(&self) -> SocketAddr {
        self.http_bind
    }

    #[must_use]
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    #[must_use]
    pub fn database_auto_migrate(&self) -> bool {
        self.database_auto_migrate
    }

    #[must_use]
    pub fn database_max_connections(&self) -> u32 {
        self.database_max_connections
    }

    #[must_use]
    pub fn database_min_connections(&self) -> u32 {
        self.database_min_connections
    }

    #[must_use]
    pub fn database_acquire_timeout(&self) -> Duration {
        self.database_acquire_timeout
    }

    #[must_use]
    pub fn database_idle_timeout(&self) -> Duration {
        self.database_idle_timeout
    }

    #[must_use]
    pub fn database_max_lifetime(&self) -> Duration {
        self.database_max_lifetime
    }

    #[must_use]
    pub fn embedding_base_url(&self) -> &str {
        &self.embedding_base_url
    }

    #[must_use]
    pub fn embedding_api_key(&self) -> Option<&str> {
        self.embedding_api_key.as_deref()
    }

    #[must_use]
    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    #[must_use]
    pub fn embedding_batch_size(&self) -> NonZeroUsize {
        self.embedding_batch_size
    }

    #[must_use]
    pub fn embedding_max_concurrency(&self) -> NonZeroUsize {
        self.embedding_max_concurrency
    }

    #[must_use]
    pub fn embedding_timeout(&self) -> Duration {
        self.embedding_timeout
    }

    #[must_use]
    pub fn llm_base_url(&self) -> &str {
        &self.llm_base_url
    }

    #[must_use]
    pub fn llm_api_key(&self) -> Option<&str> {
        self.llm_api_key.as_deref()
    }

    #[must_use]
    pub fn llm_model(&self) -> &str {
        &self.llm_model
    }

    #[must_use]
    pub fn llm_max_concurrency(&self) -> NonZeroUsize {
        self.llm_max_concurrency
    }

    #[must_use]
    pub fn llm_timeout(&self) -> Duration {
        self.llm_timeout
    }

    #[must_use]
    pub fn scheduler_publish_url(&self) -> &str {
        &self.scheduler_publish_url
    }

    #[must_use]
    pub fn scheduler_token(&self) -> Option<&str> {
        self.scheduler_token.as_deref()
    }

    #[must_use]
    pub fn scheduler_signing_key(&self) -> Option<&str> {
        self.scheduler_signing_key.as_deref()
    }

    #[must_use]
    pub fn worker_callback_url(&self) -> &str {
        &self.worker_callback_url
    }

    #[must_use]
    pub fn worker_shared_secret(&self) -> Option<&str> {
        self.worker_shared_secret.as_deref()
    }

    #[must_use]
    pub fn http_max_retries(&self) -> usize {
        self.http_max_retries
    }

    #[must_use]
    pub fn http_backoff_base_ms(&self) -> u64 {
        self.http_backoff_base_ms
    }

    #[must_use]
    pub fn http_backoff_cap_ms(&self) -> u64 {
        self.http_backoff_cap_ms
    }

    #[must_use]
    pub fn min_viable_posts(&self) -> usize {
        self.min_viable_posts
    }

    #[must_use]
    pub fn max_sample_size(&self) -> usize {
        self.max_sample_size
    }

    #[must_use]
    pub fn worker_lease(&self) -> Duration {
        self.worker_lease
    }

    #[must_use]
    pub fn session_retention_days(&self) -> u32 {
        self.session_retention_days
    }

    #[must_use]
    pub fn otel_exporter_endpoint(&self) -> Option<&str> {
        self.otel_exporter_endpoint.as_deref()
    }

    #[must_use]
    pub fn otel_sampling_ratio(&self) -> f64 {
        self.otel_sampling_ratio
    }

    #[must_use]
    pub fn pipeline(&self) -> &PipelineParams {
        &self.pipeline
    }
}

fn parse_pipeline_params() -> Result<PipelineParams, ConfigError> {
    let defaults = PipelineParams::default();
    let compact_dims = parse_non_zero_usize("REDUCER_COMPONENTS", defaults.compact_dims)?.get();
    let min_clusters = parse_usize("CLUSTER_MIN_K", defaults.min_clusters)?;
    let max_clusters = parse_usize("CLUSTER_MAX_K", defaults.max_clusters)?;
    if min_clusters < 2 {
        return Err(ConfigError::Invalid {
            name: "CLUSTER_MIN_K",
            source: anyhow::anyhow!("must be at least 2"),
        });
    }
    if max_clusters < min_clusters {
        return Err(ConfigError::Invalid {
            name: "CLUSTER_MAX_K",
            source: anyhow::anyhow!("must not be below CLUSTER_MIN_K ({min_clusters})"),
        });
    }
    let outlier_z_threshold = parse_f64("OUTLIER_Z_THRESHOLD", defaults.outlier_z_threshold)?;
    let layout_neighbors = parse_non_zero_usize("LAYOUT_NEIGHBORS", defaults.layout_neighbors)?.get();
    let layout_epochs = parse_non_zero_usize("LAYOUT_EPOCHS", defaults.layout_epochs)?.get();
    let seed = parse_u64("PIPELINE_SEED", defaults.seed)?;

    Ok(PipelineParams {
        compact_dims,
        min_clusters,
        max_clusters,
        outlier_z_threshold,
        layout_neighbors,
        layout_epochs,
        seed,
        ..defaults
    })
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_socket_addr(name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());

    raw.parse().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_non_zero_usize(name: &'static str, default: usize) -> Result<NonZeroUsize, ConfigError> {
    let parsed = parse_usize(name, default)?;
    NonZeroUsize::new(parsed).ok_or_else(|| ConfigError::Invalid {
        name,
        source: anyhow::anyhow!("must be greater than zero"),
    })
}

fn parse_duration_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_secs)?;
    Ok(Duration::from_secs(value))
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u32>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<f64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("invalid boolean value: {raw}"),
        }),
    }
}
