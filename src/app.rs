use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
    api,
    clients::{
        EmbeddingProvider, HttpEmbeddingProvider, HttpJobDispatcher, HttpLabelProvider,
        JobDispatcher, LabelProvider,
    },
    config::Config,
    observability::Telemetry,
    pipeline::{
        MapService, PipelineParams, SessionWorker, labeler::Labeler, sampler::Sampler,
        vectorizer::Vectorizer,
    },
    store::{EmbeddingCacheStore, PgStore, PostStore, SessionStore, ZoneAccess},
};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

/// 永続化と外部サービスの実装一式。テストではインメモリ実装とスタブを差し込む。
pub struct Backends {
    pub sessions: Arc<dyn SessionStore>,
    pub zones: Arc<dyn ZoneAccess>,
    pub posts: Arc<dyn PostStore>,
    pub embedding_cache: Arc<dyn EmbeddingCacheStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub labels: Arc<dyn LabelProvider>,
    pub dispatcher: Arc<dyn JobDispatcher>,
}

/// 環境変数から切り離したサービス設定。
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    pub pipeline: PipelineParams,
    pub min_viable_posts: usize,
    pub max_sample_size: usize,
    pub embedding_batch_size: usize,
    pub embedding_max_concurrency: usize,
    pub llm_max_concurrency: usize,
    pub worker_lease: Duration,
    pub scheduler_signing_key: Option<String>,
    pub worker_shared_secret: Option<String>,
    /// 同時に実行するワーカー数の上限。
    pub worker_slots: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            pipeline: PipelineParams::default(),
            min_viable_posts: 10,
            max_sample_size: 5000,
            embedding_batch_size: 100,
            embedding_max_concurrency: 4,
            llm_max_concurrency: 4,
            worker_lease: Duration::from_secs(900),
            scheduler_signing_key: None,
            worker_shared_secret: None,
            worker_slots: num_cpus::get().max(1),
        }
    }
}

impl ServiceSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            pipeline: *config.pipeline(),
            min_viable_posts: config.min_viable_posts(),
            max_sample_size: config.max_sample_size(),
            embedding_batch_size: config.embedding_batch_size().get(),
            embedding_max_concurrency: config.embedding_max_concurrency().get(),
            llm_max_concurrency: config.llm_max_concurrency().get(),
            worker_lease: config.worker_lease(),
            scheduler_signing_key: config.scheduler_signing_key().map(ToString::to_string),
            worker_shared_secret: config.worker_shared_secret().map(ToString::to_string),
            ..Self::default()
        }
    }
}

/// Credentials accepted on the worker callback.
#[derive(Debug, Clone, Default)]
pub(crate) struct WorkerAuth {
    pub(crate) signing_key: Option<String>,
    pub(crate) shared_secret: Option<String>,
}

pub struct ComponentRegistry {
    telemetry: Telemetry,
    sessions: Arc<dyn SessionStore>,
    service: MapService,
    worker: SessionWorker,
    worker_auth: WorkerAuth,
    worker_slots: Arc<Semaphore>,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn sessions(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.registry.sessions)
    }

    pub(crate) fn service(&self) -> &MapService {
        &self.registry.service
    }

    pub(crate) fn worker(&self) -> &SessionWorker {
        &self.registry.worker
    }

    pub(crate) fn worker_auth(&self) -> &WorkerAuth {
        &self.registry.worker_auth
    }

    pub(crate) fn worker_slots(&self) -> Arc<Semaphore> {
        Arc::clone(&self.registry.worker_slots)
    }
}

impl ComponentRegistry {
    /// 構成情報から Postgres ストアと HTTP クライアントを初期化し、レジストリを構築する。
    ///
    /// # Errors
    /// Telemetry の初期化、プール設定、マイグレーション、HTTP クライアント構築のいずれかが失敗した場合。
    pub async fn build(config: &Config, shutdown: CancellationToken) -> Result<Self> {
        let telemetry = Telemetry::new(
            config.otel_exporter_endpoint(),
            config.otel_sampling_ratio(),
        )?;
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections())
            .min_connections(config.database_min_connections())
            .acquire_timeout(config.database_acquire_timeout())
            .idle_timeout(Some(config.database_idle_timeout()))
            .max_lifetime(Some(config.database_max_lifetime()))
            .test_before_acquire(true)
            .connect_lazy(config.database_url())
            .context("failed to configure database connection pool")?;
        let store = Arc::new(PgStore::new(pool));
        if config.database_auto_migrate() {
            store.migrate().await?;
        }

        let backends = Backends {
            sessions: store.clone(),
            zones: store.clone(),
            posts: store.clone(),
            embedding_cache: store,
            embedder: Arc::new(HttpEmbeddingProvider::from_config(config)?),
            labels: Arc::new(HttpLabelProvider::from_config(config)?),
            dispatcher: Arc::new(HttpJobDispatcher::from_config(config)?),
        };

        Ok(Self::assemble(
            ServiceSettings::from_config(config),
            telemetry,
            backends,
            shutdown,
        ))
    }

    /// 実装一式と設定からサービスとワーカーを組み立てる。
    #[must_use]
    pub fn assemble(
        settings: ServiceSettings,
        telemetry: Telemetry,
        backends: Backends,
        shutdown: CancellationToken,
    ) -> Self {
        let metrics = telemetry.metrics_arc();
        let vectorizer = Vectorizer::new(
            backends.embedder,
            backends.embedding_cache,
            settings.embedding_batch_size,
            settings.embedding_max_concurrency,
        )
        .with_metrics(Arc::clone(&metrics));
        let labeler = Labeler::new(backends.labels, settings.llm_max_concurrency)
            .with_metrics(Arc::clone(&metrics));

        let service = MapService::new(
            Arc::clone(&backends.sessions),
            backends.zones,
            Sampler::new(Arc::clone(&backends.posts)),
            vectorizer.clone(),
            backends.dispatcher,
            Arc::clone(&metrics),
            settings.min_viable_posts,
            settings.max_sample_size,
        );
        let worker = SessionWorker::new(
            Arc::clone(&backends.sessions),
            backends.posts,
            vectorizer,
            labeler,
            metrics,
        )
        .with_params(settings.pipeline)
        .with_min_viable_posts(settings.min_viable_posts)
        .with_lease(settings.worker_lease)
        .with_shutdown(shutdown);

        Self {
            telemetry,
            sessions: backends.sessions,
            service,
            worker,
            worker_auth: WorkerAuth {
                signing_key: settings.scheduler_signing_key,
                shared_secret: settings.worker_shared_secret,
            },
            worker_slots: Arc::new(Semaphore::new(settings.worker_slots.max(1))),
        }
    }

    #[must_use]
    pub fn sessions(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.sessions)
    }

    #[must_use]
    pub fn worker(&self) -> &SessionWorker {
        &self.worker
    }
}

pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}
