//! Worker driver invoked by the scheduler callback.
//!
//! Runs one session through vectorize → reduce → cluster → label, persisting
//! after every phase. Errors never escape [`SessionWorker::run`]: they end in
//! a terminal session and a [`WorkerOutcome`].

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{
    clusterer::cluster,
    labeler::{Labeler, placeholder_records},
    params::PipelineParams,
    progress::{ProgressSink, SessionProgress},
    reducer::reduce,
    session::Phase,
    vectorizer::Vectorizer,
};
use crate::error::OpinionMapError;
use crate::observability::Metrics;
use crate::store::{
    PostStore, SessionStore,
    models::{PostRecord, ProjectionRecord, Session, SessionCounters, SessionStatus},
};

/// What a worker invocation did. Always reported to the scheduler with 200.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerOutcome {
    Completed,
    Failed,
    Cancelled,
    Skipped,
    NotFound,
}

/// Why a run stopped at a phase boundary.
#[derive(Debug, Error)]
enum Halt {
    #[error("session is no longer runnable")]
    Cancelled,
    #[error("worker interrupted by shutdown")]
    Interrupted,
}

/// Phase-boundary check: in-process shutdown first, then the persisted status.
pub struct CancellationProbe {
    token: CancellationToken,
    sessions: Arc<dyn SessionStore>,
    session_id: Uuid,
}

impl CancellationProbe {
    pub fn new(token: CancellationToken, sessions: Arc<dyn SessionStore>, session_id: Uuid) -> Self {
        Self {
            token,
            sessions,
            session_id,
        }
    }

    /// Advances into `next`. A refused transition means the session was
    /// cancelled (or otherwise terminated) while the previous phase ran.
    ///
    /// # Errors
    /// A halt marker, or the store failing.
    pub async fn checkpoint(&self, next: Phase) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Halt::Interrupted.into());
        }
        let advanced = self
            .sessions
            .advance_session(self.session_id, &next.entry_update())
            .await
            .with_context(|| format!("failed to enter phase {}", next.name()))?;
        if advanced {
            Ok(())
        } else {
            Err(Halt::Cancelled.into())
        }
    }
}

struct ActiveWorkerGuard(Arc<Metrics>);

impl ActiveWorkerGuard {
    fn enter(metrics: Arc<Metrics>) -> Self {
        metrics.active_workers.inc();
        Self(metrics)
    }
}

impl Drop for ActiveWorkerGuard {
    fn drop(&mut self) {
        self.0.active_workers.dec();
    }
}

#[derive(Clone)]
pub struct SessionWorker {
    sessions: Arc<dyn SessionStore>,
    posts: Arc<dyn PostStore>,
    vectorizer: Vectorizer,
    labeler: Labeler,
    metrics: Arc<Metrics>,
    params: PipelineParams,
    min_viable_posts: usize,
    lease: Duration,
    shutdown: CancellationToken,
}

impl SessionWorker {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        posts: Arc<dyn PostStore>,
        vectorizer: Vectorizer,
        labeler: Labeler,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sessions,
            posts,
            vectorizer,
            labeler,
            metrics,
            params: PipelineParams::default(),
            min_viable_posts: 10,
            lease: Duration::from_secs(900),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: PipelineParams) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_min_viable_posts(mut self, min_viable_posts: usize) -> Self {
        self.min_viable_posts = min_viable_posts;
        self
    }

    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Runs the session if it is claimable. Never returns an error.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn run(&self, session_id: Uuid) -> WorkerOutcome {
        let session = match self.sessions.find_session(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                warn!("worker invoked for unknown session");
                return WorkerOutcome::NotFound;
            }
            Err(error) => {
                error!(error = ?error, "failed to load session");
                return WorkerOutcome::Failed;
            }
        };

        if session.status.is_terminal() {
            info!(status = %session.status, "session already terminal, nothing to do");
            return WorkerOutcome::Skipped;
        }
        if session.status != SessionStatus::Pending {
            return self.handle_redelivery(&session).await;
        }

        match self
            .sessions
            .claim_session(session_id, &Phase::Vectorizing.entry_update())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!("session claimed by another worker");
                return WorkerOutcome::Skipped;
            }
            Err(error) => {
                error!(error = ?error, "failed to claim session");
                return WorkerOutcome::Failed;
            }
        }

        let _active = ActiveWorkerGuard::enter(Arc::clone(&self.metrics));
        let started = Instant::now();
        let probe = CancellationProbe::new(
            self.shutdown.clone(),
            Arc::clone(&self.sessions),
            session_id,
        );

        match self.execute(&session, &probe, started).await {
            Ok(true) => {
                self.metrics.sessions_completed.inc();
                self.metrics
                    .session_duration
                    .observe(started.elapsed().as_secs_f64());
                info!(elapsed_ms = started.elapsed().as_millis(), "session completed");
                WorkerOutcome::Completed
            }
            Ok(false) => {
                info!("session left running state before completion");
                WorkerOutcome::Cancelled
            }
            Err(error) => self.settle_error(session_id, &error).await,
        }
    }

    /// A callback for a session that is already running. Within the lease
    /// this is a duplicate delivery; past it the previous worker is presumed dead.
    async fn handle_redelivery(&self, session: &Session) -> WorkerOutcome {
        let idle = (Utc::now() - session.updated_at).to_std().unwrap_or_default();
        if idle <= self.lease {
            info!(status = %session.status, idle_secs = idle.as_secs(), "session already running");
            return WorkerOutcome::Skipped;
        }

        warn!(status = %session.status, idle_secs = idle.as_secs(), "worker lease expired");
        match self
            .sessions
            .fail_session(session.id, "worker lease expired", "")
            .await
        {
            Ok(true) => {
                self.metrics.sessions_failed.inc();
                WorkerOutcome::Failed
            }
            Ok(false) => WorkerOutcome::Skipped,
            Err(error) => {
                error!(error = ?error, "failed to expire session lease");
                WorkerOutcome::Failed
            }
        }
    }

    async fn settle_error(&self, session_id: Uuid, error: &anyhow::Error) -> WorkerOutcome {
        let message = match error.downcast_ref::<Halt>() {
            Some(Halt::Cancelled) => {
                info!("cancellation honoured at phase boundary");
                return WorkerOutcome::Cancelled;
            }
            Some(Halt::Interrupted) => Halt::Interrupted.to_string(),
            None => format!("{error:#}"),
        };

        error!(error = ?error, "session failed");
        match self
            .sessions
            .fail_session(session_id, &message, &format!("{error:?}"))
            .await
        {
            Ok(true) => {
                self.metrics.sessions_failed.inc();
                WorkerOutcome::Failed
            }
            // 既に終端（キャンセル済みなど）
            Ok(false) => WorkerOutcome::Cancelled,
            Err(store_error) => {
                error!(error = ?store_error, "failed to record session failure");
                WorkerOutcome::Failed
            }
        }
    }

    /// Returns `Ok(false)` when the final transition to completed is refused.
    async fn execute(
        &self,
        session: &Session,
        probe: &CancellationProbe,
        started: Instant,
    ) -> Result<bool> {
        let session_id = session.id;
        let config = session.config.v1();
        let params = self.params.with_session_seed(config.seed);
        let progress = SessionProgress::new(Arc::clone(&self.sessions), session_id);

        // vectorizing
        let phase_started = Instant::now();
        let posts = self
            .posts
            .fetch_posts(&config.sampled_post_ids)
            .await
            .context("failed to load sampled posts")?;
        let report = self.vectorizer.vectorize(&posts, &progress).await?;
        self.metrics
            .vectorize_duration
            .observe(phase_started.elapsed().as_secs_f64());

        let mut counters = SessionCounters {
            total_posts: posts.len(),
            vectorized_count: report.vectors.len(),
            ..SessionCounters::default()
        };
        self.sessions.update_counters(session_id, counters).await?;
        if report.vectors.len() < self.min_viable_posts {
            return Err(OpinionMapError::InsufficientData {
                found: report.vectors.len(),
                minimum: self.min_viable_posts,
            }
            .into());
        }
        let rows: Vec<PostRecord> = report
            .vectors
            .iter()
            .map(|(index, _)| posts[*index].clone())
            .collect();
        let vectors: Vec<Vec<f32>> = report.vectors.into_iter().map(|(_, v)| v).collect();

        // reducing
        probe.checkpoint(Phase::Reducing).await?;
        let phase_started = Instant::now();
        let reduction = spawn_blocking(move || reduce(&vectors, &params))
            .await
            .context("reducer task panicked")??;
        self.metrics
            .reduce_duration
            .observe(phase_started.elapsed().as_secs_f64());
        progress
            .report(Phase::Reducing.progress_band().1, "projection ready")
            .await;

        // clustering
        probe.checkpoint(Phase::Clustering).await?;
        let phase_started = Instant::now();
        let (reduction, clustering) = spawn_blocking(move || {
            let clustering = cluster(reduction.compact.view(), reduction.display.view(), &params);
            (reduction, clustering)
        })
        .await
        .context("clusterer task panicked")?;
        self.metrics
            .cluster_duration
            .observe(phase_started.elapsed().as_secs_f64());

        let projections: Vec<ProjectionRecord> = rows
            .iter()
            .enumerate()
            .map(|(i, post)| {
                let point = reduction.display.row(i);
                ProjectionRecord {
                    post_id: post.id,
                    x: point[0],
                    y: point[1],
                    z: point[2],
                    cluster_id: clustering.assignments[i],
                    confidence: clustering.confidences[i],
                }
            })
            .collect();
        self.sessions
            .save_projections(session_id, &projections)
            .await?;
        self.sessions
            .save_clusters(
                session_id,
                &placeholder_records(&rows, reduction.compact.view(), &clustering),
            )
            .await?;
        counters.cluster_count = clustering.clusters.len();
        counters.outlier_count = clustering.outlier_count();
        self.sessions.update_counters(session_id, counters).await?;
        info!(
            clusters = counters.cluster_count,
            outliers = counters.outlier_count,
            chosen_k = clustering.chosen_k,
            silhouette = clustering.silhouette,
            "clustering finished"
        );
        progress
            .report(Phase::Clustering.progress_band().1, "clusters ready")
            .await;

        // labeling
        probe.checkpoint(Phase::Labeling).await?;
        let phase_started = Instant::now();
        let records = self
            .labeler
            .label(&rows, reduction.compact.view(), &clustering, &progress)
            .await;
        self.sessions.save_clusters(session_id, &records).await?;
        self.metrics
            .label_duration
            .observe(phase_started.elapsed().as_secs_f64());

        let execution_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.sessions
            .complete_session(session_id, execution_ms)
            .await
            .context("failed to complete session")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ClusterLabel, EmbeddingProvider, LabelProvider, LabelRequest};
    use crate::observability::Telemetry;
    use crate::pipeline::session::{SessionConfig, SessionConfigV1};
    use crate::store::InMemoryStore;
    use crate::store::models::{CreateOutcome, NewSession};
    use async_trait::async_trait;

    struct HashEmbedding;

    #[async_trait]
    impl EmbeddingProvider for HashEmbedding {
        fn model(&self) -> &str {
            "hash"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let topic = t.len() % 3;
                    (0..8)
                        .map(|j| if j == topic { 5.0 } else { (t.len() % 7) as f32 * 0.01 })
                        .collect()
                })
                .collect())
        }
    }

    struct FailingLabels;

    #[async_trait]
    impl LabelProvider for FailingLabels {
        async fn label(&self, _request: &LabelRequest) -> Result<ClusterLabel> {
            anyhow::bail!("offline")
        }
    }

    async fn setup(post_count: usize) -> (Arc<InMemoryStore>, SessionWorker, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let zone_id = Uuid::new_v4();
        store.add_zone(zone_id, &["analyst"]).unwrap();
        let now = Utc::now();
        let posts: Vec<PostRecord> = (0..post_count)
            .map(|i| PostRecord {
                id: Uuid::new_v4(),
                zone_id,
                content: format!("{} opinion {i}", "x".repeat(i % 3 + 1)),
                posted_at: now - chrono::Duration::minutes(i as i64),
                engagement: i as i64,
            })
            .collect();
        let ids = posts.iter().map(|p| p.id).collect::<Vec<_>>();
        store.add_posts(posts).unwrap();

        let session_id = Uuid::now_v7();
        let outcome = store
            .create_session(NewSession {
                id: session_id,
                zone_id,
                config: SessionConfig::V1(SessionConfigV1 {
                    start: now - chrono::Duration::days(1),
                    end: now,
                    requested_sample_size: post_count,
                    actual_sample_size: ids.len(),
                    sampled_post_ids: ids,
                    total_available: post_count,
                    cache_hit_rate: 0.0,
                    estimated_time_seconds: 10.0,
                    seed: 7,
                }),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, CreateOutcome::Created(_)));

        let telemetry = Telemetry::without_tracing().unwrap();
        let worker = SessionWorker::new(
            store.clone(),
            store.clone(),
            Vectorizer::new(Arc::new(HashEmbedding), store.clone(), 16, 2),
            Labeler::new(Arc::new(FailingLabels), 2),
            telemetry.metrics_arc(),
        );
        (store, worker, session_id)
    }

    fn assert_send<T: Send>(_: T) {}

    #[tokio::test]
    async fn run_future_is_send_for_axum_handlers() {
        let (_store, worker, session_id) = setup(12).await;

        assert_send(worker.run(session_id));
    }

    #[tokio::test]
    async fn completes_with_placeholder_labels_when_labeling_is_down() {
        let (store, worker, session_id) = setup(40).await;

        let outcome = worker.run(session_id).await;

        assert_eq!(outcome, WorkerOutcome::Completed);
        let session = store.find_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.progress, 100);
        let clusters = store.list_clusters(session_id).await.unwrap();
        assert!(!clusters.is_empty());
        assert!(clusters.iter().all(|c| c.label.starts_with("Cluster ")));
    }

    #[tokio::test]
    async fn rerun_of_terminal_session_is_skipped() {
        let (_store, worker, session_id) = setup(40).await;
        assert_eq!(worker.run(session_id).await, WorkerOutcome::Completed);

        assert_eq!(worker.run(session_id).await, WorkerOutcome::Skipped);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (_store, worker, _) = setup(12).await;

        assert_eq!(worker.run(Uuid::new_v4()).await, WorkerOutcome::NotFound);
    }

    #[tokio::test]
    async fn too_few_vectors_fail_the_session() {
        let (store, worker, session_id) = setup(12).await;
        let worker = worker.with_min_viable_posts(20);

        assert_eq!(worker.run(session_id).await, WorkerOutcome::Failed);
        let session = store.find_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.error_message.unwrap().contains("at least 20"));
    }

    #[tokio::test]
    async fn shutdown_interrupts_at_next_boundary() {
        let (store, worker, session_id) = setup(40).await;
        let token = CancellationToken::new();
        token.cancel();
        let worker = worker.with_shutdown(token);

        assert_eq!(worker.run(session_id).await, WorkerOutcome::Failed);
        let session = store.find_session(session_id).await.unwrap().unwrap();
        assert_eq!(
            session.error_message.as_deref(),
            Some("worker interrupted by shutdown")
        );
    }

    #[tokio::test]
    async fn stale_running_session_expires_lease() {
        let (store, worker, session_id) = setup(12).await;
        store
            .claim_session(session_id, &Phase::Vectorizing.entry_update())
            .await
            .unwrap();

        assert_eq!(worker.run(session_id).await, WorkerOutcome::Skipped);

        store
            .backdate_session(session_id, chrono::Duration::hours(2))
            .unwrap();
        assert_eq!(worker.run(session_id).await, WorkerOutcome::Failed);
        let session = store.find_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.error_message.as_deref(), Some("worker lease expired"));
    }
}
