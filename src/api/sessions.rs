use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    api::caller_id,
    app::AppState,
    error::OpinionMapError,
    pipeline::session::remaining_seconds,
    store::models::{ClusterRecord, ProjectionRecord, Session, SessionStatus},
};

/// Status view of a session. Sampled post ids stay internal.
#[derive(Debug, Serialize)]
pub(crate) struct SessionView {
    session_id: Uuid,
    zone_id: Uuid,
    status: SessionStatus,
    progress: u8,
    current_phase: Option<String>,
    phase_message: Option<String>,
    sampled_posts: usize,
    total_available: usize,
    cache_hit_rate: f64,
    estimated_remaining_seconds: f64,
    total_posts: usize,
    vectorized_count: usize,
    cluster_count: usize,
    outlier_count: usize,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    execution_ms: Option<i64>,
    error_message: Option<String>,
}

impl From<Session> for SessionView {
    fn from(session: Session) -> Self {
        let config = session.config.v1();
        let estimated_remaining_seconds = if session.status.is_terminal() {
            0.0
        } else {
            remaining_seconds(config.estimated_time_seconds, session.progress)
        };
        Self {
            session_id: session.id,
            zone_id: session.zone_id,
            status: session.status,
            progress: session.progress,
            sampled_posts: config.actual_sample_size,
            total_available: config.total_available,
            cache_hit_rate: config.cache_hit_rate,
            estimated_remaining_seconds,
            current_phase: session.current_phase,
            phase_message: session.phase_message,
            total_posts: session.total_posts,
            vectorized_count: session.vectorized_count,
            cluster_count: session.cluster_count,
            outlier_count: session.outlier_count,
            created_at: session.created_at,
            started_at: session.started_at,
            completed_at: session.completed_at,
            execution_ms: session.execution_ms,
            error_message: session.error_message,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ClustersView {
    session_id: Uuid,
    clusters: Vec<ClusterRecord>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ProjectionsView {
    session_id: Uuid,
    projections: Vec<ProjectionRecord>,
}

pub(crate) async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionView>, OpinionMapError> {
    let caller = caller_id(&headers)?;
    let session = state.service().session(&caller, session_id).await?;
    Ok(Json(session.into()))
}

pub(crate) async fn get_clusters(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ClustersView>, OpinionMapError> {
    let caller = caller_id(&headers)?;
    let clusters = state.service().clusters(&caller, session_id).await?;
    Ok(Json(ClustersView {
        session_id,
        clusters,
    }))
}

pub(crate) async fn get_projections(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ProjectionsView>, OpinionMapError> {
    let caller = caller_id(&headers)?;
    let projections = state.service().projections(&caller, session_id).await?;
    Ok(Json(ProjectionsView {
        session_id,
        projections,
    }))
}
