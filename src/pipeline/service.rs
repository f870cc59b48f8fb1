//! Request-side orchestration: start (or reuse) a session, cancel it, and
//! serve read-only views of its results.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    sampler::Sampler,
    session::{SessionConfig, SessionConfigV1, estimate_seconds, remaining_seconds, session_seed},
    vectorizer::Vectorizer,
};
use crate::clients::JobDispatcher;
use crate::error::OpinionMapError;
use crate::observability::Metrics;
use crate::store::{
    SessionStore, ZoneAccess,
    models::{ClusterRecord, CreateOutcome, NewSession, ProjectionRecord, Session, SessionStatus},
};

#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    pub zone_id: Uuid,
    pub start_date: String,
    pub end_date: String,
    pub sample_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartResponse {
    pub session_id: Uuid,
    pub sampled_posts: usize,
    pub total_available: usize,
    pub cache_hit_rate: f64,
    pub estimated_time_seconds: f64,
    pub reused_active_session: bool,
}

impl StartResponse {
    fn reused(session: &Session) -> Self {
        let config = session.config.v1();
        Self {
            session_id: session.id,
            sampled_posts: config.actual_sample_size,
            total_available: config.total_available,
            cache_hit_rate: config.cache_hit_rate,
            estimated_time_seconds: remaining_seconds(config.estimated_time_seconds, session.progress),
            reused_active_session: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelResponse {
    pub session_id: Uuid,
    pub cancelled: bool,
    pub status: SessionStatus,
}

#[derive(Clone)]
pub struct MapService {
    sessions: Arc<dyn SessionStore>,
    zones: Arc<dyn ZoneAccess>,
    sampler: Sampler,
    vectorizer: Vectorizer,
    dispatcher: Arc<dyn JobDispatcher>,
    metrics: Arc<Metrics>,
    min_viable_posts: usize,
    max_sample_size: usize,
}

impl MapService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        zones: Arc<dyn ZoneAccess>,
        sampler: Sampler,
        vectorizer: Vectorizer,
        dispatcher: Arc<dyn JobDispatcher>,
        metrics: Arc<Metrics>,
        min_viable_posts: usize,
        max_sample_size: usize,
    ) -> Self {
        Self {
            sessions,
            zones,
            sampler,
            vectorizer,
            dispatcher,
            metrics,
            min_viable_posts,
            max_sample_size,
        }
    }

    /// Starts a map for the zone, or returns the zone's active session.
    ///
    /// # Errors
    /// Validation, authorization, data sufficiency and scheduling failures
    /// map to the matching [`OpinionMapError`] variants.
    pub async fn start(
        &self,
        caller_id: &str,
        request: StartRequest,
    ) -> Result<StartResponse, OpinionMapError> {
        let start = parse_bound(&request.start_date, false)?;
        let end = parse_bound(&request.end_date, true)?;
        if start >= end {
            return Err(OpinionMapError::Validation(
                "start_date must be before end_date".to_string(),
            ));
        }
        if request.sample_size < self.min_viable_posts || request.sample_size > self.max_sample_size
        {
            return Err(OpinionMapError::Validation(format!(
                "sample_size must be between {} and {}",
                self.min_viable_posts, self.max_sample_size
            )));
        }
        self.authorize(caller_id, request.zone_id).await?;

        if let Some(active) = self.sessions.find_active_session(request.zone_id).await? {
            info!(session_id = %active.id, zone_id = %request.zone_id, "reusing active session");
            self.metrics.sessions_reused.inc();
            return Ok(StartResponse::reused(&active));
        }

        let session_id = Uuid::now_v7();
        let seed = session_seed(session_id);
        let sample = self
            .sampler
            .sample(request.zone_id, start, end, request.sample_size, seed)
            .await?;
        if sample.total_available == 0 {
            return Err(OpinionMapError::NoData { total_available: 0 });
        }
        if sample.post_ids.len() < self.min_viable_posts {
            return Err(OpinionMapError::InsufficientData {
                found: sample.post_ids.len(),
                minimum: self.min_viable_posts,
            });
        }

        let stats = self.vectorizer.cache_stats(&sample.post_ids).await?;
        let estimated_time_seconds = estimate_seconds(
            stats.needs_embedding,
            self.vectorizer.batch_size(),
            sample.post_ids.len(),
        );
        let response = StartResponse {
            session_id,
            sampled_posts: sample.post_ids.len(),
            total_available: sample.total_available,
            cache_hit_rate: stats.cache_hit_rate(),
            estimated_time_seconds,
            reused_active_session: false,
        };
        let config = SessionConfig::V1(SessionConfigV1 {
            start,
            end,
            requested_sample_size: request.sample_size,
            actual_sample_size: sample.post_ids.len(),
            sampled_post_ids: sample.post_ids,
            total_available: sample.total_available,
            cache_hit_rate: response.cache_hit_rate,
            estimated_time_seconds,
            seed,
        });

        let created = self
            .sessions
            .create_session(NewSession {
                id: session_id,
                zone_id: request.zone_id,
                config,
            })
            .await?;
        if let CreateOutcome::Existing(winner) = created {
            // 同時作成で負けた側は勝者を返すだけで、ワーカーは登録しない
            info!(session_id = %winner.id, "lost creation race, reusing winner");
            self.metrics.sessions_reused.inc();
            return Ok(StartResponse::reused(&winner));
        }

        if let Err(source) = self.dispatcher.dispatch(session_id).await {
            error!(%session_id, error = ?source, "failed to schedule worker, rolling back session");
            self.metrics.scheduling_failures.inc();
            if let Err(cleanup) = self.sessions.delete_session(session_id).await {
                warn!(%session_id, error = ?cleanup, "rollback of unscheduled session failed");
            }
            return Err(OpinionMapError::Scheduling { session_id, source });
        }

        self.metrics.sessions_started.inc();
        info!(
            %session_id,
            zone_id = %request.zone_id,
            sampled = response.sampled_posts,
            total_available = response.total_available,
            cache_hit_rate = response.cache_hit_rate,
            "opinion map session started"
        );
        Ok(response)
    }

    /// Flips a running session to `cancelled`. Terminal sessions are
    /// reported as-is.
    ///
    /// # Errors
    /// Unknown session, forbidden zone, or store failure.
    pub async fn cancel(
        &self,
        caller_id: &str,
        session_id: Uuid,
    ) -> Result<CancelResponse, OpinionMapError> {
        let session = self.session(caller_id, session_id).await?;
        if session.status.is_terminal() {
            return Ok(CancelResponse {
                session_id,
                cancelled: false,
                status: session.status,
            });
        }

        if self.sessions.cancel_session(session_id).await? {
            self.metrics.sessions_cancelled.inc();
            info!(%session_id, "session cancelled");
            return Ok(CancelResponse {
                session_id,
                cancelled: true,
                status: SessionStatus::Cancelled,
            });
        }

        // 読み取り後に終端へ遷移した
        let status = self
            .sessions
            .find_session(session_id)
            .await?
            .map_or(SessionStatus::Cancelled, |s| s.status);
        Ok(CancelResponse {
            session_id,
            cancelled: false,
            status,
        })
    }

    /// # Errors
    /// Unknown session, forbidden zone, or store failure.
    pub async fn session(&self, caller_id: &str, session_id: Uuid) -> Result<Session, OpinionMapError> {
        let session = self
            .sessions
            .find_session(session_id)
            .await?
            .ok_or_else(|| OpinionMapError::not_found("session", session_id))?;
        self.authorize(caller_id, session.zone_id).await?;
        Ok(session)
    }

    /// # Errors
    /// Unknown session, forbidden zone, or store failure.
    pub async fn clusters(
        &self,
        caller_id: &str,
        session_id: Uuid,
    ) -> Result<Vec<ClusterRecord>, OpinionMapError> {
        self.session(caller_id, session_id).await?;
        Ok(self.sessions.list_clusters(session_id).await?)
    }

    /// # Errors
    /// Unknown session, forbidden zone, or store failure.
    pub async fn projections(
        &self,
        caller_id: &str,
        session_id: Uuid,
    ) -> Result<Vec<ProjectionRecord>, OpinionMapError> {
        self.session(caller_id, session_id).await?;
        Ok(self.sessions.list_projections(session_id).await?)
    }

    async fn authorize(&self, caller_id: &str, zone_id: Uuid) -> Result<(), OpinionMapError> {
        if !self.zones.zone_exists(zone_id).await? {
            return Err(OpinionMapError::not_found("zone", zone_id));
        }
        if !self.zones.can_access(caller_id, zone_id).await? {
            return Err(OpinionMapError::Forbidden { zone_id });
        }
        Ok(())
    }
}

/// RFC 3339 timestamp or `YYYY-MM-DD`. A date-only end covers that whole day.
pub(crate) fn parse_bound(value: &str, is_end: bool) -> Result<DateTime<Utc>, OpinionMapError> {
    let value = value.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
        OpinionMapError::Validation(format!(
            "invalid date '{value}', expected RFC 3339 or YYYY-MM-DD"
        ))
    })?;
    let date = if is_end {
        date.succ_opt()
            .ok_or_else(|| OpinionMapError::Validation(format!("date '{value}' out of range")))?
    } else {
        date
    };
    Ok(date.and_time(chrono::NaiveTime::MIN).and_utc())
}
