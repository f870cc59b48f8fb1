use std::collections::HashMap;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow, types::Json};
use tracing::debug;
use uuid::Uuid;

use super::{
    models::{
        ClusterRecord, CreateOutcome, NewSession, PhaseUpdate, PostRecord, PostStamp,
        ProjectionRecord, Session, SessionCounters, SessionStatus,
    },
    traits::{EmbeddingCacheStore, PostStore, SessionStore, ZoneAccess},
};
use crate::pipeline::session::SessionConfig;

const SESSION_COLUMNS: &str = r"
    id, zone_id, status, progress, current_phase, phase_message, config,
    total_posts, vectorized_count, cluster_count, outlier_count,
    created_at, updated_at, started_at, completed_at, execution_ms,
    error_message, error_trace
";

/// `sqlx` + PostgreSQL によるストア実装。
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 埋め込みマイグレーションを適用する。
    ///
    /// # Errors
    /// マイグレーションの適用に失敗した場合。
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to apply opinion map migrations")
    }

    async fn insert_pending(&self, new: &NewSession) -> Result<Option<Session>> {
        let query = format!(
            r"
            INSERT INTO opinion_map_sessions
                (id, zone_id, status, progress, current_phase, phase_message, config)
            VALUES ($1, $2, 'pending', 0, 'pending', 'waiting for worker', $3)
            ON CONFLICT (zone_id)
                WHERE status IN ('pending', 'vectorizing', 'reducing', 'clustering', 'labeling')
                DO NOTHING
            RETURNING {SESSION_COLUMNS}
            "
        );
        let row = sqlx::query(&query)
            .bind(new.id)
            .bind(new.zone_id)
            .bind(Json(&new.config))
            .fetch_optional(&self.pool)
            .await
            .context("failed to insert opinion_map_sessions row")?;

        row.as_ref().map(row_to_session).transpose()
    }
}

fn row_to_session(row: &PgRow) -> Result<Session> {
    let status: String = row.try_get("status")?;
    let progress: i16 = row.try_get("progress")?;
    let Json(config): Json<SessionConfig> = row
        .try_get("config")
        .context("failed to decode session config")?;

    Ok(Session {
        id: row.try_get("id")?,
        zone_id: row.try_get("zone_id")?,
        status: status.parse()?,
        progress: u8::try_from(progress.clamp(0, 100)).unwrap_or(0),
        current_phase: row.try_get("current_phase")?,
        phase_message: row.try_get("phase_message")?,
        config,
        total_posts: count_from_db(row.try_get("total_posts")?),
        vectorized_count: count_from_db(row.try_get("vectorized_count")?),
        cluster_count: count_from_db(row.try_get("cluster_count")?),
        outlier_count: count_from_db(row.try_get("outlier_count")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        execution_ms: row.try_get("execution_ms")?,
        error_message: row.try_get("error_message")?,
        error_trace: row.try_get("error_trace")?,
    })
}

fn count_from_db(value: i32) -> usize {
    usize::try_from(value).unwrap_or(0)
}

fn count_to_db(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[allow(clippy::cast_possible_truncation)]
fn to_real(value: f64) -> f32 {
    value as f32
}

fn active_names() -> Vec<String> {
    SessionStatus::names(&SessionStatus::ACTIVE)
}

#[async_trait]
impl SessionStore for PgStore {
    async fn create_session(&self, new: NewSession) -> Result<CreateOutcome> {
        // 競合した作成者が先に終端へ達した場合に備えて数回だけやり直す
        for attempt in 0..3 {
            if let Some(created) = self.insert_pending(&new).await? {
                return Ok(CreateOutcome::Created(created));
            }
            if let Some(existing) = self.find_active_session(new.zone_id).await? {
                return Ok(CreateOutcome::Existing(existing));
            }
            debug!(zone_id = %new.zone_id, attempt, "active session vanished during create, retrying");
        }
        Err(anyhow!(
            "could not create or find an active session for zone {}",
            new.zone_id
        ))
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM opinion_map_sessions WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch opinion_map_sessions row")?;

        row.as_ref().map(row_to_session).transpose()
    }

    async fn find_active_session(&self, zone_id: Uuid) -> Result<Option<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM opinion_map_sessions
             WHERE zone_id = $1 AND status = ANY($2)
             ORDER BY created_at DESC
             LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(zone_id)
            .bind(active_names())
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch active session")?;

        row.as_ref().map(row_to_session).transpose()
    }

    async fn delete_session(&self, session_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM opinion_map_sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("failed to delete opinion_map_sessions row")?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_session(&self, session_id: Uuid, update: &PhaseUpdate) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE opinion_map_sessions
            SET status = $2,
                progress = GREATEST(progress, $3),
                current_phase = $2,
                phase_message = $4,
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            ",
        )
        .bind(session_id)
        .bind(update.status.as_str())
        .bind(i16::from(update.progress))
        .bind(&update.message)
        .execute(&self.pool)
        .await
        .context("failed to claim session")?;
        Ok(result.rows_affected() == 1)
    }

    async fn advance_session(&self, session_id: Uuid, update: &PhaseUpdate) -> Result<bool> {
        let predecessors = SessionStatus::names(update.status.predecessors());
        let result = sqlx::query(
            r"
            UPDATE opinion_map_sessions
            SET status = $2,
                progress = GREATEST(progress, $3),
                current_phase = $2,
                phase_message = $4,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($5)
            ",
        )
        .bind(session_id)
        .bind(update.status.as_str())
        .bind(i16::from(update.progress))
        .bind(&update.message)
        .bind(predecessors)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to advance session to {}", update.status))?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_progress(
        &self,
        session_id: Uuid,
        progress: u8,
        message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE opinion_map_sessions
            SET progress = GREATEST(progress, $2),
                phase_message = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($4)
            ",
        )
        .bind(session_id)
        .bind(i16::from(progress.min(100)))
        .bind(message)
        .bind(active_names())
        .execute(&self.pool)
        .await
        .context("failed to record session progress")?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_counters(&self, session_id: Uuid, counters: SessionCounters) -> Result<()> {
        sqlx::query(
            r"
            UPDATE opinion_map_sessions
            SET total_posts = $2,
                vectorized_count = $3,
                cluster_count = $4,
                outlier_count = $5,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($6)
            ",
        )
        .bind(session_id)
        .bind(count_to_db(counters.total_posts))
        .bind(count_to_db(counters.vectorized_count))
        .bind(count_to_db(counters.cluster_count))
        .bind(count_to_db(counters.outlier_count))
        .bind(active_names())
        .execute(&self.pool)
        .await
        .context("failed to update session counters")?;
        Ok(())
    }

    async fn complete_session(&self, session_id: Uuid, execution_ms: i64) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE opinion_map_sessions
            SET status = 'completed',
                progress = 100,
                current_phase = 'completed',
                phase_message = 'completed',
                completed_at = NOW(),
                execution_ms = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'labeling'
            ",
        )
        .bind(session_id)
        .bind(execution_ms)
        .execute(&self.pool)
        .await
        .context("failed to complete session")?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_session(&self, session_id: Uuid, message: &str, trace: &str) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE opinion_map_sessions
            SET status = 'failed',
                current_phase = 'failed',
                phase_message = $2,
                error_message = $2,
                error_trace = $3,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($4)
            ",
        )
        .bind(session_id)
        .bind(message)
        .bind(trace)
        .bind(active_names())
        .execute(&self.pool)
        .await
        .context("failed to mark session failed")?;
        Ok(result.rows_affected() == 1)
    }

    async fn cancel_session(&self, session_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE opinion_map_sessions
            SET status = 'cancelled',
                current_phase = 'cancelled',
                phase_message = 'cancelled by request',
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
            ",
        )
        .bind(session_id)
        .bind(active_names())
        .execute(&self.pool)
        .await
        .context("failed to cancel session")?;
        Ok(result.rows_affected() == 1)
    }

    async fn save_projections(&self, session_id: Uuid, rows: &[ProjectionRecord]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;

        sqlx::query("DELETE FROM opinion_map_projections WHERE session_id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .context("failed to clear previous projections")?;

        let post_ids: Vec<Uuid> = rows.iter().map(|r| r.post_id).collect();
        let xs: Vec<f32> = rows.iter().map(|r| to_real(r.x)).collect();
        let ys: Vec<f32> = rows.iter().map(|r| to_real(r.y)).collect();
        let zs: Vec<f32> = rows.iter().map(|r| to_real(r.z)).collect();
        let cluster_ids: Vec<i32> = rows.iter().map(|r| r.cluster_id).collect();
        let confidences: Vec<f32> = rows.iter().map(|r| to_real(r.confidence)).collect();

        sqlx::query(
            r"
            INSERT INTO opinion_map_projections
                (session_id, post_id, x, y, z, cluster_id, confidence)
            SELECT $1, post_id, x, y, z, cluster_id, confidence
            FROM UNNEST($2::uuid[], $3::real[], $4::real[], $5::real[], $6::int[], $7::real[])
                AS t(post_id, x, y, z, cluster_id, confidence)
            ",
        )
        .bind(session_id)
        .bind(post_ids)
        .bind(xs)
        .bind(ys)
        .bind(zs)
        .bind(cluster_ids)
        .bind(confidences)
        .execute(&mut *tx)
        .await
        .context("failed to insert opinion_map_projections")?;

        tx.commit().await.context("failed to commit projections")?;
        Ok(())
    }

    async fn save_clusters(&self, session_id: Uuid, rows: &[ClusterRecord]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;

        for row in rows {
            sqlx::query(
                r"
                INSERT INTO opinion_map_clusters
                    (session_id, cluster_id, label, keywords, reasoning, post_count,
                     centroid_x, centroid_y, centroid_z, avg_sentiment, coherence)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (session_id, cluster_id) DO UPDATE SET
                    label = EXCLUDED.label,
                    keywords = EXCLUDED.keywords,
                    reasoning = EXCLUDED.reasoning,
                    post_count = EXCLUDED.post_count,
                    centroid_x = EXCLUDED.centroid_x,
                    centroid_y = EXCLUDED.centroid_y,
                    centroid_z = EXCLUDED.centroid_z,
                    avg_sentiment = EXCLUDED.avg_sentiment,
                    coherence = EXCLUDED.coherence
                ",
            )
            .bind(session_id)
            .bind(row.cluster_id)
            .bind(&row.label)
            .bind(&row.keywords)
            .bind(&row.reasoning)
            .bind(count_to_db(row.post_count))
            .bind(to_real(row.centroid[0]))
            .bind(to_real(row.centroid[1]))
            .bind(to_real(row.centroid[2]))
            .bind(to_real(row.avg_sentiment))
            .bind(to_real(row.coherence))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to upsert cluster {}", row.cluster_id))?;
        }

        tx.commit().await.context("failed to commit clusters")?;
        Ok(())
    }

    async fn list_projections(&self, session_id: Uuid) -> Result<Vec<ProjectionRecord>> {
        let rows = sqlx::query(
            r"
            SELECT post_id, x, y, z, cluster_id, confidence
            FROM opinion_map_projections
            WHERE session_id = $1
            ORDER BY cluster_id, post_id
            ",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch projections")?;

        rows.iter()
            .map(|row| {
                Ok(ProjectionRecord {
                    post_id: row.try_get("post_id")?,
                    x: f64::from(row.try_get::<f32, _>("x")?),
                    y: f64::from(row.try_get::<f32, _>("y")?),
                    z: f64::from(row.try_get::<f32, _>("z")?),
                    cluster_id: row.try_get("cluster_id")?,
                    confidence: f64::from(row.try_get::<f32, _>("confidence")?),
                })
            })
            .collect()
    }

    async fn list_clusters(&self, session_id: Uuid) -> Result<Vec<ClusterRecord>> {
        let rows = sqlx::query(
            r"
            SELECT cluster_id, label, keywords, reasoning, post_count,
                   centroid_x, centroid_y, centroid_z, avg_sentiment, coherence
            FROM opinion_map_clusters
            WHERE session_id = $1
            ORDER BY cluster_id
            ",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch clusters")?;

        rows.iter()
            .map(|row| {
                Ok(ClusterRecord {
                    cluster_id: row.try_get("cluster_id")?,
                    label: row.try_get("label")?,
                    keywords: row.try_get("keywords")?,
                    reasoning: row.try_get("reasoning")?,
                    post_count: count_from_db(row.try_get("post_count")?),
                    centroid: [
                        f64::from(row.try_get::<f32, _>("centroid_x")?),
                        f64::from(row.try_get::<f32, _>("centroid_y")?),
                        f64::from(row.try_get::<f32, _>("centroid_z")?),
                    ],
                    avg_sentiment: f64::from(row.try_get::<f32, _>("avg_sentiment")?),
                    coherence: f64::from(row.try_get::<f32, _>("coherence")?),
                })
            })
            .collect()
    }

    async fn purge_terminal_sessions(&self, completed_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM opinion_map_sessions
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND completed_at < $1
            ",
        )
        .bind(completed_before)
        .execute(&self.pool)
        .await
        .context("failed to purge expired sessions")?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database ping failed")?;
        Ok(())
    }
}

#[async_trait]
impl EmbeddingCacheStore for PgStore {
    async fn get_embeddings(
        &self,
        post_ids: &[Uuid],
        model: &str,
    ) -> Result<HashMap<Uuid, Vec<f32>>> {
        let rows = sqlx::query(
            r"
            SELECT post_id, embedding
            FROM post_embeddings
            WHERE post_id = ANY($1) AND model = $2
            ",
        )
        .bind(post_ids)
        .bind(model)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch cached embeddings")?;

        rows.iter()
            .map(|row| Ok((row.try_get("post_id")?, row.try_get("embedding")?)))
            .collect()
    }

    async fn count_cached(&self, post_ids: &[Uuid], model: &str) -> Result<usize> {
        let row = sqlx::query(
            r"
            SELECT COUNT(*) AS cached
            FROM post_embeddings
            WHERE post_id = ANY($1) AND model = $2
            ",
        )
        .bind(post_ids)
        .bind(model)
        .fetch_one(&self.pool)
        .await
        .context("failed to count cached embeddings")?;

        let cached: i64 = row.try_get("cached")?;
        Ok(usize::try_from(cached).unwrap_or(0))
    }

    async fn put_embeddings(&self, model: &str, entries: &[(Uuid, Vec<f32>)]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;

        for (post_id, embedding) in entries {
            sqlx::query(
                r"
                INSERT INTO post_embeddings (post_id, embedding, model, computed_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (post_id) DO UPDATE SET
                    embedding = EXCLUDED.embedding,
                    model = EXCLUDED.model,
                    computed_at = EXCLUDED.computed_at
                ",
            )
            .bind(post_id)
            .bind(embedding)
            .bind(model)
            .execute(&mut *tx)
            .await
            .context("failed to upsert post embedding")?;
        }

        tx.commit().await.context("failed to commit embeddings")?;
        Ok(())
    }
}

#[async_trait]
impl PostStore for PgStore {
    async fn post_stamps(
        &self,
        zone_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PostStamp>> {
        let rows = sqlx::query(
            r"
            SELECT id, posted_at
            FROM posts
            WHERE zone_id = $1 AND posted_at >= $2 AND posted_at < $3
            ORDER BY posted_at, id
            ",
        )
        .bind(zone_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch post timestamps")?;

        rows.iter()
            .map(|row| {
                Ok(PostStamp {
                    id: row.try_get("id")?,
                    posted_at: row.try_get("posted_at")?,
                })
            })
            .collect()
    }

    async fn fetch_posts(&self, post_ids: &[Uuid]) -> Result<Vec<PostRecord>> {
        let rows = sqlx::query(
            r"
            SELECT id, zone_id, content, posted_at, COALESCE(engagement, 0)::BIGINT AS engagement
            FROM posts
            WHERE id = ANY($1)
            ",
        )
        .bind(post_ids)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch posts")?;

        let mut by_id: HashMap<Uuid, PostRecord> = rows
            .iter()
            .map(|row| {
                let post = PostRecord {
                    id: row.try_get("id")?,
                    zone_id: row.try_get("zone_id")?,
                    content: row.try_get("content")?,
                    posted_at: row.try_get("posted_at")?,
                    engagement: row.try_get("engagement")?,
                };
                Ok((post.id, post))
            })
            .collect::<Result<_>>()?;

        // 呼び出し元の順序を保つ
        Ok(post_ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }
}

#[async_trait]
impl ZoneAccess for PgStore {
    async fn zone_exists(&self, zone_id: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM zones WHERE id = $1) AS exists")
            .bind(zone_id)
            .fetch_one(&self.pool)
            .await
            .context("failed to check zone existence")?;
        Ok(row.try_get("exists")?)
    }

    async fn can_access(&self, caller_id: &str, zone_id: Uuid) -> Result<bool> {
        let row = sqlx::query(
            r"
            SELECT EXISTS(
                SELECT 1 FROM zone_members WHERE zone_id = $1 AND member_id = $2
            ) AS allowed
            ",
        )
        .bind(zone_id)
        .bind(caller_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to check zone membership")?;
        Ok(row.try_get("allowed")?)
    }
}
