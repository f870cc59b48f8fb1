//! プロセス内ストア。テストとローカル開発で PostgreSQL の代わりに使う。
//!
//! 部分一意インデックスと条件付き UPDATE と同じ不変条件を単一のロックで守る。

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::{
    models::{
        ClusterRecord, CreateOutcome, NewSession, PhaseUpdate, PostRecord, PostStamp,
        ProjectionRecord, Session, SessionCounters, SessionStatus,
    },
    traits::{EmbeddingCacheStore, PostStore, SessionStore, ZoneAccess},
};

#[derive(Default)]
struct State {
    sessions: HashMap<Uuid, Session>,
    projections: HashMap<Uuid, Vec<ProjectionRecord>>,
    clusters: HashMap<Uuid, BTreeMap<i32, ClusterRecord>>,
    embeddings: HashMap<Uuid, (String, Vec<f32>)>,
    posts: HashMap<Uuid, PostRecord>,
    zones: HashMap<Uuid, HashSet<String>>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    /// ゾーンとアクセス可能な呼び出し元を登録する。
    pub fn add_zone(&self, zone_id: Uuid, members: &[&str]) -> Result<()> {
        let mut state = self.lock()?;
        state
            .zones
            .entry(zone_id)
            .or_default()
            .extend(members.iter().map(|m| (*m).to_string()));
        Ok(())
    }

    pub fn add_posts(&self, posts: impl IntoIterator<Item = PostRecord>) -> Result<()> {
        let mut state = self.lock()?;
        for post in posts {
            state.posts.insert(post.id, post);
        }
        Ok(())
    }

    /// 最終更新時刻を過去へずらす（リース期限切れの再現用）。
    pub fn backdate_session(&self, session_id: Uuid, by: Duration) -> Result<()> {
        let mut state = self.lock()?;
        let session = state
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| anyhow!("session {session_id} not found"))?;
        session.updated_at -= by;
        if let Some(completed) = session.completed_at.as_mut() {
            *completed -= by;
        }
        Ok(())
    }

    pub fn cached_model(&self, post_id: Uuid) -> Result<Option<String>> {
        Ok(self
            .lock()?
            .embeddings
            .get(&post_id)
            .map(|(model, _)| model.clone()))
    }
}

fn apply_update(session: &mut Session, update: &PhaseUpdate, now: DateTime<Utc>) {
    session.status = update.status;
    session.progress = session.progress.max(update.progress);
    session.current_phase = Some(update.status.as_str().to_string());
    session.phase_message = Some(update.message.clone());
    session.updated_at = now;
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn create_session(&self, new: NewSession) -> Result<CreateOutcome> {
        let mut state = self.lock()?;
        if let Some(existing) = state
            .sessions
            .values()
            .find(|s| s.zone_id == new.zone_id && !s.status.is_terminal())
        {
            return Ok(CreateOutcome::Existing(existing.clone()));
        }
        let now = Utc::now();
        let session = Session {
            id: new.id,
            zone_id: new.zone_id,
            status: SessionStatus::Pending,
            progress: 0,
            current_phase: Some(SessionStatus::Pending.as_str().to_string()),
            phase_message: Some("waiting for worker".to_string()),
            config: new.config,
            total_posts: 0,
            vectorized_count: 0,
            cluster_count: 0,
            outlier_count: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            execution_ms: None,
            error_message: None,
            error_trace: None,
        };
        state.sessions.insert(session.id, session.clone());
        Ok(CreateOutcome::Created(session))
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>> {
        Ok(self.lock()?.sessions.get(&session_id).cloned())
    }

    async fn find_active_session(&self, zone_id: Uuid) -> Result<Option<Session>> {
        Ok(self
            .lock()?
            .sessions
            .values()
            .find(|s| s.zone_id == zone_id && !s.status.is_terminal())
            .cloned())
    }

    async fn delete_session(&self, session_id: Uuid) -> Result<bool> {
        let mut state = self.lock()?;
        state.projections.remove(&session_id);
        state.clusters.remove(&session_id);
        Ok(state.sessions.remove(&session_id).is_some())
    }

    async fn claim_session(&self, session_id: Uuid, update: &PhaseUpdate) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(session) = state.sessions.get_mut(&session_id) else {
            return Ok(false);
        };
        if session.status != SessionStatus::Pending
            || !SessionStatus::Pending.can_transition_to(update.status)
        {
            return Ok(false);
        }
        let now = Utc::now();
        apply_update(session, update, now);
        session.started_at = Some(now);
        Ok(true)
    }

    async fn advance_session(&self, session_id: Uuid, update: &PhaseUpdate) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(session) = state.sessions.get_mut(&session_id) else {
            return Ok(false);
        };
        if !session.status.can_transition_to(update.status) {
            return Ok(false);
        }
        apply_update(session, update, Utc::now());
        Ok(true)
    }

    async fn record_progress(
        &self,
        session_id: Uuid,
        progress: u8,
        message: &str,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(session) = state.sessions.get_mut(&session_id) else {
            return Ok(false);
        };
        if session.status.is_terminal() {
            return Ok(false);
        }
        session.progress = session.progress.max(progress.min(100));
        session.phase_message = Some(message.to_string());
        session.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_counters(&self, session_id: Uuid, counters: SessionCounters) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(session) = state
            .sessions
            .get_mut(&session_id)
            .filter(|session| !session.status.is_terminal())
        {
            session.total_posts = counters.total_posts;
            session.vectorized_count = counters.vectorized_count;
            session.cluster_count = counters.cluster_count;
            session.outlier_count = counters.outlier_count;
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn complete_session(&self, session_id: Uuid, execution_ms: i64) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(session) = state.sessions.get_mut(&session_id) else {
            return Ok(false);
        };
        if !session.status.can_transition_to(SessionStatus::Completed) {
            return Ok(false);
        }
        let now = Utc::now();
        apply_update(
            session,
            &PhaseUpdate {
                status: SessionStatus::Completed,
                progress: 100,
                message: "completed".to_string(),
            },
            now,
        );
        session.completed_at = Some(now);
        session.execution_ms = Some(execution_ms);
        Ok(true)
    }

    async fn fail_session(&self, session_id: Uuid, message: &str, trace: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(session) = state.sessions.get_mut(&session_id) else {
            return Ok(false);
        };
        if !session.status.can_transition_to(SessionStatus::Failed) {
            return Ok(false);
        }
        let now = Utc::now();
        session.status = SessionStatus::Failed;
        session.current_phase = Some(SessionStatus::Failed.as_str().to_string());
        session.phase_message = Some(message.to_string());
        session.error_message = Some(message.to_string());
        session.error_trace = Some(trace.to_string());
        session.completed_at = Some(now);
        session.updated_at = now;
        Ok(true)
    }

    async fn cancel_session(&self, session_id: Uuid) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(session) = state.sessions.get_mut(&session_id) else {
            return Ok(false);
        };
        if !session.status.can_transition_to(SessionStatus::Cancelled) {
            return Ok(false);
        }
        let now = Utc::now();
        session.status = SessionStatus::Cancelled;
        session.current_phase = Some(SessionStatus::Cancelled.as_str().to_string());
        session.phase_message = Some("cancelled by request".to_string());
        session.completed_at = Some(now);
        session.updated_at = now;
        Ok(true)
    }

    async fn save_projections(&self, session_id: Uuid, rows: &[ProjectionRecord]) -> Result<()> {
        self.lock()?.projections.insert(session_id, rows.to_vec());
        Ok(())
    }

    async fn save_clusters(&self, session_id: Uuid, rows: &[ClusterRecord]) -> Result<()> {
        let mut state = self.lock()?;
        let clusters = state.clusters.entry(session_id).or_default();
        for row in rows {
            clusters.insert(row.cluster_id, row.clone());
        }
        Ok(())
    }

    async fn list_projections(&self, session_id: Uuid) -> Result<Vec<ProjectionRecord>> {
        Ok(self
            .lock()?
            .projections
            .get(&session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_clusters(&self, session_id: Uuid) -> Result<Vec<ClusterRecord>> {
        Ok(self
            .lock()?
            .clusters
            .get(&session_id)
            .map(|clusters| clusters.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn purge_terminal_sessions(&self, completed_before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock()?;
        let expired: Vec<Uuid> = state
            .sessions
            .values()
            .filter(|s| s.status.is_terminal())
            .filter(|s| s.completed_at.is_some_and(|at| at < completed_before))
            .map(|s| s.id)
            .collect();
        for id in &expired {
            state.sessions.remove(id);
            state.projections.remove(id);
            state.clusters.remove(id);
        }
        Ok(expired.len() as u64)
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}

#[async_trait]
impl EmbeddingCacheStore for InMemoryStore {
    async fn get_embeddings(
        &self,
        post_ids: &[Uuid],
        model: &str,
    ) -> Result<HashMap<Uuid, Vec<f32>>> {
        let state = self.lock()?;
        Ok(post_ids
            .iter()
            .filter_map(|id| {
                state
                    .embeddings
                    .get(id)
                    .filter(|(cached_model, _)| cached_model == model)
                    .map(|(_, vector)| (*id, vector.clone()))
            })
            .collect())
    }

    async fn count_cached(&self, post_ids: &[Uuid], model: &str) -> Result<usize> {
        let state = self.lock()?;
        let unique: HashSet<&Uuid> = post_ids.iter().collect();
        Ok(unique
            .into_iter()
            .filter(|id| {
                state
                    .embeddings
                    .get(*id)
                    .is_some_and(|(cached_model, _)| cached_model == model)
            })
            .count())
    }

    async fn put_embeddings(&self, model: &str, entries: &[(Uuid, Vec<f32>)]) -> Result<()> {
        let mut state = self.lock()?;
        for (post_id, vector) in entries {
            state
                .embeddings
                .insert(*post_id, (model.to_string(), vector.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl PostStore for InMemoryStore {
    async fn post_stamps(
        &self,
        zone_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PostStamp>> {
        let state = self.lock()?;
        let mut stamps: Vec<PostStamp> = state
            .posts
            .values()
            .filter(|p| p.zone_id == zone_id && p.posted_at >= start && p.posted_at < end)
            .map(|p| PostStamp {
                id: p.id,
                posted_at: p.posted_at,
            })
            .collect();
        stamps.sort_by_key(|s| (s.posted_at, s.id));
        Ok(stamps)
    }

    async fn fetch_posts(&self, post_ids: &[Uuid]) -> Result<Vec<PostRecord>> {
        let state = self.lock()?;
        Ok(post_ids
            .iter()
            .filter_map(|id| state.posts.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl ZoneAccess for InMemoryStore {
    async fn zone_exists(&self, zone_id: Uuid) -> Result<bool> {
        Ok(self.lock()?.zones.contains_key(&zone_id))
    }

    async fn can_access(&self, caller_id: &str, zone_id: Uuid) -> Result<bool> {
        Ok(self
            .lock()?
            .zones
            .get(&zone_id)
            .is_some_and(|members| members.contains(caller_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::session::{SessionConfig, SessionConfigV1};

    fn new_session(zone_id: Uuid) -> NewSession {
        NewSession {
            id: Uuid::now_v7(),
            zone_id,
            config: SessionConfig::V1(SessionConfigV1 {
                start: Utc::now() - Duration::days(7),
                end: Utc::now(),
                requested_sample_size: 10,
                sampled_post_ids: vec![],
                actual_sample_size: 0,
                total_available: 0,
                cache_hit_rate: 0.0,
                estimated_time_seconds: 8.0,
                seed: 1,
            }),
        }
    }

    fn enter(status: SessionStatus, progress: u8) -> PhaseUpdate {
        PhaseUpdate {
            status,
            progress,
            message: status.to_string(),
        }
    }

    #[tokio::test]
    async fn second_create_for_zone_returns_existing() {
        let store = InMemoryStore::new();
        let zone = Uuid::new_v4();

        let first = store.create_session(new_session(zone)).await.unwrap();
        let second = store.create_session(new_session(zone)).await.unwrap();

        let (CreateOutcome::Created(a), CreateOutcome::Existing(b)) = (first, second) else {
            panic!("expected created then existing");
        };
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn terminal_session_frees_zone() {
        let store = InMemoryStore::new();
        let zone = Uuid::new_v4();
        let CreateOutcome::Created(first) = store.create_session(new_session(zone)).await.unwrap()
        else {
            panic!("expected created");
        };
        assert!(store.cancel_session(first.id).await.unwrap());

        let again = store.create_session(new_session(zone)).await.unwrap();

        assert!(matches!(again, CreateOutcome::Created(s) if s.id != first.id));
    }

    #[tokio::test]
    async fn advance_refuses_illegal_and_terminal_transitions() {
        let store = InMemoryStore::new();
        let CreateOutcome::Created(session) = store
            .create_session(new_session(Uuid::new_v4()))
            .await
            .unwrap()
        else {
            panic!("expected created");
        };

        assert!(!store
            .advance_session(session.id, &enter(SessionStatus::Reducing, 45))
            .await
            .unwrap());
        assert!(store
            .claim_session(session.id, &enter(SessionStatus::Vectorizing, 5))
            .await
            .unwrap());
        assert!(!store
            .claim_session(session.id, &enter(SessionStatus::Vectorizing, 5))
            .await
            .unwrap());
        assert!(store.cancel_session(session.id).await.unwrap());
        assert!(!store
            .advance_session(session.id, &enter(SessionStatus::Reducing, 45))
            .await
            .unwrap());
        assert!(!store.fail_session(session.id, "late", "").await.unwrap());

        let stored = store.find_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let store = InMemoryStore::new();
        let CreateOutcome::Created(session) = store
            .create_session(new_session(Uuid::new_v4()))
            .await
            .unwrap()
        else {
            panic!("expected created");
        };
        store
            .claim_session(session.id, &enter(SessionStatus::Vectorizing, 5))
            .await
            .unwrap();

        store.record_progress(session.id, 30, "a").await.unwrap();
        store.record_progress(session.id, 12, "b").await.unwrap();

        let stored = store.find_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 30);
        assert!(stored.started_at.is_some());
    }

    #[tokio::test]
    async fn cache_lookup_ignores_other_models() {
        let store = InMemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store
            .put_embeddings("model-a", &[(a, vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .put_embeddings("model-b", &[(b, vec![0.0, 1.0])])
            .await
            .unwrap();

        let hits = store.get_embeddings(&[a, b], "model-a").await.unwrap();

        assert_eq!(hits.len(), 1);
        assert!(hits.contains_key(&a));
        assert_eq!(store.count_cached(&[a, b, a], "model-a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn purge_removes_only_old_terminal_sessions() {
        let store = InMemoryStore::new();
        let CreateOutcome::Created(old) = store
            .create_session(new_session(Uuid::new_v4()))
            .await
            .unwrap()
        else {
            panic!("expected created");
        };
        let CreateOutcome::Created(active) = store
            .create_session(new_session(Uuid::new_v4()))
            .await
            .unwrap()
        else {
            panic!("expected created");
        };
        store.fail_session(old.id, "boom", "trace").await.unwrap();
        store.backdate_session(old.id, Duration::days(40)).unwrap();

        let purged = store
            .purge_terminal_sessions(Utc::now() - Duration::days(30))
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert!(store.find_session(old.id).await.unwrap().is_none());
        assert!(store.find_session(active.id).await.unwrap().is_some());
    }
}
