use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{
    ClusterRecord, CreateOutcome, NewSession, PhaseUpdate, PostRecord, PostStamp,
    ProjectionRecord, Session, SessionCounters,
};

/// セッション状態機械の永続化。
///
/// 状態を書き換える操作はすべて条件付きで、適用されたかどうかを `bool` で返す。
/// 終端状態のセッションはどの操作でも変更されない。
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// ゾーンにアクティブなセッションが無い場合のみ作成する。
    async fn create_session(&self, new: NewSession) -> Result<CreateOutcome>;

    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>>;

    async fn find_active_session(&self, zone_id: Uuid) -> Result<Option<Session>>;

    /// スケジューリング失敗時の補償削除。
    async fn delete_session(&self, session_id: Uuid) -> Result<bool>;

    /// `pending` のセッションを最初のフェーズへ進め、`started_at` を記録する。
    async fn claim_session(&self, session_id: Uuid, update: &PhaseUpdate) -> Result<bool>;

    /// 正当な遷移元にある場合のみ状態を進める。進捗は減らない。
    async fn advance_session(&self, session_id: Uuid, update: &PhaseUpdate) -> Result<bool>;

    /// 非終端のセッションの進捗のみ更新する。
    async fn record_progress(&self, session_id: Uuid, progress: u8, message: &str)
    -> Result<bool>;

    async fn update_counters(&self, session_id: Uuid, counters: SessionCounters) -> Result<()>;

    async fn complete_session(&self, session_id: Uuid, execution_ms: i64) -> Result<bool>;

    async fn fail_session(&self, session_id: Uuid, message: &str, trace: &str) -> Result<bool>;

    async fn cancel_session(&self, session_id: Uuid) -> Result<bool>;

    /// 投影を置き換える（再実行しても重複しない）。
    async fn save_projections(&self, session_id: Uuid, rows: &[ProjectionRecord]) -> Result<()>;

    /// クラスタを upsert する。
    async fn save_clusters(&self, session_id: Uuid, rows: &[ClusterRecord]) -> Result<()>;

    async fn list_projections(&self, session_id: Uuid) -> Result<Vec<ProjectionRecord>>;

    async fn list_clusters(&self, session_id: Uuid) -> Result<Vec<ClusterRecord>>;

    /// 指定時刻より前に終端へ達したセッションを削除し、件数を返す。
    async fn purge_terminal_sessions(&self, completed_before: DateTime<Utc>) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}

/// 投稿単位の埋め込みキャッシュ。
#[async_trait]
pub trait EmbeddingCacheStore: Send + Sync {
    /// 指定モデルで計算済みのベクトルのみ返す。
    async fn get_embeddings(
        &self,
        post_ids: &[Uuid],
        model: &str,
    ) -> Result<HashMap<Uuid, Vec<f32>>>;

    async fn count_cached(&self, post_ids: &[Uuid], model: &str) -> Result<usize>;

    async fn put_embeddings(&self, model: &str, entries: &[(Uuid, Vec<f32>)]) -> Result<()>;
}

/// 収集サービスが所有する投稿テーブルの読み取り。
#[async_trait]
pub trait PostStore: Send + Sync {
    /// `[start, end)` の投稿を時刻順で返す。
    async fn post_stamps(
        &self,
        zone_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PostStamp>>;

    async fn fetch_posts(&self, post_ids: &[Uuid]) -> Result<Vec<PostRecord>>;
}

/// ゾーンの存在確認と呼び出し元の権限確認。
#[async_trait]
pub trait ZoneAccess: Send + Sync {
    async fn zone_exists(&self, zone_id: Uuid) -> Result<bool>;

    async fn can_access(&self, caller_id: &str, zone_id: Uuid) -> Result<bool>;
}
