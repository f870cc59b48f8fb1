use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::session::SessionConfig;

/// SessionStatus - パイプライン実行の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Vectorizing,
    Reducing,
    Clustering,
    Labeling,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub const ACTIVE: [SessionStatus; 5] = [
        SessionStatus::Pending,
        SessionStatus::Vectorizing,
        SessionStatus::Reducing,
        SessionStatus::Clustering,
        SessionStatus::Labeling,
    ];

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// 遷移元として許される状態。
    #[must_use]
    pub fn predecessors(self) -> &'static [SessionStatus] {
        match self {
            Self::Pending => &[],
            Self::Vectorizing => &[Self::Pending],
            Self::Reducing => &[Self::Vectorizing],
            Self::Clustering => &[Self::Reducing],
            Self::Labeling => &[Self::Clustering],
            Self::Completed => &[Self::Labeling],
            Self::Failed | Self::Cancelled => &Self::ACTIVE,
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        next.predecessors().contains(&self)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Vectorizing => "vectorizing",
            SessionStatus::Reducing => "reducing",
            SessionStatus::Clustering => "clustering",
            SessionStatus::Labeling => "labeling",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    /// 文字列列挙での述語（`status = ANY($n)`）に渡す値。
    #[must_use]
    pub fn names(statuses: &[SessionStatus]) -> Vec<String> {
        statuses.iter().map(|s| s.as_ref().to_string()).collect()
    }
}

impl AsRef<str> for SessionStatus {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(SessionStatus::Pending),
            "vectorizing" => Ok(SessionStatus::Vectorizing),
            "reducing" => Ok(SessionStatus::Reducing),
            "clustering" => Ok(SessionStatus::Clustering),
            "labeling" => Ok(SessionStatus::Labeling),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown session status: {other}")),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub zone_id: Uuid,
    pub status: SessionStatus,
    pub progress: u8,
    pub current_phase: Option<String>,
    pub phase_message: Option<String>,
    pub config: SessionConfig,
    pub total_posts: usize,
    pub vectorized_count: usize,
    pub cluster_count: usize,
    pub outlier_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_ms: Option<i64>,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: Uuid,
    pub zone_id: Uuid,
    pub config: SessionConfig,
}

/// 原子的な作成の結果。競合時は勝者のセッションが返る。
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(Session),
    Existing(Session),
}

/// 状態遷移と同時に書き込む進捗情報。
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseUpdate {
    pub status: SessionStatus,
    pub progress: u8,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub total_posts: usize,
    pub vectorized_count: usize,
    pub cluster_count: usize,
    pub outlier_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRecord {
    pub post_id: Uuid,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub cluster_id: i32,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub cluster_id: i32,
    pub label: String,
    pub keywords: Vec<String>,
    pub reasoning: String,
    pub post_count: usize,
    pub centroid: [f64; 3],
    pub avg_sentiment: f64,
    pub coherence: f64,
}

/// 収集済み投稿。本文は埋め込みとラベリングでのみ使う。
#[derive(Debug, Clone, PartialEq)]
pub struct PostRecord {
    pub id: Uuid,
    pub zone_id: Uuid,
    pub content: String,
    pub posted_at: DateTime<Utc>,
    pub engagement: i64,
}

/// サンプリング用の軽量な投稿参照。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostStamp {
    pub id: Uuid,
    pub posted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(SessionStatus::Pending, SessionStatus::Vectorizing, true)]
    #[case(SessionStatus::Vectorizing, SessionStatus::Reducing, true)]
    #[case(SessionStatus::Labeling, SessionStatus::Completed, true)]
    #[case(SessionStatus::Reducing, SessionStatus::Cancelled, true)]
    #[case(SessionStatus::Pending, SessionStatus::Failed, true)]
    #[case(SessionStatus::Pending, SessionStatus::Reducing, false)]
    #[case(SessionStatus::Clustering, SessionStatus::Vectorizing, false)]
    #[case(SessionStatus::Completed, SessionStatus::Failed, false)]
    #[case(SessionStatus::Cancelled, SessionStatus::Vectorizing, false)]
    #[case(SessionStatus::Failed, SessionStatus::Cancelled, false)]
    fn transition_legality(
        #[case] from: SessionStatus,
        #[case] to: SessionStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn terminal_states_have_no_exit() {
        let all = [
            SessionStatus::Pending,
            SessionStatus::Vectorizing,
            SessionStatus::Reducing,
            SessionStatus::Clustering,
            SessionStatus::Labeling,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Cancelled,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn status_serializes_lowercase() {
        let value = serde_json::to_value(SessionStatus::Vectorizing).expect("serialize");
        assert_eq!(value, "vectorizing");
    }
}
