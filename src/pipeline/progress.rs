use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::store::SessionStore;

/// Receives in-phase progress. Reporting is best-effort and never fails a phase.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: u8, message: &str);
}

/// Discards progress; used where nothing observes the run.
pub struct NoopProgress;

#[async_trait]
impl ProgressSink for NoopProgress {
    async fn report(&self, _progress: u8, _message: &str) {}
}

/// Writes progress onto the persisted session.
pub struct SessionProgress {
    sessions: Arc<dyn SessionStore>,
    session_id: Uuid,
}

impl SessionProgress {
    pub fn new(sessions: Arc<dyn SessionStore>, session_id: Uuid) -> Self {
        Self {
            sessions,
            session_id,
        }
    }
}

#[async_trait]
impl ProgressSink for SessionProgress {
    async fn report(&self, progress: u8, message: &str) {
        if let Err(error) = self
            .sessions
            .record_progress(self.session_id, progress, message)
            .await
        {
            warn!(session_id = %self.session_id, error = %error, "failed to record progress");
        }
    }
}
