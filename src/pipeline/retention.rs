use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::store::SessionStore;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// 終端セッションを保持期間後に削除する常駐タスクを起動する。
pub fn spawn_retention_daemon(
    sessions: Arc<dyn SessionStore>,
    retention_days: u32,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    RetentionDaemon {
        sessions,
        retention: chrono::Duration::days(i64::from(retention_days)),
        interval: SWEEP_INTERVAL,
        shutdown,
    }
    .spawn()
}

struct RetentionDaemon {
    sessions: Arc<dyn SessionStore>,
    retention: chrono::Duration,
    interval: Duration,
    shutdown: CancellationToken,
}

impl RetentionDaemon {
    fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        info!(
            retention_days = self.retention.num_days(),
            interval_secs = self.interval.as_secs(),
            "session retention daemon started"
        );
        loop {
            self.sweep().await;
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("session retention daemon stopped");
                    return;
                }
                () = sleep(self.interval) => {}
            }
        }
    }

    async fn sweep(&self) -> u64 {
        let cutoff = Utc::now() - self.retention;
        match self.sessions.purge_terminal_sessions(cutoff).await {
            Ok(0) => 0,
            Ok(purged) => {
                info!(purged, cutoff = %cutoff.to_rfc3339(), "purged expired sessions");
                purged
            }
            Err(err) => {
                error!(error = %err, "session retention sweep failed");
                0
            }
        }
    }
}
