/// 指数バックオフ+ジッター付き再試行ロジック。
///
/// 外部プロバイダ（埋め込み・LLM・スケジューラ）呼び出しで共有する。
use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::warn;

/// 再試行戦略の設定。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryConfig {
    /// 最大試行回数（初回を含む）
    pub(crate) max_attempts: usize,
    /// ベースとなる遅延時間（ミリ秒）
    pub(crate) base_delay_ms: u64,
    /// 最大遅延時間（ミリ秒）
    pub(crate) max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub(crate) const fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// 設定値から生成する。`HTTP_MAX_RETRIES` は再試行回数なので初回分を足す。
    #[must_use]
    pub(crate) fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            config.http_max_retries() + 1,
            config.http_backoff_base_ms(),
            config.http_backoff_cap_ms(),
        )
    }

    /// 指定された試行回数に対する遅延時間を計算する（Full Jitter戦略）。
    #[must_use]
    pub(crate) fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let shift = u32::try_from(attempt - 1).unwrap_or(u32::MAX);
        let exponential_delay = self
            .base_delay_ms
            .saturating_mul(1_u64.checked_shl(shift).unwrap_or(u64::MAX));
        let capped_delay = exponential_delay.min(self.max_delay_ms);

        let jittered_delay = if capped_delay > 0 {
            rand::rng().random_range(0..=capped_delay)
        } else {
            0
        };

        Duration::from_millis(jittered_delay)
    }

    #[must_use]
    pub(crate) const fn can_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }

    /// `operation` を再試行付きで実行する。
    ///
    /// `is_retryable` が false を返したエラーは即座に返す。
    pub(crate) async fn run<T, F, Fut, P>(
        &self,
        operation_name: &str,
        mut operation: F,
        is_retryable: P,
    ) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        P: Fn(&anyhow::Error) -> bool,
    {
        let mut attempt = 0;
        loop {
            tokio::time::sleep(self.delay_for_attempt(attempt)).await;
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if self.can_retry(attempt) && is_retryable(&error) => {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "retrying after transient failure"
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// エラーが再試行可能かどうかを判定する。
///
/// ネットワークエラー、タイムアウト、5xx、429 を再試行対象とする。
pub(crate) fn is_retryable_error(error: &reqwest::Error) -> bool {
    if error.is_timeout() || error.is_connect() {
        return true;
    }

    error.status().is_some_and(is_retryable_status)
}

pub(crate) fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// anyhow でラップされたエラー連鎖から再試行可否を判定する。
pub(crate) fn is_retryable_anyhow(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        if let Some(reqwest_error) = cause.downcast_ref::<reqwest::Error>() {
            return is_retryable_error(reqwest_error);
        }
        cause
            .downcast_ref::<UnexpectedStatus>()
            .is_some_and(|status| is_retryable_status(status.0))
    })
}

/// プロバイダが非成功ステータスを返したことを示すエラー。
#[derive(Debug, thiserror::Error)]
#[error("unexpected status {0}")]
pub(crate) struct UnexpectedStatus(pub(crate) reqwest::StatusCode);

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn delay_for_attempt_zero_is_zero() {
        assert_eq!(RetryConfig::default().delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn delay_for_attempt_is_bounded_by_exponential_cap() {
        let config = RetryConfig::new(5, 100, 10_000);

        assert!(config.delay_for_attempt(1) <= Duration::from_millis(100));
        assert!(config.delay_for_attempt(2) <= Duration::from_millis(200));
        assert!(config.delay_for_attempt(3) <= Duration::from_millis(400));
    }

    #[test]
    fn delay_for_attempt_respects_max_delay() {
        let config = RetryConfig::new(100, 100, 500);

        assert!(config.delay_for_attempt(10) <= Duration::from_millis(500));
        assert!(config.delay_for_attempt(90) <= Duration::from_millis(500));
    }

    #[test]
    fn can_retry_respects_max_attempts() {
        let config = RetryConfig::new(3, 100, 1000);

        assert!(config.can_retry(2));
        assert!(!config.can_retry(3));
    }

    #[test]
    fn retryable_status_covers_5xx_and_429() {
        assert!(is_retryable_status(reqwest::StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(reqwest::StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn run_retries_transient_failures_then_succeeds() {
        let config = RetryConfig::new(3, 0, 0);
        let calls = AtomicUsize::new(0);

        let result = config
            .run(
                "test",
                || {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 2 {
                            Err(anyhow::Error::new(UnexpectedStatus(
                                reqwest::StatusCode::SERVICE_UNAVAILABLE,
                            )))
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                is_retryable_anyhow,
            )
            .await
            .expect("third attempt succeeds");

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_stops_on_permanent_failure() {
        let config = RetryConfig::new(5, 0, 0);
        let calls = AtomicUsize::new(0);

        let result: anyhow::Result<()> = config
            .run(
                "test",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err(anyhow::Error::new(UnexpectedStatus(
                            reqwest::StatusCode::UNAUTHORIZED,
                        )))
                    }
                },
                is_retryable_anyhow,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
