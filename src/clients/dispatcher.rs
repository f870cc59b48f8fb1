use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url, header::HeaderMap};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{
    headers::{add_callback_url, add_idempotency_key},
    truncate_body,
};
use crate::config::Config;
use crate::util::retry::{RetryConfig, UnexpectedStatus, is_retryable_anyhow};

const IDEMPOTENCY_PURPOSE: &str = "opinion-map-worker";

/// ワーカー呼び出しを外部キューへ登録する。
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, session_id: Uuid) -> Result<()>;
}

/// HTTP で公開されたスケジューラ（at-least-once 配送）への登録。
#[derive(Debug, Clone)]
pub struct HttpJobDispatcher {
    client: Client,
    publish_url: Url,
    token: Option<String>,
    callback_url: String,
    retry: RetryConfig,
}

impl HttpJobDispatcher {
    /// # Errors
    /// URL が不正、または HTTP クライアントを構築できない場合。
    pub fn new(
        publish_url: &str,
        token: Option<String>,
        callback_url: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()
            .context("failed to build scheduler client")?;

        Ok(Self {
            client,
            publish_url: Url::parse(publish_url).context("invalid scheduler publish URL")?,
            token,
            callback_url: callback_url.into(),
            retry: RetryConfig::default(),
        })
    }

    /// # Errors
    /// URL が不正、または HTTP クライアントを構築できない場合。
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            config.scheduler_publish_url(),
            config.scheduler_token().map(ToString::to_string),
            config.worker_callback_url(),
        )?
        .with_retry(RetryConfig::from_config(config)))
    }

    #[must_use]
    pub(crate) fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn publish_once(&self, session_id: Uuid) -> Result<()> {
        let mut headers = HeaderMap::new();
        add_idempotency_key(&mut headers, session_id, IDEMPOTENCY_PURPOSE);
        add_callback_url(&mut headers, &self.callback_url);

        let mut request = self
            .client
            .post(self.publish_url.clone())
            .headers(headers)
            .json(&json!({ "session_id": session_id }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.context("scheduler publish failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::Error::new(UnexpectedStatus(status))
                .context(format!("scheduler rejected job: {}", truncate_body(&body))));
        }
        Ok(())
    }
}

#[async_trait]
impl JobDispatcher for HttpJobDispatcher {
    async fn dispatch(&self, session_id: Uuid) -> Result<()> {
        // 同じ Idempotency-Key で再送するのでキュー側で重複排除される
        self.retry
            .run(
                "scheduler publish",
                || self.publish_once(session_id),
                is_retryable_anyhow,
            )
            .await?;
        info!(%session_id, "worker invocation scheduled");
        Ok(())
    }
}
