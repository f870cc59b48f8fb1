use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{join_endpoint, truncate_body};
use crate::config::Config;
use crate::util::retry::{RetryConfig, UnexpectedStatus, is_retryable_anyhow};

/// 埋め込みプロバイダの抽象。テストでは決定的なスタブに差し替える。
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// キャッシュエントリに記録するモデル識別子。
    fn model(&self) -> &str;

    /// 入力順にベクトルを返す。
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// OpenAI 互換 `/v1/embeddings` クライアント。
#[derive(Debug, Clone)]
pub struct HttpEmbeddingProvider {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    model: String,
    retry: RetryConfig,
}

impl HttpEmbeddingProvider {
    /// # Errors
    /// URL が不正、または HTTP クライアントを構築できない場合。
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .context("failed to build embedding client")?;

        Ok(Self {
            client,
            endpoint: join_endpoint(base_url, "v1/embeddings")?,
            api_key,
            model: model.into(),
            retry: RetryConfig::default(),
        })
    }

    /// # Errors
    /// URL が不正、または HTTP クライアントを構築できない場合。
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            config.embedding_base_url(),
            config.embedding_api_key().map(ToString::to_string),
            config.embedding_model(),
            config.embedding_timeout(),
        )?
        .with_retry(RetryConfig::from_config(config)))
    }

    #[must_use]
    pub(crate) fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn request_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut request = self.client.post(self.endpoint.clone()).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("embedding request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::Error::new(UnexpectedStatus(status))
                .context(format!("embedding endpoint error: {}", truncate_body(&body))));
        }

        let mut payload: EmbeddingResponse = response
            .json()
            .await
            .context("failed to deserialize embedding response")?;

        if payload.data.len() != texts.len() {
            return Err(anyhow!(
                "embedding provider returned {} vectors for {} inputs",
                payload.data.len(),
                texts.len()
            ));
        }
        payload.data.sort_by_key(|datum| datum.index);
        Ok(payload.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(batch = texts.len(), model = %self.model, "requesting embeddings");
        self.retry
            .run("embedding", || self.request_once(texts), is_retryable_anyhow)
            .await
    }
}
