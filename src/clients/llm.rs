use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{join_endpoint, truncate_body};
use crate::config::Config;
use crate::schema::{LABEL_RESPONSE_SCHEMA, validate_json};
use crate::util::retry::{RetryConfig, UnexpectedStatus, is_retryable_anyhow};

/// ラベル生成に渡すクラスタの要約。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelRequest {
    /// 1 始まりのクラスタ番号。
    pub cluster_number: usize,
    pub post_count: usize,
    pub representatives: Vec<String>,
    /// 頻出語から抽出したヒント。
    pub candidate_keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterLabel {
    pub label: String,
    pub keywords: Vec<String>,
    pub sentiment: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// 言語モデルによるクラスタ命名の抽象。
#[async_trait]
pub trait LabelProvider: Send + Sync {
    async fn label(&self, request: &LabelRequest) -> Result<ClusterLabel>;
}

const SYSTEM_PROMPT: &str = "You summarise groups of social media posts that share an opinion. \
Reply with a single JSON object with the fields: \
\"label\" (a short name for the shared opinion, at most 80 characters), \
\"keywords\" (1 to 8 lower-case keywords), \
\"sentiment\" (a number from -1 for very negative to 1 for very positive) and \
\"reasoning\" (one paragraph explaining the label). Do not add other text.";

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// OpenAI 互換 `/v1/chat/completions` によるラベル生成。
#[derive(Debug, Clone)]
pub struct HttpLabelProvider {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    model: String,
    retry: RetryConfig,
}

impl HttpLabelProvider {
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
            .context("failed to build language model client")?;

        Ok(Self {
            client,
            endpoint: join_endpoint(base_url, "v1/chat/completions")?,
            api_key,
            model: model.into(),
            retry: RetryConfig::default(),
        })
    }

    /// # Errors
    /// URL が不正、または HTTP クライアントを構築できない場合。
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            config.llm_base_url(),
            config.llm_api_key().map(ToString::to_string),
            config.llm_model(),
            config.llm_timeout(),
        )?
        .with_retry(RetryConfig::from_config(config)))
    }

    #[must_use]
    pub(crate) fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn request_body(&self, request: &LabelRequest) -> Value {
        json!({
            "model": self.model,
            "temperature": 0.2,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_prompt(request) }
            ]
        })
    }

    async fn request_once(&self, body: &Value) -> Result<String> {
        let mut request = self.client.post(self.endpoint.clone()).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("language model request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::Error::new(UnexpectedStatus(status))
                .context(format!("language model endpoint error: {}", truncate_body(&body))));
        }

        let payload: ChatCompletionResponse = response
            .json()
            .await
            .context("failed to deserialize chat completion response")?;

        payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| anyhow!("language model returned no content"))
    }
}

fn user_prompt(request: &LabelRequest) -> String {
    let mut prompt = format!(
        "Cluster {} contains {} posts.\n",
        request.cluster_number, request.post_count
    );
    if !request.candidate_keywords.is_empty() {
        prompt.push_str("Frequent terms: ");
        prompt.push_str(&request.candidate_keywords.join(", "));
        prompt.push('\n');
    }
    prompt.push_str("Representative posts:\n");
    for (i, post) in request.representatives.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, post.replace('\n', " ")));
    }
    prompt
}

/// モデル出力から JSON オブジェクトを取り出し、スキーマ検証してから復元する。
pub(crate) fn parse_label_content(content: &str) -> Result<ClusterLabel> {
    let trimmed = content.trim();
    let json_text = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => return Err(anyhow!("label response is not a JSON object")),
    };
    let value: Value =
        serde_json::from_str(json_text).context("label response is not valid JSON")?;

    let validation = validate_json(&LABEL_RESPONSE_SCHEMA, &value);
    if !validation.valid {
        warn!(errors = ?validation.errors, "label response failed schema validation");
        return Err(anyhow!(
            "label response failed schema validation: {}",
            validation.errors.join("; ")
        ));
    }

    serde_json::from_value(value).context("failed to deserialize label response")
}

#[async_trait]
impl LabelProvider for HttpLabelProvider {
    async fn label(&self, request: &LabelRequest) -> Result<ClusterLabel> {
        let body = self.request_body(request);
        debug!(
            cluster = request.cluster_number,
            representatives = request.representatives.len(),
            "requesting cluster label"
        );
        let content = self
            .retry
            .run("label", || self.request_once(&body), is_retryable_anyhow)
            .await?;
        parse_label_content(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> LabelRequest {
        LabelRequest {
            cluster_number: 1,
            post_count: 42,
            representatives: vec!["Bus fares doubled again".into(), "Too expensive".into()],
            candidate_keywords: vec!["fares".into(), "bus".into()],
        }
    }

    fn completion(content: &str) -> Value {
        json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
    }

    #[test]
    fn parse_accepts_wrapped_json() {
        let label = parse_label_content(
            "```json\n{\"label\":\"Fares\",\"keywords\":[\"bus\"],\"sentiment\":-0.5,\"reasoning\":\"r\"}\n```",
        )
        .expect("parses");

        assert_eq!(label.label, "Fares");
        assert_eq!(label.keywords, vec!["bus"]);
    }

    #[test]
    fn parse_rejects_schema_violation() {
        let result = parse_label_content("{\"label\":\"Fares\",\"sentiment\":0}");

        assert!(result.is_err());
    }

    #[test]
    fn prompt_lists_representatives() {
        let prompt = user_prompt(&request());

        assert!(prompt.contains("Cluster 1 contains 42 posts"));
        assert!(prompt.contains("1. Bus fares doubled again"));
        assert!(prompt.contains("fares, bus"));
    }

    #[tokio::test]
    async fn label_round_trip_through_chat_completions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({
                "model": "test-llm",
                "response_format": { "type": "json_object" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(
                r#"{"label":"Transit costs","keywords":["fares","bus"],"sentiment":-0.6,"reasoning":"Complaints about fares."}"#,
            )))
            .mount(&server)
            .await;

        let provider = HttpLabelProvider::new(&server.uri(), None, "test-llm", Duration::from_secs(5))
            .expect("client builds")
            .with_retry(RetryConfig::new(1, 0, 0));

        let label = provider.label(&request()).await.expect("label succeeds");

        assert_eq!(label.label, "Transit costs");
        assert!((label.sentiment + 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn label_fails_on_empty_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("  ")))
            .mount(&server)
            .await;

        let provider = HttpLabelProvider::new(&server.uri(), None, "test-llm", Duration::from_secs(5))
            .expect("client builds")
            .with_retry(RetryConfig::new(1, 0, 0));

        assert!(provider.label(&request()).await.is_err());
    }
}
