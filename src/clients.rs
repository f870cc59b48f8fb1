pub mod dispatcher;
pub mod embedding;
pub(crate) mod headers;
pub mod llm;

pub use dispatcher::{HttpJobDispatcher, JobDispatcher};
pub use embedding::{EmbeddingProvider, HttpEmbeddingProvider};
pub use llm::{ClusterLabel, HttpLabelProvider, LabelProvider, LabelRequest};

use anyhow::{Context, Result};
use reqwest::Url;

/// ベース URL を末尾スラッシュ付きで解釈し、相対パスを連結する。
pub(crate) fn join_endpoint(base_url: &str, path: &str) -> Result<Url> {
    let mut base = base_url.trim_end_matches('/').to_string();
    base.push('/');
    let base = Url::parse(&base).with_context(|| format!("invalid base URL: {base_url}"))?;
    base.join(path.trim_start_matches('/'))
        .with_context(|| format!("failed to build URL for {path}"))
}

/// エラーメッセージに含めるレスポンス本文を切り詰める。
pub(crate) fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 512;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut end = LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
