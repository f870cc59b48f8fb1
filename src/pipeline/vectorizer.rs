//! Embedding cache front: reuse what is cached for the provider's model,
//! compute the rest in bounded-concurrency batches, persist new vectors.

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use futures::{StreamExt, stream};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clients::EmbeddingProvider;
use crate::error::OpinionMapError;
use crate::observability::Metrics;
use crate::pipeline::progress::ProgressSink;
use crate::pipeline::session::Phase;
use crate::store::{EmbeddingCacheStore, models::PostRecord};

/// Cached / missing split for a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub total: usize,
    pub cached: usize,
    pub needs_embedding: usize,
}

impl CacheStats {
    #[must_use]
    pub fn new(total: usize, cached: usize) -> Self {
        let cached = cached.min(total);
        Self {
            total,
            cached,
            needs_embedding: total - cached,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cache_hit_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.cached as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VectorizeReport {
    /// `(post index in the input, vector)` for every usable post, in input order.
    pub vectors: Vec<(usize, Vec<f32>)>,
    pub cached: usize,
    pub computed: usize,
    pub excluded: Vec<Uuid>,
}

#[derive(Clone)]
pub struct Vectorizer {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<dyn EmbeddingCacheStore>,
    batch_size: usize,
    concurrency: usize,
    metrics: Option<Arc<Metrics>>,
}

impl Vectorizer {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<dyn EmbeddingCacheStore>,
        batch_size: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            provider,
            cache,
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn model(&self) -> &str {
        self.provider.model()
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Counts cache hits without loading vectors.
    ///
    /// # Errors
    /// Propagates cache-store failures.
    pub async fn cache_stats(&self, post_ids: &[Uuid]) -> Result<CacheStats> {
        let cached = self.cache.count_cached(post_ids, self.model()).await?;
        Ok(CacheStats::new(post_ids.len(), cached))
    }

    /// Ensures every post has an embedding.
    ///
    /// Failed batches exclude only their posts. If every batch fails while
    /// something needed computing, the provider is treated as unreachable.
    ///
    /// # Errors
    /// Cache reads failing, or [`OpinionMapError::ExternalService`] on total failure.
    pub async fn vectorize(
        &self,
        posts: &[PostRecord],
        progress: &dyn ProgressSink,
    ) -> Result<VectorizeReport> {
        let ids: Vec<Uuid> = posts.iter().map(|p| p.id).collect();
        let mut found = self.cache.get_embeddings(&ids, self.model()).await?;
        let cached = found.len();

        let missing: Vec<&PostRecord> = posts.iter().filter(|p| !found.contains_key(&p.id)).collect();
        let batches: Vec<(Vec<Uuid>, Vec<String>)> = missing
            .chunks(self.batch_size)
            .map(|chunk| {
                (
                    chunk.iter().map(|p| p.id).collect(),
                    chunk.iter().map(|p| p.content.clone()).collect(),
                )
            })
            .collect();
        let batch_total = batches.len();

        let mut excluded = Vec::new();
        let mut computed = 0_usize;
        let mut failed_batches = 0_usize;
        let mut last_error = None;

        let provider = Arc::clone(&self.provider);
        let mut results = stream::iter(batches.into_iter().map(|(ids, texts)| {
            let provider = Arc::clone(&provider);
            async move {
                let outcome = provider.embed(&texts).await.and_then(|vectors| {
                    if vectors.len() == ids.len() {
                        Ok(vectors)
                    } else {
                        Err(anyhow::anyhow!(
                            "embedding provider returned {} vectors for {} inputs",
                            vectors.len(),
                            ids.len()
                        ))
                    }
                });
                (ids, outcome)
            }
        }))
        .buffer_unordered(self.concurrency);

        let mut done = 0_usize;
        while let Some((batch_ids, outcome)) = results.next().await {
            done += 1;
            match outcome {
                Ok(vectors) => {
                    let entries: Vec<(Uuid, Vec<f32>)> = batch_ids.into_iter().zip(vectors).collect();
                    if let Err(error) = self.cache.put_embeddings(self.model(), &entries).await {
                        warn!(error = %error, batch = entries.len(), "failed to persist embeddings, continuing");
                    }
                    computed += entries.len();
                    found.extend(entries);
                }
                Err(error) => {
                    failed_batches += 1;
                    warn!(error = %error, batch = batch_ids.len(), "embedding batch failed, excluding its posts");
                    excluded.extend(batch_ids);
                    last_error = Some(error);
                }
            }
            progress
                .report(
                    Phase::Vectorizing.progress_at(done, batch_total),
                    &format!("embedded {done}/{batch_total} batches"),
                )
                .await;
        }
        drop(results);

        if batch_total > 0 && failed_batches == batch_total {
            let source = last_error.unwrap_or_else(|| anyhow::anyhow!("embedding provider unavailable"));
            return Err(OpinionMapError::ExternalService {
                provider: "embedding",
                source,
            }
            .into());
        }

        let dimension = majority_dimension(found.values());
        let mut vectors = Vec::with_capacity(posts.len());
        for (index, post) in posts.iter().enumerate() {
            match found.remove(&post.id) {
                Some(vector) if Some(vector.len()) == dimension => vectors.push((index, vector)),
                Some(vector) => {
                    warn!(post_id = %post.id, dimension = vector.len(), "dropping embedding with unexpected dimension");
                    excluded.push(post.id);
                }
                None => {}
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.embedding_cache_hits.inc_by(cached as f64);
            metrics.embeddings_computed.inc_by(computed as f64);
            metrics.embedding_failures.inc_by(excluded.len() as f64);
        }
        info!(
            total = posts.len(),
            cached,
            computed,
            excluded = excluded.len(),
            "vectorization finished"
        );

        Ok(VectorizeReport {
            vectors,
            cached,
            computed,
            excluded,
        })
    }
}

fn majority_dimension<'a>(vectors: impl Iterator<Item = &'a Vec<f32>>) -> Option<usize> {
    let mut counts: HashMap<usize, usize> = HashMap::new();
    for vector in vectors.filter(|v| !v.is_empty()) {
        *counts.entry(vector.len()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(dim, _)| dim)
}
