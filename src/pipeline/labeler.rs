//! Cluster naming. Best-effort per cluster: a provider failure degrades that
//! cluster to a placeholder label and never fails the session.

use std::sync::Arc;

use futures::{StreamExt, stream};
use ndarray::{ArrayView1, ArrayView2};
use tracing::{info, warn};

use super::clusterer::{ClusterGeometry, Clustering};
use super::progress::ProgressSink;
use super::session::Phase;
use crate::clients::{ClusterLabel, LabelProvider, LabelRequest};
use crate::observability::Metrics;
use crate::store::models::{ClusterRecord, PostRecord};
use crate::util::kmeans::distance_sq;
use crate::util::text::{top_terms, truncate_graphemes};

const NEAREST_REPRESENTATIVES: usize = 6;
const ENGAGEMENT_REPRESENTATIVES: usize = 2;
const REPRESENTATIVE_MAX_CHARS: usize = 500;
const LABEL_MAX_CHARS: usize = 80;
const MAX_KEYWORDS: usize = 8;
const CANDIDATE_KEYWORDS: usize = 10;

#[derive(Clone)]
pub struct Labeler {
    provider: Arc<dyn LabelProvider>,
    concurrency: usize,
    metrics: Option<Arc<Metrics>>,
}

impl Labeler {
    pub fn new(provider: Arc<dyn LabelProvider>, concurrency: usize) -> Self {
        Self {
            provider,
            concurrency: concurrency.max(1),
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Labels every cluster. `posts` and `compact` rows are aligned.
    pub async fn label(
        &self,
        posts: &[PostRecord],
        compact: ArrayView2<'_, f64>,
        clustering: &Clustering,
        progress: &dyn ProgressSink,
    ) -> Vec<ClusterRecord> {
        let requests: Vec<(usize, LabelRequest)> = clustering
            .clusters
            .iter()
            .enumerate()
            .map(|(i, cluster)| (i, build_request(posts, compact, cluster)))
            .collect();
        let total = requests.len();

        let mut labels: Vec<Option<ClusterLabel>> = vec![None; total];
        let mut results = stream::iter(requests.into_iter().map(|(i, request)| async move {
            let outcome = self.provider.label(&request).await;
            (i, request, outcome)
        }))
        .buffer_unordered(self.concurrency);

        let mut done = 0_usize;
        let mut fallbacks = 0_usize;
        while let Some((i, request, outcome)) = results.next().await {
            done += 1;
            let label = match outcome.map(normalize) {
                Ok(Some(label)) => label,
                Ok(None) => {
                    warn!(cluster = request.cluster_number, "label provider returned an empty label");
                    fallbacks += 1;
                    fallback_label(&request)
                }
                Err(error) => {
                    warn!(cluster = request.cluster_number, error = %error, "labeling failed, using placeholder");
                    fallbacks += 1;
                    fallback_label(&request)
                }
            };
            labels[i] = Some(label);
            progress
                .report(
                    Phase::Labeling.progress_at(done, total),
                    &format!("labelled {done}/{total} clusters"),
                )
                .await;
        }
        drop(results);

        if let Some(metrics) = &self.metrics {
            metrics.label_fallbacks.inc_by(fallbacks as f64);
        }
        info!(clusters = total, fallbacks, "labeling finished");

        clustering
            .clusters
            .iter()
            .zip(labels)
            .map(|(cluster, label)| {
                let label = label.unwrap_or_else(|| {
                    fallback_label(&build_request(posts, compact, cluster))
                });
                to_record(cluster, label)
            })
            .collect()
    }
}

/// Placeholder records used before labeling has run.
#[must_use]
pub fn placeholder_records(
    posts: &[PostRecord],
    compact: ArrayView2<'_, f64>,
    clustering: &Clustering,
) -> Vec<ClusterRecord> {
    clustering
        .clusters
        .iter()
        .map(|cluster| {
            let label = fallback_label(&build_request(posts, compact, cluster));
            to_record(cluster, label)
        })
        .collect()
}

fn to_record(cluster: &ClusterGeometry, label: ClusterLabel) -> ClusterRecord {
    ClusterRecord {
        cluster_id: cluster.cluster_id,
        label: label.label,
        keywords: label.keywords,
        reasoning: label.reasoning,
        post_count: cluster.members.len(),
        centroid: cluster.display_centroid,
        avg_sentiment: label.sentiment,
        coherence: cluster.coherence,
    }
}

/// Nearest-to-centroid posts first, then the most engaged of the rest.
pub(crate) fn representatives(
    posts: &[PostRecord],
    compact: ArrayView2<'_, f64>,
    cluster: &ClusterGeometry,
) -> Vec<usize> {
    let centre = ArrayView1::from(cluster.compact_centroid.as_slice());
    let mut by_distance: Vec<(usize, f64)> = cluster
        .members
        .iter()
        .map(|&i| (i, distance_sq(compact.row(i), centre)))
        .collect();
    by_distance.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

    let mut picked: Vec<usize> = by_distance
        .iter()
        .take(NEAREST_REPRESENTATIVES)
        .map(|(i, _)| *i)
        .collect();

    let mut rest: Vec<usize> = by_distance
        .iter()
        .skip(NEAREST_REPRESENTATIVES)
        .map(|(i, _)| *i)
        .collect();
    rest.sort_by(|&a, &b| posts[b].engagement.cmp(&posts[a].engagement).then(a.cmp(&b)));
    picked.extend(rest.into_iter().take(ENGAGEMENT_REPRESENTATIVES));
    picked
}

fn build_request(
    posts: &[PostRecord],
    compact: ArrayView2<'_, f64>,
    cluster: &ClusterGeometry,
) -> LabelRequest {
    let representatives = representatives(posts, compact, cluster)
        .into_iter()
        .map(|i| truncate_graphemes(posts[i].content.trim(), REPRESENTATIVE_MAX_CHARS))
        .collect();
    let candidate_keywords = top_terms(
        cluster.members.iter().map(|&i| posts[i].content.as_str()),
        CANDIDATE_KEYWORDS,
    );
    LabelRequest {
        cluster_number: usize::try_from(cluster.cluster_id).unwrap_or(0) + 1,
        post_count: cluster.members.len(),
        representatives,
        candidate_keywords,
    }
}

/// Trims and bounds provider output. `None` when no usable label remains.
pub(crate) fn normalize(label: ClusterLabel) -> Option<ClusterLabel> {
    let text = truncate_graphemes(label.label.trim(), LABEL_MAX_CHARS)
        .trim()
        .to_string();
    if text.is_empty() {
        return None;
    }

    let mut keywords: Vec<String> = Vec::new();
    for keyword in label.keywords {
        let keyword = keyword.trim().to_lowercase();
        if !keyword.is_empty() && !keywords.contains(&keyword) {
            keywords.push(keyword);
        }
        if keywords.len() == MAX_KEYWORDS {
            break;
        }
    }
    if keywords.is_empty() {
        return None;
    }

    let sentiment = if label.sentiment.is_finite() {
        label.sentiment.clamp(-1.0, 1.0)
    } else {
        0.0
    };

    Some(ClusterLabel {
        label: text,
        keywords,
        sentiment,
        reasoning: label.reasoning.trim().to_string(),
    })
}

pub(crate) fn fallback_label(request: &LabelRequest) -> ClusterLabel {
    let mut keywords: Vec<String> = request
        .candidate_keywords
        .iter()
        .take(MAX_KEYWORDS)
        .cloned()
        .collect();
    if keywords.is_empty() {
        keywords.push(format!("cluster-{}", request.cluster_number));
    }
    ClusterLabel {
        label: format!("Cluster {}", request.cluster_number),
        keywords,
        sentiment: 0.0,
        reasoning: "Automatic labeling was unavailable; keywords are the most frequent terms in this cluster.".to_string(),
    }
}
