#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response},
};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use opinion_map_worker::{
    app::{Backends, ComponentRegistry, ServiceSettings, build_router},
    clients::{ClusterLabel, EmbeddingProvider, JobDispatcher, LabelProvider, LabelRequest},
    observability::Telemetry,
    store::{InMemoryStore, models::PostRecord},
};

pub const CALLER: &str = "analyst";
pub const WORKER_SECRET: &str = "worker-secret";

const TOPICS: [&str; 5] = [
    "bus fares keep rising and commuters are angry",
    "the new park is beautiful and families love it",
    "school lunches need better nutrition standards",
    "potholes on main road damage cars every week",
    "library hours were cut and students lose study space",
];

/// Topic-aligned vectors with deterministic per-text jitter.
pub struct TopicEmbedding;

#[async_trait]
impl EmbeddingProvider for TopicEmbedding {
    fn model(&self) -> &str {
        "topic-stub-v1"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| topic_vector(text)).collect())
    }
}

pub fn topic_vector(text: &str) -> Vec<f32> {
    let topic = TOPICS
        .iter()
        .position(|t| text.starts_with(t))
        .unwrap_or(0);
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (0..16)
        .map(|j| {
            let noise = ((hash >> (j * 3)) & 0x7) as f32 / 40.0;
            if j % TOPICS.len() == topic { 4.0 + noise } else { noise }
        })
        .collect()
}

pub struct KeywordLabels;

#[async_trait]
impl LabelProvider for KeywordLabels {
    async fn label(&self, request: &LabelRequest) -> Result<ClusterLabel> {
        Ok(ClusterLabel {
            label: format!("Opinion about {}", request.candidate_keywords.join(" ")),
            keywords: request.candidate_keywords.clone(),
            sentiment: 0.1,
            reasoning: format!("{} posts", request.post_count),
        })
    }
}

#[derive(Default)]
pub struct RecordingDispatcher {
    pub dispatched: Mutex<Vec<Uuid>>,
    pub fail: bool,
}

#[async_trait]
impl JobDispatcher for RecordingDispatcher {
    async fn dispatch(&self, session_id: Uuid) -> Result<()> {
        if self.fail {
            anyhow::bail!("queue rejected the job");
        }
        self.dispatched.lock().unwrap().push(session_id);
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<InMemoryStore>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub zone_id: Uuid,
}

pub struct TestAppBuilder {
    dispatcher: RecordingDispatcher,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<InMemoryStore>,
}

impl TestAppBuilder {
    pub fn new() -> Self {
        Self {
            dispatcher: RecordingDispatcher::default(),
            embedder: Arc::new(TopicEmbedding),
            store: Arc::new(InMemoryStore::new()),
        }
    }

    pub fn failing_dispatcher(mut self) -> Self {
        self.dispatcher.fail = true;
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn store(&self) -> Arc<InMemoryStore> {
        Arc::clone(&self.store)
    }

    /// `count` posts evenly spread over the `days` before `end`.
    pub fn build(self, count: usize, end: DateTime<Utc>, days: i64) -> TestApp {
        let zone_id = Uuid::new_v4();
        self.store.add_zone(zone_id, &[CALLER]).unwrap();
        let span = Duration::days(days).num_seconds();
        let posts: Vec<PostRecord> = (0..count)
            .map(|i| {
                let offset = span * i64::try_from(i).unwrap() / i64::try_from(count).unwrap();
                PostRecord {
                    id: Uuid::new_v4(),
                    zone_id,
                    content: format!("{} #{i}", TOPICS[i % TOPICS.len()]),
                    posted_at: end - Duration::days(days) + Duration::seconds(offset),
                    engagement: i64::try_from(i % 23).unwrap(),
                }
            })
            .collect();
        self.store.add_posts(posts).unwrap();

        let dispatcher = Arc::new(self.dispatcher);
        let backends = Backends {
            sessions: self.store.clone(),
            zones: self.store.clone(),
            posts: self.store.clone(),
            embedding_cache: self.store.clone(),
            embedder: self.embedder,
            labels: Arc::new(KeywordLabels),
            dispatcher: dispatcher.clone(),
        };
        let settings = ServiceSettings {
            worker_shared_secret: Some(WORKER_SECRET.to_string()),
            ..ServiceSettings::default()
        };
        let registry = ComponentRegistry::assemble(
            settings,
            Telemetry::without_tracing().unwrap(),
            backends,
            CancellationToken::new(),
        );

        TestApp {
            router: build_router(registry),
            store: self.store,
            dispatcher,
            zone_id,
        }
    }
}

pub fn start_request(zone_id: Uuid, start: &str, end: &str, sample_size: usize) -> Request<Body> {
    let body = serde_json::json!({
        "zone_id": zone_id,
        "start_date": start,
        "end_date": end,
        "sample_size": sample_size,
    });
    Request::post("/v1/opinion-maps")
        .header("content-type", "application/json")
        .header("x-caller-id", CALLER)
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn worker_request(session_id: Uuid) -> Request<Body> {
    Request::post("/internal/worker/opinion-map")
        .header("authorization", format!("Bearer {WORKER_SECRET}"))
        .body(Body::from(
            serde_json::json!({ "session_id": session_id }).to_string(),
        ))
        .unwrap()
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::get(uri)
        .header("x-caller-id", CALLER)
        .body(Body::empty())
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
