mod support;

use std::sync::{Arc, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tower::ServiceExt;
use uuid::Uuid;

use opinion_map_worker::{
    clients::EmbeddingProvider,
    store::{InMemoryStore, SessionStore, models::SessionStatus},
};
use support::{TestAppBuilder, get_request, json_body, start_request, topic_vector, worker_request};

fn end_of_window() -> DateTime<Utc> {
    "2026-05-15T00:00:00Z".parse().unwrap()
}

#[tokio::test]
async fn concurrent_starts_share_one_session_and_one_dispatch() {
    let app = TestAppBuilder::new().build(150, end_of_window(), 5);

    let (a, b) = tokio::join!(
        app.router
            .clone()
            .oneshot(start_request(app.zone_id, "2026-05-10", "2026-05-14", 100)),
        app.router
            .clone()
            .oneshot(start_request(app.zone_id, "2026-05-10", "2026-05-14", 100)),
    );
    let a = json_body(a.unwrap()).await;
    let b = json_body(b.unwrap()).await;

    assert_eq!(a["session_id"], b["session_id"]);
    assert_ne!(a["reused_active_session"], b["reused_active_session"]);
    assert_eq!(app.dispatcher.dispatched.lock().unwrap().len(), 1);

    let third = json_body(
        app.router
            .clone()
            .oneshot(start_request(app.zone_id, "2026-05-10", "2026-05-14", 100))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(third["session_id"], a["session_id"]);
    assert_eq!(third["reused_active_session"], true);
    assert_eq!(app.dispatcher.dispatched.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn rejected_dispatch_leaves_no_pending_session() {
    let app = TestAppBuilder::new()
        .failing_dispatcher()
        .build(60, end_of_window(), 2);

    let response = app
        .router
        .clone()
        .oneshot(start_request(app.zone_id, "2026-05-13", "2026-05-14", 40))
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    let body = json_body(response).await;
    assert_eq!(body["error"], "scheduling_error");
    let session_id: Uuid = body["session_id"].as_str().unwrap().parse().unwrap();
    assert!(app.store.find_session(session_id).await.unwrap().is_none());
    assert!(app
        .store
        .find_active_session(app.zone_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn nine_posts_are_below_the_minimum() {
    let app = TestAppBuilder::new().build(9, end_of_window(), 1);

    let response = app
        .router
        .clone()
        .oneshot(start_request(app.zone_id, "2026-05-14", "2026-05-14", 200))
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body = json_body(response).await;
    assert_eq!(body["error"], "insufficient_data");
    assert_eq!(body["found"], 9);
    assert_eq!(body["minimum"], 10);
    assert!(app.dispatcher.dispatched.lock().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_range_is_rejected() {
    let app = TestAppBuilder::new().build(30, end_of_window(), 1);

    let response = app
        .router
        .clone()
        .oneshot(start_request(app.zone_id, "2026-05-14", "2026-05-01", 20))
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(json_body(response).await["error"], "validation_error");
}

/// Embeds normally but cancels the session from inside the first batch,
/// the way a user cancel lands while vectorizing is in flight.
struct CancelDuringEmbedding {
    store: Arc<InMemoryStore>,
    session_id: OnceLock<Uuid>,
}

#[async_trait]
impl EmbeddingProvider for CancelDuringEmbedding {
    fn model(&self) -> &str {
        "topic-stub-v1"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if let Some(id) = self.session_id.get() {
            self.store.cancel_session(*id).await?;
        }
        Ok(texts.iter().map(|t| topic_vector(t)).collect())
    }
}

#[tokio::test]
async fn cancel_is_honoured_at_the_next_phase_boundary() {
    let builder = TestAppBuilder::new();
    let embedder = Arc::new(CancelDuringEmbedding {
        store: builder.store(),
        session_id: OnceLock::new(),
    });
    let app = builder
        .embedder(embedder.clone())
        .build(80, end_of_window(), 2);

    let started = json_body(
        app.router
            .clone()
            .oneshot(start_request(app.zone_id, "2026-05-13", "2026-05-14", 50))
            .await
            .unwrap(),
    )
    .await;
    let session_id: Uuid = started["session_id"].as_str().unwrap().parse().unwrap();
    embedder.session_id.set(session_id).unwrap();

    let outcome = json_body(
        app.router
            .clone()
            .oneshot(worker_request(session_id))
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(outcome["outcome"], "cancelled");
    let session = app.store.find_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Cancelled);
    // 投影フェーズには進んでいない
    assert!(app.store.list_projections(session_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn redelivered_callback_after_completion_is_a_no_op() {
    let app = TestAppBuilder::new().build(60, end_of_window(), 2);
    let started = json_body(
        app.router
            .clone()
            .oneshot(start_request(app.zone_id, "2026-05-13", "2026-05-14", 60))
            .await
            .unwrap(),
    )
    .await;
    let session_id: Uuid = started["session_id"].as_str().unwrap().parse().unwrap();

    let first = json_body(
        app.router
            .clone()
            .oneshot(worker_request(session_id))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(first["outcome"], "completed");
    let before = app.store.find_session(session_id).await.unwrap().unwrap();

    let second = json_body(
        app.router
            .clone()
            .oneshot(worker_request(session_id))
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(second["outcome"], "skipped");
    let after = app.store.find_session(session_id).await.unwrap().unwrap();
    assert_eq!(before.updated_at, after.updated_at);
    assert_eq!(after.status, SessionStatus::Completed);
}

#[tokio::test]
async fn completed_session_cannot_be_cancelled() {
    let app = TestAppBuilder::new().build(40, end_of_window(), 1);
    let started = json_body(
        app.router
            .clone()
            .oneshot(start_request(app.zone_id, "2026-05-14", "2026-05-14", 40))
            .await
            .unwrap(),
    )
    .await;
    let session_id: Uuid = started["session_id"].as_str().unwrap().parse().unwrap();
    app.router
        .clone()
        .oneshot(worker_request(session_id))
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(
            axum::http::Request::post(format!("/v1/opinion-maps/{session_id}/cancel"))
                .header("x-caller-id", support::CALLER)
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = json_body(response).await;
    assert_eq!(body["cancelled"], false);
    assert_eq!(body["status"], "completed");

    let view = json_body(
        app.router
            .oneshot(get_request(&format!("/v1/opinion-maps/{session_id}")))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(view["status"], "completed");
}
