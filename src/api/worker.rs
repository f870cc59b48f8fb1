use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, header::AUTHORIZATION},
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    app::{AppState, WorkerAuth},
    error::OpinionMapError,
    pipeline::WorkerOutcome,
};

type HmacSha256 = Hmac<Sha256>;

pub(crate) const SIGNATURE_HEADER: &str = "x-scheduler-signature";

#[derive(Debug, Deserialize)]
struct WorkerRequest {
    session_id: Uuid,
}

#[derive(Debug, Serialize)]
pub(crate) struct WorkerResponse {
    session_id: Uuid,
    outcome: WorkerOutcome,
}

/// スケジューラからのコールバック。認証後は常に 200 で結果を返す。
pub(crate) async fn run_worker(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WorkerResponse>, OpinionMapError> {
    if !authenticate(state.worker_auth(), &headers, &body) {
        warn!("rejected worker callback with invalid credentials");
        return Err(OpinionMapError::Unauthenticated);
    }
    let request: WorkerRequest = serde_json::from_slice(&body)
        .map_err(|error| OpinionMapError::Validation(format!("invalid worker payload: {error}")))?;

    let Ok(_slot) = state.worker_slots().acquire_owned().await else {
        return Err(OpinionMapError::Pipeline(anyhow::anyhow!(
            "worker slots closed"
        )));
    };
    let outcome = state.worker().run(request.session_id).await;
    info!(session_id = %request.session_id, ?outcome, "worker invocation finished");

    Ok(Json(WorkerResponse {
        session_id: request.session_id,
        outcome,
    }))
}

/// Signature over the raw body, or the shared bearer secret. Nothing is
/// accepted when neither credential is configured.
pub(crate) fn authenticate(auth: &WorkerAuth, headers: &HeaderMap, body: &[u8]) -> bool {
    if let (Some(key), Some(signature)) = (
        auth.signing_key.as_deref(),
        headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()),
    ) {
        if verify_signature(key, signature, body) {
            return true;
        }
    }

    if let (Some(secret), Some(token)) = (
        auth.shared_secret.as_deref(),
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer ")),
    ) {
        return constant_time_eq(secret.as_bytes(), token.trim().as_bytes());
    }
    false
}

fn verify_signature(key: &str, signature: &str, body: &[u8]) -> bool {
    let signature = signature.trim();
    let hex_digest = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0_u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
pub(crate) fn sign(key: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::api::{
        router,
        test_support::{RecordingDispatcher, harness, json_body, json_request},
    };
    use crate::store::SessionStore;

    fn auth() -> WorkerAuth {
        WorkerAuth {
            signing_key: Some("signing-key".into()),
            shared_secret: Some("worker-secret".into()),
        }
    }

    #[test]
    fn accepts_signature_or_bearer() {
        let body = br#"{"session_id":"00000000-0000-0000-0000-000000000000"}"#;

        let mut signed = HeaderMap::new();
        signed.insert(SIGNATURE_HEADER, sign("signing-key", body).parse().unwrap());
        assert!(authenticate(&auth(), &signed, body));

        let mut prefixed = HeaderMap::new();
        prefixed.insert(
            SIGNATURE_HEADER,
            format!("sha256={}", sign("signing-key", body)).parse().unwrap(),
        );
        assert!(authenticate(&auth(), &prefixed, body));

        let mut bearer = HeaderMap::new();
        bearer.insert(AUTHORIZATION, "Bearer worker-secret".parse().unwrap());
        assert!(authenticate(&auth(), &bearer, body));
    }

    #[test]
    fn rejects_tampered_or_missing_credentials() {
        let body = br#"{"session_id":"00000000-0000-0000-0000-000000000000"}"#;

        let mut tampered = HeaderMap::new();
        tampered.insert(SIGNATURE_HEADER, sign("signing-key", b"other").parse().unwrap());
        assert!(!authenticate(&auth(), &tampered, body));

        let mut wrong = HeaderMap::new();
        wrong.insert(AUTHORIZATION, "Bearer nope".parse().unwrap());
        assert!(!authenticate(&auth(), &wrong, body));

        assert!(!authenticate(&auth(), &HeaderMap::new(), body));

        let mut bearer = HeaderMap::new();
        bearer.insert(AUTHORIZATION, "Bearer worker-secret".parse().unwrap());
        assert!(!authenticate(&WorkerAuth::default(), &bearer, body));
    }

    #[tokio::test]
    async fn callback_runs_pipeline_to_completion() {
        let h = harness(80, RecordingDispatcher::default());
        let app = router(h.state.clone());
        let started = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/opinion-maps",
                &json!({
                    "zone_id": h.zone_id,
                    "start_date": "2020-01-01",
                    "end_date": chrono::Utc::now().format("%Y-%m-%d").to_string(),
                    "sample_size": 60
                }),
            ))
            .await
            .unwrap();
        let session_id: Uuid = json_body(started).await["session_id"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();
        let payload = json!({ "session_id": session_id }).to_string();

        let response = app
            .clone()
            .oneshot(
                Request::post("/internal/worker/opinion-map")
                    .header(SIGNATURE_HEADER, sign("signing-key", payload.as_bytes()))
                    .body(Body::from(payload.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(json_body(response).await["outcome"], "completed");

        let session = h.store.find_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.progress, 100);

        let again = app
            .oneshot(
                Request::post("/internal/worker/opinion-map")
                    .header("authorization", "Bearer worker-secret")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json_body(again).await["outcome"], "skipped");
    }

    #[tokio::test]
    async fn unauthenticated_callback_is_401() {
        let h = harness(0, RecordingDispatcher::default());

        let response = router(h.state)
            .oneshot(
                Request::post("/internal/worker/opinion-map")
                    .body(Body::from(json!({ "session_id": Uuid::new_v4() }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 401);
    }

    #[tokio::test]
    async fn unknown_session_reports_not_found_outcome() {
        let h = harness(0, RecordingDispatcher::default());

        let response = router(h.state)
            .oneshot(
                Request::post("/internal/worker/opinion-map")
                    .header("authorization", "Bearer worker-secret")
                    .body(Body::from(json!({ "session_id": Uuid::new_v4() }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(json_body(response).await["outcome"], "not_found");
    }
}
