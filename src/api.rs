pub(crate) mod cancel;
pub(crate) mod health;
pub(crate) mod metrics;
pub(crate) mod sessions;
pub(crate) mod start;
pub(crate) mod worker;

use axum::{
    Router,
    http::HeaderMap,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::{app::AppState, error::OpinionMapError};

/// Gateway-injected caller identity.
pub(crate) const CALLER_ID_HEADER: &str = "x-caller-id";

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/ready", get(health::ready))
        .route("/health/live", get(health::live))
        .route("/metrics", get(metrics::exporter))
        .route("/v1/opinion-maps", post(start::start_map))
        .route("/v1/opinion-maps/{session_id}", get(sessions::get_session))
        .route(
            "/v1/opinion-maps/{session_id}/cancel",
            post(cancel::cancel_map),
        )
        .route(
            "/v1/opinion-maps/{session_id}/clusters",
            get(sessions::get_clusters),
        )
        .route(
            "/v1/opinion-maps/{session_id}/projections",
            get(sessions::get_projections),
        )
        .route("/internal/worker/opinion-map", post(worker::run_worker))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub(crate) fn caller_id(headers: &HeaderMap) -> Result<String, OpinionMapError> {
    headers
        .get(CALLER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .ok_or(OpinionMapError::Unauthenticated)
}
