//! Error taxonomy surfaced at the service boundary.
//!
//! Pipeline internals use `anyhow::Result`; handlers and the session
//! service convert into [`OpinionMapError`], which owns the HTTP mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OpinionMapError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("caller identity missing")]
    Unauthenticated,
    #[error("caller may not access zone {zone_id}")]
    Forbidden { zone_id: Uuid },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("no posts in the requested range")]
    NoData { total_available: usize },
    #[error("found {found} posts, at least {minimum} are required")]
    InsufficientData { found: usize, minimum: usize },
    #[error("{provider} provider failed: {source}")]
    ExternalService {
        provider: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to schedule worker for session {session_id}: {source}")]
    Scheduling {
        session_id: Uuid,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Pipeline(#[from] anyhow::Error),
}

impl OpinionMapError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable identifier used in error bodies and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden { .. } => "forbidden",
            Self::NotFound { .. } => "not_found",
            Self::NoData { .. } => "no_data",
            Self::InsufficientData { .. } => "insufficient_data",
            Self::ExternalService { .. } => "external_service_error",
            Self::Scheduling { .. } => "scheduling_error",
            Self::Pipeline(_) => "pipeline_error",
        }
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InsufficientData { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::NotFound { .. } | Self::NoData { .. } => StatusCode::NOT_FOUND,
            Self::ExternalService { .. } => StatusCode::BAD_GATEWAY,
            Self::Scheduling { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Pipeline(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> Value {
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        match self {
            Self::NoData { total_available } => {
                body["total_available"] = json!(total_available);
            }
            Self::InsufficientData { found, minimum } => {
                body["found"] = json!(found);
                body["minimum"] = json!(minimum);
            }
            Self::Scheduling { session_id, .. } => {
                body["session_id"] = json!(session_id);
            }
            // 内部エラーの詳細はログにのみ残す
            Self::Pipeline(_) => {
                body["message"] = json!("internal pipeline error");
            }
            _ => {}
        }
        body
    }
}

impl IntoResponse for OpinionMapError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = ?self, kind = self.kind(), "request failed");
        } else {
            tracing::debug!(error = %self, kind = self.kind(), "request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(OpinionMapError::Validation("bad".into()), StatusCode::BAD_REQUEST)]
    #[case(OpinionMapError::Unauthenticated, StatusCode::UNAUTHORIZED)]
    #[case(OpinionMapError::Forbidden { zone_id: Uuid::nil() }, StatusCode::FORBIDDEN)]
    #[case(OpinionMapError::not_found("session", "x"), StatusCode::NOT_FOUND)]
    #[case(OpinionMapError::NoData { total_available: 0 }, StatusCode::NOT_FOUND)]
    #[case(OpinionMapError::InsufficientData { found: 9, minimum: 10 }, StatusCode::BAD_REQUEST)]
    #[case(
        OpinionMapError::ExternalService { provider: "embedding", source: anyhow::anyhow!("down") },
        StatusCode::BAD_GATEWAY
    )]
    #[case(
        OpinionMapError::Scheduling { session_id: Uuid::nil(), source: anyhow::anyhow!("queue") },
        StatusCode::SERVICE_UNAVAILABLE
    )]
    #[case(OpinionMapError::Pipeline(anyhow::anyhow!("boom")), StatusCode::INTERNAL_SERVER_ERROR)]
    fn maps_to_status(#[case] error: OpinionMapError, #[case] expected: StatusCode) {
        assert_eq!(error.status_code(), expected);
    }

    #[test]
    fn insufficient_data_body_carries_counts() {
        let body = OpinionMapError::InsufficientData {
            found: 9,
            minimum: 10,
        }
        .body();

        assert_eq!(body["error"], "insufficient_data");
        assert_eq!(body["found"], 9);
        assert_eq!(body["minimum"], 10);
    }

    #[test]
    fn no_data_body_carries_total() {
        let body = OpinionMapError::NoData { total_available: 0 }.body();

        assert_eq!(body["error"], "no_data");
        assert_eq!(body["total_available"], 0);
    }

    #[test]
    fn pipeline_body_hides_internal_detail() {
        let body = OpinionMapError::Pipeline(anyhow::anyhow!("password=hunter2")).body();

        assert_eq!(body["message"], "internal pipeline error");
    }
}
