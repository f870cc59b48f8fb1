use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};

use crate::{api::caller_id, app::AppState, error::OpinionMapError, pipeline::StartRequest};

/// 新規作成は 202、既存のアクティブセッション再利用は 200 を返す。
pub(crate) async fn start_map(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> Result<impl IntoResponse, OpinionMapError> {
    let caller = caller_id(&headers)?;
    let Json(request) =
        payload.map_err(|rejection| OpinionMapError::Validation(rejection.body_text()))?;

    let response = state.service().start(&caller, request).await?;
    let status = if response.reused_active_session {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(response)))
}
