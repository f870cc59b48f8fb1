use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
};
use uuid::Uuid;

use crate::{
    api::caller_id, app::AppState, error::OpinionMapError, pipeline::CancelResponse,
};

pub(crate) async fn cancel_map(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, OpinionMapError> {
    let caller = caller_id(&headers)?;
    let response = state.service().cancel(&caller, session_id).await?;
    Ok(Json(response))
}
