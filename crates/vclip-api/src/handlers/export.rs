//! Export control-plane handlers (§6): `POST /export/start`,
//! `GET /export/status/{id}`, `GET /export/queue`, `DELETE /export/cancel/{id}`.
//! The fifth endpoint in §6, `/export/progress/{id}`, is the websocket
//! upgrade in `crate::ws`.

use axum::extract::{Path, State};
use axum::Json;

use vclip_models::{ExportRequest, ExportStartResponse, JobId, RenderJob};

use crate::error::ApiResult;
use crate::state::AppState;

/// `POST /export/start` (§6).
pub async fn start_export(
    State(state): State<AppState>,
    Json(request): Json<ExportRequest>,
) -> ApiResult<Json<ExportStartResponse>> {
    Ok(Json(state.orchestrator.start(request).await?))
}

/// `GET /export/status/{id}` (§6).
pub async fn export_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RenderJob>> {
    let job = state.orchestrator.status(&JobId::from(id)).await?;
    Ok(Json(job))
}

/// `GET /export/queue` (§6): every job still in flight.
pub async fn export_queue(State(state): State<AppState>) -> Json<Vec<RenderJob>> {
    Json(state.orchestrator.list_active().await)
}

/// `DELETE /export/cancel/{id}` (§6).
pub async fn cancel_export(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RenderJob>> {
    let job = state.orchestrator.cancel(&JobId::from(id)).await?;
    Ok(Json(job))
}
