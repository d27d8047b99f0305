use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::server::AppState;
use crate::server::response::{ApiError, ApiResponse, StoreOptionExt, StoreResultExt};
use crate::types::{DispatchMessage, ScheduleRequest};

pub async fn list_flag_schedules(
    State(state): State<Arc<AppState>>,
    Path(flag_id): Path<String>,
) -> impl IntoResponse {
    state
        .store
        .get_flag(&flag_id)
        .api_err("Failed to get flag")?
        .or_not_found("Flag not found")?;

    let schedules = state.schedules.list_for_flag(&flag_id)?;

    Ok::<_, ApiError>(Json(ApiResponse::success(schedules)))
}

pub async fn create_schedule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScheduleRequest>,
) -> impl IntoResponse {
    let schedule = state.schedules.create(req).await?;

    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(schedule))))
}

pub async fn update_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ScheduleRequest>,
) -> impl IntoResponse {
    let schedule = state.schedules.update(&id, req).await?;

    Ok::<_, ApiError>(Json(ApiResponse::success(schedule)))
}

pub async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state.schedules.delete(&id).await?;

    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

/// Push delivery of a dispatched message. A non-2xx response tells the
/// delivering service to retry.
pub async fn execute_message(
    State(state): State<Arc<AppState>>,
    Json(message): Json<DispatchMessage>,
) -> impl IntoResponse {
    let outcome = state.worker.process(&message).await?;

    Ok::<_, ApiError>(Json(ApiResponse::success(outcome)))
}
