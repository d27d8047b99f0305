use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::cache::invalidate_quietly;
use crate::cascade::CascadeReport;
use crate::server::AppState;
use crate::server::dto::{
    CreateFlagRequest, FlagLookupParams, ListFlagsParams, UpdateFlagRequest,
};
use crate::server::response::{ApiError, ApiResponse, StoreOptionExt, StoreResultExt};
use crate::server::validation::{
    validate_flag_key, validate_flag_name, validate_rollout_percentage, validate_variants,
};
use crate::types::{Flag, FlagStatus};

#[derive(Debug, Serialize)]
pub struct FlagUpdateResponse {
    pub flag: Flag,
    pub cascade: CascadeReport,
}

fn load_live_flag(state: &AppState, id: &str) -> Result<Flag, ApiError> {
    let flag = state
        .store
        .get_flag(id)
        .api_err("Failed to get flag")?
        .or_not_found("Flag not found")?;

    if flag.is_archived() {
        return Err(ApiError::not_found("Flag not found"));
    }
    Ok(flag)
}

pub async fn list_flags(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListFlagsParams>,
) -> impl IntoResponse {
    let scope = params.scope()?;

    let flags = match state.cache.get_list(&scope, params.status) {
        Some(flags) => flags,
        None => {
            let flags = state
                .store
                .list_flags(&scope, params.status)
                .api_err("Failed to list flags")?;
            state.cache.put_list(&scope, params.status, flags.clone());
            flags
        }
    };

    Ok::<_, ApiError>(Json(ApiResponse::success(flags)))
}

pub async fn create_flag(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateFlagRequest>,
) -> impl IntoResponse {
    let scope = req.scope.scope()?;
    validate_flag_key(&req.key)?;
    if let Some(name) = &req.name {
        validate_flag_name(name)?;
    }
    validate_rollout_percentage(req.rollout_percentage)?;
    validate_variants(&req.variants)?;

    let now = Utc::now();
    let flag = Flag {
        id: Uuid::new_v4().to_string(),
        key: req.key,
        name: req.name,
        description: req.description,
        flag_type: req.flag_type,
        status: req.status,
        default_value: req.default_value,
        rollout_percentage: req.rollout_percentage,
        rollout_by: req.rollout_by,
        rules: req.rules,
        variants: req.variants,
        dependencies: req.dependencies,
        scope,
        environment: req.environment,
        created_at: now,
        updated_at: now,
    };

    state.store.create_flag(&flag).api_err("Failed to create flag")?;
    invalidate_quietly(state.cache.as_ref(), &flag).await;

    info!(flag_id = %flag.id, key = %flag.key, scope = %flag.scope, "Flag created");

    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(flag))))
}

pub async fn get_flag(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<FlagLookupParams>,
) -> impl IntoResponse {
    let scope = params.scope()?;

    if let Some(flag) = scope
        .as_ref()
        .and_then(|scope| state.cache.get_flag(&id, scope))
    {
        return Ok(Json(ApiResponse::success(flag)));
    }

    let flag = state
        .store
        .get_flag(&id)
        .api_err("Failed to get flag")?
        .or_not_found("Flag not found")?;

    if let Some(scope) = scope {
        if flag.scope != scope {
            return Err(ApiError::not_found("Flag not found"));
        }
        state.cache.put_flag(&flag);
    }

    Ok::<_, ApiError>(Json(ApiResponse::success(flag)))
}

/// Operator update. A status change to active or inactive cascades to dependents.
/// A flag changed since it was read, by a schedule or a cascade, is a 409.
pub async fn update_flag(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateFlagRequest>,
) -> impl IntoResponse {
    let mut flag = load_live_flag(&state, &id)?;
    let previous_status = flag.status;
    let read_at = flag.updated_at;

    if let Some(name) = req.name {
        validate_flag_name(&name)?;
        flag.name = Some(name);
    }
    if let Some(description) = req.description {
        flag.description = Some(description);
    }
    if let Some(flag_type) = req.flag_type {
        flag.flag_type = flag_type;
    }
    if let Some(status) = req.status {
        flag.status = status;
    }
    if let Some(default_value) = req.default_value {
        flag.default_value = default_value;
    }
    if let Some(percentage) = req.rollout_percentage {
        validate_rollout_percentage(percentage)?;
        flag.rollout_percentage = percentage;
    }
    if let Some(rollout_by) = req.rollout_by {
        flag.rollout_by = Some(rollout_by);
    }
    if let Some(rules) = req.rules {
        flag.rules = rules;
    }
    if let Some(variants) = req.variants {
        validate_variants(&variants)?;
        flag.variants = variants;
    }
    if let Some(dependencies) = req.dependencies {
        flag.dependencies = dependencies;
    }
    if let Some(environment) = req.environment {
        flag.environment = Some(environment);
    }
    flag.updated_at = Utc::now();

    state
        .store
        .update_flag(&flag, read_at)
        .api_err("Failed to update flag")?;
    invalidate_quietly(state.cache.as_ref(), &flag).await;

    info!(flag_id = %flag.id, status = %flag.status, "Flag updated");

    let cascade = if flag.status != previous_status
        && matches!(flag.status, FlagStatus::Active | FlagStatus::Inactive)
    {
        state.cascade.cascade(&flag, flag.status).await?
    } else {
        CascadeReport::default()
    };

    Ok::<_, ApiError>(Json(ApiResponse::success(FlagUpdateResponse { flag, cascade })))
}

/// Archives the flag and disarms its pending schedules. Archiving never cascades.
pub async fn delete_flag(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let mut flag = load_live_flag(&state, &id)?;

    for schedule in state.schedules.list_for_flag(&flag.id)? {
        if schedule.is_enabled {
            state.schedules.delete(&schedule.id).await?;
        }
    }

    let read_at = flag.updated_at;
    flag.status = FlagStatus::Archived;
    flag.updated_at = Utc::now();
    state
        .store
        .update_flag(&flag, read_at)
        .api_err("Failed to archive flag")?;
    invalidate_quietly(state.cache.as_ref(), &flag).await;

    info!(flag_id = %flag.id, "Flag archived");

    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}
