use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    routing::get,
    Json, Router,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::dto::{CreateLogRequest, Pagination};
use super::repo_types::{MealLog, NewMealLog};
use crate::auth::AuthUser;
use crate::drafts::repo_types::MealSlot;
use crate::error::{ApiError, ApiResult};
use crate::images::services::owns_image;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/meal-logs", get(list_logs).post(create_log))
        .route("/meal-logs/:log_id", get(get_log))
}

#[instrument(skip(state))]
pub async fn list_logs(
    State(state): State<AppState>,
    AuthUser(owner): AuthUser,
    Query(p): Query<Pagination>,
) -> ApiResult<Json<Vec<MealLog>>> {
    let (limit, offset) = p.clamped();
    let logs = state
        .logs
        .list_logs(owner, limit, offset)
        .await
        .map_err(|e| ApiError::internal("Failed to list meal logs", e))?;
    Ok(Json(logs))
}

#[instrument(skip(state))]
pub async fn get_log(
    State(state): State<AppState>,
    AuthUser(owner): AuthUser,
    Path(log_id): Path<String>,
) -> ApiResult<Json<MealLog>> {
    let log_id = Uuid::parse_str(log_id.trim()).map_err(|_| ApiError::NotFound("Meal log"))?;
    state
        .logs
        .get_log(owner, log_id)
        .await
        .map_err(|e| ApiError::internal("Failed to load meal log", e))?
        .map(Json)
        .ok_or(ApiError::NotFound("Meal log"))
}

/// POST /meal-logs. The entry carries no analysis and is never estimated.
#[instrument(skip(state, body))]
pub async fn create_log(
    State(state): State<AppState>,
    AuthUser(owner): AuthUser,
    Json(body): Json<CreateLogRequest>,
) -> ApiResult<(StatusCode, [(header::HeaderName, String); 1], Json<MealLog>)> {
    let name = body.name.trim().to_string();
    if name.is_empty() && body.image.is_none() {
        return Err(ApiError::BadRequest("name or image is required".into()));
    }
    if let Some(image) = &body.image {
        if !owns_image(owner, image) {
            warn!(%owner, path = %image.storage_path, "log references foreign image");
            return Err(ApiError::BadRequest("Image does not belong to this user".into()));
        }
    }

    let log = state
        .logs
        .insert_log(
            owner,
            NewMealLog {
                name,
                slot: MealSlot::normalized(&body.slot.id, &body.slot.name),
                image: body.image,
                source_file_name: body
                    .source_file_name
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
            },
        )
        .await
        .map_err(|e| ApiError::internal("Failed to create meal log", e))?;

    info!(%owner, log_id = %log.id, "meal logged directly");
    let location = format!("/meal-logs/{}", log.id);
    Ok((StatusCode::CREATED, [(header::LOCATION, location)], Json(log)))
}
