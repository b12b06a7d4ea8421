use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::dto::{CreateDraftRequest, DraftResponse, PromoteResponse, RetryResponse, SlotInput};
use super::repo_types::{MealImage, MealSlot, NewMealDraft};
use crate::auth::AuthUser;
use crate::config::LifecycleConfig;
use crate::error::{ApiError, ApiResult};
use crate::images::services::{is_image_mime, owns_image, upload_meal_image, UploadItem};
use crate::state::AppState;
use crate::store::{RetryOutcome, StoreError};

/// Longest review window a client may ask for.
const MAX_AUTO_PROMOTE_MINUTES: i64 = 24 * 60;

pub fn router(cfg: &LifecycleConfig) -> Router<AppState> {
    Router::new()
        .route("/meal-drafts", get(list_drafts).post(create_draft))
        .route(
            "/meal-drafts/photo",
            post(create_draft_with_photo).layer(DefaultBodyLimit::max(cfg.max_upload_bytes)),
        )
        .route("/meal-drafts/:draft_id", get(get_draft))
        .route("/meal-drafts/:draft_id/retry", post(retry_draft))
        .route("/meal-drafts/:draft_id/promote", post(promote_draft))
}

type Created = (StatusCode, [(header::HeaderName, String); 1], Json<DraftResponse>);

#[instrument(skip(state))]
pub async fn list_drafts(
    State(state): State<AppState>,
    AuthUser(owner): AuthUser,
) -> ApiResult<Json<Vec<DraftResponse>>> {
    let drafts = state
        .lifecycle
        .drafts()
        .list_drafts(owner)
        .await
        .map_err(|e| ApiError::from_store(e, "Failed to list meal drafts"))?;
    Ok(Json(drafts.into_iter().map(DraftResponse::from).collect()))
}

#[instrument(skip(state))]
pub async fn get_draft(
    State(state): State<AppState>,
    AuthUser(owner): AuthUser,
    Path(draft_id): Path<String>,
) -> ApiResult<Json<DraftResponse>> {
    let draft_id = parse_draft_id(&draft_id)?;
    let draft = state
        .lifecycle
        .drafts()
        .get_draft(owner, draft_id)
        .await
        .map_err(|e| ApiError::from_store(e, "Failed to load meal draft"))?
        .ok_or(ApiError::DraftNotFound)?;
    Ok(Json(draft.into()))
}

/// POST /meal-drafts with an image already in storage (or none at all).
#[instrument(skip(state, body))]
pub async fn create_draft(
    State(state): State<AppState>,
    AuthUser(owner): AuthUser,
    Json(body): Json<CreateDraftRequest>,
) -> ApiResult<Created> {
    if let Some(image) = &body.image {
        if !owns_image(owner, image) {
            warn!(%owner, path = %image.storage_path, "draft references foreign image");
            return Err(ApiError::BadRequest("Image does not belong to this user".into()));
        }
    }

    let draft = new_draft(
        &state,
        body.name,
        body.slot,
        body.image,
        body.source_file_name,
        body.auto_promote_delay_minutes,
    );
    insert(&state, owner, draft).await
}

/// POST /meal-drafts/photo (multipart)
/// Fields: file (or image), name, slotId, slotName, autoPromoteDelayMinutes.
#[instrument(skip(state, mp))]
pub async fn create_draft_with_photo(
    State(state): State<AppState>,
    AuthUser(owner): AuthUser,
    mut mp: Multipart,
) -> ApiResult<Created> {
    let mut file: Option<(Bytes, String, Option<String>)> = None;
    let mut name = String::new();
    let mut slot = SlotInput::default();
    let mut delay = None;

    while let Some(field) = mp.next_field().await.map_err(bad_multipart)? {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "file" | "image" => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let file_name = field.file_name().map(str::to_string);
                let data = field.bytes().await.map_err(bad_multipart)?;
                file = Some((data, content_type, file_name));
            }
            "name" => name = field.text().await.map_err(bad_multipart)?,
            "slotId" => slot.id = field.text().await.map_err(bad_multipart)?,
            "slotName" => slot.name = field.text().await.map_err(bad_multipart)?,
            "autoPromoteDelayMinutes" => {
                let raw = field.text().await.map_err(bad_multipart)?;
                let minutes = raw.trim().parse::<i64>().map_err(|_| {
                    ApiError::BadRequest("autoPromoteDelayMinutes must be an integer".into())
                })?;
                delay = Some(minutes);
            }
            _ => {}
        }
    }

    let (body, content_type, file_name) =
        file.ok_or_else(|| ApiError::BadRequest("file is required".into()))?;
    if !is_image_mime(&content_type) {
        return Err(ApiError::BadRequest("Only image uploads are supported".into()));
    }
    if body.is_empty() {
        return Err(ApiError::BadRequest("file is empty".into()));
    }

    let image = upload_meal_image(
        state.storage.as_ref(),
        owner,
        UploadItem {
            body,
            content_type: &content_type,
        },
        state.config.storage.presign_ttl_secs,
    )
    .await
    .map_err(|e| ApiError::internal("Failed to upload meal image", e))?;

    let storage_path = image.storage_path.clone();
    let draft = new_draft(&state, name, slot, Some(image), file_name, delay);
    let created = insert(&state, owner, draft).await;
    if created.is_err() {
        if let Err(e) = state.storage.delete_object(&storage_path).await {
            warn!(error = %e, path = %storage_path, "failed to remove orphaned upload");
        }
    }
    created
}

#[instrument(skip(state))]
pub async fn retry_draft(
    State(state): State<AppState>,
    AuthUser(owner): AuthUser,
    Path(draft_id): Path<String>,
) -> ApiResult<Json<RetryResponse>> {
    let draft_id = parse_draft_id(&draft_id)?;
    let outcome = state
        .lifecycle
        .retry(owner, draft_id)
        .await
        .map_err(|e| ApiError::from_store(e, "Failed to retry meal draft"))?;

    let (retried, draft) = match outcome {
        RetryOutcome::Reset(d) => (true, d),
        RetryOutcome::Unchanged(d) => (false, d),
    };
    Ok(Json(RetryResponse {
        retried,
        draft: draft.into(),
    }))
}

/// POST /meal-drafts/{draftId}/promote  body: `{ "isEstimated"?: bool | "true" | "false" }`
#[instrument(skip(state, body))]
pub async fn promote_draft(
    State(state): State<AppState>,
    AuthUser(owner): AuthUser,
    Path(draft_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<PromoteResponse>> {
    let is_estimated = parse_promote_body(&body)
        .ok_or_else(|| ApiError::BadRequest("Invalid request body".into()))?;
    let draft_id = parse_draft_id(&draft_id)?;

    match state.lifecycle.promote(owner, draft_id, is_estimated).await {
        Ok(log) => {
            info!(%owner, %draft_id, log_id = %log.id, is_estimated, "meal draft promoted");
            Ok(Json(PromoteResponse {
                ok: true,
                log_id: log.id,
            }))
        }
        Err(e) => {
            if matches!(e, StoreError::DraftNotFound | StoreError::DraftNotReady) {
                warn!(%owner, %draft_id, reason = %e, "promotion refused");
            }
            Err(ApiError::from_store(e, "Failed to promote meal draft"))
        }
    }
}

// --- helpers ---

fn new_draft(
    state: &AppState,
    name: String,
    slot: SlotInput,
    image: Option<MealImage>,
    source_file_name: Option<String>,
    delay: Option<i64>,
) -> NewMealDraft {
    let minutes = delay
        .unwrap_or(i64::from(state.config.lifecycle.default_auto_promote_minutes))
        .clamp(1, MAX_AUTO_PROMOTE_MINUTES);
    NewMealDraft {
        name: name.trim().to_string(),
        slot: MealSlot::normalized(&slot.id, &slot.name),
        image,
        source_file_name: source_file_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        // clamped above, always fits
        auto_promote_delay_minutes: i32::try_from(minutes).unwrap_or(1),
    }
}

async fn insert(state: &AppState, owner: Uuid, draft: NewMealDraft) -> ApiResult<Created> {
    let draft = state
        .lifecycle
        .create_draft(owner, draft)
        .await
        .map_err(|e| ApiError::from_store(e, "Failed to create meal draft"))?;
    let location = format!("/meal-drafts/{}", draft.id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(draft.into()),
    ))
}

/// Ids that cannot name a draft are reported the same way as missing ones.
fn parse_draft_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::DraftNotFound)
}

/// An absent or blank body means "estimated"; anything else must be a JSON
/// object, where `isEstimated` is read leniently.
fn parse_promote_body(body: &[u8]) -> Option<bool> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Some(true);
    }
    match serde_json::from_slice::<Value>(body).ok()? {
        Value::Object(map) => Some(parse_boolean(map.get("isEstimated"), true)),
        _ => None,
    }
}

fn parse_boolean(value: Option<&Value>, fallback: bool) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => true,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => false,
        _ => fallback,
    }
}

fn bad_multipart(e: MultipartError) -> ApiError {
    ApiError::BadRequest(format!("Invalid multipart body: {}", e))
}
