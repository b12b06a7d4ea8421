use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::repo_types::{MealDraft, MealImage};

#[derive(Debug, Default, Deserialize)]
pub struct SlotInput {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// POST /meal-drafts
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDraftRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slot: SlotInput,
    pub image: Option<MealImage>,
    pub source_file_name: Option<String>,
    pub auto_promote_delay_minutes: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftResponse {
    #[serde(flatten)]
    pub draft: MealDraft,
    #[serde(with = "time::serde::rfc3339::option")]
    pub auto_promote_at: Option<OffsetDateTime>,
    /// Only set for drafts in `error`: whether a retry can help.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl From<MealDraft> for DraftResponse {
    fn from(draft: MealDraft) -> Self {
        Self {
            auto_promote_at: draft.auto_promote_at(),
            retryable: draft.error.as_ref().map(|e| e.code.is_retryable()),
            draft,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub retried: bool,
    pub draft: DraftResponse,
}

#[derive(Debug, Serialize)]
pub struct PromoteResponse {
    pub ok: bool,
    #[serde(rename = "logId")]
    pub log_id: Uuid,
}
