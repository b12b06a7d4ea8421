use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::analysis::MealAnalysis;
use crate::drafts::repo_types::{MealImage, MealSlot};

/// Permanent meal record. Never updated after insert.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MealLog {
    pub id: Uuid,
    pub owner: Uuid,
    pub name: String,
    pub slot: MealSlot,
    pub image: Option<MealImage>,
    pub source_file_name: Option<String>,
    pub analysis: Option<MealAnalysis>,
    pub is_estimated: bool,
    pub source_draft_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub promoted_at: OffsetDateTime,
}

/// A log entry written without a draft stage.
#[derive(Debug, Clone)]
pub struct NewMealLog {
    pub name: String,
    pub slot: MealSlot,
    pub image: Option<MealImage>,
    pub source_file_name: Option<String>,
}
