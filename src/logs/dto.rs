use serde::Deserialize;

use crate::drafts::dto::SlotInput;
use crate::drafts::repo_types::MealImage;

/// POST /meal-logs: a meal logged directly, without analysis.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLogRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slot: SlotInput,
    pub image: Option<MealImage>,
    pub source_file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

impl Pagination {
    pub const MAX_LIMIT: i64 = 100;

    pub fn clamped(&self) -> (i64, i64) {
        (self.limit.clamp(1, Self::MAX_LIMIT), self.offset.max(0))
    }
}
