use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::analysis::MealAnalysis;

/// Analysis progress of a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftStatus {
    Pending,
    Processing,
    Ready,
    Error,
}

impl DraftStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DraftStatus::Pending => "pending",
            DraftStatus::Processing => "processing",
            DraftStatus::Ready => "ready",
            DraftStatus::Error => "error",
        }
    }
}

impl fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DraftStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DraftStatus::Pending),
            "processing" => Ok(DraftStatus::Processing),
            "ready" => Ok(DraftStatus::Ready),
            "error" => Ok(DraftStatus::Error),
            other => Err(format!("unknown draft status {other:?}")),
        }
    }
}

/// Meal-time bucket ("Breakfast", "Dinner", ...). Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MealSlot {
    pub id: String,
    pub name: String,
}

impl MealSlot {
    /// Trim both fields; a blank id becomes `unspecified`, a blank name falls
    /// back to the id and then to `Meal`.
    pub fn normalized(id: &str, name: &str) -> Self {
        let id = id.trim();
        let name = name.trim();
        let name = if !name.is_empty() {
            name
        } else if !id.is_empty() {
            id
        } else {
            "Meal"
        };
        Self {
            id: if id.is_empty() { "unspecified" } else { id }.to_string(),
            name: name.to_string(),
        }
    }
}

/// Reference to an uploaded image in the blob store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MealImage {
    pub storage_path: String,
    #[serde(rename = "downloadURL")]
    pub download_url: String,
    pub size: u64,
    pub content_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    MissingInput,
    MissingImage,
    StorageUnavailable,
    AnalysisFailed,
}

impl FailureCode {
    /// Whether retrying with the same input can succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureCode::StorageUnavailable | FailureCode::AnalysisFailed
        )
    }

    pub fn default_message(self) -> &'static str {
        match self {
            FailureCode::MissingInput => "Meal draft is missing details for analysis.",
            FailureCode::MissingImage => "Meal draft image could not be found.",
            FailureCode::StorageUnavailable => "Storage is temporarily unavailable. Try again soon.",
            FailureCode::AnalysisFailed => "We couldn't analyze this meal.",
        }
    }
}

/// Typed failure recorded on a draft in `error` status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFailure {
    pub code: FailureCode,
    pub message: String,
}

impl From<FailureCode> for AnalysisFailure {
    fn from(code: FailureCode) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
        }
    }
}

/// In-flight meal record. Only the store mutates status, payload and
/// timestamps.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MealDraft {
    pub id: Uuid,
    pub owner: Uuid,
    pub name: String,
    pub slot: MealSlot,
    pub image: Option<MealImage>,
    pub source_file_name: Option<String>,
    pub status: DraftStatus,
    pub analysis: Option<MealAnalysis>,
    pub error: Option<AnalysisFailure>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub analysis_started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub analysis_completed_at: Option<OffsetDateTime>,
    pub auto_promote_delay_minutes: i32,
}

impl MealDraft {
    /// Deadline after which a ready draft is promoted as estimated.
    pub fn auto_promote_at(&self) -> Option<OffsetDateTime> {
        if self.status != DraftStatus::Ready {
            return None;
        }
        self.analysis_completed_at
            .map(|done| done + Duration::minutes(i64::from(self.auto_promote_delay_minutes)))
    }

    /// `pending`/`processing` carry no payload, `ready` carries exactly an
    /// analysis, `error` carries exactly a failure.
    pub fn payload_matches_status(&self) -> bool {
        match self.status {
            DraftStatus::Pending | DraftStatus::Processing => {
                self.analysis.is_none() && self.error.is_none()
            }
            DraftStatus::Ready => self.analysis.is_some() && self.error.is_none(),
            DraftStatus::Error => self.analysis.is_none() && self.error.is_some(),
        }
    }
}

/// Client-supplied fields of a new draft, already normalized.
#[derive(Debug, Clone)]
pub struct NewMealDraft {
    pub name: String,
    pub slot: MealSlot,
    pub image: Option<MealImage>,
    pub source_file_name: Option<String>,
    pub auto_promote_delay_minutes: i32,
}
