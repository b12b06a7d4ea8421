//! Draft Store and Log Store.
//!
//! Every call is scoped to one owner; a record belonging to another owner is
//! indistinguishable from a missing one. Status transitions are conditional
//! writes: they only apply when the draft is still in the expected state and
//! report `None` otherwise.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::analysis::MealAnalysis;
use crate::drafts::repo_types::{AnalysisFailure, DraftStatus, MealDraft, NewMealDraft};
use crate::logs::repo_types::{MealLog, NewMealLog};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("draft not found")]
    DraftNotFound,

    #[error("draft is not ready for promotion")]
    DraftNotReady,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Result of asking to re-run analysis on a draft.
#[derive(Debug, Clone)]
pub enum RetryOutcome {
    /// The draft was in `error` and is `pending` again.
    Reset(MealDraft),
    /// The draft was not in `error`; nothing changed.
    Unchanged(MealDraft),
}

#[async_trait]
pub trait DraftStore: Send + Sync {
    async fn insert_draft(&self, owner: Uuid, draft: NewMealDraft)
        -> Result<MealDraft, StoreError>;

    async fn get_draft(&self, owner: Uuid, id: Uuid) -> Result<Option<MealDraft>, StoreError>;

    /// Newest first.
    async fn list_drafts(&self, owner: Uuid) -> Result<Vec<MealDraft>, StoreError>;

    /// Drafts of every owner in `status`, oldest first. Used by the
    /// lifecycle worker's sweeps only.
    async fn list_drafts_by_status(
        &self,
        status: DraftStatus,
        limit: i64,
    ) -> Result<Vec<MealDraft>, StoreError>;

    /// `pending -> processing`, stamping `analysis_started_at`. Returns the
    /// updated draft only to the caller that performed the transition.
    async fn begin_analysis(&self, owner: Uuid, id: Uuid) -> Result<Option<MealDraft>, StoreError>;

    /// `processing -> ready`.
    async fn complete_analysis(
        &self,
        owner: Uuid,
        id: Uuid,
        analysis: &MealAnalysis,
    ) -> Result<Option<MealDraft>, StoreError>;

    /// `processing -> error`.
    async fn fail_analysis(
        &self,
        owner: Uuid,
        id: Uuid,
        failure: &AnalysisFailure,
    ) -> Result<Option<MealDraft>, StoreError>;

    /// `processing -> error` for every draft whose analysis started at or
    /// before `started_before`, oldest claim first. Such a run died or hung
    /// without recording an outcome.
    async fn expire_processing(
        &self,
        started_before: OffsetDateTime,
        failure: &AnalysisFailure,
        limit: i64,
    ) -> Result<Vec<MealDraft>, StoreError>;

    /// `error -> pending`, clearing payload and analysis timestamps.
    /// Fails with `DraftNotFound` when the draft does not exist.
    async fn reset_for_retry(&self, owner: Uuid, id: Uuid) -> Result<RetryOutcome, StoreError>;

    /// Atomically turn a `ready` draft into a log entry and delete the draft.
    async fn promote(
        &self,
        owner: Uuid,
        id: Uuid,
        is_estimated: bool,
    ) -> Result<MealLog, StoreError>;
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn insert_log(&self, owner: Uuid, log: NewMealLog) -> Result<MealLog, StoreError>;

    async fn get_log(&self, owner: Uuid, id: Uuid) -> Result<Option<MealLog>, StoreError>;

    /// Newest first.
    async fn list_logs(
        &self,
        owner: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MealLog>, StoreError>;
}
