use anyhow::Context;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, types::Json, FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{DraftStore, LogStore, RetryOutcome, StoreError};
use crate::analysis::MealAnalysis;
use crate::drafts::repo_types::{
    AnalysisFailure, DraftStatus, MealDraft, MealImage, MealSlot, NewMealDraft,
};
use crate::logs::repo_types::{MealLog, NewMealLog};

const DRAFT_COLUMNS: &str = "id, owner_id, name, slot_id, slot_name, image, source_file_name, \
     status, analysis, error, created_at, updated_at, analysis_started_at, \
     analysis_completed_at, auto_promote_delay_minutes";

const LOG_COLUMNS: &str = "id, owner_id, name, slot_id, slot_name, image, source_file_name, \
     analysis, is_estimated, source_draft_id, created_at, updated_at, promoted_at";

#[derive(Debug, FromRow)]
struct DraftRow {
    id: Uuid,
    owner_id: Uuid,
    name: String,
    slot_id: String,
    slot_name: String,
    image: Option<Json<MealImage>>,
    source_file_name: Option<String>,
    status: String,
    analysis: Option<Json<MealAnalysis>>,
    error: Option<Json<AnalysisFailure>>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    analysis_started_at: Option<OffsetDateTime>,
    analysis_completed_at: Option<OffsetDateTime>,
    auto_promote_delay_minutes: i32,
}

impl TryFrom<DraftRow> for MealDraft {
    type Error = StoreError;

    fn try_from(r: DraftRow) -> Result<Self, Self::Error> {
        let status = r
            .status
            .parse::<DraftStatus>()
            .map_err(|e| StoreError::Corrupt(format!("meal_drafts {}: {}", r.id, e)))?;
        let draft = Self {
            id: r.id,
            owner: r.owner_id,
            name: r.name,
            slot: MealSlot {
                id: r.slot_id,
                name: r.slot_name,
            },
            image: r.image.map(|Json(i)| i),
            source_file_name: r.source_file_name,
            status,
            analysis: r.analysis.map(|Json(a)| a),
            error: r.error.map(|Json(e)| e),
            created_at: r.created_at,
            updated_at: r.updated_at,
            analysis_started_at: r.analysis_started_at,
            analysis_completed_at: r.analysis_completed_at,
            auto_promote_delay_minutes: r.auto_promote_delay_minutes,
        };
        if !draft.payload_matches_status() {
            return Err(StoreError::Corrupt(format!(
                "meal_drafts {}: payload does not match status {}",
                draft.id, draft.status
            )));
        }
        Ok(draft)
    }
}

#[derive(Debug, FromRow)]
struct LogRow {
    id: Uuid,
    owner_id: Uuid,
    name: String,
    slot_id: String,
    slot_name: String,
    image: Option<Json<MealImage>>,
    source_file_name: Option<String>,
    analysis: Option<Json<MealAnalysis>>,
    is_estimated: bool,
    source_draft_id: Option<Uuid>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    promoted_at: OffsetDateTime,
}

impl From<LogRow> for MealLog {
    fn from(r: LogRow) -> Self {
        Self {
            id: r.id,
            owner: r.owner_id,
            name: r.name,
            slot: MealSlot {
                id: r.slot_id,
                name: r.slot_name,
            },
            image: r.image.map(|Json(i)| i),
            source_file_name: r.source_file_name,
            analysis: r.analysis.map(|Json(a)| a),
            is_estimated: r.is_estimated,
            source_draft_id: r.source_draft_id,
            created_at: r.created_at,
            updated_at: r.updated_at,
            promoted_at: r.promoted_at,
        }
    }
}

fn into_draft(row: Option<DraftRow>) -> Result<Option<MealDraft>, StoreError> {
    row.map(MealDraft::try_from).transpose()
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connect to database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("run migrations")?;

        Ok(Self::from_pool(pool))
    }

    /// Wrap an already migrated pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DraftStore for PgStore {
    async fn insert_draft(
        &self,
        owner: Uuid,
        draft: NewMealDraft,
    ) -> Result<MealDraft, StoreError> {
        let query = format!(
            "INSERT INTO meal_drafts \
                 (id, owner_id, name, slot_id, slot_name, image, source_file_name, \
                  status, auto_promote_delay_minutes) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8) \
             RETURNING {DRAFT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DraftRow>(&query)
            .bind(Uuid::new_v4())
            .bind(owner)
            .bind(&draft.name)
            .bind(&draft.slot.id)
            .bind(&draft.slot.name)
            .bind(draft.image.map(Json))
            .bind(&draft.source_file_name)
            .bind(draft.auto_promote_delay_minutes.max(1))
            .fetch_one(&self.pool)
            .await?;
        MealDraft::try_from(row)
    }

    async fn get_draft(&self, owner: Uuid, id: Uuid) -> Result<Option<MealDraft>, StoreError> {
        let query = format!("SELECT {DRAFT_COLUMNS} FROM meal_drafts WHERE id = $1 AND owner_id = $2");
        let row = sqlx::query_as::<_, DraftRow>(&query)
            .bind(id)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        into_draft(row)
    }

    async fn list_drafts(&self, owner: Uuid) -> Result<Vec<MealDraft>, StoreError> {
        let query = format!(
            "SELECT {DRAFT_COLUMNS} FROM meal_drafts WHERE owner_id = $1 ORDER BY created_at DESC"
        );
        sqlx::query_as::<_, DraftRow>(&query)
            .bind(owner)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(MealDraft::try_from)
            .collect()
    }

    async fn list_drafts_by_status(
        &self,
        status: DraftStatus,
        limit: i64,
    ) -> Result<Vec<MealDraft>, StoreError> {
        let query = format!(
            "SELECT {DRAFT_COLUMNS} FROM meal_drafts WHERE status = $1 \
             ORDER BY created_at ASC LIMIT $2"
        );
        sqlx::query_as::<_, DraftRow>(&query)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(MealDraft::try_from)
            .collect()
    }

    async fn begin_analysis(&self, owner: Uuid, id: Uuid) -> Result<Option<MealDraft>, StoreError> {
        // Compare-and-set on status: of two concurrent triggers only one
        // gets a row back.
        let query = format!(
            "UPDATE meal_drafts \
             SET status = 'processing', analysis_started_at = clock_timestamp(), \
                 updated_at = clock_timestamp() \
             WHERE id = $1 AND owner_id = $2 AND status = 'pending' \
             RETURNING {DRAFT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DraftRow>(&query)
            .bind(id)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        into_draft(row)
    }

    async fn complete_analysis(
        &self,
        owner: Uuid,
        id: Uuid,
        analysis: &MealAnalysis,
    ) -> Result<Option<MealDraft>, StoreError> {
        let query = format!(
            "UPDATE meal_drafts \
             SET status = 'ready', analysis = $3, error = NULL, \
                 analysis_completed_at = clock_timestamp(), updated_at = clock_timestamp() \
             WHERE id = $1 AND owner_id = $2 AND status = 'processing' \
             RETURNING {DRAFT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DraftRow>(&query)
            .bind(id)
            .bind(owner)
            .bind(Json(analysis))
            .fetch_optional(&self.pool)
            .await?;
        into_draft(row)
    }

    async fn fail_analysis(
        &self,
        owner: Uuid,
        id: Uuid,
        failure: &AnalysisFailure,
    ) -> Result<Option<MealDraft>, StoreError> {
        let query = format!(
            "UPDATE meal_drafts \
             SET status = 'error', error = $3, analysis = NULL, \
                 analysis_completed_at = NULL, updated_at = clock_timestamp() \
             WHERE id = $1 AND owner_id = $2 AND status = 'processing' \
             RETURNING {DRAFT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DraftRow>(&query)
            .bind(id)
            .bind(owner)
            .bind(Json(failure))
            .fetch_optional(&self.pool)
            .await?;
        into_draft(row)
    }

    async fn expire_processing(
        &self,
        started_before: OffsetDateTime,
        failure: &AnalysisFailure,
        limit: i64,
    ) -> Result<Vec<MealDraft>, StoreError> {
        // SKIP LOCKED: a row being completed right now is left to its run.
        let query = format!(
            "UPDATE meal_drafts \
             SET status = 'error', error = $2, analysis = NULL, \
                 analysis_completed_at = NULL, updated_at = clock_timestamp() \
             WHERE status = 'processing' AND id IN ( \
                 SELECT id FROM meal_drafts \
                 WHERE status = 'processing' AND analysis_started_at <= $1 \
                 ORDER BY analysis_started_at ASC LIMIT $3 \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING {DRAFT_COLUMNS}"
        );
        sqlx::query_as::<_, DraftRow>(&query)
            .bind(started_before)
            .bind(Json(failure))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(MealDraft::try_from)
            .collect()
    }

    async fn reset_for_retry(&self, owner: Uuid, id: Uuid) -> Result<RetryOutcome, StoreError> {
        let query = format!(
            "UPDATE meal_drafts \
             SET status = 'pending', analysis = NULL, error = NULL, \
                 analysis_started_at = NULL, analysis_completed_at = NULL, \
                 updated_at = clock_timestamp() \
             WHERE id = $1 AND owner_id = $2 AND status = 'error' \
             RETURNING {DRAFT_COLUMNS}"
        );
        let reset = sqlx::query_as::<_, DraftRow>(&query)
            .bind(id)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(draft) = into_draft(reset)? {
            return Ok(RetryOutcome::Reset(draft));
        }

        self.get_draft(owner, id)
            .await?
            .map(RetryOutcome::Unchanged)
            .ok_or(StoreError::DraftNotFound)
    }

    async fn promote(
        &self,
        owner: Uuid,
        id: Uuid,
        is_estimated: bool,
    ) -> Result<MealLog, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row lock: a concurrent promoter waits here and then sees no row.
        let select = format!(
            "SELECT {DRAFT_COLUMNS} FROM meal_drafts \
             WHERE id = $1 AND owner_id = $2 FOR UPDATE"
        );
        let row = sqlx::query_as::<_, DraftRow>(&select)
            .bind(id)
            .bind(owner)
            .fetch_optional(&mut *tx)
            .await?;
        let draft = into_draft(row)?.ok_or(StoreError::DraftNotFound)?;
        if draft.status != DraftStatus::Ready {
            return Err(StoreError::DraftNotReady);
        }

        let insert = format!(
            "INSERT INTO meal_logs \
                 (id, owner_id, name, slot_id, slot_name, image, source_file_name, analysis, \
                  is_estimated, source_draft_id, created_at, updated_at, promoted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, clock_timestamp(), clock_timestamp()) \
             RETURNING {LOG_COLUMNS}"
        );
        let log = sqlx::query_as::<_, LogRow>(&insert)
            .bind(Uuid::new_v4())
            .bind(owner)
            .bind(&draft.name)
            .bind(&draft.slot.id)
            .bind(&draft.slot.name)
            .bind(draft.image.as_ref().map(Json))
            .bind(&draft.source_file_name)
            .bind(draft.analysis.as_ref().map(Json))
            .bind(is_estimated)
            .bind(draft.id)
            .bind(draft.created_at)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM meal_drafts WHERE id = $1 AND owner_id = $2")
            .bind(id)
            .bind(owner)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(log.into())
    }
}

#[async_trait]
impl LogStore for PgStore {
    async fn insert_log(&self, owner: Uuid, log: NewMealLog) -> Result<MealLog, StoreError> {
        let query = format!(
            "INSERT INTO meal_logs \
                 (id, owner_id, name, slot_id, slot_name, image, source_file_name, \
                  analysis, is_estimated, source_draft_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, NULL, FALSE, NULL) \
             RETURNING {LOG_COLUMNS}"
        );
        let row = sqlx::query_as::<_, LogRow>(&query)
            .bind(Uuid::new_v4())
            .bind(owner)
            .bind(&log.name)
            .bind(&log.slot.id)
            .bind(&log.slot.name)
            .bind(log.image.map(Json))
            .bind(&log.source_file_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    async fn get_log(&self, owner: Uuid, id: Uuid) -> Result<Option<MealLog>, StoreError> {
        let query = format!("SELECT {LOG_COLUMNS} FROM meal_logs WHERE id = $1 AND owner_id = $2");
        let row = sqlx::query_as::<_, LogRow>(&query)
            .bind(id)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(MealLog::from))
    }

    async fn list_logs(
        &self,
        owner: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MealLog>, StoreError> {
        let query = format!(
            "SELECT {LOG_COLUMNS} FROM meal_logs WHERE owner_id = $1 \
             ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query_as::<_, LogRow>(&query)
            .bind(owner)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(MealLog::from).collect())
    }
}
