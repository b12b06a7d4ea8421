use std::collections::HashMap;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{DraftStore, LogStore, RetryOutcome, StoreError};
use crate::analysis::MealAnalysis;
use crate::drafts::repo_types::{AnalysisFailure, DraftStatus, MealDraft, NewMealDraft};
use crate::logs::repo_types::{MealLog, NewMealLog};

/// Both collections behind one lock, so promotion is a single critical
/// section.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    drafts: HashMap<Uuid, MealDraft>,
    logs: HashMap<Uuid, MealLog>,
    last_stamp: Option<OffsetDateTime>,
}

impl Inner {
    /// Server clock, forced strictly increasing across writes.
    fn stamp(&mut self) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn owned_draft(&mut self, owner: Uuid, id: Uuid) -> Option<&mut MealDraft> {
        self.drafts.get_mut(&id).filter(|d| d.owner == owner)
    }

    /// Apply `change` only when the draft is in `from`.
    fn transition(
        &mut self,
        owner: Uuid,
        id: Uuid,
        from: DraftStatus,
        change: impl FnOnce(&mut MealDraft, OffsetDateTime),
    ) -> Option<MealDraft> {
        let now = self.stamp();
        let draft = self.owned_draft(owner, id)?;
        if draft.status != from {
            return None;
        }
        change(draft, now);
        draft.updated_at = now;
        Some(draft.clone())
    }

    fn fail(&mut self, owner: Uuid, id: Uuid, failure: &AnalysisFailure) -> Option<MealDraft> {
        self.transition(owner, id, DraftStatus::Processing, |draft, _| {
            draft.status = DraftStatus::Error;
            draft.error = Some(failure.clone());
            draft.analysis = None;
            draft.analysis_completed_at = None;
        })
    }

    fn fresh_id(&self) -> Uuid {
        loop {
            let id = Uuid::new_v4();
            if !self.drafts.contains_key(&id) && !self.logs.contains_key(&id) {
                return id;
            }
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn log_count(&self) -> usize {
        self.inner.lock().await.logs.len()
    }
}

#[async_trait]
impl DraftStore for MemoryStore {
    async fn insert_draft(
        &self,
        owner: Uuid,
        draft: NewMealDraft,
    ) -> Result<MealDraft, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.stamp();
        let record = MealDraft {
            id: inner.fresh_id(),
            owner,
            name: draft.name,
            slot: draft.slot,
            image: draft.image,
            source_file_name: draft.source_file_name,
            status: DraftStatus::Pending,
            analysis: None,
            error: None,
            created_at: now,
            updated_at: now,
            analysis_started_at: None,
            analysis_completed_at: None,
            auto_promote_delay_minutes: draft.auto_promote_delay_minutes.max(1),
        };
        inner.drafts.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_draft(&self, owner: Uuid, id: Uuid) -> Result<Option<MealDraft>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.drafts.get(&id).filter(|d| d.owner == owner).cloned())
    }

    async fn list_drafts(&self, owner: Uuid) -> Result<Vec<MealDraft>, StoreError> {
        let inner = self.inner.lock().await;
        let mut drafts: Vec<MealDraft> = inner
            .drafts
            .values()
            .filter(|d| d.owner == owner)
            .cloned()
            .collect();
        drafts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(drafts)
    }

    async fn list_drafts_by_status(
        &self,
        status: DraftStatus,
        limit: i64,
    ) -> Result<Vec<MealDraft>, StoreError> {
        let inner = self.inner.lock().await;
        let mut drafts: Vec<MealDraft> = inner
            .drafts
            .values()
            .filter(|d| d.status == status)
            .cloned()
            .collect();
        drafts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        drafts.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(drafts)
    }

    async fn begin_analysis(&self, owner: Uuid, id: Uuid) -> Result<Option<MealDraft>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.transition(owner, id, DraftStatus::Pending, |draft, now| {
            draft.status = DraftStatus::Processing;
            draft.analysis_started_at = Some(now);
        }))
    }

    async fn complete_analysis(
        &self,
        owner: Uuid,
        id: Uuid,
        analysis: &MealAnalysis,
    ) -> Result<Option<MealDraft>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.transition(owner, id, DraftStatus::Processing, |draft, now| {
            draft.status = DraftStatus::Ready;
            draft.analysis = Some(analysis.clone());
            draft.analysis_completed_at = Some(now);
            draft.error = None;
        }))
    }

    async fn fail_analysis(
        &self,
        owner: Uuid,
        id: Uuid,
        failure: &AnalysisFailure,
    ) -> Result<Option<MealDraft>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.fail(owner, id, failure))
    }

    async fn expire_processing(
        &self,
        started_before: OffsetDateTime,
        failure: &AnalysisFailure,
        limit: i64,
    ) -> Result<Vec<MealDraft>, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut stale: Vec<(OffsetDateTime, Uuid, Uuid)> = inner
            .drafts
            .values()
            .filter(|d| d.status == DraftStatus::Processing)
            .filter_map(|d| {
                d.analysis_started_at
                    .filter(|started| *started <= started_before)
                    .map(|started| (started, d.owner, d.id))
            })
            .collect();
        stale.sort();
        stale.truncate(usize::try_from(limit).unwrap_or(0));

        let mut expired = Vec::with_capacity(stale.len());
        for (_, owner, id) in stale {
            expired.extend(inner.fail(owner, id, failure));
        }
        Ok(expired)
    }

    async fn reset_for_retry(&self, owner: Uuid, id: Uuid) -> Result<RetryOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let reset = inner.transition(owner, id, DraftStatus::Error, |draft, _| {
            draft.status = DraftStatus::Pending;
            draft.analysis = None;
            draft.error = None;
            draft.analysis_started_at = None;
            draft.analysis_completed_at = None;
        });
        match reset {
            Some(draft) => Ok(RetryOutcome::Reset(draft)),
            None => inner
                .owned_draft(owner, id)
                .map(|d| RetryOutcome::Unchanged(d.clone()))
                .ok_or(StoreError::DraftNotFound),
        }
    }

    async fn promote(
        &self,
        owner: Uuid,
        id: Uuid,
        is_estimated: bool,
    ) -> Result<MealLog, StoreError> {
        let mut inner = self.inner.lock().await;
        let draft = inner
            .drafts
            .get(&id)
            .filter(|d| d.owner == owner)
            .ok_or(StoreError::DraftNotFound)?;
        if draft.status != DraftStatus::Ready {
            return Err(StoreError::DraftNotReady);
        }

        let now = inner.stamp();
        let log_id = inner.fresh_id();
        let draft = inner
            .drafts
            .remove(&id)
            .ok_or(StoreError::DraftNotFound)?;
        let log = MealLog {
            id: log_id,
            owner,
            name: draft.name,
            slot: draft.slot,
            image: draft.image,
            source_file_name: draft.source_file_name,
            analysis: draft.analysis,
            is_estimated,
            source_draft_id: Some(draft.id),
            created_at: draft.created_at,
            updated_at: now,
            promoted_at: now,
        };
        inner.logs.insert(log.id, log.clone());
        Ok(log)
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn insert_log(&self, owner: Uuid, log: NewMealLog) -> Result<MealLog, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.stamp();
        let record = MealLog {
            id: inner.fresh_id(),
            owner,
            name: log.name,
            slot: log.slot,
            image: log.image,
            source_file_name: log.source_file_name,
            analysis: None,
            is_estimated: false,
            source_draft_id: None,
            created_at: now,
            updated_at: now,
            promoted_at: now,
        };
        inner.logs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_log(&self, owner: Uuid, id: Uuid) -> Result<Option<MealLog>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.logs.get(&id).filter(|l| l.owner == owner).cloned())
    }

    async fn list_logs(
        &self,
        owner: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MealLog>, StoreError> {
        let inner = self.inner.lock().await;
        let mut logs: Vec<MealLog> = inner
            .logs
            .values()
            .filter(|l| l.owner == owner)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(logs
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .collect())
    }
}
