//! Auto-promotion of ready drafts once their review window closes.
//!
//! One sleeping task per ready draft. Firing late, twice, or after a human
//! already promoted the draft is harmless: the promotion transaction reports
//! the draft as gone or not ready and the timer just stops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::repo_types::{DraftStatus, MealDraft};
use crate::logs::repo_types::MealLog;
use crate::store::{DraftStore, StoreError};

/// Upper bound on ready drafts examined per catch-up pass.
const CATCH_UP_BATCH: i64 = 500;

#[derive(Default)]
struct Timers {
    next_generation: u64,
    scheduled: HashMap<Uuid, (u64, JoinHandle<()>)>,
}

#[derive(Clone)]
pub struct AutoPromoter {
    drafts: Arc<dyn DraftStore>,
    timers: Arc<Mutex<Timers>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CatchUp {
    pub promoted: usize,
    pub scheduled: usize,
    /// Overdue drafts whose promotion hit a store error; the next pass
    /// tries them again.
    pub failed: usize,
}

impl AutoPromoter {
    pub fn new(drafts: Arc<dyn DraftStore>) -> Self {
        Self {
            drafts,
            timers: Arc::new(Mutex::new(Timers::default())),
        }
    }

    /// Arm the timer for a ready draft, replacing any earlier timer for it.
    /// Returns `false` when the draft has no deadline.
    pub async fn schedule(&self, draft: &MealDraft) -> bool {
        let Some(deadline) = draft.auto_promote_at() else {
            return false;
        };
        let delay = Duration::try_from(deadline - OffsetDateTime::now_utc()).unwrap_or(Duration::ZERO);
        let (owner, draft_id) = (draft.owner, draft.id);

        // Held across spawn + insert so the task cannot forget itself before
        // it is registered.
        let mut timers = self.timers.lock().await;
        timers.next_generation += 1;
        let generation = timers.next_generation;

        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = this.fire(owner, draft_id).await {
                error!(error = %e, %owner, %draft_id, "auto-promotion failed");
            }
            this.forget(draft_id, generation).await;
        });

        if let Some((_, previous)) = timers.scheduled.insert(draft_id, (generation, handle)) {
            previous.abort();
        }
        debug!(%owner, %draft_id, delay_secs = delay.as_secs(), "auto-promotion scheduled");
        true
    }

    pub async fn cancel(&self, draft_id: Uuid) {
        if let Some((_, handle)) = self.timers.lock().await.scheduled.remove(&draft_id) {
            handle.abort();
            debug!(%draft_id, "auto-promotion cancelled");
        }
    }

    pub async fn is_scheduled(&self, draft_id: Uuid) -> bool {
        self.timers.lock().await.scheduled.contains_key(&draft_id)
    }

    /// Promote as estimated. `Ok(None)` means someone else already handled
    /// the draft.
    pub async fn fire(&self, owner: Uuid, draft_id: Uuid) -> Result<Option<MealLog>, StoreError> {
        match self.drafts.promote(owner, draft_id, true).await {
            Ok(log) => {
                info!(%owner, %draft_id, log_id = %log.id, "draft auto-promoted");
                Ok(Some(log))
            }
            Err(StoreError::DraftNotFound) | Err(StoreError::DraftNotReady) => {
                debug!(%owner, %draft_id, "auto-promotion skipped; draft already handled");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Promote every ready draft whose deadline is at or before `now` and arm
    /// timers for the rest. Covers deadlines that passed while no timer was
    /// running, e.g. across a restart.
    pub async fn catch_up(&self, now: OffsetDateTime) -> Result<CatchUp, StoreError> {
        let ready = self
            .drafts
            .list_drafts_by_status(DraftStatus::Ready, CATCH_UP_BATCH)
            .await?;

        let mut outcome = CatchUp::default();
        for draft in ready {
            match draft.auto_promote_at() {
                Some(deadline) if deadline <= now => match self.fire(draft.owner, draft.id).await {
                    Ok(Some(_)) => outcome.promoted += 1,
                    Ok(None) => {}
                    Err(e) => {
                        error!(error = %e, owner = %draft.owner, draft_id = %draft.id, "overdue auto-promotion failed");
                        outcome.failed += 1;
                    }
                },
                Some(_) if !self.is_scheduled(draft.id).await => {
                    if self.schedule(&draft).await {
                        outcome.scheduled += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(outcome)
    }

    async fn forget(&self, draft_id: Uuid, generation: u64) {
        let mut timers = self.timers.lock().await;
        if matches!(timers.scheduled.get(&draft_id), Some((g, _)) if *g == generation) {
            timers.scheduled.remove(&draft_id);
        }
    }
}
