//! Draft lifecycle: creation, analysis, retry and promotion.
//!
//! Creating or retrying a draft publishes a [`DraftEvent`]; the
//! [`LifecycleWorker`] picks it up and runs analysis on its own task. The
//! worker also sweeps periodically so pending drafts whose event was lost and
//! ready drafts whose timer died with a previous process are picked up again.
//! Drafts stuck in `processing` past the analysis lease are failed as
//! retryable.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::auto_promote::{AutoPromoter, CatchUp};
use super::repo_types::{AnalysisFailure, DraftStatus, FailureCode, MealDraft, NewMealDraft};
use crate::analysis::{AnalysisEngine, AnalysisInput, MealAnalysis};
use crate::logs::repo_types::MealLog;
use crate::storage::{StorageClient, StorageError};
use crate::store::{DraftStore, RetryOutcome, StoreError};

/// Drafts re-dispatched or expired per sweep.
const SWEEP_BATCH: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftEvent {
    Pending { owner: Uuid, draft_id: Uuid },
}

#[derive(Clone)]
pub struct DraftLifecycle {
    drafts: Arc<dyn DraftStore>,
    storage: Arc<dyn StorageClient>,
    engine: Arc<dyn AnalysisEngine>,
    auto_promoter: AutoPromoter,
    events: mpsc::UnboundedSender<DraftEvent>,
}

impl DraftLifecycle {
    pub fn new(
        drafts: Arc<dyn DraftStore>,
        storage: Arc<dyn StorageClient>,
        engine: Arc<dyn AnalysisEngine>,
    ) -> (Self, mpsc::UnboundedReceiver<DraftEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let lifecycle = Self {
            auto_promoter: AutoPromoter::new(drafts.clone()),
            drafts,
            storage,
            engine,
            events,
        };
        (lifecycle, receiver)
    }

    pub fn drafts(&self) -> &Arc<dyn DraftStore> {
        &self.drafts
    }

    #[cfg(test)]
    pub fn auto_promoter(&self) -> &AutoPromoter {
        &self.auto_promoter
    }

    #[instrument(skip(self, draft), fields(%owner))]
    pub async fn create_draft(&self, owner: Uuid, draft: NewMealDraft) -> Result<MealDraft, StoreError> {
        let draft = self.drafts.insert_draft(owner, draft).await?;
        info!(draft_id = %draft.id, has_image = draft.image.is_some(), "meal draft created");
        self.publish(owner, draft.id);
        Ok(draft)
    }

    /// Claim a pending draft and run analysis on it. Returns `None` when the
    /// draft was not pending, i.e. another run already owns it.
    ///
    /// Analysis failures end up on the draft as an `error` status; only store
    /// failures are returned.
    #[instrument(skip(self), fields(%owner, %draft_id))]
    pub async fn process_pending(&self, owner: Uuid, draft_id: Uuid) -> Result<Option<MealDraft>, StoreError> {
        let Some(draft) = self.drafts.begin_analysis(owner, draft_id).await? else {
            debug!("draft is not pending; skipping");
            return Ok(None);
        };

        info!(engine = self.engine.engine_name(), "analyzing meal draft");
        let updated = match self.analyze(&draft).await {
            Ok(analysis) => {
                self.drafts
                    .complete_analysis(owner, draft_id, &analysis)
                    .await?
            }
            Err(failure) => {
                warn!(code = ?failure.code, retryable = failure.code.is_retryable(), "meal analysis failed");
                self.drafts.fail_analysis(owner, draft_id, &failure).await?
            }
        };

        match &updated {
            Some(d) if d.status == DraftStatus::Ready => {
                info!(calories = d.analysis.as_ref().map(|a| a.calories), "meal draft ready");
                self.auto_promoter.schedule(d).await;
            }
            Some(_) => {}
            None => warn!("draft left processing while analysis ran; result dropped"),
        }
        Ok(updated)
    }

    async fn analyze(&self, draft: &MealDraft) -> Result<MealAnalysis, AnalysisFailure> {
        let storage_path = draft
            .image
            .as_ref()
            .map(|img| img.storage_path.trim())
            .filter(|p| !p.is_empty());

        let image = match storage_path {
            Some(path) => match self.storage.get_object(path).await {
                Ok(bytes) => {
                    debug!(bytes = bytes.len(), "image downloaded");
                    Some(bytes)
                }
                Err(StorageError::NotFound(key)) => {
                    warn!(%key, "draft image missing from storage");
                    return Err(FailureCode::MissingImage.into());
                }
                Err(StorageError::Unavailable(e)) => {
                    warn!(error = %e, "storage unavailable");
                    return Err(FailureCode::StorageUnavailable.into());
                }
            },
            None => None,
        };

        let label = Some(draft.name.trim()).filter(|n| !n.is_empty());
        if image.is_none() && label.is_none() {
            return Err(FailureCode::MissingInput.into());
        }

        let input = AnalysisInput {
            image: image.as_deref(),
            label,
        };
        let raw = self.engine.analyze(input).await.map_err(|e| {
            error!(error = %e, engine = self.engine.engine_name(), "analysis engine failed");
            AnalysisFailure::from(FailureCode::AnalysisFailed)
        })?;

        Ok(MealAnalysis::from_raw(&raw))
    }

    /// Put a failed draft back to `pending` and queue it again. Drafts in any
    /// other state are returned untouched.
    #[instrument(skip(self), fields(%owner, %draft_id))]
    pub async fn retry(&self, owner: Uuid, draft_id: Uuid) -> Result<RetryOutcome, StoreError> {
        let outcome = self.drafts.reset_for_retry(owner, draft_id).await?;
        match &outcome {
            RetryOutcome::Reset(_) => {
                info!("meal draft queued for another analysis");
                self.auto_promoter.cancel(draft_id).await;
                self.publish(owner, draft_id);
            }
            RetryOutcome::Unchanged(d) => {
                debug!(status = %d.status, "retry ignored; draft is not in error");
            }
        }
        Ok(outcome)
    }

    /// Fail every draft that has been `processing` for longer than `lease`
    /// as of `now`. They come out retryable.
    pub async fn expire_stale(&self, now: OffsetDateTime, lease: Duration) -> Result<Vec<MealDraft>, StoreError> {
        let failure = AnalysisFailure::from(FailureCode::AnalysisFailed);
        let expired = self
            .drafts
            .expire_processing(now - lease, &failure, SWEEP_BATCH)
            .await?;
        for draft in &expired {
            warn!(
                owner = %draft.owner,
                draft_id = %draft.id,
                started_at = ?draft.analysis_started_at,
                "analysis lease expired; draft marked failed"
            );
        }
        Ok(expired)
    }

    /// Human-confirmed promotion. Exactly one concurrent caller wins; the
    /// rest see `DraftNotFound`.
    #[instrument(skip(self), fields(%owner, %draft_id))]
    pub async fn promote(&self, owner: Uuid, draft_id: Uuid, is_estimated: bool) -> Result<MealLog, StoreError> {
        let result = self.drafts.promote(owner, draft_id, is_estimated).await;
        if matches!(result, Ok(_) | Err(StoreError::DraftNotFound)) {
            self.auto_promoter.cancel(draft_id).await;
        }
        result
    }

    fn publish(&self, owner: Uuid, draft_id: Uuid) {
        if self
            .events
            .send(DraftEvent::Pending { owner, draft_id })
            .is_err()
        {
            warn!(%draft_id, "lifecycle worker not running; draft waits for the next sweep");
        }
    }
}

/// Consumes draft events and runs the periodic sweep.
pub struct LifecycleWorker {
    lifecycle: DraftLifecycle,
    events: mpsc::UnboundedReceiver<DraftEvent>,
    sweep_interval: Duration,
    processing_lease: Duration,
}

impl LifecycleWorker {
    pub fn new(
        lifecycle: DraftLifecycle,
        events: mpsc::UnboundedReceiver<DraftEvent>,
        sweep_interval: Duration,
        processing_lease: Duration,
    ) -> Self {
        Self {
            lifecycle,
            events,
            sweep_interval,
            processing_lease,
        }
    }

    /// Run until the event channel closes. The first sweep happens right away,
    /// which restores auto-promotion timers after a restart.
    pub async fn run(mut self) {
        info!(
            sweep_secs = self.sweep_interval.as_secs(),
            lease_secs = self.processing_lease.as_secs(),
            "lifecycle worker started"
        );
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(DraftEvent::Pending { owner, draft_id }) => self.dispatch(owner, draft_id),
                    None => {
                        info!("lifecycle worker shutting down");
                        break;
                    }
                },
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }

    fn dispatch(&self, owner: Uuid, draft_id: Uuid) {
        let lifecycle = self.lifecycle.clone();
        tokio::spawn(async move {
            if let Err(e) = lifecycle.process_pending(owner, draft_id).await {
                error!(error = %e, %owner, %draft_id, "draft processing failed");
            }
        });
    }

    async fn sweep(&self) {
        let now = OffsetDateTime::now_utc();
        if let Err(e) = self.lifecycle.expire_stale(now, self.processing_lease).await {
            error!(error = %e, "processing lease sweep failed");
        }

        match self
            .lifecycle
            .drafts
            .list_drafts_by_status(DraftStatus::Pending, SWEEP_BATCH)
            .await
        {
            Ok(pending) => {
                if !pending.is_empty() {
                    debug!(count = pending.len(), "re-dispatching pending drafts");
                }
                for draft in pending {
                    self.dispatch(draft.owner, draft.id);
                }
            }
            Err(e) => error!(error = %e, "pending sweep failed"),
        }

        match self
            .lifecycle
            .auto_promoter
            .catch_up(now)
            .await
        {
            Ok(outcome) if outcome != CatchUp::default() => {
                info!(
                    promoted = outcome.promoted,
                    scheduled = outcome.scheduled,
                    failed = outcome.failed,
                    "auto-promotion sweep"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "auto-promotion sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::{json, Value};
    use tokio::sync::Notify;

    use super::*;
    use crate::analysis::{AnalysisError, StubAnalysisEngine};
    use crate::drafts::repo_types::{MealImage, MealSlot};
    use crate::images::services::{upload_meal_image, UploadItem};
    use crate::storage::MemoryStorage;
    use crate::store::{LogStore, MemoryStore};

    /// Engine double: counts calls, optionally fails the first `failures`
    /// calls, optionally waits on a gate before answering.
    struct ScriptedEngine {
        calls: AtomicUsize,
        failures: usize,
        reply: Value,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedEngine {
        fn replying(reply: Value) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures: 0,
                reply,
                gate: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AnalysisEngine for ScriptedEngine {
        async fn analyze(&self, _input: AnalysisInput<'_>) -> Result<Value, AnalysisError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if call < self.failures {
                return Err(AnalysisError::RequestFailed("connection reset".into()));
            }
            Ok(self.reply.clone())
        }

        fn engine_name(&self) -> &'static str {
            "scripted"
        }
    }

    struct DownStorage;

    #[async_trait]
    impl StorageClient for DownStorage {
        async fn put_object(&self, _key: &str, _body: Bytes, _ct: &str) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn get_object(&self, _key: &str) -> Result<Bytes, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn delete_object(&self, _key: &str) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn presign_get(&self, _key: &str, _s: u64) -> anyhow::Result<String> {
            anyhow::bail!("connection refused")
        }
    }

    fn sample_reply() -> Value {
        json!({
            "calories": 540,
            "macros": { "protein": 38, "carbs": 42, "fat": 22 },
            "items": [{ "name": "Salmon", "quantity": 1, "unit": "fillet" }]
        })
    }

    struct Harness {
        store: Arc<MemoryStore>,
        storage: Arc<MemoryStorage>,
        engine: Arc<ScriptedEngine>,
        lifecycle: DraftLifecycle,
        events: mpsc::UnboundedReceiver<DraftEvent>,
    }

    fn harness(engine: ScriptedEngine) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let storage = Arc::new(MemoryStorage::new());
        let engine = Arc::new(engine);
        let (lifecycle, events) = DraftLifecycle::new(store.clone(), storage.clone(), engine.clone());
        Harness {
            store,
            storage,
            engine,
            lifecycle,
            events,
        }
    }

    fn new_draft(name: &str, image: Option<MealImage>) -> NewMealDraft {
        NewMealDraft {
            name: name.into(),
            slot: MealSlot::normalized("dinner", "Dinner"),
            image,
            source_file_name: None,
            auto_promote_delay_minutes: 5,
        }
    }

    async fn uploaded_image(storage: &MemoryStorage, owner: Uuid) -> MealImage {
        upload_meal_image(
            storage,
            owner,
            UploadItem {
                body: Bytes::from_static(b"\xff\xd8\xff\xe0jpeg"),
                content_type: "image/jpeg",
            },
            600,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn draft_goes_from_upload_to_log() {
        let mut h = harness(ScriptedEngine::replying(sample_reply()));
        let owner = Uuid::new_v4();
        let image = uploaded_image(&h.storage, owner).await;

        let draft = h
            .lifecycle
            .create_draft(owner, new_draft("Salmon bowl", Some(image.clone())))
            .await
            .unwrap();
        assert_eq!(draft.status, DraftStatus::Pending);
        assert_eq!(
            h.events.recv().await,
            Some(DraftEvent::Pending { owner, draft_id: draft.id })
        );

        let ready = h
            .lifecycle
            .process_pending(owner, draft.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ready.status, DraftStatus::Ready);
        assert!(ready.payload_matches_status());
        assert_eq!(ready.analysis.as_ref().unwrap().calories, 540.0);
        assert!(h.lifecycle.auto_promoter().is_scheduled(draft.id).await);

        let log = h.lifecycle.promote(owner, draft.id, false).await.unwrap();
        assert_eq!(log.name, "Salmon bowl");
        assert_eq!(log.slot, MealSlot::normalized("dinner", "Dinner"));
        assert_eq!(log.image, Some(image));
        assert_eq!(log.analysis, ready.analysis);
        assert_eq!(log.source_draft_id, Some(draft.id));
        assert_eq!(log.created_at, draft.created_at);
        assert!(!log.is_estimated);

        assert!(h.store.get_draft(owner, draft.id).await.unwrap().is_none());
        assert!(!h.lifecycle.auto_promoter().is_scheduled(draft.id).await);
        assert_eq!(h.store.list_logs(owner, 20, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_triggers_analyze_once() {
        let gate = Arc::new(Notify::new());
        let mut engine = ScriptedEngine::replying(sample_reply());
        engine.gate = Some(gate.clone());
        let h = harness(engine);
        let owner = Uuid::new_v4();
        let draft = h
            .lifecycle
            .create_draft(owner, new_draft("Pad thai", None))
            .await
            .unwrap();

        let draft_id = draft.id;
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let lifecycle = h.lifecycle.clone();
                tokio::spawn(async move { lifecycle.process_pending(owner, draft_id).await })
            })
            .collect();
        gate.notify_one();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(h.engine.calls(), 1);

        let stored = h.store.get_draft(owner, draft.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DraftStatus::Ready);
        h.lifecycle.auto_promoter().cancel(draft.id).await;
    }

    #[tokio::test]
    async fn concurrent_promotions_write_one_log() {
        let h = harness(ScriptedEngine::replying(sample_reply()));
        let owner = Uuid::new_v4();
        let draft = h
            .lifecycle
            .create_draft(owner, new_draft("Ramen", None))
            .await
            .unwrap();
        h.lifecycle.process_pending(owner, draft.id).await.unwrap();

        let draft_id = draft.id;
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let lifecycle = h.lifecycle.clone();
                tokio::spawn(async move { lifecycle.promote(owner, draft_id, i % 2 == 0).await })
            })
            .collect();

        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(StoreError::DraftNotFound) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(h.store.log_count().await, 1);
        assert!(h.store.get_draft(owner, draft.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_analysis_can_be_retried() {
        let mut engine = ScriptedEngine::replying(sample_reply());
        engine.failures = 1;
        let h = harness(engine);
        let owner = Uuid::new_v4();
        let draft = h
            .lifecycle
            .create_draft(owner, new_draft("Tacos", None))
            .await
            .unwrap();

        let failed = h
            .lifecycle
            .process_pending(owner, draft.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, DraftStatus::Error);
        assert_eq!(failed.error.as_ref().unwrap().code, FailureCode::AnalysisFailed);
        assert!(failed.payload_matches_status());
        assert!(matches!(
            h.lifecycle.promote(owner, draft.id, true).await,
            Err(StoreError::DraftNotReady)
        ));

        let RetryOutcome::Reset(reset) = h.lifecycle.retry(owner, draft.id).await.unwrap() else {
            panic!("draft in error should reset");
        };
        assert_eq!(reset.status, DraftStatus::Pending);
        assert!(reset.analysis.is_none() && reset.error.is_none());
        assert!(reset.analysis_started_at.is_none() && reset.analysis_completed_at.is_none());

        let ready = h
            .lifecycle
            .process_pending(owner, draft.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ready.status, DraftStatus::Ready);
        assert!(ready.analysis_started_at.unwrap() > failed.analysis_started_at.unwrap());
        assert!(ready.analysis_completed_at.unwrap() > failed.updated_at);
        assert_eq!(h.engine.calls(), 2);
        h.lifecycle.auto_promoter().cancel(draft.id).await;
    }

    #[tokio::test]
    async fn retry_outside_error_state() {
        let h = harness(ScriptedEngine::replying(sample_reply()));
        let owner = Uuid::new_v4();

        assert!(matches!(
            h.lifecycle.retry(owner, Uuid::new_v4()).await,
            Err(StoreError::DraftNotFound)
        ));

        let draft = h
            .lifecycle
            .create_draft(owner, new_draft("Soup", None))
            .await
            .unwrap();
        h.lifecycle.process_pending(owner, draft.id).await.unwrap();

        let outcome = h.lifecycle.retry(owner, draft.id).await.unwrap();
        let RetryOutcome::Unchanged(same) = outcome else {
            panic!("ready draft must not reset");
        };
        assert_eq!(same.status, DraftStatus::Ready);
        assert!(h.lifecycle.auto_promoter().is_scheduled(draft.id).await);
        h.lifecycle.auto_promoter().cancel(draft.id).await;
    }

    #[tokio::test]
    async fn blank_draft_fails_without_calling_engine() {
        let h = harness(ScriptedEngine::replying(sample_reply()));
        let owner = Uuid::new_v4();
        let draft = h
            .lifecycle
            .create_draft(owner, new_draft("   ", None))
            .await
            .unwrap();

        let failed = h
            .lifecycle
            .process_pending(owner, draft.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, DraftStatus::Error);
        assert_eq!(failed.error.unwrap().code, FailureCode::MissingInput);
        assert_eq!(h.engine.calls(), 0);
    }

    #[tokio::test]
    async fn missing_object_marks_missing_image() {
        let h = harness(ScriptedEngine::replying(sample_reply()));
        let owner = Uuid::new_v4();
        let mut image = uploaded_image(&h.storage, owner).await;
        image.storage_path = format!("drafts/{}/gone.jpg", owner);

        let draft = h
            .lifecycle
            .create_draft(owner, new_draft("Curry", Some(image)))
            .await
            .unwrap();
        let failed = h
            .lifecycle
            .process_pending(owner, draft.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.error.unwrap().code, FailureCode::MissingImage);
        assert_eq!(h.engine.calls(), 0);
    }

    #[tokio::test]
    async fn unreachable_storage_marks_storage_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(ScriptedEngine::replying(sample_reply()));
        let (lifecycle, _events) = DraftLifecycle::new(store.clone(), Arc::new(DownStorage), engine.clone());
        let owner = Uuid::new_v4();
        let image = MealImage {
            storage_path: format!("drafts/{}/a.jpg", owner),
            download_url: "https://example.invalid/a.jpg".into(),
            size: 10,
            content_type: "image/jpeg".into(),
            uploaded_at: OffsetDateTime::now_utc(),
        };

        let draft = lifecycle
            .create_draft(owner, new_draft("Burger", Some(image)))
            .await
            .unwrap();
        let failed = lifecycle
            .process_pending(owner, draft.id)
            .await
            .unwrap()
            .unwrap();
        let failure = failed.error.unwrap();
        assert_eq!(failure.code, FailureCode::StorageUnavailable);
        assert!(failure.code.is_retryable());
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn malformed_engine_output_still_yields_ready_draft() {
        let h = harness(ScriptedEngine::replying(json!({
            "calories": "lots",
            "macros": null,
            "items": [{ "quantity": -2 }]
        })));
        let owner = Uuid::new_v4();
        let draft = h
            .lifecycle
            .create_draft(owner, new_draft("Mystery stew", None))
            .await
            .unwrap();

        let ready = h
            .lifecycle
            .process_pending(owner, draft.id)
            .await
            .unwrap()
            .unwrap();
        let analysis = ready.analysis.unwrap();
        assert_eq!(analysis.calories, 0.0);
        assert_eq!(analysis.macros.protein, 0.0);
        assert_eq!(analysis.items.len(), 1);
        assert_eq!(analysis.items[0].name, "Item");
        assert_eq!(analysis.items[0].quantity, 1.0);
        assert_eq!(analysis.items[0].unit, "serving");
        h.lifecycle.auto_promoter().cancel(draft.id).await;
    }

    #[tokio::test]
    async fn second_trigger_after_completion_is_a_no_op() {
        let h = harness(ScriptedEngine::replying(sample_reply()));
        let owner = Uuid::new_v4();
        let draft = h
            .lifecycle
            .create_draft(owner, new_draft("Salad", None))
            .await
            .unwrap();

        assert!(h.lifecycle.process_pending(owner, draft.id).await.unwrap().is_some());
        assert!(h.lifecycle.process_pending(owner, draft.id).await.unwrap().is_none());
        assert_eq!(h.engine.calls(), 1);
        h.lifecycle.auto_promoter().cancel(draft.id).await;
    }

    #[tokio::test]
    async fn draft_abandoned_in_processing_becomes_retryable() {
        let h = harness(ScriptedEngine::replying(sample_reply()));
        let owner = Uuid::new_v4();
        let lease = Duration::from_secs(300);
        let draft = h
            .lifecycle
            .create_draft(owner, new_draft("Lasagna", None))
            .await
            .unwrap();

        // Claimed by a run that never reports back.
        let claimed = h.store.begin_analysis(owner, draft.id).await.unwrap().unwrap();
        let started = claimed.analysis_started_at.unwrap();

        let early = h.lifecycle.expire_stale(started + Duration::from_secs(299), lease).await.unwrap();
        assert!(early.is_empty());
        let stored = h.store.get_draft(owner, draft.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DraftStatus::Processing);

        let expired = h.lifecycle.expire_stale(started + lease, lease).await.unwrap();
        assert_eq!(expired.len(), 1);
        let failed = &expired[0];
        assert_eq!(failed.status, DraftStatus::Error);
        let failure = failed.error.as_ref().unwrap();
        assert_eq!(failure.code, FailureCode::AnalysisFailed);
        assert!(failure.code.is_retryable());
        assert!(failed.payload_matches_status());

        let RetryOutcome::Reset(_) = h.lifecycle.retry(owner, draft.id).await.unwrap() else {
            panic!("expired draft should reset");
        };
        let ready = h
            .lifecycle
            .process_pending(owner, draft.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ready.status, DraftStatus::Ready);
        assert_eq!(h.engine.calls(), 1);
        h.lifecycle.auto_promoter().cancel(draft.id).await;
    }

    #[tokio::test]
    async fn late_result_after_expiry_is_dropped() {
        let h = harness(ScriptedEngine::replying(sample_reply()));
        let owner = Uuid::new_v4();
        let draft = h
            .lifecycle
            .create_draft(owner, new_draft("Chili", None))
            .await
            .unwrap();
        let claimed = h.store.begin_analysis(owner, draft.id).await.unwrap().unwrap();
        let lease = Duration::from_secs(60);
        h.lifecycle
            .expire_stale(claimed.analysis_started_at.unwrap() + lease, lease)
            .await
            .unwrap();

        let late = h
            .store
            .complete_analysis(owner, draft.id, &MealAnalysis::default())
            .await
            .unwrap();
        assert!(late.is_none());
        let stored = h.store.get_draft(owner, draft.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DraftStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_sweep_expires_claims_of_a_dead_process() {
        let store = Arc::new(MemoryStore::new());
        let (lifecycle, events) = DraftLifecycle::new(
            store.clone(),
            Arc::new(MemoryStorage::new()),
            Arc::new(StubAnalysisEngine::instant()),
        );
        let owner = Uuid::new_v4();
        let draft = store
            .insert_draft(owner, new_draft("Risotto", None))
            .await
            .unwrap();
        store.begin_analysis(owner, draft.id).await.unwrap().unwrap();

        // Zero lease: any claim older than the sweep itself is abandoned.
        let worker = tokio::spawn(
            LifecycleWorker::new(lifecycle.clone(), events, Duration::from_secs(30), Duration::ZERO).run(),
        );
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let d = store.get_draft(owner, draft.id).await.unwrap().unwrap();
            if d.status != DraftStatus::Processing {
                break;
            }
        }
        worker.abort();

        let stored = store.get_draft(owner, draft.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DraftStatus::Error);
        assert!(stored.error.unwrap().code.is_retryable());
        assert!(matches!(
            lifecycle.retry(owner, draft.id).await.unwrap(),
            RetryOutcome::Reset(_)
        ));
        assert!(matches!(
            lifecycle.promote(owner, draft.id, true).await,
            Err(StoreError::DraftNotReady)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn worker_processes_events_and_sweeps_stragglers() {
        let store = Arc::new(MemoryStore::new());
        let (lifecycle, events) = DraftLifecycle::new(
            store.clone(),
            Arc::new(MemoryStorage::new()),
            Arc::new(StubAnalysisEngine::instant()),
        );
        let owner = Uuid::new_v4();

        // Inserted behind the lifecycle's back: only the sweep can find it.
        let straggler = store
            .insert_draft(owner, new_draft("Omelette", None))
            .await
            .unwrap();

        let worker = tokio::spawn(LifecycleWorker::new(
            lifecycle.clone(),
            events,
            Duration::from_secs(30),
            Duration::from_secs(300),
        )
        .run());
        let draft = lifecycle
            .create_draft(owner, new_draft("Pancakes", None))
            .await
            .unwrap();

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let a = store.get_draft(owner, draft.id).await.unwrap().unwrap();
            let b = store.get_draft(owner, straggler.id).await.unwrap().unwrap();
            if a.status == DraftStatus::Ready && b.status == DraftStatus::Ready {
                break;
            }
        }

        for id in [draft.id, straggler.id] {
            let d = store.get_draft(owner, id).await.unwrap().unwrap();
            assert_eq!(d.status, DraftStatus::Ready);
            assert!(lifecycle.auto_promoter().is_scheduled(id).await);
        }

        // Both review windows close; the timers promote as estimated.
        tokio::time::sleep(Duration::from_secs(6 * 60)).await;
        let logs = store.list_logs(owner, 20, 0).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.is_estimated));

        worker.abort();
    }
}
