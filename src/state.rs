use std::sync::Arc;
use std::time::Duration;

use crate::analysis::{engine_from_config, AnalysisEngine};
use crate::config::{AppConfig, StorageBackend, StoreBackend};
use crate::drafts::{DraftLifecycle, LifecycleWorker};
use crate::storage::{MemoryStorage, Storage, StorageClient};
use crate::store::{DraftStore, LogStore, MemoryStore, PgStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub lifecycle: DraftLifecycle,
    pub logs: Arc<dyn LogStore>,
    pub storage: Arc<dyn StorageClient>,
}

impl AppState {
    /// Wire everything from the environment. The returned worker must be
    /// spawned for drafts to get analyzed.
    pub async fn init() -> anyhow::Result<(Self, LifecycleWorker)> {
        let config = Arc::new(AppConfig::from_env()?);

        let (drafts, logs): (Arc<dyn DraftStore>, Arc<dyn LogStore>) = match config.store {
            StoreBackend::Postgres => {
                let url = config
                    .database_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))?;
                let store = Arc::new(PgStore::connect(url).await?);
                (store.clone() as Arc<dyn DraftStore>, store as Arc<dyn LogStore>)
            }
            StoreBackend::Memory => {
                tracing::warn!("using in-memory store; drafts and logs are lost on restart");
                let store = Arc::new(MemoryStore::new());
                (store.clone() as Arc<dyn DraftStore>, store as Arc<dyn LogStore>)
            }
        };

        let storage: Arc<dyn StorageClient> = match config.storage.backend {
            StorageBackend::S3 => Arc::new(Storage::from_config(&config.storage).await?),
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        };

        let engine = engine_from_config(&config.analysis)?;
        tracing::info!(
            engine = engine.engine_name(),
            store = ?config.store,
            storage = ?config.storage.backend,
            "app state initialized"
        );

        Ok(Self::from_parts(config, drafts, logs, storage, engine))
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        drafts: Arc<dyn DraftStore>,
        logs: Arc<dyn LogStore>,
        storage: Arc<dyn StorageClient>,
        engine: Arc<dyn AnalysisEngine>,
    ) -> (Self, LifecycleWorker) {
        let (lifecycle, events) = DraftLifecycle::new(drafts, storage.clone(), engine);
        let worker = LifecycleWorker::new(
            lifecycle.clone(),
            events,
            Duration::from_secs(config.lifecycle.sweep_interval_secs),
            Duration::from_secs(config.lifecycle.processing_lease_secs),
        );
        let state = Self {
            config,
            lifecycle,
            logs,
            storage,
        };
        (state, worker)
    }

    /// Everything in memory with an instant stub engine. No worker runs;
    /// tests drive analysis through `lifecycle.process_pending`.
    #[cfg(test)]
    pub fn fake() -> Self {
        use crate::analysis::StubAnalysisEngine;

        let config = AppConfig::from_lookup(|key| match key {
            "JWT_SECRET" => Some("test-secret".into()),
            "STORAGE_BACKEND" => Some("memory".into()),
            _ => None,
        })
        .expect("test config");

        let store = Arc::new(MemoryStore::new());
        let (state, _worker) = Self::from_parts(
            Arc::new(config),
            store.clone(),
            store,
            Arc::new(MemoryStorage::new()),
            Arc::new(StubAnalysisEngine::instant()),
        );
        state
    }
}
