//! Incremental sheet-to-issue sync: run orchestration, scheduling and status reads.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hrdesk_adapters::{
    Catalog, FixtureSheetReader, FormRowValidator, HttpMediaFetcher, MediaTransfer, ObjectStoreUploader,
    SheetValuesReader, SourceReader,
};
use hrdesk_core::{SyncRunSummary, TriggerKind};
use hrdesk_storage::{HttpClientConfig, HttpFetcher, MemoryStore, ObjectStore, PgStore, SyncStore};
use tokio_cron_scheduler::JobScheduler;
use tracing::{info, warn};

mod config;
mod orchestrator;
mod persist;
mod scheduler;
mod status;


pub use config::SyncConfig;
pub use orchestrator::{OrchestratorSettings, RunHandle, RunWait, SyncOrchestrator, TriggerError};
pub use persist::RecordPersister;
pub use scheduler::{build_scheduler, scheduled_tick};
pub use status::{StatusStore, SyncHealth, SyncStatus};

pub const CRATE_NAME: &str = "hrdesk-sync";

/// Connects the configured store: Postgres (migrated) when `DATABASE_URL` is set, otherwise an
/// in-memory store that lives as long as the process.
pub async fn connect_store(config: &SyncConfig) -> Result<Arc<dyn SyncStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Everything a process needs to run and observe syncs.
#[derive(Clone)]
pub struct SyncEngine {
    pub config: SyncConfig,
    pub store: Arc<dyn SyncStore>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub status: StatusStore,
}

impl SyncEngine {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = connect_store(&config).await?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: SyncConfig, store: Arc<dyn SyncStore>) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);

        let source: Arc<dyn SourceReader> = match (&config.source_fixture, &config.source_url) {
            (Some(path), _) => Arc::new(FixtureSheetReader::new(path.clone())),
            (None, Some(url)) => Arc::new(SheetValuesReader::new(http.clone(), url.clone(), config.source_token.clone())),
            (None, None) => bail!("no sheet source configured: set HRDESK_SOURCE_URL or HRDESK_SOURCE_FIXTURE"),
        };

        let validator = if config.catalog_path.exists() {
            let catalog = Catalog::load(&config.catalog_path)?;
            info!(
                path = %config.catalog_path.display(),
                halls = catalog.halls.len(),
                categories = catalog.categories.len(),
                "loaded catalog"
            );
            FormRowValidator::with_catalog(catalog)
        } else {
            FormRowValidator::new()
        };

        let media = MediaTransfer::new(
            Arc::new(HttpMediaFetcher::new(http, config.max_media_bytes)),
            Arc::new(ObjectStoreUploader::new(
                ObjectStore::new(config.media_dir.clone()),
                config.media_base_url.clone(),
            )),
        );

        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            source,
            validator,
            media,
            config.orchestrator_settings(),
        ));

        Ok(Self {
            status: StatusStore::new(store.clone()),
            config,
            store,
            orchestrator,
        })
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        build_scheduler(self.orchestrator.clone(), self.config.sync_interval())
            .await
            .map(Some)
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let engine = SyncEngine::from_config(SyncConfig::from_env()).await?;
    engine.orchestrator.recover_stale_runs().await?;
    engine
        .orchestrator
        .trigger(TriggerKind::Manual)
        .await
        .context("running manual sync")
}
