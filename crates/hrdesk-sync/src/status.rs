use std::sync::Arc;

use anyhow::{Context, Result};
use hrdesk_core::{RetryTicket, RunStatus, SyncRun, SyncRunSummary};
use hrdesk_storage::SyncStore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncHealth {
    Healthy,
    NeedsAttention,
    Unknown,
}

/// Poll-friendly status document served to the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub current_sync: Option<SyncRunSummary>,
    pub last_sync: Option<SyncRunSummary>,
    pub last_successful_sync: Option<SyncRunSummary>,
    pub last_failed_sync: Option<SyncRunSummary>,
    pub recent_syncs: Vec<SyncRunSummary>,
    pub total_runs: u64,
    /// Last sheet position committed by a sync.
    pub high_water_mark: u64,
    pub pending_media_retries: u64,
    pub parked_media: Vec<RetryTicket>,
    pub health: SyncHealth,
}

/// Read-only view over run history and the media retry ledger.
#[derive(Clone)]
pub struct StatusStore {
    store: Arc<dyn SyncStore>,
}

impl StatusStore {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    pub async fn current_run(&self) -> Result<Option<SyncRunSummary>> {
        let run = self.store.current_run().await.context("loading current run")?;
        Ok(run.as_ref().map(SyncRun::summary))
    }

    /// Most recent first.
    pub async fn history(&self, limit: usize) -> Result<Vec<SyncRunSummary>> {
        let runs = self.store.recent_runs(limit).await.context("loading run history")?;
        Ok(runs.iter().map(SyncRun::summary).collect())
    }

    pub async fn last_successful(&self) -> Result<Option<SyncRunSummary>> {
        self.latest(RunStatus::Success).await
    }

    pub async fn last_failed(&self) -> Result<Option<SyncRunSummary>> {
        self.latest(RunStatus::Failed).await
    }

    pub async fn high_water_mark(&self) -> Result<u64> {
        let mark = self
            .store
            .high_water_mark()
            .await
            .context("loading high-water mark")?;
        Ok(mark.position())
    }

    async fn latest(&self, status: RunStatus) -> Result<Option<SyncRunSummary>> {
        let run = self
            .store
            .latest_finished(status)
            .await
            .with_context(|| format!("loading last {status} run"))?;
        Ok(run.as_ref().map(SyncRun::summary))
    }

    pub async fn snapshot(&self, limit: usize) -> Result<SyncStatus> {
        let current_sync = self.current_run().await?;
        let recent_syncs = self.history(limit).await?;
        let last_successful_sync = self.last_successful().await?;
        let last_failed_sync = self.last_failed().await?;
        let total_runs = self.store.run_count().await.context("counting runs")?;
        let high_water_mark = self.high_water_mark().await?;
        let pending_media_retries = self
            .store
            .pending_ticket_count()
            .await
            .context("counting pending media retries")?;
        let parked_media = self
            .store
            .parked_tickets()
            .await
            .context("loading parked media")?;

        let last_sync = match (&last_successful_sync, &last_failed_sync) {
            (Some(ok), Some(failed)) if failed.completed_at > ok.completed_at => Some(failed.clone()),
            (Some(ok), _) => Some(ok.clone()),
            (None, failed) => failed.clone(),
        };

        let health = match &last_sync {
            None => SyncHealth::Unknown,
            Some(last) if last.status == RunStatus::Failed || !parked_media.is_empty() => {
                SyncHealth::NeedsAttention
            }
            Some(_) => SyncHealth::Healthy,
        };

        Ok(SyncStatus {
            current_sync,
            last_sync,
            last_successful_sync,
            last_failed_sync,
            recent_syncs,
            total_runs,
            high_water_mark,
            pending_media_retries,
            parked_media,
            health,
        })
    }
}
