use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hrdesk_core::TriggerKind;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};

use crate::orchestrator::{SyncOrchestrator, TriggerError};

/// Starts a scheduled run unless one is already active. The run continues in the background.
pub async fn scheduled_tick(orchestrator: &Arc<SyncOrchestrator>) {
    match orchestrator.start(TriggerKind::Scheduled).await {
        Ok(handle) => debug!(run_id = %handle.run_id(), "scheduled sync started"),
        Err(TriggerError::AlreadyRunning { current }) => {
            debug!(current_run = %current.id, "sync already running, skipping scheduled tick")
        }
        Err(err) => error!(error = ?err, "scheduled sync could not start"),
    }
}

/// Builds a scheduler firing [`scheduled_tick`] every `interval`. The caller starts it.
pub async fn build_scheduler(orchestrator: Arc<SyncOrchestrator>, interval: Duration) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(interval, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            scheduled_tick(&orchestrator).await;
        })
    })
    .with_context(|| format!("creating sync job every {}s", interval.as_secs()))?;
    sched.add(job).await.context("adding sync job")?;
    info!(interval_secs = interval.as_secs(), "sync scheduler configured");
    Ok(sched)
}
