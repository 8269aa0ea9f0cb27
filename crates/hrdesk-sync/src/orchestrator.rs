use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use hrdesk_adapters::{ingest_key, AdapterContext, FormRowValidator, MediaTransfer, SourceReader};
use hrdesk_core::{PersistOutcome, RunCounters, RunStatus, SyncRun, SyncRunSummary, TriggerKind};
use hrdesk_storage::{RunAcquisition, SyncStore};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::persist::RecordPersister;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_media_attempts: u32,
    pub retry_batch_limit: usize,
    pub media_concurrency: usize,
    pub stale_run_after: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_media_attempts: 5,
            retry_batch_limit: 20,
            media_concurrency: 4,
            stale_run_after: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("sync run {} is already in progress", .current.id)]
    AlreadyRunning { current: SyncRunSummary },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Outcome of waiting on a started run with a deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunWait {
    Finished(SyncRunSummary),
    StillRunning { run_id: Uuid },
}

/// A started run. Dropping the handle detaches the run; it keeps going in the background.
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    join: JoinHandle<SyncRun>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn wait(self) -> Result<SyncRunSummary> {
        let run = self.join.await.context("sync run task did not complete")?;
        Ok(run.summary())
    }

    pub async fn wait_for(mut self, limit: Duration) -> Result<RunWait> {
        match tokio::time::timeout(limit, &mut self.join).await {
            Ok(joined) => {
                let run = joined.context("sync run task did not complete")?;
                Ok(RunWait::Finished(run.summary()))
            }
            Err(_) => Ok(RunWait::StillRunning { run_id: self.run_id }),
        }
    }
}

#[derive(Debug, Default)]
struct RunProgress {
    counters: RunCounters,
    errors: Vec<String>,
}

#[derive(Debug, Clone)]
struct MediaJob {
    issue_id: Uuid,
    reference: String,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Owns the run lifecycle: lock acquisition, the ingest pipeline and finalization.
pub struct SyncOrchestrator {
    store: Arc<dyn SyncStore>,
    source: Arc<dyn SourceReader>,
    validator: FormRowValidator,
    persister: RecordPersister,
    media: MediaTransfer,
    settings: OrchestratorSettings,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn SyncStore>,
        source: Arc<dyn SourceReader>,
        validator: FormRowValidator,
        media: MediaTransfer,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            persister: RecordPersister::new(store.clone()),
            store,
            source,
            validator,
            media,
            settings,
        }
    }

    /// Fails runs left `running` by a crashed process.
    pub async fn recover_stale_runs(&self) -> Result<Vec<Uuid>> {
        let recovered = self
            .store
            .recover_stale_runs(self.settings.stale_run_after)
            .await
            .context("recovering stale sync runs")?;
        for run_id in &recovered {
            warn!(%run_id, "marked abandoned sync run as failed");
        }
        Ok(recovered)
    }

    /// Acquires the run lock and spawns the pipeline. Never waits for the run itself.
    pub async fn start(self: &Arc<Self>, kind: TriggerKind) -> Result<RunHandle, TriggerError> {
        let acquisition = self
            .store
            .begin_run(kind, self.settings.stale_run_after)
            .await
            .context("acquiring sync run lock")?;
        let run = match acquisition {
            RunAcquisition::Started(run) => run,
            RunAcquisition::Busy(current) => {
                return Err(TriggerError::AlreadyRunning {
                    current: current.summary(),
                })
            }
        };

        info!(run_id = %run.id, trigger = %kind, "sync run started");
        let run_id = run.id;
        let this = Arc::clone(self);
        let join = tokio::spawn(async move { this.drive(run).await });
        Ok(RunHandle { run_id, join })
    }

    /// Runs to completion and returns the finalized summary.
    pub async fn trigger(self: &Arc<Self>, kind: TriggerKind) -> Result<SyncRunSummary, TriggerError> {
        let handle = self.start(kind).await?;
        Ok(handle.wait().await?)
    }

    async fn drive(self: Arc<Self>, run: SyncRun) -> SyncRun {
        let span = info_span!("sync_run", run_id = %run.id, trigger = %run.trigger_kind);
        async move {
            let ctx = AdapterContext::new(run.id);
            let mut progress = RunProgress::default();
            let outcome = AssertUnwindSafe(self.execute(&ctx, &mut progress))
                .catch_unwind()
                .await;

            let status = match outcome {
                Ok(Ok(())) => RunStatus::Success,
                Ok(Err(err)) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "sync run failed");
                    progress.errors.push(message);
                    RunStatus::Failed
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(%message, "sync run panicked");
                    progress.errors.push(format!("run panicked: {message}"));
                    RunStatus::Failed
                }
            };

            let finished = run.finish(status, progress.counters, progress.errors, Utc::now());
            match self.store.finish_run(&finished).await {
                Ok(true) => info!(
                    status = %finished.status,
                    rows_checked = finished.counters.rows_checked,
                    rows_created = finished.counters.rows_created,
                    rows_skipped = finished.counters.rows_skipped,
                    media_uploaded = finished.counters.media_uploaded,
                    media_retry_queued = finished.counters.media_retry_queued,
                    "sync run finished"
                ),
                Ok(false) => warn!("sync run was already finalized elsewhere"),
                Err(err) => error!(error = ?err, "could not finalize sync run"),
            }
            finished
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, ctx: &AdapterContext, progress: &mut RunProgress) -> Result<()> {
        let due = self
            .store
            .due_tickets(self.settings.retry_batch_limit)
            .await
            .context("loading due media tickets")?;
        if !due.is_empty() {
            debug!(tickets = due.len(), "retrying pending media uploads");
        }
        let retries = due
            .into_iter()
            .map(|ticket| MediaJob {
                issue_id: ticket.issue_id,
                reference: ticket.media_reference,
            })
            .collect();
        self.upload_media(ctx, retries, progress).await?;

        let new_media = self.ingest_rows(ctx, progress).await?;
        self.upload_media(ctx, new_media, progress).await?;

        let parked = self
            .store
            .parked_tickets()
            .await
            .context("loading parked media tickets")?;
        if !parked.is_empty() {
            progress
                .errors
                .push(format!("{} media upload(s) parked for manual follow-up", parked.len()));
        }
        Ok(())
    }

    async fn ingest_rows(&self, ctx: &AdapterContext, progress: &mut RunProgress) -> Result<Vec<MediaJob>> {
        let mark = self
            .store
            .high_water_mark()
            .await
            .context("loading high-water mark")?;
        let mut rows = self
            .source
            .read_since(ctx, mark)
            .await
            .with_context(|| format!("reading source {} since position {}", self.source.source_id(), mark.position()))?;

        let mut media = Vec::new();
        while let Some(next) = rows.next().await {
            let row = next.context("reading source row")?;
            progress.counters.rows_checked += 1;

            match self.validator.validate(&row) {
                Ok(candidate) => {
                    let key = ingest_key(&candidate);
                    match self.persister.persist(&candidate, &key).await? {
                        PersistOutcome::Created(issue) => {
                            progress.counters.rows_created += 1;
                            if let Some(reference) = issue.media.source_reference {
                                media.push(MediaJob {
                                    issue_id: issue.id,
                                    reference,
                                });
                            }
                        }
                        PersistOutcome::Skipped { .. } => progress.counters.rows_skipped += 1,
                    }
                }
                Err(err) => {
                    warn!(position = row.position, error = %err, "row rejected");
                    progress.counters.rows_skipped += 1;
                    progress.errors.push(format!("row {}: {err}", row.position));
                }
            }

            self.store
                .advance_mark(row.position)
                .await
                .context("advancing high-water mark")?;
            self.heartbeat(ctx.run_id).await?;
        }
        Ok(media)
    }

    async fn upload_media(&self, ctx: &AdapterContext, jobs: Vec<MediaJob>, progress: &mut RunProgress) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }

        let transfers = jobs.into_iter().map(|job| {
            let media = self.media.clone();
            let ctx = ctx.clone();
            async move {
                let outcome = media.transfer(&ctx, job.issue_id, &job.reference).await;
                (job, outcome)
            }
        });
        let mut results = stream::iter(transfers).buffer_unordered(self.settings.media_concurrency.max(1));

        while let Some((job, outcome)) = results.next().await {
            match outcome {
                Ok(url) => {
                    self.store
                        .set_media_present(job.issue_id, &url)
                        .await
                        .context("recording uploaded media")?;
                    progress.counters.media_uploaded += 1;
                }
                Err(err) => {
                    let ticket = self
                        .store
                        .record_media_failure(job.issue_id, &err.to_failure(), self.settings.max_media_attempts)
                        .await
                        .context("recording media failure")?;
                    match ticket {
                        Some(ticket) if ticket.is_parked() => {
                            warn!(issue_id = %job.issue_id, attempts = ticket.attempts, error = %err, "media upload parked");
                            progress.errors.push(format!(
                                "media for issue {} parked after {} attempt(s): {}",
                                job.issue_id,
                                ticket.attempts,
                                err.message()
                            ));
                        }
                        Some(ticket) => {
                            debug!(issue_id = %job.issue_id, attempts = ticket.attempts, error = %err, "media upload queued for retry");
                            progress.counters.media_retry_queued += 1;
                            progress.errors.push(format!(
                                "media for issue {} failed (attempt {}), will retry: {}",
                                job.issue_id,
                                ticket.attempts,
                                err.message()
                            ));
                        }
                        None => warn!(issue_id = %job.issue_id, error = %err, "media failed for issue without retry ticket"),
                    }
                }
            }
            self.heartbeat(ctx.run_id).await?;
        }
        Ok(())
    }

    async fn heartbeat(&self, run_id: Uuid) -> Result<()> {
        let held = self
            .store
            .heartbeat(run_id)
            .await
            .context("refreshing run heartbeat")?;
        if !held {
            bail!("run lock lost: run {run_id} was finalized by another process");
        }
        Ok(())
    }
}
