use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hrdesk_core::{
    AuditEntry, HighWaterMark, IngestKey, IssueCandidate, IssueRecord, MediaFailure, PersistOutcome,
    RetryTicket, RunStatus, SyncRun, TriggerKind,
};
use uuid::Uuid;

pub(crate) const MAX_ATTEMPTS_REASON: &str = "max attempts exceeded";

/// Issue persistence. Creation is keyed by [`IngestKey`] and happens at most once per key.
#[async_trait]
pub trait IssueRepository: Send + Sync {
    /// Inserts the issue, its creation audit entry and (when the candidate carries media) a
    /// pending retry ticket in one transaction, unless the key already exists.
    async fn insert_issue_if_absent(&self, key: &IngestKey, candidate: &IssueCandidate) -> Result<PersistOutcome>;

    async fn get_issue(&self, id: Uuid) -> Result<Option<IssueRecord>>;

    /// Most recently created first.
    async fn list_issues(&self, limit: usize) -> Result<Vec<IssueRecord>>;

    async fn audit_entries(&self, issue_id: Uuid) -> Result<Vec<AuditEntry>>;

    /// Sets media to `present` (unless it already is) and deletes the issue's retry ticket.
    async fn set_media_present(&self, issue_id: Uuid, url: &str) -> Result<()>;
}

/// Durable queue of media uploads awaiting another attempt.
#[async_trait]
pub trait RetryLedger: Send + Sync {
    /// Non-parked tickets, oldest first.
    async fn due_tickets(&self, limit: usize) -> Result<Vec<RetryTicket>>;

    /// Counts one failed attempt. Permanent failures park the ticket with the failure message;
    /// transient ones park it once `attempts` reaches `max_attempts`. Returns `None` when the
    /// issue has no ticket.
    async fn record_media_failure(
        &self,
        issue_id: Uuid,
        failure: &MediaFailure,
        max_attempts: u32,
    ) -> Result<Option<RetryTicket>>;

    async fn parked_tickets(&self) -> Result<Vec<RetryTicket>>;

    /// Tickets still eligible for automatic retry.
    async fn pending_ticket_count(&self) -> Result<u64>;

    /// Clears the parked state and attempt counter of every parked ticket.
    async fn requeue_parked(&self) -> Result<u64>;
}

#[async_trait]
pub trait MarkStore: Send + Sync {
    async fn high_water_mark(&self) -> Result<HighWaterMark>;

    /// Moves the mark forward to `position`; never moves it backwards.
    async fn advance_mark(&self, position: u64) -> Result<HighWaterMark>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunAcquisition {
    Started(SyncRun),
    /// Another run holds the lock.
    Busy(SyncRun),
}

/// Run history. A run in `running` state is the run lock.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Fails stale runs, then atomically creates a `running` run unless one is already active.
    async fn begin_run(&self, kind: TriggerKind, stale_after: Duration) -> Result<RunAcquisition>;

    /// Refreshes the run's heartbeat. Returns `false` when the run no longer holds the lock.
    async fn heartbeat(&self, run_id: Uuid) -> Result<bool>;

    /// Finalizes a running run. Returns `false` if it had already been finalized elsewhere.
    async fn finish_run(&self, run: &SyncRun) -> Result<bool>;

    /// Marks runs whose heartbeat is older than `stale_after` as failed; returns their ids.
    async fn recover_stale_runs(&self, stale_after: Duration) -> Result<Vec<Uuid>>;

    async fn current_run(&self) -> Result<Option<SyncRun>>;

    /// Most recently started first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>>;

    /// Latest finished run with the given status, by completion time.
    async fn latest_finished(&self, status: RunStatus) -> Result<Option<SyncRun>>;

    async fn run_count(&self) -> Result<u64>;
}

/// Everything the sync engine needs from persistence.
pub trait SyncStore: IssueRepository + RetryLedger + RunLedger + MarkStore {}

impl<T> SyncStore for T where T: IssueRepository + RetryLedger + RunLedger + MarkStore {}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(3650))
}

pub(crate) fn stale_run_message(heartbeat_at: DateTime<Utc>) -> String {
    format!("run abandoned: no heartbeat since {}", heartbeat_at.to_rfc3339())
}
