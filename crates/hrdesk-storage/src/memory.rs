use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use hrdesk_core::{
    AuditEntry, HighWaterMark, IngestKey, IssueCandidate, IssueRecord, MediaFailure, PersistOutcome,
    RetryTicket, RunCounters, RunStatus, SyncRun, TriggerKind,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{
    chrono_duration, stale_run_message, IssueRepository, MarkStore, RetryLedger, RunAcquisition, RunLedger,
    MAX_ATTEMPTS_REASON,
};

/// In-process store with the same atomicity guarantees as [`crate::PgStore`], scoped to one
/// process. Used for tests and database-less local runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    issues: Vec<IssueRecord>,
    by_key: HashMap<IngestKey, usize>,
    audit: Vec<AuditEntry>,
    // insertion order == creation order
    tickets: Vec<RetryTicket>,
    mark: u64,
    runs: Vec<SyncRun>,
}

impl MemoryState {
    fn issue_mut(&mut self, id: Uuid) -> Option<&mut IssueRecord> {
        self.issues.iter_mut().find(|issue| issue.id == id)
    }

    fn fail_stale_runs(&mut self, stale_after: Duration) -> Vec<Uuid> {
        let now = Utc::now();
        let cutoff = now - chrono_duration(stale_after);
        let mut recovered = Vec::new();
        for run in self.runs.iter_mut().filter(|r| r.is_running() && r.heartbeat_at <= cutoff) {
            let mut errors = run.errors.clone();
            errors.push(stale_run_message(run.heartbeat_at));
            *run = run.clone().finish(RunStatus::Failed, run.counters, errors, now);
            recovered.push(run.id);
        }
        recovered
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a running run's heartbeat into the past, as a crashed process would leave it.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn backdate_heartbeat(&self, run_id: Uuid, by: Duration) {
        let mut state = self.state.lock().await;
        if let Some(run) = state.runs.iter_mut().find(|r| r.id == run_id) {
            run.heartbeat_at -= chrono_duration(by);
        }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub async fn ticket(&self, issue_id: Uuid) -> Option<RetryTicket> {
        let state = self.state.lock().await;
        state.tickets.iter().find(|t| t.issue_id == issue_id).cloned()
    }
}

#[async_trait]
impl IssueRepository for MemoryStore {
    async fn insert_issue_if_absent(&self, key: &IngestKey, candidate: &IssueCandidate) -> Result<PersistOutcome> {
        let mut state = self.state.lock().await;
        if let Some(&idx) = state.by_key.get(key) {
            return Ok(PersistOutcome::Skipped {
                existing_id: state.issues[idx].id,
            });
        }

        let issue = IssueRecord::from_candidate(key, candidate, Utc::now());
        state.audit.push(AuditEntry::issue_created(&issue));
        if let Some(reference) = &issue.media.source_reference {
            state
                .tickets
                .push(RetryTicket::new(issue.id, reference.clone(), issue.created_at));
        }
        let idx = state.issues.len();
        state.by_key.insert(key.clone(), idx);
        state.issues.push(issue.clone());
        Ok(PersistOutcome::Created(issue))
    }

    async fn get_issue(&self, id: Uuid) -> Result<Option<IssueRecord>> {
        let state = self.state.lock().await;
        Ok(state.issues.iter().find(|issue| issue.id == id).cloned())
    }

    async fn list_issues(&self, limit: usize) -> Result<Vec<IssueRecord>> {
        let state = self.state.lock().await;
        Ok(state.issues.iter().rev().take(limit).cloned().collect())
    }

    async fn audit_entries(&self, issue_id: Uuid) -> Result<Vec<AuditEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .audit
            .iter()
            .filter(|entry| entry.issue_id == issue_id)
            .cloned()
            .collect())
    }

    async fn set_media_present(&self, issue_id: Uuid, url: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(issue) = state.issue_mut(issue_id) {
            issue.media.mark_present(url);
            issue.updated_at = Utc::now();
        }
        state.tickets.retain(|ticket| ticket.issue_id != issue_id);
        Ok(())
    }
}

#[async_trait]
impl RetryLedger for MemoryStore {
    async fn due_tickets(&self, limit: usize) -> Result<Vec<RetryTicket>> {
        let state = self.state.lock().await;
        Ok(state
            .tickets
            .iter()
            .filter(|ticket| !ticket.is_parked())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_media_failure(
        &self,
        issue_id: Uuid,
        failure: &MediaFailure,
        max_attempts: u32,
    ) -> Result<Option<RetryTicket>> {
        let mut state = self.state.lock().await;
        let Some(ticket) = state.tickets.iter_mut().find(|t| t.issue_id == issue_id) else {
            return Ok(None);
        };
        ticket.attempts += 1;
        ticket.last_error = Some(failure.message.clone());
        ticket.last_attempted_at = Some(Utc::now());
        if failure.permanent {
            ticket.parked_reason = Some(failure.message.clone());
        } else if ticket.attempts >= max_attempts {
            ticket.parked_reason = Some(MAX_ATTEMPTS_REASON.to_string());
        }
        Ok(Some(ticket.clone()))
    }

    async fn parked_tickets(&self) -> Result<Vec<RetryTicket>> {
        let state = self.state.lock().await;
        Ok(state.tickets.iter().filter(|t| t.is_parked()).cloned().collect())
    }

    async fn pending_ticket_count(&self) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state.tickets.iter().filter(|t| !t.is_parked()).count() as u64)
    }

    async fn requeue_parked(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut requeued = 0;
        for ticket in state.tickets.iter_mut().filter(|t| t.is_parked()) {
            ticket.parked_reason = None;
            ticket.attempts = 0;
            requeued += 1;
        }
        Ok(requeued)
    }
}

#[async_trait]
impl MarkStore for MemoryStore {
    async fn high_water_mark(&self) -> Result<HighWaterMark> {
        Ok(HighWaterMark(self.state.lock().await.mark))
    }

    async fn advance_mark(&self, position: u64) -> Result<HighWaterMark> {
        let mut state = self.state.lock().await;
        state.mark = state.mark.max(position);
        Ok(HighWaterMark(state.mark))
    }
}

#[async_trait]
impl RunLedger for MemoryStore {
    async fn begin_run(&self, kind: TriggerKind, stale_after: Duration) -> Result<RunAcquisition> {
        let mut state = self.state.lock().await;
        state.fail_stale_runs(stale_after);
        if let Some(active) = state.runs.iter().find(|r| r.is_running()) {
            return Ok(RunAcquisition::Busy(active.clone()));
        }
        let run = SyncRun::begin(kind, Utc::now());
        state.runs.push(run.clone());
        Ok(RunAcquisition::Started(run))
    }

    async fn heartbeat(&self, run_id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.runs.iter_mut().find(|r| r.id == run_id && r.is_running()) {
            Some(run) => {
                run.heartbeat_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn finish_run(&self, run: &SyncRun) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.runs.iter_mut().find(|r| r.id == run.id && r.is_running()) {
            Some(slot) => {
                *slot = run.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn recover_stale_runs(&self, stale_after: Duration) -> Result<Vec<Uuid>> {
        Ok(self.state.lock().await.fail_stale_runs(stale_after))
    }

    async fn current_run(&self) -> Result<Option<SyncRun>> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().find(|r| r.is_running()).cloned())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().rev().take(limit).cloned().collect())
    }

    async fn latest_finished(&self, status: RunStatus) -> Result<Option<SyncRun>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.status == status && r.completed_at.is_some())
            .max_by_key(|r| r.completed_at)
            .cloned())
    }

    async fn run_count(&self) -> Result<u64> {
        Ok(self.state.lock().await.runs.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrdesk_core::MediaState;

    fn candidate(email: &str, media: Option<&str>) -> IssueCandidate {
        IssueCandidate {
            source_position: 1,
            submitted_at: None,
            raw_timestamp: Some("11/24/2025 19:22:00".into()),
            submitter_email: email.into(),
            submitter_name: None,
            hall: "Levi".into(),
            room_number: "A205".into(),
            category: "Plumbing".into(),
            description: None,
            media_reference: media.map(ToString::to_string),
        }
    }

    #[tokio::test]
    async fn insert_is_conditional_on_key() {
        let store = MemoryStore::new();
        let key = IngestKey::new("v1:abc");
        let first = store
            .insert_issue_if_absent(&key, &candidate("a@x.io", None))
            .await
            .unwrap();
        let PersistOutcome::Created(issue) = first else {
            panic!("expected creation");
        };
        let second = store
            .insert_issue_if_absent(&key, &candidate("a@x.io", None))
            .await
            .unwrap();
        assert_eq!(second, PersistOutcome::Skipped { existing_id: issue.id });
        assert_eq!(store.list_issues(10).await.unwrap().len(), 1);
        assert_eq!(store.audit_entries(issue.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn media_rows_get_a_pending_ticket_until_uploaded() {
        let store = MemoryStore::new();
        let outcome = store
            .insert_issue_if_absent(&IngestKey::new("v1:m"), &candidate("a@x.io", Some("https://drive.example/f")))
            .await
            .unwrap();
        let PersistOutcome::Created(issue) = outcome else {
            panic!("expected creation");
        };
        assert_eq!(issue.media.state, MediaState::Pending);
        assert_eq!(store.pending_ticket_count().await.unwrap(), 1);

        store.set_media_present(issue.id, "https://cdn.example/1.jpg").await.unwrap();
        let stored = store.get_issue(issue.id).await.unwrap().unwrap();
        assert_eq!(stored.media.state, MediaState::Present);
        assert!(store.ticket(issue.id).await.is_none());
    }

    #[tokio::test]
    async fn transient_failures_park_at_max_attempts() {
        let store = MemoryStore::new();
        let PersistOutcome::Created(issue) = store
            .insert_issue_if_absent(&IngestKey::new("v1:t"), &candidate("a@x.io", Some("https://drive.example/f")))
            .await
            .unwrap()
        else {
            panic!("expected creation");
        };
        let failure = MediaFailure {
            message: "timeout".into(),
            permanent: false,
        };
        let first = store.record_media_failure(issue.id, &failure, 2).await.unwrap().unwrap();
        assert_eq!(first.attempts, 1);
        assert!(!first.is_parked());
        let second = store.record_media_failure(issue.id, &failure, 2).await.unwrap().unwrap();
        assert_eq!(second.parked_reason.as_deref(), Some(MAX_ATTEMPTS_REASON));
        assert!(store.due_tickets(10).await.unwrap().is_empty());

        assert_eq!(store.requeue_parked().await.unwrap(), 1);
        let due = store.due_tickets(10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 0);
    }

    #[tokio::test]
    async fn mark_never_moves_backwards() {
        let store = MemoryStore::new();
        store.advance_mark(5).await.unwrap();
        assert_eq!(store.advance_mark(3).await.unwrap(), HighWaterMark(5));
    }

    #[tokio::test]
    async fn one_running_run_at_a_time_with_stale_recovery() {
        let store = MemoryStore::new();
        let stale_after = Duration::from_secs(600);
        let RunAcquisition::Started(first) = store.begin_run(TriggerKind::Manual, stale_after).await.unwrap() else {
            panic!("expected lock");
        };
        let busy = store.begin_run(TriggerKind::Scheduled, stale_after).await.unwrap();
        assert_eq!(busy, RunAcquisition::Busy(first.clone()));

        store.backdate_heartbeat(first.id, Duration::from_secs(3600)).await;
        let RunAcquisition::Started(second) = store.begin_run(TriggerKind::Scheduled, stale_after).await.unwrap() else {
            panic!("stale run should have released the lock");
        };
        assert_ne!(first.id, second.id);

        let recovered = store
            .latest_finished(RunStatus::Failed)
            .await
            .unwrap()
            .expect("stale run recorded as failed");
        assert_eq!(recovered.id, first.id);
        assert!(recovered.errors[0].starts_with("run abandoned"));
        assert!(!store.heartbeat(first.id).await.unwrap());

        let finished = second.clone().finish(RunStatus::Success, RunCounters::default(), vec![], Utc::now());
        assert!(store.finish_run(&finished).await.unwrap());
        assert!(!store.finish_run(&finished).await.unwrap());
        assert!(store.current_run().await.unwrap().is_none());
        assert_eq!(store.recent_runs(10).await.unwrap()[0].id, second.id);
    }
}
