//! Core domain model for the HRDesk sync engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hrdesk-core";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} `{}`", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Manual,
}

string_enum!(TriggerKind, "trigger kind", {
    Scheduled => "scheduled",
    Manual => "manual",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

string_enum!(RunStatus, "run status", {
    Running => "running",
    Success => "success",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Pending,
    InProgress,
    Done,
}

string_enum!(IssueStatus, "issue status", {
    Pending => "pending",
    InProgress => "in_progress",
    Done => "done",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaState {
    Absent,
    Pending,
    Present,
}

string_enum!(MediaState, "media state", {
    Absent => "absent",
    Pending => "pending",
    Present => "present",
});

/// Raw spreadsheet row as delivered by a source reader.
///
/// `position` is the 1-based data row index; the header row sits at position 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRow {
    pub position: u64,
    pub cells: Vec<(String, String)>,
}

impl SourceRow {
    pub fn new(position: u64, cells: Vec<(String, String)>) -> Self {
        Self { position, cells }
    }

    /// Case-insensitive header lookup: exact header match wins, otherwise the first
    /// header containing `needle`. Blank cells read as `None`.
    pub fn get(&self, needle: &str) -> Option<&str> {
        let needle = needle.trim().to_ascii_lowercase();
        let exact = self
            .cells
            .iter()
            .find(|(header, _)| header.trim().to_ascii_lowercase() == needle);
        let cell = exact.or_else(|| {
            self.cells
                .iter()
                .find(|(header, _)| header.to_ascii_lowercase().contains(&needle))
        })?;
        let value = cell.1.trim();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }
}

/// Furthest source position already consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HighWaterMark(pub u64);

impl HighWaterMark {
    pub fn position(&self) -> u64 {
        self.0
    }

    pub fn covers(&self, position: u64) -> bool {
        position <= self.0
    }
}

/// Content-derived idempotency key for one logical form submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IngestKey(String);

impl IngestKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IngestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated handoff from the row validator into persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCandidate {
    pub source_position: u64,
    pub submitted_at: Option<DateTime<Utc>>,
    pub raw_timestamp: Option<String>,
    pub submitter_email: String,
    pub submitter_name: Option<String>,
    pub hall: String,
    pub room_number: String,
    pub category: String,
    pub description: Option<String>,
    pub media_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub state: MediaState,
    pub source_reference: Option<String>,
    pub url: Option<String>,
}

impl MediaAsset {
    pub fn for_reference(reference: Option<String>) -> Self {
        let state = if reference.is_some() {
            MediaState::Pending
        } else {
            MediaState::Absent
        };
        Self {
            state,
            source_reference: reference,
            url: None,
        }
    }

    /// Marks the asset uploaded. An asset that is already present keeps its URL.
    pub fn mark_present(&mut self, url: impl Into<String>) {
        if self.state == MediaState::Present {
            return;
        }
        self.state = MediaState::Present;
        self.url = Some(url.into());
    }
}

/// Persisted issue created from a form submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub id: Uuid,
    pub ingest_key: IngestKey,
    pub source_position: u64,
    pub submitted_at: Option<DateTime<Utc>>,
    pub submitter_email: String,
    pub submitter_name: Option<String>,
    pub hall: String,
    pub room_number: String,
    pub category: String,
    pub description: Option<String>,
    pub media: MediaAsset,
    pub status: IssueStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IssueRecord {
    pub fn from_candidate(key: &IngestKey, candidate: &IssueCandidate, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ingest_key: key.clone(),
            source_position: candidate.source_position,
            submitted_at: candidate.submitted_at,
            submitter_email: candidate.submitter_email.clone(),
            submitter_name: candidate.submitter_name.clone(),
            hall: candidate.hall.clone(),
            room_number: candidate.room_number.clone(),
            category: candidate.category.clone(),
            description: candidate.description.clone(),
            media: MediaAsset::for_reference(candidate.media_reference.clone()),
            status: IssueStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub issue_id: Uuid,
    /// `None` for system actions.
    pub actor: Option<String>,
    pub action: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub details: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn issue_created(issue: &IssueRecord) -> Self {
        Self {
            issue_id: issue.id,
            actor: None,
            action: "created".to_string(),
            old_value: None,
            new_value: Some(issue.status.as_str().to_string()),
            details: Some("Issue created from form submission".to_string()),
            recorded_at: issue.created_at,
        }
    }
}

/// Durable record of a media upload that has not succeeded yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryTicket {
    pub issue_id: Uuid,
    pub media_reference: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Set once the ticket is excluded from automatic retries.
    pub parked_reason: Option<String>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RetryTicket {
    pub fn new(issue_id: Uuid, media_reference: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            issue_id,
            media_reference: media_reference.into(),
            attempts: 0,
            last_error: None,
            parked_reason: None,
            last_attempted_at: None,
            created_at: now,
        }
    }

    pub fn is_parked(&self) -> bool {
        self.parked_reason.is_some()
    }
}

/// Failure details applied to a ticket after one upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFailure {
    pub message: String,
    pub permanent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Created(IssueRecord),
    Skipped { existing_id: Uuid },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub rows_checked: u32,
    pub rows_created: u32,
    pub rows_skipped: u32,
    pub media_uploaded: u32,
    pub media_retry_queued: u32,
}

/// One execution of the sync pipeline. A `Running` row doubles as the run lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub trigger_kind: TriggerKind,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counters: RunCounters,
    pub errors: Vec<String>,
}

impl SyncRun {
    pub fn begin(trigger_kind: TriggerKind, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger_kind,
            status: RunStatus::Running,
            started_at: now,
            heartbeat_at: now,
            completed_at: None,
            counters: RunCounters::default(),
            errors: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    pub fn finish(
        mut self,
        status: RunStatus,
        counters: RunCounters,
        errors: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        self.status = status;
        self.counters = counters;
        self.errors = errors;
        self.heartbeat_at = now;
        self.completed_at = Some(now);
        self
    }

    pub fn summary(&self) -> SyncRunSummary {
        SyncRunSummary::from(self)
    }
}

/// External projection of a run consumed by the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub id: Uuid,
    pub trigger_kind: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub rows_processed: u32,
    pub rows_created: u32,
    pub rows_skipped: u32,
    pub media_uploaded: u32,
    pub media_retry_queued: u32,
    pub errors: Vec<String>,
}

impl From<&SyncRun> for SyncRunSummary {
    fn from(run: &SyncRun) -> Self {
        Self {
            id: run.id,
            trigger_kind: run.trigger_kind,
            started_at: run.started_at,
            completed_at: run.completed_at,
            status: run.status,
            rows_processed: run.counters.rows_checked,
            rows_created: run.counters.rows_created,
            rows_skipped: run.counters.rows_skipped,
            media_uploaded: run.counters.media_uploaded,
            media_retry_queued: run.counters.media_retry_queued,
            errors: run.errors.clone(),
        }
    }
}
