use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hrdesk_core::{
    AuditEntry, HighWaterMark, IngestKey, IssueCandidate, IssueRecord, MediaAsset, MediaFailure, PersistOutcome,
    RetryTicket, RunCounters, RunStatus, SyncRun, TriggerKind,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::store::{
    stale_run_message, IssueRepository, MarkStore, RetryLedger, RunAcquisition, RunLedger, MAX_ATTEMPTS_REASON,
};

const ISSUE_COLUMNS: &str = "id, ingest_key, source_position, submitted_at, submitter_email, submitter_name, \
     hall, room_number, category, description, media_state, media_source, media_url, status, created_at, updated_at";

const TICKET_COLUMNS: &str =
    "issue_id, media_source, attempts, last_error, parked_reason, last_attempted_at, created_at";

const RUN_COLUMNS: &str = "id, trigger_kind, status, started_at, heartbeat_at, completed_at, rows_checked, \
     rows_created, rows_skipped, media_uploaded, media_retry_queued, errors";

/// Postgres-backed [`crate::SyncStore`]. The run lock is the partial unique index
/// `sync_runs_single_running_idx`, so it holds across processes sharing the database.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .with_context(|| format!("decoding column {column}"))
}

fn count_column(row: &PgRow, column: &str) -> Result<u32> {
    let value: i64 = row.try_get(column)?;
    Ok(u32::try_from(value.max(0)).unwrap_or(u32::MAX))
}

fn issue_from_row(row: &PgRow) -> Result<IssueRecord> {
    let position: i64 = row.try_get("source_position")?;
    Ok(IssueRecord {
        id: row.try_get("id")?,
        ingest_key: IngestKey::new(row.try_get::<String, _>("ingest_key")?),
        source_position: u64::try_from(position).unwrap_or_default(),
        submitted_at: row.try_get("submitted_at")?,
        submitter_email: row.try_get("submitter_email")?,
        submitter_name: row.try_get("submitter_name")?,
        hall: row.try_get("hall")?,
        room_number: row.try_get("room_number")?,
        category: row.try_get("category")?,
        description: row.try_get("description")?,
        media: MediaAsset {
            state: parse_column(row, "media_state")?,
            source_reference: row.try_get("media_source")?,
            url: row.try_get("media_url")?,
        },
        status: parse_column(row, "status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ticket_from_row(row: &PgRow) -> Result<RetryTicket> {
    let attempts: i32 = row.try_get("attempts")?;
    Ok(RetryTicket {
        issue_id: row.try_get("issue_id")?,
        media_reference: row.try_get("media_source")?,
        attempts: u32::try_from(attempts).unwrap_or_default(),
        last_error: row.try_get("last_error")?,
        parked_reason: row.try_get("parked_reason")?,
        last_attempted_at: row.try_get("last_attempted_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<SyncRun> {
    let errors: Json<Vec<String>> = row.try_get("errors")?;
    Ok(SyncRun {
        id: row.try_get("id")?,
        trigger_kind: parse_column::<TriggerKind>(row, "trigger_kind")?,
        status: parse_column::<RunStatus>(row, "status")?,
        started_at: row.try_get("started_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        completed_at: row.try_get("completed_at")?,
        counters: RunCounters {
            rows_checked: count_column(row, "rows_checked")?,
            rows_created: count_column(row, "rows_created")?,
            rows_skipped: count_column(row, "rows_skipped")?,
            media_uploaded: count_column(row, "media_uploaded")?,
            media_retry_queued: count_column(row, "media_retry_queued")?,
        },
        errors: errors.0,
    })
}

async fn fail_stale_runs(conn: &mut PgConnection, stale_after: Duration) -> Result<Vec<Uuid>> {
    let stale = sqlx::query(&format!(
        "SELECT {RUN_COLUMNS} FROM sync_runs \
          WHERE status = 'running' \
            AND heartbeat_at <= NOW() - make_interval(secs => $1) \
          FOR UPDATE"
    ))
    .bind(stale_after.as_secs_f64())
    .fetch_all(&mut *conn)
    .await
    .context("selecting stale runs")?;

    let mut recovered = Vec::with_capacity(stale.len());
    for row in &stale {
        let run = run_from_row(row)?;
        let mut errors = run.errors.clone();
        errors.push(stale_run_message(run.heartbeat_at));
        sqlx::query(
            r#"
            UPDATE sync_runs
               SET status = 'failed',
                   completed_at = NOW(),
                   errors = $2
             WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(Json(errors))
        .execute(&mut *conn)
        .await
        .context("failing stale run")?;
        warn!(run_id = %run.id, heartbeat_at = %run.heartbeat_at, "recovered stale sync run");
        recovered.push(run.id);
    }
    Ok(recovered)
}

#[async_trait]
impl IssueRepository for PgStore {
    async fn insert_issue_if_absent(&self, key: &IngestKey, candidate: &IssueCandidate) -> Result<PersistOutcome> {
        let issue = IssueRecord::from_candidate(key, candidate, Utc::now());
        let mut tx = self.pool.begin().await.context("opening persist transaction")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO issues (
                id, ingest_key, source_position, submitted_at, submitter_email, submitter_name,
                hall, room_number, category, description, media_state, media_source, status,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
            ON CONFLICT (ingest_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(issue.id)
        .bind(key.as_str())
        .bind(i64::try_from(issue.source_position).unwrap_or(i64::MAX))
        .bind(issue.submitted_at)
        .bind(&issue.submitter_email)
        .bind(&issue.submitter_name)
        .bind(&issue.hall)
        .bind(&issue.room_number)
        .bind(&issue.category)
        .bind(&issue.description)
        .bind(issue.media.state.as_str())
        .bind(&issue.media.source_reference)
        .bind(issue.status.as_str())
        .bind(issue.created_at)
        .fetch_optional(&mut *tx)
        .await
        .context("inserting issue")?;

        if inserted.is_none() {
            let existing_id: Uuid = sqlx::query("SELECT id FROM issues WHERE ingest_key = $1")
                .bind(key.as_str())
                .fetch_one(&mut *tx)
                .await
                .context("loading existing issue for ingest key")?
                .try_get("id")?;
            tx.commit().await.context("committing skipped persist")?;
            return Ok(PersistOutcome::Skipped { existing_id });
        }

        let audit = AuditEntry::issue_created(&issue);
        sqlx::query(
            r#"
            INSERT INTO issue_audit_log (issue_id, actor, action, old_value, new_value, details, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(audit.issue_id)
        .bind(&audit.actor)
        .bind(&audit.action)
        .bind(&audit.old_value)
        .bind(&audit.new_value)
        .bind(&audit.details)
        .bind(audit.recorded_at)
        .execute(&mut *tx)
        .await
        .context("inserting creation audit entry")?;

        if let Some(reference) = &issue.media.source_reference {
            sqlx::query(
                r#"
                INSERT INTO media_retry_tickets (issue_id, media_source, attempts, created_at)
                VALUES ($1, $2, 0, $3)
                "#,
            )
            .bind(issue.id)
            .bind(reference)
            .bind(issue.created_at)
            .execute(&mut *tx)
            .await
            .context("inserting pending media ticket")?;
        }

        tx.commit().await.context("committing issue")?;
        Ok(PersistOutcome::Created(issue))
    }

    async fn get_issue(&self, id: Uuid) -> Result<Option<IssueRecord>> {
        let row = sqlx::query(&format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("loading issue")?;
        row.as_ref().map(issue_from_row).transpose()
    }

    async fn list_issues(&self, limit: usize) -> Result<Vec<IssueRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {ISSUE_COLUMNS} FROM issues ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("listing issues")?;
        rows.iter().map(issue_from_row).collect()
    }

    async fn audit_entries(&self, issue_id: Uuid) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT issue_id, actor, action, old_value, new_value, details, recorded_at
              FROM issue_audit_log
             WHERE issue_id = $1
             ORDER BY recorded_at, id
            "#,
        )
        .bind(issue_id)
        .fetch_all(&self.pool)
        .await
        .context("loading audit entries")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(AuditEntry {
                issue_id: row.try_get("issue_id")?,
                actor: row.try_get("actor")?,
                action: row.try_get("action")?,
                old_value: row.try_get("old_value")?,
                new_value: row.try_get("new_value")?,
                details: row.try_get("details")?,
                recorded_at: row.try_get("recorded_at")?,
            });
        }
        Ok(out)
    }

    async fn set_media_present(&self, issue_id: Uuid, url: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.context("opening media transaction")?;
        sqlx::query(
            r#"
            UPDATE issues
               SET media_state = 'present',
                   media_url = $2,
                   updated_at = NOW()
             WHERE id = $1
               AND media_state <> 'present'
            "#,
        )
        .bind(issue_id)
        .bind(url)
        .execute(&mut *tx)
        .await
        .context("marking media present")?;
        sqlx::query("DELETE FROM media_retry_tickets WHERE issue_id = $1")
            .bind(issue_id)
            .execute(&mut *tx)
            .await
            .context("deleting media ticket")?;
        tx.commit().await.context("committing media upload")?;
        Ok(())
    }
}

#[async_trait]
impl RetryLedger for PgStore {
    async fn due_tickets(&self, limit: usize) -> Result<Vec<RetryTicket>> {
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM media_retry_tickets \
              WHERE parked_reason IS NULL \
              ORDER BY created_at, issue_id \
              LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("loading due media tickets")?;
        rows.iter().map(ticket_from_row).collect()
    }

    async fn record_media_failure(
        &self,
        issue_id: Uuid,
        failure: &MediaFailure,
        max_attempts: u32,
    ) -> Result<Option<RetryTicket>> {
        let row = sqlx::query(&format!(
            "UPDATE media_retry_tickets \
                SET attempts = attempts + 1, \
                    last_error = $2, \
                    last_attempted_at = NOW(), \
                    parked_reason = CASE \
                        WHEN $3 THEN $2 \
                        WHEN attempts + 1 >= $4 THEN $5 \
                        ELSE parked_reason \
                    END \
              WHERE issue_id = $1 \
          RETURNING {TICKET_COLUMNS}"
        ))
        .bind(issue_id)
        .bind(&failure.message)
        .bind(failure.permanent)
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .bind(MAX_ATTEMPTS_REASON)
        .fetch_optional(&self.pool)
        .await
        .context("recording media failure")?;
        row.as_ref().map(ticket_from_row).transpose()
    }

    async fn parked_tickets(&self) -> Result<Vec<RetryTicket>> {
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM media_retry_tickets \
              WHERE parked_reason IS NOT NULL \
              ORDER BY created_at, issue_id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("loading parked media tickets")?;
        rows.iter().map(ticket_from_row).collect()
    }

    async fn pending_ticket_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM media_retry_tickets WHERE parked_reason IS NULL")
            .fetch_one(&self.pool)
            .await
            .context("counting pending media tickets")?
            .try_get("n")?;
        Ok(count.max(0) as u64)
    }

    async fn requeue_parked(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE media_retry_tickets
               SET parked_reason = NULL,
                   attempts = 0
             WHERE parked_reason IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await
        .context("requeueing parked media tickets")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl MarkStore for PgStore {
    async fn high_water_mark(&self) -> Result<HighWaterMark> {
        let row = sqlx::query("SELECT position FROM sync_cursor WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("loading high-water mark")?;
        let position = match row {
            Some(row) => row.try_get::<i64, _>("position")?,
            None => 0,
        };
        Ok(HighWaterMark(u64::try_from(position).unwrap_or_default()))
    }

    async fn advance_mark(&self, position: u64) -> Result<HighWaterMark> {
        let position: i64 = sqlx::query(
            r#"
            INSERT INTO sync_cursor (id, position, updated_at)
            VALUES (1, $1, NOW())
            ON CONFLICT (id) DO UPDATE
               SET position = GREATEST(sync_cursor.position, EXCLUDED.position),
                   updated_at = NOW()
            RETURNING position
            "#,
        )
        .bind(i64::try_from(position).unwrap_or(i64::MAX))
        .fetch_one(&self.pool)
        .await
        .context("advancing high-water mark")?
        .try_get("position")?;
        Ok(HighWaterMark(u64::try_from(position).unwrap_or_default()))
    }
}

#[async_trait]
impl RunLedger for PgStore {
    async fn begin_run(&self, kind: TriggerKind, stale_after: Duration) -> Result<RunAcquisition> {
        let mut tx = self.pool.begin().await.context("opening run lock transaction")?;
        fail_stale_runs(&mut *tx, stale_after).await?;

        let run = SyncRun::begin(kind, Utc::now());
        let inserted = sqlx::query(
            r#"
            INSERT INTO sync_runs (id, trigger_kind, status, started_at, heartbeat_at)
            VALUES ($1, $2, 'running', $3, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(run.id)
        .bind(kind.as_str())
        .bind(run.started_at)
        .execute(&mut *tx)
        .await
        .context("inserting running sync run")?;

        if inserted.rows_affected() == 1 {
            tx.commit().await.context("committing run lock")?;
            return Ok(RunAcquisition::Started(run));
        }

        let active = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs WHERE status = 'running' LIMIT 1"
        ))
        .fetch_optional(&mut *tx)
        .await
        .context("loading active sync run")?;
        tx.commit().await.context("closing run lock transaction")?;
        match active {
            Some(row) => Ok(RunAcquisition::Busy(run_from_row(&row)?)),
            None => Err(anyhow!("run lock released concurrently; try again")),
        }
    }

    async fn heartbeat(&self, run_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sync_runs SET heartbeat_at = NOW() WHERE id = $1 AND status = 'running'",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await
        .context("refreshing run heartbeat")?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_run(&self, run: &SyncRun) -> Result<bool> {
        let completed_at: DateTime<Utc> = run.completed_at.unwrap_or_else(Utc::now);
        let result = sqlx::query(
            r#"
            UPDATE sync_runs
               SET status = $2,
                   completed_at = $3,
                   heartbeat_at = $3,
                   rows_checked = $4,
                   rows_created = $5,
                   rows_skipped = $6,
                   media_uploaded = $7,
                   media_retry_queued = $8,
                   errors = $9
             WHERE id = $1
               AND status = 'running'
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(completed_at)
        .bind(i64::from(run.counters.rows_checked))
        .bind(i64::from(run.counters.rows_created))
        .bind(i64::from(run.counters.rows_skipped))
        .bind(i64::from(run.counters.media_uploaded))
        .bind(i64::from(run.counters.media_retry_queued))
        .bind(Json(run.errors.clone()))
        .execute(&self.pool)
        .await
        .context("finalizing sync run")?;
        Ok(result.rows_affected() == 1)
    }

    async fn recover_stale_runs(&self, stale_after: Duration) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await.context("opening stale recovery transaction")?;
        let recovered = fail_stale_runs(&mut *tx, stale_after).await?;
        tx.commit().await.context("committing stale recovery")?;
        Ok(recovered)
    }

    async fn current_run(&self) -> Result<Option<SyncRun>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs WHERE status = 'running' LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .context("loading current sync run")?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs ORDER BY started_at DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("loading sync history")?;
        rows.iter().map(run_from_row).collect()
    }

    async fn latest_finished(&self, status: RunStatus) -> Result<Option<SyncRun>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs \
              WHERE status = $1 AND completed_at IS NOT NULL \
              ORDER BY completed_at DESC \
              LIMIT 1"
        ))
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("loading latest finished run")?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn run_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM sync_runs")
            .fetch_one(&self.pool)
            .await
            .context("counting sync runs")?
            .try_get("n")?;
        Ok(count.max(0) as u64)
    }
}
