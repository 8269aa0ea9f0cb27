//! Axum JSON API over the sync engine: manual trigger, status polling and read-only issue access.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hrdesk_core::{AuditEntry, IssueRecord, SyncRunSummary, TriggerKind};
use hrdesk_storage::{IssueRepository, RetryLedger};
use hrdesk_sync::{RunWait, SyncConfig, SyncEngine, TriggerError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hrdesk-web";

const DEFAULT_STATUS_LIMIT: usize = 10;
const MAX_STATUS_LIMIT: usize = 100;
const DEFAULT_ISSUE_LIMIT: usize = 50;
const MAX_ISSUE_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub engine: SyncEngine,
    /// How long `POST /sync` waits before answering `202 accepted`.
    pub respond_within: Duration,
}

impl AppState {
    pub fn new(engine: SyncEngine, respond_within: Duration) -> Self {
        Self {
            engine,
            respond_within,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn clamped(&self, default: usize, max: usize) -> usize {
        self.limit.unwrap_or(default).clamp(1, max)
    }
}

/// Body of `POST /sync` when the run finished or is still in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub status: String,
    pub run_id: Uuid,
    pub rows_checked: u32,
    pub rows_created: u32,
    pub rows_skipped: u32,
    pub media_uploaded: u32,
    pub media_retry_queued: u32,
    pub errors: Vec<String>,
    /// Last committed sheet position when the response was built.
    pub high_water_mark: u64,
}

impl TriggerResponse {
    fn completed(summary: SyncRunSummary, high_water_mark: u64) -> Self {
        Self {
            status: summary.status.to_string(),
            run_id: summary.id,
            rows_checked: summary.rows_processed,
            rows_created: summary.rows_created,
            rows_skipped: summary.rows_skipped,
            media_uploaded: summary.media_uploaded,
            media_retry_queued: summary.media_retry_queued,
            errors: summary.errors,
            high_water_mark,
        }
    }

    fn accepted(run_id: Uuid, high_water_mark: u64) -> Self {
        Self {
            status: "accepted".into(),
            run_id,
            rows_checked: 0,
            rows_created: 0,
            rows_skipped: 0,
            media_uploaded: 0,
            media_retry_queued: 0,
            errors: Vec::new(),
            high_water_mark,
        }
    }
}

#[derive(Debug, Serialize)]
struct IssueDetail {
    issue: IssueRecord,
    audit: Vec<AuditEntry>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/sync", post(trigger_handler))
        .route("/sync/status", get(status_handler))
        .route("/sync/media/requeue", post(requeue_handler))
        .route("/issues", get(issues_handler))
        .route("/issues/{id}", get(issue_detail_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("HRDESK_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let respond_within = std::env::var("HRDESK_RESPOND_WITHIN_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(20));

    let engine = SyncEngine::from_config(SyncConfig::from_env()).await?;
    engine.orchestrator.recover_stale_runs().await?;
    let scheduler = engine.maybe_build_scheduler().await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, scheduler = scheduler.is_some(), "hrdesk web listening");
    axum::serve(listener, app(AppState::new(engine, respond_within))).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    let handle = match state.engine.orchestrator.start(TriggerKind::Manual).await {
        Ok(handle) => handle,
        Err(TriggerError::AlreadyRunning { current }) => {
            return (
                StatusCode::CONFLICT,
                Json(json!({ "status": "already_running", "current_sync": current })),
            )
                .into_response()
        }
        Err(TriggerError::Store(err)) => return server_error(err),
    };

    let waited = match handle.wait_for(state.respond_within).await {
        Ok(waited) => waited,
        Err(err) => return server_error(err),
    };
    let mark = match state.engine.status.high_water_mark().await {
        Ok(mark) => mark,
        Err(err) => return server_error(err),
    };
    match waited {
        RunWait::Finished(summary) => (StatusCode::OK, Json(TriggerResponse::completed(summary, mark))).into_response(),
        RunWait::StillRunning { run_id } => {
            (StatusCode::ACCEPTED, Json(TriggerResponse::accepted(run_id, mark))).into_response()
        }
    }
}

async fn status_handler(State(state): State<Arc<AppState>>, Query(query): Query<LimitQuery>) -> Response {
    let limit = query.clamped(DEFAULT_STATUS_LIMIT, MAX_STATUS_LIMIT);
    match state.engine.status.snapshot(limit).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => server_error(err),
    }
}

async fn requeue_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.store.requeue_parked().await {
        Ok(requeued) => {
            info!(requeued, "parked media requeued");
            Json(json!({ "requeued": requeued })).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn issues_handler(State(state): State<Arc<AppState>>, Query(query): Query<LimitQuery>) -> Response {
    let limit = query.clamped(DEFAULT_ISSUE_LIMIT, MAX_ISSUE_LIMIT);
    match state.engine.store.list_issues(limit).await {
        Ok(issues) => Json(issues).into_response(),
        Err(err) => server_error(err),
    }
}

async fn issue_detail_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    let store = &state.engine.store;
    let issue = match store.get_issue(id).await {
        Ok(Some(issue)) => issue,
        Ok(None) => return (StatusCode::NOT_FOUND, Json(json!({ "error": "issue not found" }))).into_response(),
        Err(err) => return server_error(err),
    };
    match store.audit_entries(id).await {
        Ok(audit) => Json(IssueDetail { issue, audit }).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    let message = format!("{err:#}");
    error!(error = %message, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use async_trait::async_trait;
    use axum::body::Body;
    use hrdesk_adapters::{
        AdapterContext, FetchedMedia, FixtureSheetReader, FormRowValidator, MediaError, MediaFetcher, MediaTransfer,
        ObjectStoreUploader, RowStream, SourceError, SourceReader,
    };
    use hrdesk_core::HighWaterMark;
    use hrdesk_storage::{MemoryStore, ObjectStore, RunAcquisition, RunLedger, SyncStore};
    use hrdesk_sync::{OrchestratorSettings, StatusStore, SyncOrchestrator};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct OfflineFetcher;

    #[async_trait]
    impl MediaFetcher for OfflineFetcher {
        async fn fetch(&self, _ctx: &AdapterContext, reference: &str) -> Result<FetchedMedia, MediaError> {
            Err(MediaError::Transient(format!("offline: {reference}")))
        }
    }

    /// Source whose read never completes, keeping the run in flight.
    struct StalledSource;

    #[async_trait]
    impl SourceReader for StalledSource {
        fn source_id(&self) -> &str {
            "stalled"
        }

        async fn read_since(&self, _ctx: &AdapterContext, _mark: HighWaterMark) -> Result<RowStream, SourceError> {
            std::future::pending().await
        }
    }

    fn fixture_path() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sheet/sample.json")
    }

    fn catalog_path() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../catalog.yaml")
    }

    struct TestApp {
        router: Router,
        store: Arc<MemoryStore>,
        _media_dir: TempDir,
    }

    fn test_app(source: Arc<dyn SourceReader>, respond_within: Duration) -> TestApp {
        let store = Arc::new(MemoryStore::new());
        let media_dir = tempfile::tempdir().unwrap();
        let catalog = hrdesk_adapters::Catalog::load(catalog_path()).unwrap();
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            source,
            FormRowValidator::with_catalog(catalog),
            MediaTransfer::new(
                Arc::new(OfflineFetcher),
                Arc::new(ObjectStoreUploader::new(
                    ObjectStore::new(media_dir.path()),
                    "https://media.example",
                )),
            ),
            OrchestratorSettings::default(),
        ));
        let dyn_store: Arc<dyn SyncStore> = store.clone();
        let engine = SyncEngine {
            config: SyncConfig::from_lookup(|_| None),
            status: StatusStore::new(dyn_store.clone()),
            store: dyn_store,
            orchestrator,
        };
        TestApp {
            router: app(AppState::new(engine, respond_within)),
            store,
            _media_dir: media_dir,
        }
    }

    fn fixture_app() -> TestApp {
        test_app(Arc::new(FixtureSheetReader::new(fixture_path())), Duration::from_secs(20))
    }

    async fn send(router: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let resp = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let app = fixture_app();
        let resp = app
            .router
            .oneshot(axum::http::Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn manual_trigger_reports_completed_run() {
        let app = fixture_app();
        let (status, body) = send(&app.router, "POST", "/sync").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["rows_checked"], 4);
        assert_eq!(body["rows_created"], 3);
        assert_eq!(body["rows_skipped"], 1);
        assert_eq!(body["media_uploaded"], 0);
        assert_eq!(body["media_retry_queued"], 2);
        assert_eq!(body["high_water_mark"], 5);

        let (status, again) = send(&app.router, "POST", "/sync").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["rows_checked"], 0);
        assert_eq!(again["rows_created"], 0);
        assert_eq!(again["high_water_mark"], 5);
    }

    #[tokio::test]
    async fn trigger_while_running_is_rejected_with_current_run() {
        let app = fixture_app();
        let RunAcquisition::Started(running) = app
            .store
            .begin_run(TriggerKind::Scheduled, Duration::from_secs(1800))
            .await
            .unwrap()
        else {
            panic!("lock should be free");
        };

        let (status, body) = send(&app.router, "POST", "/sync").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], "already_running");
        assert_eq!(body["current_sync"]["id"], running.id.to_string());
        assert_eq!(body["current_sync"]["trigger_kind"], "scheduled");
    }

    #[tokio::test]
    async fn slow_run_is_accepted_and_visible_in_status() {
        let app = test_app(Arc::new(StalledSource), Duration::from_millis(50));
        let (status, body) = send(&app.router, "POST", "/sync").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["rows_checked"], 0);
        assert_eq!(body["high_water_mark"], 0);

        let (status, snapshot) = send(&app.router, "GET", "/sync/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["current_sync"]["id"], body["run_id"]);
        assert_eq!(snapshot["current_sync"]["status"], "running");
        assert_eq!(snapshot["health"], "unknown");
    }

    #[tokio::test]
    async fn status_lists_history_and_pending_media() {
        let app = fixture_app();
        send(&app.router, "POST", "/sync").await;
        send(&app.router, "POST", "/sync").await;

        let (status, snapshot) = send(&app.router, "GET", "/sync/status?limit=1").await;
        assert_eq!(status, StatusCode::OK);
        assert!(snapshot["current_sync"].is_null());
        assert_eq!(snapshot["recent_syncs"].as_array().unwrap().len(), 1);
        assert_eq!(snapshot["last_successful_sync"]["id"], snapshot["recent_syncs"][0]["id"]);
        assert_eq!(snapshot["pending_media_retries"], 2);
        assert_eq!(snapshot["health"], "healthy");
        assert_eq!(snapshot["total_runs"], 2);
        assert_eq!(snapshot["high_water_mark"], 5);

        let (_, all) = send(&app.router, "GET", "/sync/status?limit=1000").await;
        assert_eq!(all["recent_syncs"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn requeue_reports_count() {
        let app = fixture_app();
        let (status, body) = send(&app.router, "POST", "/sync/media/requeue").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["requeued"], 0);
    }

    #[tokio::test]
    async fn issues_are_listed_and_fetched_with_audit() {
        let app = fixture_app();
        send(&app.router, "POST", "/sync").await;

        let (status, issues) = send(&app.router, "GET", "/issues?limit=2").await;
        assert_eq!(status, StatusCode::OK);
        let issues = issues.as_array().unwrap();
        assert_eq!(issues.len(), 2);

        let id = issues[0]["id"].as_str().unwrap();
        let (status, detail) = send(&app.router, "GET", &format!("/issues/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["issue"]["id"], id);
        assert_eq!(detail["audit"][0]["action"], "created");

        let (status, _) = send(&app.router, "GET", &format!("/issues/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
