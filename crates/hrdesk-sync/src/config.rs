use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use hrdesk_adapters::DEFAULT_MAX_MEDIA_BYTES;

use crate::orchestrator::OrchestratorSettings;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub source_url: Option<String>,
    pub source_fixture: Option<PathBuf>,
    pub source_token: Option<String>,
    pub catalog_path: PathBuf,
    pub media_dir: PathBuf,
    pub media_base_url: String,
    pub scheduler_enabled: bool,
    pub sync_interval_minutes: u64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_media_attempts: u32,
    pub retry_batch_limit: usize,
    pub media_concurrency: usize,
    pub stale_run_secs: u64,
    pub max_media_bytes: usize,
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: non_empty(&lookup, "DATABASE_URL"),
            source_url: non_empty(&lookup, "HRDESK_SOURCE_URL"),
            source_fixture: non_empty(&lookup, "HRDESK_SOURCE_FIXTURE").map(PathBuf::from),
            source_token: non_empty(&lookup, "HRDESK_SOURCE_TOKEN"),
            catalog_path: non_empty(&lookup, "HRDESK_CATALOG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./catalog.yaml")),
            media_dir: non_empty(&lookup, "HRDESK_MEDIA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./media")),
            media_base_url: non_empty(&lookup, "HRDESK_MEDIA_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8080/media".to_string()),
            scheduler_enabled: lookup("HRDESK_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_interval_minutes: parse_or(&lookup, "SYNC_INTERVAL_MINUTES", 15u64).max(1),
            user_agent: non_empty(&lookup, "HRDESK_USER_AGENT").unwrap_or_else(|| "hrdesk-sync/0.1".to_string()),
            http_timeout_secs: parse_or(&lookup, "HRDESK_HTTP_TIMEOUT_SECS", 20),
            max_media_attempts: parse_or(&lookup, "HRDESK_MAX_MEDIA_ATTEMPTS", 5u32).max(1),
            retry_batch_limit: parse_or(&lookup, "HRDESK_RETRY_BATCH_LIMIT", 20),
            media_concurrency: parse_or(&lookup, "HRDESK_MEDIA_CONCURRENCY", 4usize).max(1),
            stale_run_secs: parse_or(&lookup, "HRDESK_STALE_RUN_SECS", 1800),
            max_media_bytes: parse_or(&lookup, "HRDESK_MAX_MEDIA_BYTES", DEFAULT_MAX_MEDIA_BYTES),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_minutes * 60)
    }

    pub fn stale_run_after(&self) -> Duration {
        Duration::from_secs(self.stale_run_secs)
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_media_attempts: self.max_media_attempts,
            retry_batch_limit: self.retry_batch_limit,
            media_concurrency: self.media_concurrency,
            stale_run_after: self.stale_run_after(),
        }
    }
}
