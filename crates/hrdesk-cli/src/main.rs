use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hrdesk_core::RunStatus;
use hrdesk_storage::{PgStore, RetryLedger};
use hrdesk_sync::{StatusStore, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hrdesk")]
#[command(about = "Hall repair desk: sheet-to-issue sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one manual sync and print its summary.
    Sync,
    /// Serve the HTTP API (and the scheduler when enabled).
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Print the sync status document as JSON.
    Status {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Make parked media uploads eligible for the next run.
    RequeueMedia,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hrdesk=info,warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Admin commands never fall back to the in-memory store.
fn database_url(config: &SyncConfig, command: &str) -> Result<String> {
    config
        .database_url
        .clone()
        .with_context(|| format!("DATABASE_URL is required for {command}"))
}

async fn connect_database(command: &str) -> Result<PgStore> {
    let url = database_url(&SyncConfig::from_env(), command)?;
    let store = PgStore::connect(&url).await?;
    store.migrate().await?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = hrdesk_sync::run_sync_once_from_env().await?;
            println!(
                "sync {}: run_id={} checked={} created={} skipped={} media_uploaded={} media_retry_queued={}",
                summary.status,
                summary.id,
                summary.rows_processed,
                summary.rows_created,
                summary.rows_skipped,
                summary.media_uploaded,
                summary.media_retry_queued
            );
            for error in &summary.errors {
                println!("  - {error}");
            }
            if summary.status == RunStatus::Failed {
                std::process::exit(1);
            }
        }
        Commands::Serve => hrdesk_web::serve_from_env().await?,
        Commands::Migrate => {
            let url = database_url(&SyncConfig::from_env(), "migrate")?;
            PgStore::connect(&url).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Status { limit } => {
            let store = connect_database("status").await?;
            let snapshot = StatusStore::new(Arc::new(store)).snapshot(limit.clamp(1, 100)).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::RequeueMedia => {
            let store = connect_database("requeue-media").await?;
            let requeued = store.requeue_parked().await?;
            println!("requeued {requeued} parked media upload(s)");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_commands_require_a_database() {
        let config = SyncConfig::from_lookup(|_| None);
        for command in ["migrate", "status", "requeue-media"] {
            let err = database_url(&config, command).unwrap_err();
            assert_eq!(err.to_string(), format!("DATABASE_URL is required for {command}"));
        }
    }

    #[test]
    fn configured_database_url_is_used() {
        let config = SyncConfig::from_lookup(|key| {
            (key == "DATABASE_URL").then(|| "postgres://hrdesk@localhost/hrdesk".to_string())
        });
        assert_eq!(
            database_url(&config, "status").unwrap(),
            "postgres://hrdesk@localhost/hrdesk"
        );
    }
}
