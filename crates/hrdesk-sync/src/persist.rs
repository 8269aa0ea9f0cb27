use std::sync::Arc;

use anyhow::{Context, Result};
use hrdesk_core::{IngestKey, IssueCandidate, PersistOutcome};
use hrdesk_storage::SyncStore;
use tracing::debug;

/// Conditional issue creation keyed by [`IngestKey`].
#[derive(Clone)]
pub struct RecordPersister {
    store: Arc<dyn SyncStore>,
}

impl RecordPersister {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    pub async fn persist(&self, candidate: &IssueCandidate, key: &IngestKey) -> Result<PersistOutcome> {
        let outcome = self
            .store
            .insert_issue_if_absent(key, candidate)
            .await
            .with_context(|| format!("persisting issue for ingest key {key}"))?;
        match &outcome {
            PersistOutcome::Created(issue) => {
                debug!(issue_id = %issue.id, position = candidate.source_position, "issue created")
            }
            PersistOutcome::Skipped { existing_id } => {
                debug!(%existing_id, position = candidate.source_position, "row already ingested")
            }
        }
        Ok(outcome)
    }
}
