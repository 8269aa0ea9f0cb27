//! Adapters between the outside world and the sync engine: spreadsheet readers, form-row
//! validation, ingest keys and media transfer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod catalog;
mod key;
mod media;
mod sheet;
mod validate;

pub use catalog::Catalog;
pub use key::ingest_key;
pub use media::{
    image_extension, normalize_media_link, sniff_extension, FetchedMedia, HttpMediaFetcher, MediaError, MediaFetcher, MediaTransfer,
    MediaUploader, ObjectStoreUploader, DEFAULT_MAX_MEDIA_BYTES,
};
pub use sheet::{sheet_values_to_rows, FixtureSheetReader, RowStream, SheetValues, SheetValuesReader, SourceError, SourceReader};
pub use validate::{parse_submission_timestamp, FormRowValidator, ValidationError};

pub const CRATE_NAME: &str = "hrdesk-adapters";

/// Per-run context handed to every adapter call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
        }
    }
}
