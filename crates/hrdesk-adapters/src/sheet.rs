use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use hrdesk_core::{HighWaterMark, SourceRow};
use hrdesk_storage::{FetchRequest, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use crate::AdapterContext;

/// Whole-run source failures. Either one fails the run without moving the mark.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("malformed source data: {0}")]
    Malformed(String),
}

pub type RowStream = BoxStream<'static, Result<SourceRow, SourceError>>;

#[async_trait]
pub trait SourceReader: Send + Sync {
    fn source_id(&self) -> &str;

    /// Rows strictly after `mark`, in position order. The stream is finite.
    async fn read_since(&self, ctx: &AdapterContext, mark: HighWaterMark) -> Result<RowStream, SourceError>;
}

/// Spreadsheet "values" payload: the first row is the header row.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SheetValues {
    #[serde(default)]
    pub values: Vec<Vec<JsonValue>>,
}

impl SheetValues {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SourceError> {
        serde_json::from_slice(bytes).map_err(|err| SourceError::Malformed(format!("sheet values payload: {err}")))
    }
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Pairs each data row with the header row. Short rows are padded with blank cells and blank
/// rows are dropped; cells past the header width are ignored.
///
/// Positions are 1-based; rows at or before `mark` are not returned.
pub fn sheet_values_to_rows(values: SheetValues, mark: HighWaterMark) -> Result<Vec<SourceRow>, SourceError> {
    let mut rows = values.values.into_iter();
    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };
    let headers: Vec<String> = header.iter().map(|h| cell_text(h).trim().to_string()).collect();
    if headers.iter().all(String::is_empty) {
        return Err(SourceError::Malformed("header row is empty".to_string()));
    }

    let mut out = Vec::new();
    for (idx, row) in rows.enumerate() {
        let position = idx as u64 + 1;
        if mark.covers(position) {
            continue;
        }
        let cells: Vec<(String, String)> = headers
            .iter()
            .enumerate()
            .map(|(col, header)| (header.clone(), row.get(col).map(cell_text).unwrap_or_default()))
            .collect();
        if cells.iter().all(|(_, value)| value.trim().is_empty()) {
            continue;
        }
        out.push(SourceRow::new(position, cells));
    }
    Ok(out)
}

fn into_stream(rows: Vec<SourceRow>) -> RowStream {
    stream::iter(rows.into_iter().map(Ok)).boxed()
}

/// Reads the form-response sheet over HTTP (a `values` endpoint returning [`SheetValues`]).
#[derive(Debug, Clone)]
pub struct SheetValuesReader {
    http: Arc<HttpFetcher>,
    url: String,
    token: Option<String>,
}

impl SheetValuesReader {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl SourceReader for SheetValuesReader {
    fn source_id(&self) -> &str {
        &self.url
    }

    async fn read_since(&self, ctx: &AdapterContext, mark: HighWaterMark) -> Result<RowStream, SourceError> {
        let response = self
            .http
            .get(ctx.run_id, FetchRequest::get(&self.url).bearer(self.token.as_deref()))
            .await
            .map_err(|err| SourceError::Unavailable(err.to_string()))?;
        let rows = sheet_values_to_rows(SheetValues::from_slice(&response.bytes)?, mark)?;
        debug!(run_id = %ctx.run_id, mark = mark.position(), rows = rows.len(), "read sheet values");
        Ok(into_stream(rows))
    }
}

/// Reads the same payload shape from a JSON file on disk.
#[derive(Debug, Clone)]
pub struct FixtureSheetReader {
    path: PathBuf,
}

impl FixtureSheetReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SourceReader for FixtureSheetReader {
    fn source_id(&self) -> &str {
        self.path.to_str().unwrap_or("fixture")
    }

    async fn read_since(&self, ctx: &AdapterContext, mark: HighWaterMark) -> Result<RowStream, SourceError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|err| SourceError::Unavailable(format!("reading {}: {err}", self.path.display())))?;
        let rows = sheet_values_to_rows(SheetValues::from_slice(&bytes)?, mark)?;
        debug!(run_id = %ctx.run_id, path = %self.path.display(), rows = rows.len(), "read fixture sheet");
        Ok(into_stream(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(v: JsonValue) -> SheetValues {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn header_only_and_empty_sheets_yield_no_rows() {
        assert!(sheet_values_to_rows(values(json!({})), HighWaterMark(0)).unwrap().is_empty());
        let header_only = values(json!({"values": [["Timestamp", "Email Address"]]}));
        assert!(sheet_values_to_rows(header_only, HighWaterMark(0)).unwrap().is_empty());
    }

    #[test]
    fn rows_are_positioned_padded_and_filtered_by_mark() {
        let sheet = values(json!({"values": [
            ["Timestamp", "Email Address", "Hall"],
            ["11/24/2025 19:22:00", "a@x.io", "Levi"],
            [],
            ["11/24/2025 19:30:00", "b@x.io"],
        ]}));
        let rows = sheet_values_to_rows(sheet.clone(), HighWaterMark(0)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].position, 1);
        assert_eq!(rows[1].position, 3);
        assert_eq!(rows[1].get("hall"), None);

        let later = sheet_values_to_rows(sheet, HighWaterMark(1)).unwrap();
        assert_eq!(later.iter().map(|r| r.position).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn numeric_cells_are_read_as_text() {
        let sheet = values(json!({"values": [["Room Number"], [205]]}));
        let rows = sheet_values_to_rows(sheet, HighWaterMark(0)).unwrap();
        assert_eq!(rows[0].get("room number"), Some("205"));
    }

    #[test]
    fn blank_header_row_is_malformed() {
        let blank = values(json!({"values": [["", " "], ["a", "b"]]}));
        assert!(matches!(
            sheet_values_to_rows(blank, HighWaterMark(0)),
            Err(SourceError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn fixture_reader_reports_missing_file_as_unavailable() {
        let reader = FixtureSheetReader::new("/definitely/not/here.json");
        let ctx = AdapterContext::new(uuid::Uuid::new_v4());
        let err = reader.read_since(&ctx, HighWaterMark(0)).await.err().unwrap();
        assert!(matches!(err, SourceError::Unavailable(_)));
    }
}
