use std::path::PathBuf;

use futures::TryStreamExt;
use hrdesk_adapters::{
    ingest_key, AdapterContext, Catalog, FixtureSheetReader, FormRowValidator, SourceReader, ValidationError,
};
use hrdesk_core::{HighWaterMark, SourceRow};
use uuid::Uuid;

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

async fn read_rows(mark: u64) -> Vec<SourceRow> {
    let reader = FixtureSheetReader::new(workspace_root().join("fixtures/sheet/sample.json"));
    let ctx = AdapterContext::new(Uuid::new_v4());
    reader
        .read_since(&ctx, HighWaterMark(mark))
        .await
        .expect("open fixture")
        .try_collect()
        .await
        .expect("read fixture rows")
}

#[tokio::test]
async fn fixture_sheet_rows_skip_blank_lines() {
    let rows = read_rows(0).await;
    let positions: Vec<u64> = rows.iter().map(|r| r.position).collect();
    assert_eq!(positions, vec![1, 2, 3, 5]);

    let resumed = read_rows(2).await;
    let positions: Vec<u64> = resumed.iter().map(|r| r.position).collect();
    assert_eq!(positions, vec![3, 5]);
}

#[tokio::test]
async fn fixture_sheet_validates_against_checked_in_catalog() {
    let catalog = Catalog::load(workspace_root().join("catalog.yaml")).expect("catalog");
    let validator = FormRowValidator::with_catalog(catalog);
    let rows = read_rows(0).await;

    let results: Vec<_> = rows.iter().map(|row| validator.validate(row)).collect();

    let first = results[0].as_ref().expect("row 1 valid");
    assert_eq!(first.hall, "Levi");
    assert!(first.media_reference.is_some());

    let second = results[1].as_ref().expect("row 2 valid");
    assert_eq!(second.category, "Electrical");
    assert_eq!(second.media_reference, None);

    assert_eq!(
        results[2].as_ref().unwrap_err(),
        &ValidationError::MissingFields(vec!["room number"])
    );

    let fifth = results[3].as_ref().expect("row 5 valid");
    assert!(fifth.submitted_at.is_some());
    assert_eq!(fifth.description, None);

    let keys: std::collections::HashSet<_> = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(ingest_key)
        .collect();
    assert_eq!(keys.len(), 3);
}
