use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use hrdesk_core::{IssueCandidate, SourceRow};
use thiserror::Error;
use tracing::warn;

use crate::catalog::Catalog;

const DATETIME_FORMATS: &[&str] = &[
    "%m/%d/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%d/%m/%Y %H:%M",
    "%Y-%m-%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%d/%m/%Y", "%Y-%m-%d"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("unknown hall `{0}`")]
    UnknownHall(String),
    #[error("unknown category `{0}`")]
    UnknownCategory(String),
}

/// Parses a form timestamp cell. Naive values are taken as UTC; a trailing ` GMT…` or
/// ` UTC…` zone label is ignored.
pub fn parse_submission_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let clean = raw.split(" GMT").next().unwrap_or(raw);
    let clean = clean.split(" UTC").next().unwrap_or(clean).trim();
    if clean.is_empty() {
        return None;
    }

    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(clean, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(clean, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
        }
    }
    DateTime::parse_from_rfc3339(clean)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Maps raw form-response rows to issue candidates.
#[derive(Debug, Clone, Default)]
pub struct FormRowValidator {
    catalog: Option<Catalog>,
}

impl FormRowValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(catalog: Catalog) -> Self {
        Self {
            catalog: Some(catalog),
        }
    }

    pub fn validate(&self, row: &SourceRow) -> Result<IssueCandidate, ValidationError> {
        let email = row.get("email");
        let hall = row.get("hall");
        let room_number = row.get("room number").or_else(|| row.get("room_number"));
        let category = row.get("category");

        let (Some(email), Some(hall), Some(room_number), Some(category)) = (email, hall, room_number, category)
        else {
            let missing = [
                ("email", email),
                ("hall", hall),
                ("room number", room_number),
                ("category", category),
            ]
            .into_iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| name)
            .collect();
            return Err(ValidationError::MissingFields(missing));
        };

        let (hall, category) = match &self.catalog {
            Some(catalog) => (catalog.resolve_hall(hall)?, catalog.resolve_category(category)?),
            None => (hall.to_string(), category.to_string()),
        };

        let raw_timestamp = row.get("timestamp").map(str::to_string);
        let submitted_at = raw_timestamp.as_deref().and_then(|raw| {
            let parsed = parse_submission_timestamp(raw);
            if parsed.is_none() {
                warn!(position = row.position, raw, "unparseable submission timestamp, keeping raw value");
            }
            parsed
        });

        Ok(IssueCandidate {
            source_position: row.position,
            submitted_at,
            raw_timestamp,
            submitter_email: email.to_string(),
            submitter_name: row.get("name").map(str::to_string),
            hall,
            room_number: room_number.to_string(),
            category,
            description: row.get("description").or_else(|| row.get("describe")).map(str::to_string),
            // multi-file uploads arrive comma separated; the first file is the issue photo
            media_reference: row
                .get("image")
                .and_then(|cell| cell.split(',').map(str::trim).find(|link| !link.is_empty()))
                .map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    const HEADERS: [&str; 8] = [
        "Timestamp",
        "Email Address",
        "Name",
        "Hall",
        "Room Number",
        "Category",
        "Describe the Issue",
        "Image",
    ];

    fn row(values: [&str; 8]) -> SourceRow {
        SourceRow::new(
            4,
            HEADERS
                .iter()
                .zip(values)
                .map(|(h, v)| (h.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn timestamp_formats_follow_documented_order() {
        let us = parse_submission_timestamp("11/24/2025 19:22:00").unwrap();
        assert_eq!((us.month(), us.day()), (11, 24));
        // ambiguous day/month resolves US-first
        let ambiguous = parse_submission_timestamp("03/04/2025 08:00:00").unwrap();
        assert_eq!((ambiguous.month(), ambiguous.day()), (3, 4));
        let eu = parse_submission_timestamp("24/11/2025 19:22").unwrap();
        assert_eq!((eu.month(), eu.day()), (11, 24));
        assert!(parse_submission_timestamp("2025-11-24").is_some());
        assert!(parse_submission_timestamp("11/24/2025 19:22:00 GMT+01:00").is_some());
        assert!(parse_submission_timestamp("2025-11-24T19:22:00+01:00").is_some());
        assert!(parse_submission_timestamp("yesterday").is_none());
    }

    #[test]
    fn valid_row_maps_every_field() {
        let candidate = FormRowValidator::new()
            .validate(&row([
                "11/24/2025 19:22:00",
                "Student@Example.com",
                "Ada",
                "Levi",
                "A205",
                "Plumbing",
                "Leaking pipe",
                "https://drive.google.com/open?id=abc, https://drive.google.com/open?id=def",
            ]))
            .unwrap();
        assert_eq!(candidate.source_position, 4);
        assert_eq!(candidate.submitter_email, "Student@Example.com");
        assert_eq!(candidate.submitter_name.as_deref(), Some("Ada"));
        assert_eq!(candidate.room_number, "A205");
        assert_eq!(candidate.description.as_deref(), Some("Leaking pipe"));
        assert_eq!(
            candidate.media_reference.as_deref(),
            Some("https://drive.google.com/open?id=abc")
        );
        assert!(candidate.submitted_at.is_some());
    }

    #[test]
    fn missing_required_fields_are_listed() {
        let err = FormRowValidator::new()
            .validate(&row(["", "a@x.io", "", "", "A1", "", "", ""]))
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingFields(vec!["hall", "category"]));
        assert_eq!(err.to_string(), "missing required fields: hall, category");
    }

    #[test]
    fn unparseable_timestamp_is_kept_raw() {
        let candidate = FormRowValidator::new()
            .validate(&row(["sometime", "a@x.io", "", "Levi", "A1", "Other", "", ""]))
            .unwrap();
        assert_eq!(candidate.submitted_at, None);
        assert_eq!(candidate.raw_timestamp.as_deref(), Some("sometime"));
        assert_eq!(candidate.media_reference, None);
        assert_eq!(candidate.submitter_name, None);
    }

    #[test]
    fn catalog_rejects_unknown_hall() {
        let validator = FormRowValidator::with_catalog(Catalog {
            halls: vec!["Levi".into()],
            categories: vec![],
        });
        let err = validator
            .validate(&row(["", "a@x.io", "", "Mars", "A1", "Plumbing", "", ""]))
            .unwrap_err();
        assert_eq!(err, ValidationError::UnknownHall("Mars".into()));
    }
}
