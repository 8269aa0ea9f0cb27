use hrdesk_core::{IngestKey, IssueCandidate};
use hrdesk_storage::sha256_hex;

fn normalized(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Idempotency key for one form submission: submitter email plus submission time, or the
/// submitted content when the row carries no timestamp. The source position never contributes.
pub fn ingest_key(candidate: &IssueCandidate) -> IngestKey {
    let email = normalized(&candidate.submitter_email);
    let stamp = candidate
        .submitted_at
        .map(|ts| ts.to_rfc3339())
        .or_else(|| candidate.raw_timestamp.as_deref().map(|raw| raw.trim().to_string()));

    match stamp {
        Some(stamp) => IngestKey::new(format!(
            "v1:{}",
            sha256_hex(format!("{email}|{stamp}").as_bytes())
        )),
        None => {
            let content = [
                email,
                normalized(&candidate.hall),
                normalized(&candidate.room_number),
                normalized(&candidate.category),
                normalized(candidate.description.as_deref().unwrap_or_default()),
            ]
            .join("|");
            IngestKey::new(format!("v1c:{}", sha256_hex(content.as_bytes())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candidate(position: u64, email: &str) -> IssueCandidate {
        IssueCandidate {
            source_position: position,
            submitted_at: Some(Utc.with_ymd_and_hms(2025, 11, 24, 19, 22, 0).unwrap()),
            raw_timestamp: Some("11/24/2025 19:22:00".into()),
            submitter_email: email.into(),
            submitter_name: None,
            hall: "Levi".into(),
            room_number: "A205".into(),
            category: "Plumbing".into(),
            description: Some("Leaking pipe".into()),
            media_reference: None,
        }
    }

    #[test]
    fn key_ignores_position_and_email_case() {
        let a = ingest_key(&candidate(1, "Student@Example.com"));
        let b = ingest_key(&candidate(9, " student@example.com "));
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("v1:"));
    }

    #[test]
    fn different_submission_times_differ() {
        let a = candidate(1, "a@x.io");
        let mut b = a.clone();
        b.submitted_at = Some(Utc.with_ymd_and_hms(2025, 11, 24, 19, 23, 0).unwrap());
        assert_ne!(ingest_key(&a), ingest_key(&b));
    }

    #[test]
    fn raw_timestamp_is_used_when_unparsed() {
        let mut a = candidate(1, "a@x.io");
        a.submitted_at = None;
        a.raw_timestamp = Some("sometime".into());
        let mut b = a.clone();
        b.raw_timestamp = Some("  sometime ".into());
        assert_eq!(ingest_key(&a), ingest_key(&b));
    }

    #[test]
    fn rows_without_timestamp_key_by_content() {
        let mut a = candidate(1, "a@x.io");
        a.submitted_at = None;
        a.raw_timestamp = None;
        let mut b = a.clone();
        b.source_position = 2;
        b.hall = "LEVI".into();
        assert_eq!(ingest_key(&a), ingest_key(&b));
        assert!(ingest_key(&a).as_str().starts_with("v1c:"));

        b.room_number = "B1".into();
        assert_ne!(ingest_key(&a), ingest_key(&b));
    }
}
