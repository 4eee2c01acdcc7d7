//! Token validity policy
//!
//! Upstox access tokens lapse at the exchange-session boundary, 03:00 local
//! time, not after a rolling duration. A token generated before 03:00 is
//! good until 03:00 the same day; anything later is good until 03:00 the
//! next day. Tokens from before the boundary field was introduced fall back
//! to a 24-hour rule.

use chrono::{Duration, NaiveDateTime, NaiveTime};

use super::TokenRecord;

/// Wall-clock time at which the previous session's tokens lapse.
fn session_boundary() -> NaiveTime {
    NaiveTime::from_hms_opt(3, 0, 0).expect("03:00 is a valid wall-clock time")
}

/// Expiry timestamp for a token generated at `generated_at`.
pub fn calculate_validity(generated_at: NaiveDateTime) -> NaiveDateTime {
    let boundary = generated_at.date().and_time(session_boundary());
    if generated_at < boundary {
        boundary
    } else {
        boundary + Duration::days(1)
    }
}

/// Strict validity predicate: valid iff `now` is before the stored
/// `validity_at`. Records without `validity_at` use the legacy rule
/// (generated less than 24 hours ago). Records with neither timestamp
/// parseable are reported invalid.
pub fn is_valid(record: &TokenRecord, now: NaiveDateTime) -> bool {
    if let Some(validity) = record.validity_time() {
        return now < validity;
    }
    match record.generated_time() {
        Some(generated) => now - generated < Duration::hours(24),
        None => false,
    }
}

/// Detailed validity status for reporting.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenStatus {
    Valid {
        expires_at: NaiveDateTime,
        remaining: Duration,
    },
    Expired {
        expired_at: NaiveDateTime,
        since: Duration,
    },
    Unknown {
        reason: &'static str,
    },
}

/// Classify a record against `now`, with remaining/elapsed durations for
/// the status report.
pub fn status_detail(record: &TokenRecord, now: NaiveDateTime) -> TokenStatus {
    let expires_at = match record.validity_time() {
        Some(t) => t,
        None => {
            return TokenStatus::Unknown {
                reason: "no validity information",
            }
        }
    };

    if now < expires_at {
        TokenStatus::Valid {
            expires_at,
            remaining: expires_at - now,
        }
    } else {
        TokenStatus::Expired {
            expired_at: expires_at,
            since: now - expires_at,
        }
    }
}

/// Duration as whole hours with two decimals, for the status report.
pub fn hours(d: Duration) -> f64 {
    (d.num_seconds() as f64 / 3600.0 * 100.0).round() / 100.0
}

/// Duration as `H:MM:SS`.
pub fn human_duration(d: Duration) -> String {
    let secs = d.num_seconds().max(0);
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::format_timestamp;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap()
    }

    fn record(generated_at: Option<&str>, validity_at: Option<&str>) -> TokenRecord {
        TokenRecord {
            access_token: "tok".into(),
            api_key: "key".into(),
            generated_at: generated_at.map(str::to_string),
            validity_at: validity_at.map(str::to_string),
            status: "active".into(),
            extra: Default::default(),
        }
    }

    #[test]
    fn test_before_boundary_expires_same_day() {
        assert_eq!(
            calculate_validity(ts("2024-05-01T01:30:00")),
            ts("2024-05-01T03:00:00")
        );
    }

    #[test]
    fn test_after_boundary_expires_next_day() {
        assert_eq!(
            calculate_validity(ts("2024-05-01T10:00:00")),
            ts("2024-05-02T03:00:00")
        );
    }

    #[test]
    fn test_exactly_at_boundary_expires_next_day() {
        assert_eq!(
            calculate_validity(ts("2024-05-01T03:00:00")),
            ts("2024-05-02T03:00:00")
        );
    }

    #[test]
    fn test_is_valid_strict_at_breakpoint() {
        let rec = record(
            Some("2024-05-01T10:00:00"),
            Some("2024-05-02T03:00:00"),
        );
        assert!(is_valid(&rec, ts("2024-05-02T02:59:59")));
        // Never valid at or after validity_at.
        assert!(!is_valid(&rec, ts("2024-05-02T03:00:00")));
        assert!(!is_valid(&rec, ts("2024-05-02T03:00:01")));
    }

    #[test]
    fn test_legacy_rule_without_validity_at() {
        let rec = record(Some("2024-05-01T10:00:00"), None);
        assert!(is_valid(&rec, ts("2024-05-02T09:59:59")));
        assert!(!is_valid(&rec, ts("2024-05-02T10:00:00")));
    }

    #[test]
    fn test_validity_at_wins_over_legacy() {
        // Generated 1 hour ago (legacy-valid) but past its boundary.
        let rec = record(
            Some("2024-05-02T02:00:00"),
            Some("2024-05-02T03:00:00"),
        );
        assert!(!is_valid(&rec, ts("2024-05-02T03:00:00")));
    }

    #[test]
    fn test_unparsable_timestamps_invalid() {
        let rec = record(Some("garbage"), None);
        assert!(!is_valid(&rec, ts("2024-05-01T10:00:00")));
    }

    #[test]
    fn test_status_detail_valid() {
        let rec = record(
            Some("2024-05-01T10:00:00"),
            Some("2024-05-02T03:00:00"),
        );
        match status_detail(&rec, ts("2024-05-01T21:00:00")) {
            TokenStatus::Valid {
                expires_at,
                remaining,
            } => {
                assert_eq!(expires_at, ts("2024-05-02T03:00:00"));
                assert_eq!(remaining, Duration::hours(6));
                assert_eq!(hours(remaining), 6.0);
                assert_eq!(human_duration(remaining), "6:00:00");
            }
            other => panic!("expected valid, got {:?}", other),
        }
    }

    #[test]
    fn test_status_detail_expired() {
        let rec = record(
            Some("2024-05-01T10:00:00"),
            Some("2024-05-02T03:00:00"),
        );
        match status_detail(&rec, ts("2024-05-02T04:30:00")) {
            TokenStatus::Expired { expired_at, since } => {
                assert_eq!(expired_at, ts("2024-05-02T03:00:00"));
                assert_eq!(since, Duration::minutes(90));
                assert_eq!(hours(since), 1.5);
                assert_eq!(human_duration(since), "1:30:00");
            }
            other => panic!("expected expired, got {:?}", other),
        }
    }

    #[test]
    fn test_issue_invariant() {
        let now = ts("2024-05-01T10:00:00");
        let rec = TokenRecord::issue("tok".into(), "key".into(), now);
        assert_eq!(rec.generated_at.as_deref(), Some(format_timestamp(now).as_str()));
        assert_eq!(rec.validity_time(), Some(calculate_validity(now)));
        assert_eq!(rec.status, "active");
    }
}
