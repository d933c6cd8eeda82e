use chrono::{DateTime, TimeZone, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Message and task timestamps are unix milliseconds throughout.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Parse an RFC 3339 timestamp into unix milliseconds.
pub fn parse_rfc3339_millis(raw: &str) -> Result<i64, String> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.timestamp_millis())
        .map_err(|err| format!("invalid RFC 3339 timestamp `{raw}`: {err}"))
}

pub fn format_rfc3339(millis: i64) -> String {
    millis_to_datetime(millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_round_trip_preserves_instant() {
        let millis = 1_735_689_600_000; // 2025-01-01T00:00:00Z
        let rendered = format_rfc3339(millis);
        assert_eq!(parse_rfc3339_millis(&rendered).expect("parse"), millis);
    }

    #[test]
    fn rfc3339_parse_rejects_garbage() {
        assert!(parse_rfc3339_millis("not-a-time").is_err());
        assert!(parse_rfc3339_millis("").is_err());
    }

    #[test]
    fn rfc3339_parse_accepts_offsets() {
        let millis = parse_rfc3339_millis("2025-06-01T12:00:00+02:00").expect("parse");
        assert_eq!(millis, 1_748_772_000_000);
    }
}
