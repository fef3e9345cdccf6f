//! Timestamp parsing and rendering.
//!
//! The stream format is RFC 3339 UTC throughout; user-supplied values
//! (config, due dates) also accept date-only and naive datetime forms.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::{Error, Result};

/// Render a timestamp the way the stream and the database store it.
#[must_use]
pub fn to_rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

/// Parse a stored RFC 3339 timestamp; tolerates a trailing naive form from
/// older databases by assuming UTC.
pub fn parse_stored(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    Err(Error::validation(
        "timestamp",
        format!("not an RFC 3339 timestamp: '{s}'"),
    ))
}

/// Parse a user-supplied timestamp: RFC 3339, `YYYY-MM-DDTHH:MM:SS`, or a
/// bare date (midnight UTC).
pub fn parse_flexible(s: &str, field: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(Error::validation(
        field,
        format!("unrecognized timestamp '{s}' (want RFC 3339 or YYYY-MM-DD)"),
    ))
}
