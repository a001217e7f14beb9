//! Timestamp helpers.
//!
//! All persisted timestamps are Unix epoch milliseconds (`INTEGER` columns) so
//! expiry checks are plain integer comparisons inside SQL.

use chrono::{DateTime, SecondsFormat, Utc};

/// Current time in Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Renders epoch milliseconds as an RFC 3339 string for API responses.
pub fn to_rfc3339(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
