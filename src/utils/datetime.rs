//! Timestamp helpers
//!
//! Entity rows carry `chrono::DateTime<Utc>` values. Queue and tombstone tables
//! store RFC 3339 text with millisecond precision and a `Z` suffix, which keeps
//! lexical ordering identical to chronological ordering for range deletes.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};

/// Current time truncated to milliseconds.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Next `updated_at` for a row whose previous value is `prev`.
///
/// Strictly greater than `prev` even when the wall clock has not advanced or
/// went backwards.
pub fn next_stamp(prev: DateTime<Utc>) -> DateTime<Utc> {
    let floor = prev.trunc_subsecs(3) + Duration::milliseconds(1);
    now().max(floor)
}

/// Format a timestamp for the raw bookkeeping tables.
pub fn format_storage(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp written by [`format_storage`] (or any RFC 3339 value).
pub fn parse_storage(value: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value).with_context(|| format!("Invalid timestamp: {value}"))?;
    Ok(parsed.with_timezone(&Utc))
}

/// Oldest timestamp still inside a retention window of `days`.
pub fn retention_cutoff(days: i64) -> DateTime<Utc> {
    now() - Duration::days(days)
}
