//! UTC normalization for caller-supplied instants.
//!
//! Everything the store keeps is UTC Unix milliseconds. Input may carry its
//! own offset (RFC 3339) or be naive wall-clock time; naive input is only
//! accepted together with an explicit caller offset, never the server's
//! local zone.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, SecondsFormat, TimeZone, Utc};
use thiserror::Error;

use crate::model::Ms;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    #[error("invalid timestamp: {0}")]
    Malformed(String),
    #[error("timestamp '{0}' has no UTC offset and no timezone was given")]
    MissingOffset(String),
    #[error("invalid timezone offset: {0}")]
    BadOffset(String),
    #[error("timestamp out of range: {0}")]
    OutOfRange(String),
}

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Parse a fixed UTC offset: `Z`, `UTC`, `+HH:MM`, `-HHMM`, `+HH`.
pub fn parse_offset(tz: &str) -> Result<FixedOffset, TimeError> {
    let tz = tz.trim();
    if tz.eq_ignore_ascii_case("z") || tz.eq_ignore_ascii_case("utc") {
        return Ok(utc_offset());
    }
    let bad = || TimeError::BadOffset(tz.to_string());

    let (sign, rest) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return Err(bad()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(bad());
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().map_err(|_| bad())?, 0),
        4 => (
            digits[..2].parse::<i32>().map_err(|_| bad())?,
            digits[2..].parse::<i32>().map_err(|_| bad())?,
        ),
        _ => return Err(bad()),
    };
    if hours > 23 || minutes > 59 {
        return Err(bad());
    }
    FixedOffset::east_opt(sign * (hours * 3_600 + minutes * 60)).ok_or_else(bad)
}

/// Normalize a textual instant to UTC milliseconds.
///
/// An explicit offset in `text` always wins over `caller_offset`.
pub fn parse_timestamp(text: &str, caller_offset: Option<FixedOffset>) -> Result<Ms, TimeError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(TimeError::Malformed(text.to_string()));
    }
    if let Ok(ms) = text.parse::<Ms>() {
        return Ok(ms);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp_millis());
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, fmt) {
            return Ok(dt.timestamp_millis());
        }
    }

    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .ok_or_else(|| TimeError::Malformed(text.to_string()))?;
    let offset = caller_offset.ok_or_else(|| TimeError::MissingOffset(text.to_string()))?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| TimeError::OutOfRange(text.to_string()))
}

/// RFC 3339 UTC with millisecond precision, e.g. `2026-10-16T08:00:00.000Z`.
pub fn format_ms(ms: Ms) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => ms.to_string(),
    }
}

/// Render `ms` in the caller's offset, for log lines.
pub fn format_in(ms: Ms, offset: FixedOffset) -> String {
    match offset.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, false),
        None => ms.to_string(),
    }
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}
