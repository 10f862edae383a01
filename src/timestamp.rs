//! Timestamp normalization.
//!
//! Records arrive with heterogeneous timestamp encodings depending on which
//! backend path produced them:
//! - `DD-MM-YYYY HH:mm:ss` (chat messages)
//! - `DD.MM.YYYY` (day-only values)
//! - ISO 8601 with or without a trailing `Z` / offset
//! - naive `YYYY-MM-DD HH:mm:ss` or `YYYY-MM-DDTHH:mm:ss`
//! - epoch milliseconds
//!
//! Everything is reduced to epoch milliseconds. Naive values are read in one
//! fixed offset shared by all sources, so relative order never depends on the
//! host timezone. Parse failures return `None`; choosing the substitute is the
//! caller's job (see [`Fallback`]).

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Display format of a timeline day divider
pub const DAY_FORMAT: &str = "%d.%m.%Y";

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%d-%m-%Y %H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
];

const NAIVE_DATE_FORMATS: &[&str] = &["%d.%m.%Y", "%d-%m-%Y", "%Y-%m-%d"];

/// Offset-carrying formats not covered by RFC 3339 (e.g. `+0300`)
const OFFSET_DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

/// A timestamp in any accepted encoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimestampInput<'a> {
    EpochMillis(i64),
    EpochFractional(f64),
    Text(&'a str),
}

/// Substitute instant for a timestamp that failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Epoch zero; keeps bulk data sort-stable
    Epoch,
    /// A caller-supplied "now" for freshly created, not yet timestamped items
    At(i64),
}

impl Fallback {
    pub fn millis(self) -> i64 {
        match self {
            Fallback::Epoch => 0,
            Fallback::At(ms) => ms,
        }
    }
}

/// Normalize to epoch milliseconds, `None` if the value is not a valid instant.
pub fn normalize(input: TimestampInput<'_>, offset: FixedOffset) -> Option<i64> {
    let millis = match input {
        TimestampInput::EpochMillis(ms) => ms,
        TimestampInput::EpochFractional(ms) => {
            if !ms.is_finite() {
                return None;
            }
            ms.round() as i64
        }
        TimestampInput::Text(text) => parse_text(text, offset)?,
    };
    // Day dividers carry a four-digit year and must parse back
    let local = DateTime::<Utc>::from_timestamp_millis(millis)?.with_timezone(&offset);
    (1..=9999).contains(&local.year()).then_some(millis)
}

/// Parse one of the accepted text encodings.
pub fn parse_text(text: &str, offset: FixedOffset) -> Option<i64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if text.bytes().all(|b| b.is_ascii_digit()) {
        return text.parse::<i64>().ok();
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }

    for format in OFFSET_DATETIME_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt.timestamp_millis());
        }
    }

    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return localize(naive, offset);
        }
    }

    for format in NAIVE_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return localize(date.and_hms_opt(0, 0, 0)?, offset);
        }
    }

    None
}

fn localize(naive: NaiveDateTime, offset: FixedOffset) -> Option<i64> {
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp_millis())
}

/// Calendar day of an instant in `offset`, formatted as `DD.MM.YYYY`.
pub fn day_divider(millis: i64, offset: FixedOffset) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_default()
        .with_timezone(&offset)
        .format(DAY_FORMAT)
        .to_string()
}

/// Parse a day divider back into a date for ordering.
pub fn parse_day(divider: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(divider.trim(), DAY_FORMAT).ok()
}
