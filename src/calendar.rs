//! Calendar boundary: `YYYY-MM-DD` dates and `HH:MM` times combined into [`Ms`].
//!
//! All times live in one implicit local zone. A timestamp is the Unix-millisecond
//! value of the naive local date-time, so no timezone conversion happens anywhere.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};

use crate::model::{Ms, Span};

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M";
const DAY_MS: Ms = 86_400_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeError {
    #[error("invalid date format: '{0}' (expected YYYY-MM-DD)")]
    BadDate(String),
    #[error("invalid time format: '{0}' (expected HH:MM)")]
    BadTime(String),
    #[error("invalid timestamp: '{0}' (expected YYYY-MM-DD or YYYY-MM-DD HH:MM)")]
    BadTimestamp(String),
    #[error("end time {end} must be after start time {start}")]
    EmptyWindow { start: String, end: String },
}

/// Source of "now" for maintenance checks and record timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Clock {
    #[default]
    System,
    Fixed(Ms),
}

impl Clock {
    pub fn now_ms(&self) -> Ms {
        match self {
            Clock::System => to_ms(chrono::Local::now().naive_local()),
            Clock::Fixed(ms) => *ms,
        }
    }
}

pub fn parse_date(s: &str) -> Result<NaiveDate, TimeError> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).map_err(|_| TimeError::BadDate(s.to_string()))
}

/// Seconds are always `:00`.
pub fn parse_time(s: &str) -> Result<NaiveTime, TimeError> {
    NaiveTime::parse_from_str(s.trim(), TIME_FORMAT).map_err(|_| TimeError::BadTime(s.to_string()))
}

/// Accepts a bare date (midnight) or a date with `HH:MM`.
pub fn parse_timestamp(s: &str) -> Result<Ms, TimeError> {
    let trimmed = s.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, DATE_FORMAT) {
        return Ok(to_ms(date.and_time(NaiveTime::MIN)));
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M"))
        .map(to_ms)
        .map_err(|_| TimeError::BadTimestamp(s.to_string()))
}

pub fn to_ms(dt: NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis()
}

fn from_ms(ms: Ms) -> NaiveDateTime {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.naive_utc())
        .unwrap_or_default()
}

/// Written end of a window that runs to the following midnight.
pub const END_OF_DAY: &str = "24:00";

/// Combine a date with start/end times into `[start, end)`. The end may be
/// `24:00`.
pub fn window(date: &str, start_time: &str, end_time: &str) -> Result<Span, TimeError> {
    let day = parse_date(date)?;
    let start = to_ms(day.and_time(parse_time(start_time)?));
    let end = if end_time.trim() == END_OF_DAY {
        to_ms(day.and_time(NaiveTime::MIN)) + DAY_MS
    } else {
        to_ms(day.and_time(parse_time(end_time)?))
    };
    if start >= end {
        return Err(TimeError::EmptyWindow {
            start: start_time.to_string(),
            end: end_time.to_string(),
        });
    }
    Ok(Span::new(start, end))
}

/// The whole calendar day `[00:00, next 00:00)`.
pub fn day_span(date: &str) -> Result<Span, TimeError> {
    let start = to_ms(parse_date(date)?.and_time(NaiveTime::MIN));
    Ok(Span::new(start, start + DAY_MS))
}

pub fn format_date(ms: Ms) -> String {
    from_ms(ms).format(DATE_FORMAT).to_string()
}

pub fn format_time(ms: Ms) -> String {
    from_ms(ms).format(TIME_FORMAT).to_string()
}

pub fn format_timestamp(ms: Ms) -> String {
    from_ms(ms).format("%Y-%m-%d %H:%M").to_string()
}

/// Split a stored window back into boundary strings `(date, start, end)`.
/// An end on the following midnight is written `24:00`.
pub fn split_window(span: &Span) -> (String, String, String) {
    let end = if span.end > span.start && format_date(span.end) != format_date(span.start) {
        END_OF_DAY.to_string()
    } else {
        format_time(span.end)
    };
    (format_date(span.start), format_time(span.start), end)
}
