//! Timestamp utilities
//!
//! Persisted timestamps are RFC 3339 UTC with millisecond precision so that
//! lexical order in SQLite matches chronological order.

use crate::{Error, Result};
use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp for storage
pub fn to_db_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp
pub fn parse_db_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Invalid stored timestamp '{}': {}", value, e)))
}

/// Midnight at the start of `at`'s local day
pub fn start_of_day<Tz: TimeZone>(at: &DateTime<Tz>) -> DateTime<Tz> {
    local_midnight(&at.timezone(), at.date_naive())
}

/// Midnight at the start of the local day after `at`
pub fn start_of_next_day<Tz: TimeZone>(at: &DateTime<Tz>) -> DateTime<Tz> {
    let date = at.date_naive();
    let next = date.checked_add_days(Days::new(1)).unwrap_or(date);
    local_midnight(&at.timezone(), next)
}

/// Midnight on the first day of `at`'s local month
pub fn start_of_month<Tz: TimeZone>(at: &DateTime<Tz>) -> DateTime<Tz> {
    let date = at.date_naive();
    let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date);
    local_midnight(&at.timezone(), first)
}

/// Midnight on the first day of the local month after `at`
pub fn start_of_next_month<Tz: TimeZone>(at: &DateTime<Tz>) -> DateTime<Tz> {
    let date = at.date_naive();
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date);
    local_midnight(&at.timezone(), first)
}

// Zones with a DST jump at midnight have no 00:00 on that date; the first
// valid instant after it is used instead.
fn local_midnight<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> DateTime<Tz> {
    let naive: NaiveDateTime = date.and_time(NaiveTime::default());
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(naive + chrono::Duration::hours(1)))
                .earliest()
        })
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
}
