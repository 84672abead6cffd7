use chrono::{DateTime, Datelike, Local, TimeDelta};
use sums_lib::{SumsError, SumsResult};

/// Placement-record TTLs are minute-resolution local times stored as text,
/// so plain string comparison orders them.
pub const EFFECTIVE_DATE_FORMAT: &str = "%Y%m%d%H%M";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Extra days granted on every `get` touch beyond the requested retention.
pub const TOUCH_GRACE_DAYS: i64 = 3;
pub const PROVISIONAL_TTL_DAYS: i64 = 2;

pub fn format_effective_date(t: DateTime<Local>) -> String {
    t.format(EFFECTIVE_DATE_FORMAT).to_string()
}

pub fn effective_now() -> String {
    format_effective_date(Local::now())
}

/// `now` plus `days`, as effective-date text. Retention comes from clients, so
/// anything that leaves the four-digit-year range is a bad request.
pub fn effective_after_days(now: DateTime<Local>, days: i64) -> SumsResult<String> {
    TimeDelta::try_days(days)
        .and_then(|delta| now.checked_add_signed(delta))
        .filter(|t| (1..=9999).contains(&t.year()))
        .map(format_effective_date)
        .ok_or_else(|| SumsError::BadRequest(format!("retention of {} days is out of range", days)))
}

/// TTL written by a `get` touch. Negative retention only ever extends, so the
/// caller applies it with `MAX(current, value)`.
pub fn touch_effective_date(now: DateTime<Local>, retention: i64) -> SumsResult<String> {
    let days = retention
        .checked_abs()
        .and_then(|d| d.checked_add(TOUCH_GRACE_DAYS))
        .ok_or_else(|| {
            SumsError::BadRequest(format!("retention of {} days is out of range", retention))
        })?;
    effective_after_days(now, days)
}

/// TTL of the final placement written by put.
pub fn put_effective_date(now: DateTime<Local>, retention: i64) -> SumsResult<String> {
    let days = retention.checked_abs().ok_or_else(|| {
        SumsError::BadRequest(format!("retention of {} days is out of range", retention))
    })?;
    effective_after_days(now, days)
}

pub fn timestamp_now() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}
