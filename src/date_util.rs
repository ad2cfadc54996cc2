use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

/// Canonical on-disk timestamp format. Lexical order equals chronological order.
pub const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Get the last day of a given month.
pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    first_of_next_month(year, month) - Duration::days(1)
}

/// Get the quarter (1-4) for a given date.
pub fn quarter_of(d: NaiveDate) -> u8 {
    ((d.month() - 1) / 3 + 1) as u8
}

/// First day of the month following `year-month`.
pub fn first_of_next_month(year: i32, month: u32) -> NaiveDate {
    if month == 12 {
        ymd(year + 1, 1, 1)
    } else {
        ymd(year, month + 1, 1)
    }
}

/// First day of the quarter `q` (1-4) in `year`.
pub fn quarter_start(year: i32, q: u8) -> NaiveDate {
    ymd(year, (q as u32 - 1) * 3 + 1, 1)
}

/// Midnight UTC at the start of `d`.
pub fn start_of_day(d: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN))
}

/// Truncate an instant to midnight UTC on the first of its month.
pub fn truncate_to_month(ts: DateTime<Utc>) -> DateTime<Utc> {
    start_of_day(ymd(ts.year(), ts.month(), 1))
}

/// The same calendar day `years` years away; Feb 29 clamps to Feb 28.
pub fn shift_years(d: NaiveDate, years: i32) -> NaiveDate {
    let year = d.year() + years;
    NaiveDate::from_ymd_opt(year, d.month(), d.day())
        .unwrap_or_else(|| last_day_of_month(year, d.month()))
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

/// Parse a stored or user-supplied timestamp. Accepts RFC 3339 with any offset,
/// `YYYY-MM-DD HH:MM:SS` (taken as UTC) and bare dates (midnight UTC).
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(start_of_day)
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

// Callers only pass validated components (month 1-12, day 1).
fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN)
}
