use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::date_util::{
    first_of_next_month, parse_date, quarter_of, quarter_start, shift_years, start_of_day,
};
use crate::error::{Error, Result};

static RE_QUARTER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-Q([1-4])$").unwrap());
static RE_MONTH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})$").unwrap());
static RE_RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4}-\d{2}-\d{2})\.\.(\d{4}-\d{2}-\d{2})$").unwrap());

/// Longest accepted rolling period, about a century.
const MAX_ROLLING_DAYS: u32 = 36_500;

/// A named era, e.g. `klaytn-2022`, independent of any aggregation window.
/// `start` is inclusive, `end` exclusive; `end = None` means still running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Era {
    pub key: String,
    pub label: String,
    pub start: NaiveDate,
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

impl Era {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= start_of_day(self.start) && self.end.is_none_or(|end| ts < start_of_day(end))
    }
}

/// Which era a commit instant belongs to. Eras are checked in configuration order.
pub fn classify(eras: &[Era], ts: DateTime<Utc>) -> Option<&Era> {
    eras.iter().find(|e| e.contains(ts))
}

/// A time period for metric requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Period {
    Year(i32),
    Quarter(i32, u8),
    Month(i32, u8),
    /// Last N days ending on (and including) the given date.
    Rolling(u32, NaiveDate),
    YearToDate(i32),
    QuarterToDate(i32, u8),
    MonthToDate(i32, u8),
    /// Explicit half-open date range `[start, end)`.
    Range(NaiveDate, NaiveDate),
    Era(Era),
}

impl Period {
    /// Parse a period string.
    ///
    /// Supported formats:
    /// - `2025`: year
    /// - `2025-Q1`: quarter
    /// - `2025-01`: month
    /// - `30d`: rolling last N days
    /// - `ytd`, `qtd`, `mtd`: current year/quarter/month to date
    /// - `2025-ytd`: a specific year to date
    /// - `2025-01-01..2025-03-01`: explicit half-open range
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let today = Utc::now().date_naive();

        // To-date periods
        match s.to_lowercase().as_str() {
            "ytd" => return Ok(Period::YearToDate(today.year())),
            "qtd" => return Ok(Period::QuarterToDate(today.year(), quarter_of(today))),
            "mtd" => return Ok(Period::MonthToDate(today.year(), today.month() as u8)),
            _ => {}
        }

        // Rolling: "30d", "7d", etc.
        if let Some(n) = s.strip_suffix(['d', 'D']) {
            if let Ok(n) = n.parse::<u32>() {
                if n == 0 {
                    return Err(Error::PeriodParse("rolling period must be at least 1 day".into()));
                }
                if n > MAX_ROLLING_DAYS {
                    return Err(Error::PeriodParse(format!(
                        "rolling period must be at most {MAX_ROLLING_DAYS} days, got {n}"
                    )));
                }
                return Ok(Period::Rolling(n, today));
            }
        }

        if let Some(rest) = s.strip_suffix("-ytd") {
            let year: i32 = rest
                .parse()
                .map_err(|_| Error::PeriodParse(format!("invalid year: {s}")))?;
            return Ok(Period::YearToDate(year));
        }

        if s.len() == 4 {
            if let Ok(year) = s.parse::<i32>() {
                return Ok(Period::Year(year));
            }
        }

        if let Some(caps) = RE_QUARTER.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let q: u8 = caps[2].parse().unwrap();
            return Ok(Period::Quarter(year, q));
        }

        if let Some(caps) = RE_MONTH.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let month: u8 = caps[2].parse().unwrap();
            if (1..=12).contains(&month) {
                return Ok(Period::Month(year, month));
            }
        }

        if let Some(caps) = RE_RANGE.captures(s) {
            let start = parse_date(&caps[1])
                .ok_or_else(|| Error::PeriodParse(format!("invalid date: {}", &caps[1])))?;
            let end = parse_date(&caps[2])
                .ok_or_else(|| Error::PeriodParse(format!("invalid date: {}", &caps[2])))?;
            if end <= start {
                return Err(Error::Config(format!("range ends ({end}) before it starts ({start})")));
            }
            return Ok(Period::Range(start, end));
        }

        Err(Error::PeriodParse(format!("unrecognized period: {s}")))
    }

    /// Like [`Period::parse`], but era keys (case-insensitive) take precedence.
    pub fn parse_with_eras(s: &str, eras: &[Era]) -> Result<Self> {
        let trimmed = s.trim();
        if let Some(era) = eras.iter().find(|e| e.key.eq_ignore_ascii_case(trimmed)) {
            return Ok(Period::Era(era.clone()));
        }
        Self::parse(trimmed)
    }

    /// Canonical key string for cache keys and display.
    pub fn to_key(&self) -> String {
        match self {
            Period::Year(y) => format!("{y}"),
            Period::Quarter(y, q) => format!("{y}-Q{q}"),
            Period::Month(y, m) => format!("{y}-{m:02}"),
            Period::Rolling(n, as_of) => format!("{n}d@{as_of}"),
            Period::YearToDate(y) => format!("{y}-ytd"),
            Period::QuarterToDate(y, q) => format!("{y}-Q{q}-td"),
            Period::MonthToDate(y, m) => format!("{y}-{m:02}-td"),
            Period::Range(start, end) => format!("{start}..{end}"),
            Period::Era(era) => era.key.clone(),
        }
    }

    /// Half-open UTC bounds `[start, end)` for this period.
    pub fn bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        self.bounds_at(Utc::now().date_naive())
    }

    /// Half-open UTC bounds, with to-date periods running through the end of `today`.
    /// An open-ended era also runs through the end of `today`.
    pub fn bounds_at(&self, today: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let tomorrow = today + Duration::days(1);
        let (start, end) = match self {
            Period::Year(y) => (ymd(*y, 1, 1), ymd(*y + 1, 1, 1)),
            Period::Quarter(y, q) => {
                let start = quarter_start(*y, *q);
                let end = if *q == 4 { ymd(*y + 1, 1, 1) } else { quarter_start(*y, q + 1) };
                (start, end)
            }
            Period::Month(y, m) => (ymd(*y, *m as u32, 1), first_of_next_month(*y, *m as u32)),
            Period::Rolling(n, as_of) => {
                (*as_of - Duration::days(*n as i64 - 1), *as_of + Duration::days(1))
            }
            Period::YearToDate(y) => (ymd(*y, 1, 1), tomorrow),
            Period::QuarterToDate(y, q) => (quarter_start(*y, *q), tomorrow),
            Period::MonthToDate(y, m) => (ymd(*y, *m as u32, 1), tomorrow),
            Period::Range(start, end) => (*start, *end),
            Period::Era(era) => (era.start, era.end.unwrap_or(tomorrow)),
        };
        (start_of_day(start), start_of_day(end))
    }

    /// Calendar-aligned periods are summed over calendar months; the rest over
    /// rolling windows.
    pub fn is_calendar_aligned(&self) -> bool {
        matches!(
            self,
            Period::Year(_)
                | Period::Quarter(..)
                | Period::Month(..)
                | Period::YearToDate(_)
                | Period::QuarterToDate(..)
                | Period::MonthToDate(..)
        )
    }

    /// The equivalent period one year earlier, for year-over-year comparison.
    pub fn year_ago(&self) -> Option<Self> {
        self.year_ago_at(Utc::now().date_naive())
    }

    /// To-date periods compare against the prior year clamped to the same day
    /// offset. Eras have no prior period.
    pub fn year_ago_at(&self, today: NaiveDate) -> Option<Self> {
        let to_date = |start: NaiveDate| {
            Period::Range(
                shift_years(start, -1),
                shift_years(today, -1) + Duration::days(1),
            )
        };
        match self {
            Period::Year(y) => Some(Period::Year(y - 1)),
            Period::Quarter(y, q) => Some(Period::Quarter(y - 1, *q)),
            Period::Month(y, m) => Some(Period::Month(y - 1, *m)),
            Period::Rolling(n, as_of) => Some(Period::Rolling(*n, shift_years(*as_of, -1))),
            Period::YearToDate(y) if *y == today.year() => Some(to_date(ymd(*y, 1, 1))),
            Period::YearToDate(y) => Some(Period::YearToDate(y - 1)),
            Period::QuarterToDate(y, q) => Some(to_date(quarter_start(*y, *q))),
            Period::MonthToDate(y, m) => Some(to_date(ymd(*y, *m as u32, 1))),
            Period::Range(start, end) => {
                Some(Period::Range(shift_years(*start, -1), shift_years(*end, -1)))
            }
            Period::Era(_) => None,
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN)
}
