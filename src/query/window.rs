use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::date_util::{first_of_next_month, quarter_of, quarter_start, start_of_day, truncate_to_month};
use crate::error::{Error, Result};

/// How a requested range is cut into windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStrategy {
    Month,
    Quarter,
    Rolling,
    Single,
}

impl WindowStrategy {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "month" | "monthly" => Ok(Self::Month),
            "quarter" | "quarterly" => Ok(Self::Quarter),
            "rolling" => Ok(Self::Rolling),
            "single" | "range" => Ok(Self::Single),
            other => Err(Error::Config(format!(
                "unknown window strategy '{other}' (expected month, quarter, rolling or single)"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::Rolling => "rolling",
            Self::Single => "single",
        }
    }
}

/// A half-open time window `[start, end)`. `end = None` is open-ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub label: String,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: Option<DateTime<Utc>>, label: impl Into<String>) -> Self {
        Self {
            start,
            end,
            label: label.into(),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && self.end.is_none_or(|end| ts < end)
    }
}

/// Input to [`generate`].
#[derive(Debug, Clone)]
pub struct WindowSpec {
    pub strategy: WindowStrategy,
    pub start: DateTime<Utc>,
    /// `None` runs through "now".
    pub end: Option<DateTime<Utc>>,
    pub rolling_days: u32,
    pub month_cap: usize,
    pub quarter_epoch: NaiveDate,
}

impl WindowSpec {
    /// A spec with limits taken from the engine configuration.
    pub fn new(
        strategy: WindowStrategy,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            strategy,
            start,
            end,
            rolling_days: config.rolling_window_days,
            month_cap: config.month_window_cap,
            quarter_epoch: config.quarter_epoch,
        }
    }
}

/// Produce ordered windows for `spec`. Month, quarter and rolling windows are
/// contiguous and non-overlapping; `Single` yields exactly one window.
pub fn generate(spec: &WindowSpec, now: DateTime<Utc>) -> Result<Vec<Window>> {
    if let Some(end) = spec.end {
        if end <= spec.start {
            return Err(Error::Config(format!(
                "window range ends ({end}) at or before it starts ({})",
                spec.start
            )));
        }
    }

    match spec.strategy {
        WindowStrategy::Month => Ok(months(spec, now)),
        WindowStrategy::Quarter => Ok(quarters(spec, now)),
        WindowStrategy::Rolling => rolling(spec, now),
        WindowStrategy::Single => Ok(vec![Window::new(
            spec.start,
            spec.end,
            format!(
                "{}..{}",
                spec.start.format("%Y-%m-%d"),
                spec.end
                    .map(|e| e.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "now".to_string())
            ),
        )]),
    }
}

fn months(spec: &WindowSpec, now: DateTime<Utc>) -> Vec<Window> {
    let limit = spec.end.unwrap_or(now);
    let mut windows = Vec::new();
    let mut cursor = truncate_to_month(spec.start);

    while cursor < limit && cursor < now {
        if windows.len() == spec.month_cap {
            log::warn!(
                "Month window cap ({}) reached at {}; range through {limit} truncated",
                spec.month_cap,
                cursor.format("%Y-%m")
            );
            break;
        }
        let next = start_of_day(first_of_next_month(cursor.year(), cursor.month()));
        let end = next.min(limit).min(now);
        windows.push(Window::new(cursor, Some(end), cursor.format("%Y-%m").to_string()));
        cursor = next;
    }
    windows
}

fn quarters(spec: &WindowSpec, now: DateTime<Utc>) -> Vec<Window> {
    let limit = spec.end.unwrap_or(now);
    let mut windows = Vec::new();
    let mut year = spec.quarter_epoch.year();
    let mut q = quarter_of(spec.quarter_epoch);

    loop {
        let start = start_of_day(quarter_start(year, q));
        let (next_year, next_q) = if q == 4 { (year + 1, 1) } else { (year, q + 1) };
        let end = start_of_day(quarter_start(next_year, next_q));

        // Fully in the future, or past the requested range
        if start >= now || start >= limit {
            break;
        }
        if end > spec.start {
            let label = format!("{year}-Q{q}");
            if end > now && now <= limit {
                windows.push(Window::new(start, Some(now), format!("{label} (partial)")));
            } else {
                windows.push(Window::new(start, Some(end.min(limit)), label));
            }
        }
        year = next_year;
        q = next_q;
    }
    windows
}

fn rolling(spec: &WindowSpec, now: DateTime<Utc>) -> Result<Vec<Window>> {
    if spec.rolling_days == 0 {
        return Err(Error::Config("rolling window length must be at least 1 day".into()));
    }
    let step = Duration::days(spec.rolling_days as i64);
    let end = spec.end.unwrap_or(now);
    let mut windows = Vec::new();
    let mut cursor = spec.start;

    while cursor < end {
        let nominal = cursor + step;
        let window_end = nominal.min(end);
        windows.push(Window::new(
            cursor,
            Some(window_end),
            format!("{}..{}", cursor.format("%Y-%m-%d"), window_end.format("%Y-%m-%d")),
        ));
        // Advance by the nominal step so a short final window never shifts the tiling.
        cursor = nominal;
    }
    Ok(windows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date_util::parse_ts;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_ts(s).unwrap()
    }

    fn spec(strategy: WindowStrategy, start: &str, end: Option<&str>) -> WindowSpec {
        WindowSpec::new(strategy, ts(start), end.map(ts), &EngineConfig::default())
    }

    #[test]
    fn test_months_jan_feb() {
        let windows = generate(
            &spec(WindowStrategy::Month, "2025-01-01", Some("2025-03-01")),
            ts("2026-01-01"),
        )
        .unwrap();
        let labels: Vec<&str> = windows.iter().map(|w| w.label.as_str()).collect();
        assert_eq!(labels, vec!["2025-01", "2025-02"]);
        assert_eq!(windows[0].end, Some(ts("2025-02-01")));
        assert_eq!(windows[1].end, Some(ts("2025-03-01")));
    }

    #[test]
    fn test_months_start_truncated_and_last_clamped_to_now() {
        let now = ts("2025-03-10T12:00:00Z");
        let windows = generate(&spec(WindowStrategy::Month, "2025-01-17", None), now).unwrap();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].start, ts("2025-01-01"));
        assert_eq!(windows[2].label, "2025-03");
        assert_eq!(windows[2].end, Some(now));
    }

    #[test]
    fn test_months_last_window_clamped_to_requested_end() {
        let windows = generate(
            &spec(WindowStrategy::Month, "2025-01-01", Some("2025-02-15")),
            ts("2026-01-01"),
        )
        .unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].label, "2025-02");
        assert_eq!(windows[1].end, Some(ts("2025-02-15")));
        assert!(!windows[1].contains(ts("2025-02-20")));
    }

    #[test]
    fn test_quarters_last_window_clamped_to_requested_end() {
        let windows = generate(
            &spec(WindowStrategy::Quarter, "2025-01-01", Some("2025-05-10")),
            ts("2026-01-01"),
        )
        .unwrap();
        let labels: Vec<&str> = windows.iter().map(|w| w.label.as_str()).collect();
        assert_eq!(labels, vec!["2025-Q1", "2025-Q2"]);
        assert_eq!(windows[1].end, Some(ts("2025-05-10")));
    }

    #[test]
    fn test_months_capped() {
        let windows = generate(
            &spec(WindowStrategy::Month, "2015-01-01", Some("2025-01-01")),
            ts("2026-01-01"),
        )
        .unwrap();
        assert_eq!(windows.len(), 24);
        assert_eq!(windows[23].label, "2016-12");
    }

    #[test]
    fn test_quarters_partial_and_future_omitted() {
        let now = ts("2025-11-15");
        let windows = generate(
            &spec(WindowStrategy::Quarter, "2025-01-01", Some("2026-12-31")),
            now,
        )
        .unwrap();
        let labels: Vec<&str> = windows.iter().map(|w| w.label.as_str()).collect();
        assert_eq!(labels, vec!["2025-Q1", "2025-Q2", "2025-Q3", "2025-Q4 (partial)"]);
        assert_eq!(windows[3].end, Some(now));
        assert_eq!(windows[2].end, Some(ts("2025-10-01")));
    }

    #[test]
    fn test_quarters_start_at_epoch() {
        let windows = generate(
            &spec(WindowStrategy::Quarter, "2010-01-01", Some("2019-07-01")),
            ts("2026-01-01"),
        )
        .unwrap();
        let labels: Vec<&str> = windows.iter().map(|w| w.label.as_str()).collect();
        assert_eq!(labels, vec!["2019-Q1", "2019-Q2"]);
    }

    #[test]
    fn test_rolling_95_days_tiles_exactly() {
        let start = ts("2025-01-01");
        let end = start + Duration::days(95);
        let windows = generate(
            &WindowSpec::new(WindowStrategy::Rolling, start, Some(end), &EngineConfig::default()),
            ts("2026-01-01"),
        )
        .unwrap();

        assert_eq!(windows.len(), 4);
        assert_eq!(windows[0].start, start);
        assert_eq!(windows[3].end, Some(end));
        for pair in windows.windows(2) {
            // No gap, no overlap, strictly increasing ends
            assert_eq!(pair[0].end, Some(pair[1].start));
            assert!(pair[0].end < pair[1].end);
        }
        for w in &windows {
            let span = w.end.unwrap() - w.start;
            assert!(span <= Duration::days(30));
        }
        assert_eq!(windows[3].end.unwrap() - windows[3].start, Duration::days(5));
    }

    #[test]
    fn test_single_window() {
        let windows = generate(
            &spec(WindowStrategy::Single, "2025-01-01", Some("2025-03-01")),
            ts("2026-01-01"),
        )
        .unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].label, "2025-01-01..2025-03-01");

        let open = generate(&spec(WindowStrategy::Single, "2025-01-01", None), ts("2026-01-01"))
            .unwrap();
        assert_eq!(open[0].end, None);
        assert!(open[0].contains(ts("2030-01-01")));
    }

    #[test]
    fn test_end_before_start_is_configuration_error() {
        for strategy in [
            WindowStrategy::Month,
            WindowStrategy::Quarter,
            WindowStrategy::Rolling,
            WindowStrategy::Single,
        ] {
            let result = generate(
                &spec(strategy, "2025-03-01", Some("2025-01-01")),
                ts("2026-01-01"),
            );
            assert!(matches!(result, Err(Error::Config(_))), "{strategy:?}");
        }
    }

    #[test]
    fn test_rolling_zero_days_rejected() {
        let mut s = spec(WindowStrategy::Rolling, "2025-01-01", Some("2025-02-01"));
        s.rolling_days = 0;
        assert!(generate(&s, ts("2026-01-01")).is_err());
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(WindowStrategy::parse("Monthly").unwrap(), WindowStrategy::Month);
        assert_eq!(WindowStrategy::parse("rolling").unwrap(), WindowStrategy::Rolling);
        assert!(WindowStrategy::parse("weekly").is_err());
    }
}
