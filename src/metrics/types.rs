use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::query::window::WindowStrategy;

/// Per-repository rollup within one window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRollup {
    pub commit_count: u64,
    pub contributor_count: u64,
    pub last_commit_at: Option<DateTime<Utc>>,
}

/// Aggregator output for a single window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WindowAggregate {
    pub distinct_contributors: u64,
    /// Qualifying commits in the window.
    pub commit_count: u64,
    pub per_repository: BTreeMap<i64, RepositoryRollup>,
    /// Earliest commit per identity within the window only.
    pub first_seen: HashMap<String, DateTime<Utc>>,
}

/// Distinct-contributor count for one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCount {
    pub label: String,
    pub count: u64,
}

/// Windowed counts folded into a "developer-months" style sum.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowedCounts {
    pub total: u64,
    pub windows: Vec<WindowCount>,
    pub degraded_windows: Vec<String>,
}

/// Served result of a MAD-sum request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MadSumResult {
    pub period: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub strategy: WindowStrategy,
    pub total: u64,
    pub windows: Vec<WindowCount>,
    pub previous_total: Option<u64>,
    pub yoy_percent: Option<f64>,
    pub degraded_windows: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDevelopersResult {
    pub period: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub count: u64,
    pub previous_count: Option<u64>,
    pub yoy_percent: Option<f64>,
    pub degraded_windows: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub label: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub count: u64,
    /// Era key containing the window start, if any.
    pub era: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesResult {
    pub strategy: WindowStrategy,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub points: Vec<SeriesPoint>,
    pub degraded_windows: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryActivity {
    pub repository_id: i64,
    pub owner: String,
    pub name: String,
    pub commit_count: u64,
    pub contributor_count: u64,
    pub last_commit_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryActivityResult {
    pub period: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Ranked by commit count, most active first.
    pub repositories: Vec<RepositoryActivity>,
    pub degraded_windows: Vec<String>,
}

/// A served, cacheable result.
pub trait MetricResult: Serialize + DeserializeOwned {
    fn degraded_windows(&self) -> &[String];
}

impl MetricResult for MadSumResult {
    fn degraded_windows(&self) -> &[String] {
        &self.degraded_windows
    }
}

impl MetricResult for NewDevelopersResult {
    fn degraded_windows(&self) -> &[String] {
        &self.degraded_windows
    }
}

impl MetricResult for TimeSeriesResult {
    fn degraded_windows(&self) -> &[String] {
        &self.degraded_windows
    }
}

impl MetricResult for RepositoryActivityResult {
    fn degraded_windows(&self) -> &[String] {
        &self.degraded_windows
    }
}
