//! Result cache: memoized metric payloads with a TTL per metric family.
//!
//! The cache never fails a request. Every store or decode error is logged and
//! reported as a miss, and a failed write is simply dropped.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::TtlConfig;
use crate::date_util::format_ts;
use crate::error::{Error, Result};
use crate::storage::repository::{self, CacheRow};
use crate::storage::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFamily {
    MadSum,
    NewDevelopers,
    TimeSeries,
    RepositoryActivity,
}

impl MetricFamily {
    pub const ALL: [MetricFamily; 4] = [
        MetricFamily::MadSum,
        MetricFamily::NewDevelopers,
        MetricFamily::TimeSeries,
        MetricFamily::RepositoryActivity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricFamily::MadSum => "mad_sum",
            MetricFamily::NewDevelopers => "new_developers",
            MetricFamily::TimeSeries => "time_series",
            MetricFamily::RepositoryActivity => "repository_activity",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s.trim())
            .ok_or_else(|| Error::Config(format!("unknown metric family '{s}'")))
    }

    pub fn ttl(&self, ttl: &TtlConfig) -> Duration {
        let secs = match self {
            MetricFamily::MadSum => ttl.mad_sum_secs,
            MetricFamily::NewDevelopers => ttl.new_developers_secs,
            MetricFamily::TimeSeries => ttl.time_series_secs,
            MetricFamily::RepositoryActivity => ttl.repository_activity_secs,
        };
        Duration::from_secs(secs)
    }
}

impl std::fmt::Display for MetricFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the cache key for a request: `family:k1=v1|k2=v2`, params sorted so
/// that their order never changes the key.
pub fn cache_key(family: MetricFamily, params: &[(&str, String)]) -> String {
    let mut parts: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
    parts.sort();
    format!("{}:{}", family.as_str(), parts.join("|"))
}

fn latest_expiry() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map_or(DateTime::<Utc>::MAX_UTC, |t| t.and_utc())
}

#[derive(Clone)]
pub struct ResultCache {
    db: Database,
}

impl ResultCache {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_at(key, Utc::now()).await
    }

    /// Look up `key` as of `now`. An expired entry is deleted and is a miss.
    pub async fn get_at<T: DeserializeOwned>(&self, key: &str, now: DateTime<Utc>) -> Option<T> {
        let lookup_key = key.to_string();
        let row = self
            .db
            .reader()
            .call(move |conn| repository::get_cache_entry(conn, &lookup_key))
            .await;
        let row = match row {
            Ok(Some(row)) => row,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Cache read failed for {key}, treating as miss: {e}");
                return None;
            }
        };

        let now = format_ts(now);
        if row.expires_at <= now {
            log::debug!("Cache entry {key} expired at {}", row.expires_at);
            let expired_key = key.to_string();
            let deleted = self
                .db
                .writer()
                .call(move |conn| repository::delete_expired_cache_entry(conn, &expired_key, &now))
                .await;
            if let Err(e) = deleted {
                log::warn!("Failed to evict expired cache entry {key}: {e}");
            }
            return None;
        }

        match serde_json::from_str(&row.payload) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Cache entry {key} ({}) does not decode, treating as miss: {e}", row.metric_family);
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, family: MetricFamily, value: &T, ttl: Duration) {
        self.set_at(key, family, value, ttl, Utc::now()).await
    }

    /// Upsert `value` under `key`, expiring `ttl` after `now`. Last write wins.
    pub async fn set_at<T: Serialize>(
        &self,
        key: &str,
        family: MetricFamily,
        value: &T,
        ttl: Duration,
        now: DateTime<Utc>,
    ) {
        let payload = match serde_json::to_string(value) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Cannot encode cache entry {key}: {e}");
                return;
            }
        };
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        // Stored expiries compare as text, which only holds for four-digit years.
        let latest = latest_expiry();
        let expires_at = now
            .checked_add_signed(ttl)
            .map_or(latest, |t| t.min(latest));
        let row = CacheRow {
            metric_family: family.as_str().to_string(),
            payload,
            created_at: format_ts(now),
            expires_at: format_ts(expires_at),
        };
        let key_owned = key.to_string();
        let written = self
            .db
            .writer()
            .call(move |conn| repository::put_cache_entry(conn, &key_owned, &row))
            .await;
        match written {
            Ok(()) => log::debug!("Cached {key} for {}s", ttl.num_seconds()),
            Err(e) => log::warn!("Cache write failed for {key}: {e}"),
        }
    }

    /// Delete every entry expired at `now`. Returns the number removed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let now = format_ts(now);
        let removed = self
            .db
            .writer()
            .call(move |conn| repository::sweep_cache(conn, &now))
            .await
            .map_err(|e| Error::Cache(e.to_string()))?;
        log::info!("Swept {removed} expired cache entries");
        Ok(removed)
    }

    /// Drop all entries, or one family's. Needed after filtering rules change,
    /// since cached results were computed under the old rules.
    pub async fn clear(&self, family: Option<MetricFamily>) -> Result<usize> {
        let removed = self
            .db
            .writer()
            .call(move |conn| repository::clear_cache(conn, family.map(|f| f.as_str())))
            .await
            .map_err(|e| Error::Cache(e.to_string()))?;
        log::info!("Cleared {removed} cache entries");
        Ok(removed)
    }

    /// Live entries per family, for status reporting. Empty on failure.
    pub async fn live_entries(&self, now: DateTime<Utc>) -> Vec<(String, i64)> {
        let now = format_ts(now);
        self.db
            .reader()
            .call(move |conn| repository::count_live_cache_entries(conn, &now))
            .await
            .unwrap_or_else(|e| {
                log::warn!("Cannot count cache entries: {e}");
                Vec::new()
            })
    }
}
