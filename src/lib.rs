pub mod cache;
pub mod config;
pub mod date_util;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod query;
pub mod storage;

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use cache::{cache_key, MetricFamily, ResultCache};
pub use config::{EngineConfig, RepositoryRef};
pub use error::{Error, Result};
pub use filter::{IdentityFilter, RepositoryDescriptor, ScopeQualifier};
pub use metrics::{
    MadSumResult, NewDevelopersResult, RepositoryActivityResult, SeriesPoint, TimeSeriesResult,
    WindowCount,
};
pub use query::period::{Era, Period};
pub use query::window::{Window, WindowStrategy};
pub use storage::repository::{ImportReport, RepositoryImport, StoreStats};
pub use storage::{Database, SchemaCapabilities};

use date_util::format_ts;
use metrics::aggregate::AggregateContext;
use metrics::batch::BatchSettings;
use metrics::{MetricResult, WindowedCounts};
use query::window::{generate, WindowSpec};
use storage::repository;

/// JSON fixture accepted by [`DevActivity::import`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportFixture {
    pub repositories: Vec<RepositoryImport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub store: StoreStats,
    pub capabilities: SchemaCapabilities,
    /// Live entries per metric family.
    pub cache_entries: Vec<(String, i64)>,
    pub identity_exclusions: usize,
    pub repository_exclusions: usize,
    pub eras: Vec<String>,
}

/// Main entry point: cache-fronted developer activity metrics over a commit store.
pub struct DevActivity {
    db: Database,
    config: EngineConfig,
    identity: Arc<IdentityFilter>,
    scope: ScopeQualifier,
    cache: ResultCache,
}

impl DevActivity {
    /// Build the engine over `db`. Overrides stored in `app_config` are applied
    /// on top of `config`, and optional schema features are probed once here.
    pub async fn new(db: Database, mut config: EngineConfig) -> Result<Self> {
        let overrides = db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await?;
        config.apply_overrides(&overrides)?;

        let capabilities = db.probe_capabilities().await;
        if !capabilities.has_fork_column {
            log::info!("Repository store has no is_fork column; fork exclusion disabled");
        }

        Ok(Self {
            identity: Arc::new(IdentityFilter::from_config(&config)),
            scope: ScopeQualifier::from_config(&config, capabilities),
            cache: ResultCache::new(db.clone()),
            db,
            config,
        })
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn capabilities(&self) -> SchemaCapabilities {
        self.scope.capabilities()
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    // ── Requests ─────────────────────────────────────────────────

    /// Sum of monthly (or rolling 30-day) active developers over `period`,
    /// with year-over-year change where a prior period exists.
    pub async fn mad_sum(&self, period: &Period) -> Result<MadSumResult> {
        let now = Utc::now();
        let (start, end) = period.bounds_at(now.date_naive());
        let params = [
            ("period", period.to_key()),
            ("start", format_ts(start)),
            ("end", format_ts(end)),
        ];

        self.cached(MetricFamily::MadSum, &params, move || async move {
            let ctx = self.context().await;
            let (strategy, current) = self.sum_period(&ctx, period, now).await?;
            let mut degraded_windows = current.degraded_windows;

            let previous = match period.year_ago_at(now.date_naive()) {
                Some(prior) => {
                    let (_, counts) = self.sum_period(&ctx, &prior, now).await?;
                    degraded_windows.extend(
                        counts
                            .degraded_windows
                            .iter()
                            .map(|label| format!("{label} (prior year)")),
                    );
                    Some(counts.total)
                }
                None => None,
            };

            Ok(MadSumResult {
                period: period.to_key(),
                start,
                end,
                strategy,
                total: current.total,
                windows: current.windows,
                previous_total: previous,
                yoy_percent: metrics::yoy_percent(current.total, previous),
                degraded_windows,
            })
        })
        .await
    }

    /// Contributors whose first-ever commit falls inside `period`.
    pub async fn new_developers(&self, period: &Period) -> Result<NewDevelopersResult> {
        let now = Utc::now();
        let (start, end) = period.bounds_at(now.date_naive());
        let params = [
            ("period", period.to_key()),
            ("start", format_ts(start)),
            ("end", format_ts(end)),
        ];

        self.cached(MetricFamily::NewDevelopers, &params, move || async move {
            let ctx = self.context().await;
            let settings = BatchSettings::from_config(&self.config);
            let current = metrics::new_contributors(
                &ctx,
                settings,
                Window::new(start, Some(end), period.to_key()),
            )
            .await?;
            let mut degraded_windows = current.degraded_windows;

            let previous = match period.year_ago_at(now.date_naive()) {
                Some(prior) => {
                    let (prior_start, prior_end) = prior.bounds_at(now.date_naive());
                    let counts = metrics::new_contributors(
                        &ctx,
                        settings,
                        Window::new(prior_start, Some(prior_end), prior.to_key()),
                    )
                    .await?;
                    degraded_windows.extend(counts.degraded_windows);
                    Some(counts.total)
                }
                None => None,
            };

            Ok(NewDevelopersResult {
                period: period.to_key(),
                start,
                end,
                count: current.total,
                previous_count: previous,
                yoy_percent: metrics::yoy_percent(current.total, previous),
                degraded_windows,
            })
        })
        .await
    }

    /// Distinct contributors per window of `strategy` from `start` to `end`
    /// (or now).
    pub async fn time_series(
        &self,
        strategy: WindowStrategy,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<TimeSeriesResult> {
        let now = Utc::now();
        // Validate before touching the cache.
        let windows = generate(&WindowSpec::new(strategy, start, end, &self.config), now)?;
        let params = [
            ("strategy", strategy.as_str().to_string()),
            ("start", format_ts(start)),
            ("end", end.map(format_ts).unwrap_or_else(|| "now".into())),
        ];

        self.cached(MetricFamily::TimeSeries, &params, move || async move {
            let ctx = self.context().await;
            let (points, degraded_windows) = metrics::time_series(
                &ctx,
                BatchSettings::from_config(&self.config),
                windows,
                &self.config.eras,
            )
            .await?;
            Ok(TimeSeriesResult {
                strategy,
                start,
                end,
                points,
                degraded_windows,
            })
        })
        .await
    }

    /// Per-repository commit and contributor rollups for `period`, most
    /// active first, optionally truncated to `limit` repositories.
    pub async fn repository_activity(
        &self,
        period: &Period,
        limit: Option<usize>,
    ) -> Result<RepositoryActivityResult> {
        let now = Utc::now();
        let (start, end) = period.bounds_at(now.date_naive());
        let params = [
            ("period", period.to_key()),
            ("start", format_ts(start)),
            ("end", format_ts(end)),
            ("limit", limit.map_or_else(|| "all".to_string(), |l| l.to_string())),
        ];

        self.cached(MetricFamily::RepositoryActivity, &params, move || async move {
            let ctx = self.context().await;
            let (mut repositories, degraded_windows) = metrics::repository_activity(
                &ctx,
                BatchSettings::from_config(&self.config),
                Window::new(start, Some(end), period.to_key()),
            )
            .await?;
            if let Some(limit) = limit {
                repositories.truncate(limit);
            }
            Ok(RepositoryActivityResult {
                period: period.to_key(),
                start,
                end,
                repositories,
                degraded_windows,
            })
        })
        .await
    }

    /// Scope for one request: excluded repositories are resolved once here
    /// and shared by every window. If the store cannot be scoped at all, the
    /// context fails every window so the request degrades instead of erroring.
    async fn context(&self) -> AggregateContext {
        match self.scope.resolve(&self.db).await {
            Ok(excluded) => AggregateContext::new(self.db.clone(), Arc::clone(&self.identity), excluded),
            Err(e) => {
                log::error!("Repository scope unavailable, windows will be zeroed: {e}");
                AggregateContext::unscoped(self.db.clone(), Arc::clone(&self.identity), e.to_string())
            }
        }
    }

    async fn sum_period(
        &self,
        ctx: &AggregateContext,
        period: &Period,
        now: DateTime<Utc>,
    ) -> Result<(WindowStrategy, WindowedCounts)> {
        let (start, end) = period.bounds_at(now.date_naive());
        let strategy = if period.is_calendar_aligned() {
            WindowStrategy::Month
        } else {
            WindowStrategy::Rolling
        };
        let windows = generate(&WindowSpec::new(strategy, start, Some(end), &self.config), now)?;
        let counts =
            metrics::sum_over_windows(ctx, BatchSettings::from_config(&self.config), windows).await?;
        Ok((strategy, counts))
    }

    /// Serve from the cache, or compute and store. Degraded results are
    /// served but not cached.
    async fn cached<T, F, Fut>(
        &self,
        family: MetricFamily,
        params: &[(&str, String)],
        compute: F,
    ) -> Result<T>
    where
        T: MetricResult,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = cache_key(family, params);
        if let Some(hit) = self.cache.get::<T>(&key).await {
            log::debug!("Cache hit: {key}");
            return Ok(hit);
        }

        let value = compute().await?;
        if value.degraded_windows().is_empty() {
            self.cache
                .set(&key, family, &value, family.ttl(&self.config.ttl))
                .await;
        } else {
            log::warn!(
                "Not caching {key}: degraded windows {:?}",
                value.degraded_windows()
            );
        }
        Ok(value)
    }

    // ── Commit store ─────────────────────────────────────────────

    /// Load a fixture into the commit store. Cached results are dropped since
    /// they no longer reflect the store.
    pub async fn import(&self, fixture: ImportFixture) -> Result<ImportReport> {
        let has_fork_column = self.capabilities().has_fork_column;
        let report = self
            .db
            .writer()
            .call(move |conn| {
                repository::import_repositories(conn, &fixture.repositories, has_fork_column)
            })
            .await?;
        log::info!(
            "Imported {} repositories: {} commits inserted, {} already present",
            report.repositories,
            report.commits_inserted,
            report.commits_skipped
        );
        if report.commits_inserted > 0 {
            self.clear_cache(None).await?;
        }
        Ok(report)
    }

    pub async fn status(&self) -> Result<Status> {
        let store = self
            .db
            .reader()
            .call(|conn| repository::store_stats(conn))
            .await?;
        Ok(Status {
            store,
            capabilities: self.capabilities(),
            cache_entries: self.cache.live_entries(Utc::now()).await,
            identity_exclusions: self.identity.tokens().len(),
            repository_exclusions: self.config.repository_exclusions.len(),
            eras: self.config.eras.iter().map(|e| e.key.clone()).collect(),
        })
    }

    // ── Cache ────────────────────────────────────────────────────

    pub async fn sweep_cache(&self) -> Result<usize> {
        self.cache.sweep_expired(Utc::now()).await
    }

    pub async fn clear_cache(&self, family: Option<MetricFamily>) -> Result<usize> {
        self.cache.clear(family).await
    }

    // ── Config ───────────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        let val = self
            .db
            .reader()
            .call(move |conn| repository::get_config(conn, &key))
            .await?;
        Ok(val)
    }

    /// Store an override and apply it immediately. The value is validated
    /// first; cached results are dropped because they were computed under
    /// the previous settings.
    pub async fn config_set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.config.clone();
        updated.apply_overrides(&[(key.to_string(), value.to_string())])?;

        let (k, v) = (key.to_string(), value.to_string());
        self.db
            .writer()
            .call(move |conn| repository::set_config(conn, &k, &v))
            .await?;

        self.apply_config(updated);
        self.clear_cache(None).await?;
        Ok(())
    }

    /// Remove an override. Takes full effect the next time the engine opens.
    pub async fn config_unset(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        let removed = self
            .db
            .writer()
            .call(move |conn| repository::delete_config(conn, &key))
            .await?;
        if removed {
            self.clear_cache(None).await?;
        }
        Ok(removed)
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        let list = self
            .db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await?;
        Ok(list)
    }

    fn apply_config(&mut self, config: EngineConfig) {
        self.identity = Arc::new(IdentityFilter::from_config(&config));
        self.scope = ScopeQualifier::from_config(&config, self.scope.capabilities());
        self.config = config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date_util::parse_ts;
    use crate::storage::repository::CommitInput;

    fn commit(sha: &str, email: &str, ts: &str) -> CommitInput {
        CommitInput {
            sha: sha.into(),
            committer_name: None,
            committer_email: Some(email.into()),
            committed_at: Some(ts.into()),
        }
    }

    fn repo(owner: &str, name: &str, is_fork: Option<bool>, commits: Vec<CommitInput>) -> RepositoryImport {
        RepositoryImport {
            owner: owner.into(),
            name: name.into(),
            is_fork,
            commits,
        }
    }

    fn scenario() -> ImportFixture {
        ImportFixture {
            repositories: vec![repo(
                "acme",
                "core",
                Some(false),
                vec![
                    commit("1", "a@x.com", "2025-01-05"),
                    commit("2", "a@x.com", "2025-02-03"),
                    commit("3", "b@x.com", "2025-01-20"),
                ],
            )],
        }
    }

    async fn engine(fixture: ImportFixture) -> DevActivity {
        let db = Database::open_memory().await.unwrap();
        let engine = DevActivity::new(db, EngineConfig::default()).await.unwrap();
        engine.import(fixture).await.unwrap();
        engine
    }

    fn ts(s: &str) -> DateTime<Utc> {
        parse_ts(s).unwrap()
    }

    #[tokio::test]
    async fn test_monthly_series_and_new_developers() {
        let engine = engine(scenario()).await;

        let series = engine
            .time_series(WindowStrategy::Month, ts("2025-01-01"), Some(ts("2025-03-01")))
            .await
            .unwrap();
        let counts: Vec<(&str, u64)> = series
            .points
            .iter()
            .map(|p| (p.label.as_str(), p.count))
            .collect();
        assert_eq!(counts, vec![("2025-01", 2), ("2025-02", 1)]);

        let period = Period::parse("2025-01-01..2025-03-01").unwrap();
        let new = engine.new_developers(&period).await.unwrap();
        assert_eq!(new.count, 2);
        assert_eq!(new.previous_count, Some(0));
        assert_eq!(new.yoy_percent, Some(100.0));
    }

    #[tokio::test]
    async fn test_mad_sum_year_with_yoy() {
        let mut fixture = scenario();
        fixture.repositories[0]
            .commits
            .push(commit("4", "c@x.com", "2024-03-10"));
        let engine = engine(fixture).await;

        let result = engine.mad_sum(&Period::Year(2025)).await.unwrap();
        assert_eq!(result.strategy, WindowStrategy::Month);
        assert_eq!(result.total, 3);
        assert_eq!(result.windows[0].label, "2025-01");
        assert_eq!(result.previous_total, Some(1));
        assert_eq!(result.yoy_percent, Some(200.0));
        assert!(result.degraded_windows.is_empty());
    }

    #[tokio::test]
    async fn test_period_without_commits_is_zero() {
        let engine = engine(scenario()).await;
        let result = engine.mad_sum(&Period::Month(2019, 6)).await.unwrap();
        assert_eq!(result.total, 0);
        assert_eq!(result.yoy_percent, None);
    }

    #[tokio::test]
    async fn test_inverted_range_is_configuration_error() {
        let engine = engine(scenario()).await;
        let err = engine
            .time_series(WindowStrategy::Month, ts("2025-03-01"), Some(ts("2025-01-01")))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    fn fork_fixture(flag_fork: bool) -> ImportFixture {
        let mut fork_commits = Vec::new();
        for i in 0..20 {
            fork_commits.push(commit(&format!("f{i}"), &format!("dev{i}@x.com"), "2025-01-10"));
        }
        ImportFixture {
            repositories: vec![
                repo(
                    "acme",
                    "core",
                    Some(false),
                    vec![commit("1", "a@x.com", "2025-01-05"), commit("2", "b@x.com", "2025-01-06")],
                ),
                repo("someone", "core-fork", Some(flag_fork), fork_commits),
            ],
        }
    }

    #[tokio::test]
    async fn test_fork_excluded_even_when_most_active() {
        let engine = engine(fork_fixture(true)).await;
        let result = engine
            .repository_activity(&Period::Month(2025, 1), None)
            .await
            .unwrap();
        assert_eq!(result.repositories.len(), 1);
        assert_eq!(result.repositories[0].name, "core");

        let mad = engine.mad_sum(&Period::Month(2025, 1)).await.unwrap();
        assert_eq!(mad.total, 2);
    }

    #[tokio::test]
    async fn test_missing_fork_column_tolerated() {
        // With the column present but nothing flagged
        let with_column = engine(fork_fixture(false)).await;
        let expected = with_column.mad_sum(&Period::Month(2025, 1)).await.unwrap();

        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                conn.execute_batch("ALTER TABLE repositories DROP COLUMN is_fork")?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
        let without_column = DevActivity::new(db, EngineConfig::default()).await.unwrap();
        assert!(!without_column.capabilities().has_fork_column);
        without_column.import(fork_fixture(false)).await.unwrap();

        let actual = without_column.mad_sum(&Period::Month(2025, 1)).await.unwrap();
        assert_eq!(actual.total, expected.total);
        assert_eq!(actual.total, 22);
    }

    #[tokio::test]
    async fn test_fork_column_dropped_after_open_still_serves() {
        let engine = engine(fork_fixture(false)).await;
        assert!(engine.capabilities().has_fork_column);
        engine
            .db()
            .writer()
            .call(|conn| {
                conn.execute_batch("ALTER TABLE repositories DROP COLUMN is_fork")?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();

        let mad = engine.mad_sum(&Period::Month(2025, 1)).await.unwrap();
        assert_eq!(mad.total, 22);
        assert!(mad.degraded_windows.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_repository_store_degrades() {
        let engine = engine(scenario()).await;
        engine
            .db()
            .writer()
            .call(|conn| {
                conn.execute_batch("PRAGMA foreign_keys=OFF; DROP TABLE repositories;")?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();

        let mad = engine.mad_sum(&Period::Month(2025, 1)).await.unwrap();
        assert_eq!(mad.total, 0);
        assert_eq!(mad.windows[0].label, "2025-01");
        assert!(mad.degraded_windows.contains(&"2025-01".to_string()));

        // Degraded results are not cached
        assert!(engine.cache().live_entries(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn test_results_are_cached_until_cleared() {
        let engine = engine(scenario()).await;
        let period = Period::Month(2025, 1);
        let first = engine.mad_sum(&period).await.unwrap();
        assert_eq!(first.total, 2);

        // Bypass import so the cache is not invalidated
        engine
            .db()
            .writer()
            .call(|conn| {
                repository::insert_commit(conn, 1, &commit("9", "z@x.com", "2025-01-15"))?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
        assert_eq!(engine.mad_sum(&period).await.unwrap().total, 2);

        engine.clear_cache(Some(MetricFamily::MadSum)).await.unwrap();
        assert_eq!(engine.mad_sum(&period).await.unwrap().total, 3);
    }

    #[tokio::test]
    async fn test_config_set_applies_and_persists() {
        let mut engine = engine(scenario()).await;
        let period = Period::Month(2025, 1);
        assert_eq!(engine.mad_sum(&period).await.unwrap().total, 2);

        engine.config_set("identity_exclusions", "b@x.com").await.unwrap();
        assert_eq!(engine.mad_sum(&period).await.unwrap().total, 1);
        assert!(engine.config_set("batch_size", "zero").await.is_err());

        let reopened = DevActivity::new(engine.db().clone(), EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(reopened.config().identity_exclusions, vec!["b@x.com"]);
        assert_eq!(reopened.config_list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_repository_exclusion_and_status() {
        let db = Database::open_memory().await.unwrap();
        let config = EngineConfig {
            repository_exclusions: vec![RepositoryRef::new("someone", "CORE-FORK")],
            ..EngineConfig::default()
        };
        let engine = DevActivity::new(db, config).await.unwrap();
        engine.import(fork_fixture(false)).await.unwrap();

        let mad = engine.mad_sum(&Period::Month(2025, 1)).await.unwrap();
        assert_eq!(mad.total, 2);

        let status = engine.status().await.unwrap();
        assert_eq!(status.store.repositories, 2);
        assert_eq!(status.store.commits, 22);
        assert!(status.capabilities.has_fork_column);
        assert_eq!(status.cache_entries, vec![("mad_sum".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_import_is_idempotent() {
        let engine = engine(scenario()).await;
        let report = engine.import(scenario()).await.unwrap();
        assert_eq!(report.commits_inserted, 0);
        assert_eq!(report.commits_skipped, 3);
    }
}
