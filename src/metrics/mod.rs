pub mod aggregate;
pub mod batch;
pub mod types;

pub use types::*;

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::filter::{normalize_identity, IdentityFilter};
use crate::query::builder::FirstCommitRow;
use crate::query::period::{classify, Era};
use crate::query::window::Window;
use crate::storage::repository::list_repositories;

use aggregate::{aggregate, AggregateContext};
use batch::{run_windows, BatchSettings};

/// Sum of per-window distinct contributors. A contributor active in two
/// windows counts twice: this is developer-months, not a headcount.
pub async fn sum_over_windows(
    ctx: &AggregateContext,
    settings: BatchSettings,
    windows: Vec<Window>,
) -> Result<WindowedCounts> {
    let task_ctx = ctx.clone();
    let outcome = run_windows(windows, settings, move |window| {
        let ctx = task_ctx.clone();
        async move {
            aggregate(&ctx, &window)
                .await
                .map(|agg| agg.distinct_contributors)
        }
    })
    .await?;

    let windows: Vec<WindowCount> = outcome
        .iter()
        .map(|(w, count)| WindowCount {
            label: w.label.clone(),
            count: *count,
        })
        .collect();
    Ok(WindowedCounts {
        total: windows.iter().map(|w| w.count).sum(),
        windows,
        degraded_windows: outcome.degraded,
    })
}

/// Identities whose first commit across all history falls inside `range`.
///
/// Scans every qualifying commit grouped by identity, so this is much more
/// expensive than a windowed count of the same range.
pub async fn new_contributors(
    ctx: &AggregateContext,
    settings: BatchSettings,
    range: Window,
) -> Result<WindowedCounts> {
    let task_ctx = ctx.clone();
    let outcome = run_windows(vec![range], settings, move |window| {
        let ctx = task_ctx.clone();
        async move {
            ctx.ensure_scoped()?;
            let rows = ctx.commit_query().first_commits(&ctx.db).await?;
            Ok(count_first_commits(&ctx.identity, &rows, &window))
        }
    })
    .await?;

    let windows: Vec<WindowCount> = outcome
        .iter()
        .map(|(w, count)| WindowCount {
            label: w.label.clone(),
            count: *count,
        })
        .collect();
    Ok(WindowedCounts {
        total: windows.iter().map(|w| w.count).sum(),
        windows,
        degraded_windows: outcome.degraded,
    })
}

/// Count identities whose earliest qualifying commit lies in `range`.
/// Name variants of an identity that the filter rejects do not count as
/// that identity's first commit.
pub fn count_first_commits(identity: &IdentityFilter, rows: &[FirstCommitRow], range: &Window) -> u64 {
    let mut first: HashMap<String, DateTime<Utc>> = HashMap::new();
    for row in rows {
        if identity.is_excluded(row.committer_name.as_deref(), Some(&row.identity)) {
            continue;
        }
        let Some(id) = normalize_identity(&row.identity) else {
            continue;
        };
        first
            .entry(id)
            .and_modify(|t| *t = (*t).min(row.first_commit_at))
            .or_insert(row.first_commit_at);
    }
    first.values().filter(|t| range.contains(**t)).count() as u64
}

/// Year-over-year change in percent.
///
/// `None` when there is nothing to compare: no prior period, or both zero.
/// Growth from zero is reported as 100.
pub fn yoy_percent(current: u64, previous: Option<u64>) -> Option<f64> {
    match previous? {
        0 if current == 0 => None,
        0 => Some(100.0),
        prev => Some((current as f64 - prev as f64) / prev as f64 * 100.0),
    }
}

/// Distinct contributors per window, each point tagged with its era.
pub async fn time_series(
    ctx: &AggregateContext,
    settings: BatchSettings,
    windows: Vec<Window>,
    eras: &[Era],
) -> Result<(Vec<SeriesPoint>, Vec<String>)> {
    let counts = sum_over_windows(ctx, settings, windows.clone()).await?;
    let points = windows
        .into_iter()
        .zip(counts.windows)
        .map(|(w, c)| SeriesPoint {
            era: classify(eras, w.start).map(|e| e.key.clone()),
            label: w.label,
            start: w.start,
            end: w.end,
            count: c.count,
        })
        .collect();
    Ok((points, counts.degraded_windows))
}

/// Per-repository rollups over one range, most commits first.
pub async fn repository_activity(
    ctx: &AggregateContext,
    settings: BatchSettings,
    range: Window,
) -> Result<(Vec<RepositoryActivity>, Vec<String>)> {
    let task_ctx = ctx.clone();
    let mut outcome = run_windows(vec![range], settings, move |window| {
        let ctx = task_ctx.clone();
        async move {
            let agg = aggregate(&ctx, &window).await?;
            let repos = ctx
                .db
                .reader()
                .call(|conn| list_repositories(conn, false))
                .await?;
            let mut activity: Vec<RepositoryActivity> = repos
                .into_iter()
                .filter_map(|repo| {
                    let rollup = agg.per_repository.get(&repo.id)?;
                    Some(RepositoryActivity {
                        repository_id: repo.id,
                        owner: repo.owner,
                        name: repo.name,
                        commit_count: rollup.commit_count,
                        contributor_count: rollup.contributor_count,
                        last_commit_at: rollup.last_commit_at,
                    })
                })
                .collect();
            activity.sort_by(|a, b| {
                b.commit_count
                    .cmp(&a.commit_count)
                    .then(a.repository_id.cmp(&b.repository_id))
            });
            Ok(activity)
        }
    })
    .await?;

    let activity = outcome.values.pop().unwrap_or_default();
    Ok((activity, outcome.degraded))
}
