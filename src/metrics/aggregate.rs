use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::filter::{normalize_identity, IdentityFilter};
use crate::metrics::types::{RepositoryRollup, WindowAggregate};
use crate::query::builder::{CommitQuery, CommitRow};
use crate::query::window::Window;
use crate::storage::Database;

/// Everything one request's aggregations share. Cheap to clone into tasks.
#[derive(Clone)]
pub struct AggregateContext {
    pub db: Database,
    pub identity: Arc<IdentityFilter>,
    /// Repository ids the scope qualifier rejected for this request.
    pub excluded_repositories: Arc<Vec<i64>>,
    /// Set when the scope could not be resolved; every scan then fails.
    scope_error: Option<Arc<String>>,
}

impl AggregateContext {
    pub fn new(db: Database, identity: Arc<IdentityFilter>, excluded_repositories: Vec<i64>) -> Self {
        Self {
            db,
            identity,
            excluded_repositories: Arc::new(excluded_repositories),
            scope_error: None,
        }
    }

    /// A context whose repository scope is unknown. Scans report a store
    /// error instead of counting commits from repositories that may be out
    /// of scope.
    pub fn unscoped(db: Database, identity: Arc<IdentityFilter>, cause: impl Into<String>) -> Self {
        Self {
            db,
            identity,
            excluded_repositories: Arc::new(Vec::new()),
            scope_error: Some(Arc::new(cause.into())),
        }
    }

    /// Fails with [`Error::Database`] when the scope is unknown.
    pub fn ensure_scoped(&self) -> Result<()> {
        match &self.scope_error {
            Some(cause) => Err(Error::Database(format!("repository scope unavailable: {cause}"))),
            None => Ok(()),
        }
    }

    /// Base commit scan for this scope.
    pub fn commit_query(&self) -> CommitQuery {
        CommitQuery::new()
            .exclude_repositories(&self.excluded_repositories)
            .attributable()
    }
}

/// Scan the commits of one window and fold them into counts.
pub async fn aggregate(ctx: &AggregateContext, window: &Window) -> Result<WindowAggregate> {
    ctx.ensure_scoped()?;
    let rows = ctx.commit_query().window(window).rows(&ctx.db).await?;
    Ok(fold_rows(&ctx.identity, window, &rows))
}

fn fold_rows(identity: &IdentityFilter, window: &Window, rows: &[CommitRow]) -> WindowAggregate {
    let mut contributors: HashSet<String> = HashSet::new();
    let mut repo_contributors: HashMap<i64, HashSet<String>> = HashMap::new();
    let mut per_repository: BTreeMap<i64, RepositoryRollup> = BTreeMap::new();
    let mut first_seen: HashMap<String, DateTime<Utc>> = HashMap::new();
    let mut commit_count = 0;

    for row in rows {
        if identity.is_excluded_commit(
            row.committer_name.as_deref(),
            row.committer_email.as_deref(),
            row.committed_at,
        ) {
            continue;
        }
        let (Some(email), Some(ts)) = (
            row.committer_email.as_deref().and_then(normalize_identity),
            row.committed_at,
        ) else {
            continue;
        };
        if !window.contains(ts) {
            continue;
        }

        commit_count += 1;
        first_seen
            .entry(email.clone())
            .and_modify(|t| *t = (*t).min(ts))
            .or_insert(ts);

        let rollup = per_repository.entry(row.repository_id).or_default();
        rollup.commit_count += 1;
        rollup.last_commit_at = rollup.last_commit_at.max(Some(ts));
        repo_contributors
            .entry(row.repository_id)
            .or_default()
            .insert(email.clone());

        contributors.insert(email);
    }

    for (repo_id, rollup) in per_repository.iter_mut() {
        rollup.contributor_count = repo_contributors.get(repo_id).map_or(0, |s| s.len() as u64);
    }

    WindowAggregate {
        distinct_contributors: contributors.len() as u64,
        commit_count,
        per_repository,
        first_seen,
    }
}
