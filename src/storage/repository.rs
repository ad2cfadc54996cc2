use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::date_util::{format_ts, parse_ts};
use crate::filter::RepositoryDescriptor;

// ── Repositories ───────────────────────────────────────────────────

/// Insert a repository if it does not exist and return its id. The fork flag
/// is only written when the store has the column and the flag is known.
pub fn upsert_repository(
    conn: &Connection,
    owner: &str,
    name: &str,
    is_fork: Option<bool>,
    has_fork_column: bool,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO repositories (owner, name) VALUES (?1, ?2)
         ON CONFLICT(owner, name) DO NOTHING",
        params![owner, name],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM repositories WHERE owner = ?1 AND name = ?2",
        params![owner, name],
        |row| row.get(0),
    )?;
    if let (true, Some(is_fork)) = (has_fork_column, is_fork) {
        conn.execute(
            "UPDATE repositories SET is_fork = ?1 WHERE id = ?2",
            params![is_fork, id],
        )?;
    }
    Ok(id)
}

pub fn list_repositories(
    conn: &Connection,
    with_fork_column: bool,
) -> Result<Vec<RepositoryDescriptor>, rusqlite::Error> {
    let sql = if with_fork_column {
        "SELECT id, owner, name, is_fork FROM repositories ORDER BY id"
    } else {
        "SELECT id, owner, name, NULL FROM repositories ORDER BY id"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| {
        Ok(RepositoryDescriptor {
            id: row.get(0)?,
            owner: row.get(1)?,
            name: row.get(2)?,
            is_fork: row.get::<_, Option<bool>>(3)?,
        })
    })?;
    rows.collect()
}

// ── Commits ────────────────────────────────────────────────────────

/// A commit as delivered by the crawler or an import fixture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInput {
    pub sha: String,
    #[serde(default)]
    pub committer_name: Option<String>,
    #[serde(default)]
    pub committer_email: Option<String>,
    /// Any timestamp `parse_ts` accepts; stored as canonical UTC text.
    #[serde(default)]
    pub committed_at: Option<String>,
}

/// Insert a commit, ignoring duplicates of `(repository_id, sha)`.
/// Returns whether a row was written.
pub fn insert_commit(
    conn: &Connection,
    repository_id: i64,
    commit: &CommitInput,
) -> Result<bool, rusqlite::Error> {
    let committed_at = match commit.committed_at.as_deref() {
        Some(raw) => match parse_ts(raw) {
            Some(ts) => Some(format_ts(ts)),
            None => {
                log::warn!("Commit {} has unparseable timestamp '{raw}', storing NULL", commit.sha);
                None
            }
        },
        None => None,
    };
    let n = conn.execute(
        "INSERT OR IGNORE INTO commits (repository_id, sha, committer_name, committer_email, committed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            repository_id,
            commit.sha,
            commit.committer_name,
            commit.committer_email,
            committed_at
        ],
    )?;
    Ok(n > 0)
}

/// One repository and its commits, as found in an import fixture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryImport {
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub is_fork: Option<bool>,
    #[serde(default)]
    pub commits: Vec<CommitInput>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub repositories: usize,
    pub commits_inserted: usize,
    /// Already present under the same `(repository, sha)`.
    pub commits_skipped: usize,
}

/// Load repositories and their commits in one transaction.
pub fn import_repositories(
    conn: &mut Connection,
    repos: &[RepositoryImport],
    has_fork_column: bool,
) -> Result<ImportReport, rusqlite::Error> {
    let tx = conn.transaction()?;
    let mut report = ImportReport::default();
    for repo in repos {
        let id = upsert_repository(&tx, &repo.owner, &repo.name, repo.is_fork, has_fork_column)?;
        report.repositories += 1;
        for commit in &repo.commits {
            if insert_commit(&tx, id, commit)? {
                report.commits_inserted += 1;
            } else {
                report.commits_skipped += 1;
            }
        }
    }
    tx.commit()?;
    Ok(report)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub repositories: i64,
    pub commits: i64,
    /// Distinct normalized emails, before identity filtering.
    pub identities: i64,
    pub first_commit_at: Option<String>,
    pub last_commit_at: Option<String>,
}

pub fn store_stats(conn: &Connection) -> Result<StoreStats, rusqlite::Error> {
    let repositories: i64 =
        conn.query_row("SELECT COUNT(*) FROM repositories", [], |row| row.get(0))?;
    let (commits, identities, first_commit_at, last_commit_at) = conn.query_row(
        "SELECT COUNT(*),
                COUNT(DISTINCT CASE WHEN trim(committer_email) != '' THEN lower(trim(committer_email)) END),
                MIN(committed_at),
                MAX(committed_at)
         FROM commits",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;
    Ok(StoreStats {
        repositories,
        commits,
        identities,
        first_commit_at,
        last_commit_at,
    })
}

// ── App Config ─────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn delete_config(conn: &Connection, key: &str) -> Result<bool, rusqlite::Error> {
    let n = conn.execute("DELETE FROM app_config WHERE key = ?1", params![key])?;
    Ok(n > 0)
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Result Cache ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CacheRow {
    pub metric_family: String,
    pub payload: String,
    pub created_at: String,
    pub expires_at: String,
}

pub fn get_cache_entry(conn: &Connection, key: &str) -> Result<Option<CacheRow>, rusqlite::Error> {
    conn.query_row(
        "SELECT metric_family, payload, created_at, expires_at FROM result_cache WHERE cache_key = ?1",
        params![key],
        |row| {
            Ok(CacheRow {
                metric_family: row.get(0)?,
                payload: row.get(1)?,
                created_at: row.get(2)?,
                expires_at: row.get(3)?,
            })
        },
    )
    .optional()
}

pub fn put_cache_entry(
    conn: &Connection,
    key: &str,
    entry: &CacheRow,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO result_cache (cache_key, metric_family, payload, created_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            key,
            entry.metric_family,
            entry.payload,
            entry.created_at,
            entry.expires_at
        ],
    )?;
    Ok(())
}

/// Delete `key` only if it is still expired at `now`, so a concurrent
/// repopulation is not thrown away.
pub fn delete_expired_cache_entry(
    conn: &Connection,
    key: &str,
    now: &str,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "DELETE FROM result_cache WHERE cache_key = ?1 AND expires_at <= ?2",
        params![key, now],
    )
}

pub fn sweep_cache(conn: &Connection, now: &str) -> Result<usize, rusqlite::Error> {
    conn.execute("DELETE FROM result_cache WHERE expires_at <= ?1", params![now])
}

/// Remove every entry, or only those of one metric family.
pub fn clear_cache(conn: &Connection, family: Option<&str>) -> Result<usize, rusqlite::Error> {
    match family {
        Some(f) => conn.execute("DELETE FROM result_cache WHERE metric_family = ?1", params![f]),
        None => conn.execute("DELETE FROM result_cache", []),
    }
}

/// Live entry count per metric family.
pub fn count_live_cache_entries(
    conn: &Connection,
    now: &str,
) -> Result<Vec<(String, i64)>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT metric_family, COUNT(*) FROM result_cache
         WHERE expires_at > ?1
         GROUP BY metric_family ORDER BY metric_family",
    )?;
    let rows = stmt.query_map(params![now], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}
