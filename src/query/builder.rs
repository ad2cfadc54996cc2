use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::date_util::{format_ts, parse_ts};
use crate::error::Result;
use crate::query::window::Window;
use crate::storage::Database;

/// Commit-store columns a predicate may reference. Column names are never
/// taken from input, only from this list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    RepositoryId,
    CommittedAt,
    CommitterName,
    CommitterEmail,
}

impl Field {
    fn column(&self) -> &'static str {
        match self {
            Field::RepositoryId => "c.repository_id",
            Field::CommittedAt => "c.committed_at",
            Field::CommitterName => "c.committer_name",
            Field::CommitterEmail => "c.committer_email",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ge,
    Lt,
    IsNotNull,
    /// Not NULL and not blank after trimming.
    NotBlank,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Int(i64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    fn boxed(&self) -> Option<Box<dyn rusqlite::types::ToSql>> {
        match self {
            Value::Int(i) => Some(Box::new(*i)),
            Value::Text(s) => Some(Box::new(s.clone())),
            Value::None | Value::List(_) => None,
        }
    }
}

/// One `(field, operator, value)` filter. All predicates of a query are ANDed.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: Field,
    pub op: Op,
    pub value: Value,
}

impl Predicate {
    pub fn new(field: Field, op: Op, value: Value) -> Self {
        Self { field, op, value }
    }

    pub fn at_or_after(ts: DateTime<Utc>) -> Self {
        Self::new(Field::CommittedAt, Op::Ge, Value::Text(format_ts(ts)))
    }

    pub fn before(ts: DateTime<Utc>) -> Self {
        Self::new(Field::CommittedAt, Op::Lt, Value::Text(format_ts(ts)))
    }

    pub fn repository_not_in(ids: &[i64]) -> Self {
        Self::new(
            Field::RepositoryId,
            Op::NotIn,
            Value::List(ids.iter().map(|id| Value::Int(*id)).collect()),
        )
    }

    /// Append this predicate's SQL and bound parameters.
    fn compile(
        &self,
        params: &mut Vec<Box<dyn rusqlite::types::ToSql>>,
    ) -> String {
        let col = self.field.column();
        let mut bind = |v: &Value| -> String {
            match v.boxed() {
                Some(b) => {
                    params.push(b);
                    format!("?{}", params.len())
                }
                None => "NULL".to_string(),
            }
        };
        match self.op {
            Op::Eq => format!("{col} = {}", bind(&self.value)),
            Op::Ge => format!("{col} >= {}", bind(&self.value)),
            Op::Lt => format!("{col} < {}", bind(&self.value)),
            Op::IsNotNull => format!("{col} IS NOT NULL"),
            Op::NotBlank => format!("{col} IS NOT NULL AND trim({col}) != ''"),
            Op::In | Op::NotIn => {
                let items: Vec<&Value> = match &self.value {
                    Value::List(items) => items.iter().collect(),
                    other => vec![other],
                };
                if items.is_empty() {
                    // Empty IN matches nothing; empty NOT IN matches everything.
                    return if self.op == Op::In { "0".into() } else { "1".into() };
                }
                let placeholders: Vec<String> = items.into_iter().map(&mut bind).collect();
                let kw = if self.op == Op::In { "IN" } else { "NOT IN" };
                format!("{col} {kw} ({})", placeholders.join(", "))
            }
        }
    }
}

/// A commit joined to its repository.
#[derive(Debug, Clone, Serialize)]
pub struct CommitRow {
    pub repository_id: i64,
    pub sha: String,
    pub committer_name: Option<String>,
    pub committer_email: Option<String>,
    pub committed_at: Option<DateTime<Utc>>,
}

/// Earliest commit of one `(identity, display name)` pair.
#[derive(Debug, Clone, Serialize)]
pub struct FirstCommitRow {
    pub identity: String,
    pub committer_name: Option<String>,
    pub first_commit_at: DateTime<Utc>,
}

/// Builder for parameterized commit-store scans.
#[derive(Debug, Clone, Default)]
pub struct CommitQuery {
    predicates: Vec<Predicate>,
}

impl CommitQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn predicate(mut self, p: Predicate) -> Self {
        self.predicates.push(p);
        self
    }

    /// Commits with `committed_at` in `[window.start, window.end)`.
    pub fn window(self, window: &Window) -> Self {
        let q = self.predicate(Predicate::at_or_after(window.start));
        match window.end {
            Some(end) => q.predicate(Predicate::before(end)),
            None => q,
        }
    }

    pub fn exclude_repositories(self, ids: &[i64]) -> Self {
        if ids.is_empty() {
            self
        } else {
            self.predicate(Predicate::repository_not_in(ids))
        }
    }

    /// Only commits that can be attributed and placed in time.
    pub fn attributable(self) -> Self {
        self.predicate(Predicate::new(Field::CommitterEmail, Op::NotBlank, Value::None))
            .predicate(Predicate::new(Field::CommittedAt, Op::IsNotNull, Value::None))
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Scan matching commits.
    pub async fn rows(self, db: &Database) -> Result<Vec<CommitRow>> {
        let builder = self;
        db.reader()
            .call(move |conn| {
                let (sql, params) = builder.build_rows_sql();
                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(param_refs.as_slice(), |row| {
                    let committed_at: Option<String> = row.get(4)?;
                    Ok(CommitRow {
                        repository_id: row.get(0)?,
                        sha: row.get(1)?,
                        committer_name: row.get(2)?,
                        committer_email: row.get(3)?,
                        committed_at: committed_at.as_deref().and_then(parse_ts),
                    })
                })?;
                let result: std::result::Result<Vec<CommitRow>, _> = rows.collect();
                result
            })
            .await
            .map_err(|e| crate::error::Error::Database(e.to_string()))
    }

    /// Earliest commit per `(identity, name)` pair across everything matching.
    pub async fn first_commits(self, db: &Database) -> Result<Vec<FirstCommitRow>> {
        let builder = self;
        db.reader()
            .call(move |conn| {
                let (sql, params) = builder.build_first_seen_sql();
                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(param_refs.as_slice(), |row| {
                    let first: String = row.get(2)?;
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?, first))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (identity, committer_name, first) = row?;
                    match parse_ts(&first) {
                        Some(first_commit_at) => out.push(FirstCommitRow {
                            identity,
                            committer_name,
                            first_commit_at,
                        }),
                        None => log::warn!("Skipping unparseable commit timestamp '{first}' for {identity}"),
                    }
                }
                Ok::<Vec<FirstCommitRow>, rusqlite::Error>(out)
            })
            .await
            .map_err(|e| crate::error::Error::Database(e.to_string()))
    }

    fn build_where(&self) -> (String, Vec<Box<dyn rusqlite::types::ToSql>>) {
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let wheres: Vec<String> = self
            .predicates
            .iter()
            .map(|p| p.compile(&mut params))
            .collect();
        if wheres.is_empty() {
            (String::new(), params)
        } else {
            (format!(" WHERE {}", wheres.join(" AND ")), params)
        }
    }

    fn build_rows_sql(&self) -> (String, Vec<Box<dyn rusqlite::types::ToSql>>) {
        let (where_clause, params) = self.build_where();
        let sql = format!(
            "SELECT c.repository_id, c.sha, c.committer_name, c.committer_email, c.committed_at
             FROM commits c
             JOIN repositories r ON r.id = c.repository_id{where_clause}
             ORDER BY c.committed_at"
        );
        (sql, params)
    }

    fn build_first_seen_sql(&self) -> (String, Vec<Box<dyn rusqlite::types::ToSql>>) {
        let (where_clause, params) = self.build_where();
        let sql = format!(
            "SELECT lower(trim(c.committer_email)) AS identity, c.committer_name, MIN(c.committed_at)
             FROM commits c
             JOIN repositories r ON r.id = c.repository_id{where_clause}
             GROUP BY identity, c.committer_name"
        );
        (sql, params)
    }
}
