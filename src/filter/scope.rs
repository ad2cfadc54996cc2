use serde::Serialize;

use crate::config::{EngineConfig, RepositoryRef};
use crate::error::Result;
use crate::storage::{repository, Database, SchemaCapabilities};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryDescriptor {
    pub id: i64,
    pub owner: String,
    pub name: String,
    /// `None` when unknown or when the store has no fork column.
    pub is_fork: Option<bool>,
}

/// Decides which repositories participate in a computation.
#[derive(Debug, Clone)]
pub struct ScopeQualifier {
    exclusions: Vec<RepositoryRef>,
    capabilities: SchemaCapabilities,
}

impl ScopeQualifier {
    pub fn new(exclusions: &[RepositoryRef], capabilities: SchemaCapabilities) -> Self {
        let exclusions = exclusions
            .iter()
            .map(|r| RepositoryRef::new(&r.owner.to_lowercase(), &r.name.to_lowercase()))
            .collect();
        Self {
            exclusions,
            capabilities,
        }
    }

    pub fn from_config(config: &EngineConfig, capabilities: SchemaCapabilities) -> Self {
        Self::new(&config.repository_exclusions, capabilities)
    }

    pub fn capabilities(&self) -> SchemaCapabilities {
        self.capabilities
    }

    pub fn qualifies(&self, repo: &RepositoryDescriptor) -> bool {
        if self.capabilities.has_fork_column && repo.is_fork == Some(true) {
            return false;
        }
        let owner = repo.owner.to_lowercase();
        let name = repo.name.to_lowercase();
        !self
            .exclusions
            .iter()
            .any(|r| r.owner == owner && r.name == name)
    }

    /// Ids of every repository in the store that does not qualify.
    ///
    /// A failed listing is retried once. If the fork column has disappeared
    /// since start-up, the listing falls back to owner/name only and fork
    /// exclusion is skipped for this request.
    pub async fn resolve(&self, db: &Database) -> Result<Vec<i64>> {
        let with_fork = self.capabilities.has_fork_column;
        let repos = match list(db, with_fork).await {
            Ok(repos) => repos,
            Err(e) => {
                log::warn!("Listing repositories failed ({e}), retrying once");
                match list(db, with_fork).await {
                    Ok(repos) => repos,
                    Err(e) if with_fork => {
                        log::warn!(
                            "Listing repositories with fork flag failed ({e}); fork exclusion disabled for this request"
                        );
                        list(db, false).await?
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        let excluded: Vec<i64> = repos
            .iter()
            .filter(|r| !self.qualifies(r))
            .map(|r| r.id)
            .collect();
        if !excluded.is_empty() {
            log::debug!("{} of {} repositories out of scope", excluded.len(), repos.len());
        }
        Ok(excluded)
    }
}

async fn list(db: &Database, with_fork: bool) -> Result<Vec<RepositoryDescriptor>> {
    let repos = db
        .reader()
        .call(move |conn| repository::list_repositories(conn, with_fork))
        .await?;
    Ok(repos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(id: i64, owner: &str, name: &str, is_fork: Option<bool>) -> RepositoryDescriptor {
        RepositoryDescriptor {
            id,
            owner: owner.into(),
            name: name.into(),
            is_fork,
        }
    }

    #[test]
    fn test_fork_excluded_only_when_column_exists() {
        let with = ScopeQualifier::new(&[], SchemaCapabilities { has_fork_column: true });
        let without = ScopeQualifier::new(&[], SchemaCapabilities::default());
        let fork = repo(1, "someone", "core", Some(true));

        assert!(!with.qualifies(&fork));
        assert!(without.qualifies(&fork));
        assert!(with.qualifies(&repo(2, "acme", "core", Some(false))));
        // Unknown is not the same as "not a fork", but it is not a fork flag either.
        assert!(with.qualifies(&repo(3, "acme", "tools", None)));
    }

    #[test]
    fn test_exclusion_list_is_case_insensitive() {
        let q = ScopeQualifier::new(
            &[RepositoryRef::new("Upstream", "Mirror")],
            SchemaCapabilities::default(),
        );
        assert!(!q.qualifies(&repo(1, "upstream", "MIRROR", None)));
        assert!(q.qualifies(&repo(2, "upstream", "mirror-tools", None)));
        assert!(q.qualifies(&repo(3, "other", "mirror", None)));
    }

    #[tokio::test]
    async fn test_resolve_against_store() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                repository::upsert_repository(conn, "acme", "core", Some(false), true)?;
                repository::upsert_repository(conn, "acme", "core-fork", Some(true), true)?;
                repository::upsert_repository(conn, "upstream", "mirror", None, true)?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();

        let caps = db.probe_capabilities().await;
        let q = ScopeQualifier::new(&[RepositoryRef::new("UPSTREAM", "mirror")], caps);
        let mut excluded = q.resolve(&db).await.unwrap();
        excluded.sort();
        assert_eq!(excluded, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_resolve_survives_dropped_fork_column() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                repository::upsert_repository(conn, "acme", "core", Some(false), true)?;
                repository::upsert_repository(conn, "upstream", "mirror", Some(true), true)?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
        let caps = db.probe_capabilities().await;
        assert!(caps.has_fork_column);

        db.writer()
            .call(|conn| {
                conn.execute_batch("ALTER TABLE repositories DROP COLUMN is_fork")?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();

        let q = ScopeQualifier::new(&[RepositoryRef::new("acme", "core")], caps);
        assert_eq!(q.resolve(&db).await.unwrap(), vec![1]);
    }
}
