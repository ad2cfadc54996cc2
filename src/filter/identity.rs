use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::EngineConfig;

/// Email shapes that never belong to a human, independent of configuration.
static RE_NON_HUMAN_EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"noreply@github\.com|github-actions|\[bot\]|bot@").unwrap()
});

/// Normalize a committer email into an identity: trimmed and lower-cased.
/// `None` when nothing is left.
pub fn normalize_identity(email: &str) -> Option<String> {
    let normalized = email.trim().to_lowercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Decides whether a commit is a genuine human contribution.
///
/// Exclusion tokens are case-insensitive substrings checked against both the
/// committer name and email. A legitimate contributor whose name happens to
/// contain a token (say, "Travis Smith" against `travis`) is excluded too;
/// that loss of recall is accepted.
#[derive(Debug, Clone)]
pub struct IdentityFilter {
    tokens: Vec<String>,
}

impl IdentityFilter {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens = tokens
            .into_iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self { tokens }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.identity_exclusions)
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// True if the `(name, email)` pair must not be counted.
    pub fn is_excluded(&self, name: Option<&str>, email: Option<&str>) -> bool {
        let Some(email) = email.and_then(normalize_identity) else {
            return true;
        };
        if RE_NON_HUMAN_EMAIL.is_match(&email) {
            return true;
        }
        let name = name.map(|n| n.trim().to_lowercase()).unwrap_or_default();
        self.tokens
            .iter()
            .any(|t| email.contains(t.as_str()) || name.contains(t.as_str()))
    }

    /// [`IdentityFilter::is_excluded`], plus commits that cannot be placed in time.
    pub fn is_excluded_commit(
        &self,
        name: Option<&str>,
        email: Option<&str>,
        committed_at: Option<DateTime<Utc>>,
    ) -> bool {
        committed_at.is_none() || self.is_excluded(name, email)
    }
}

impl Default for IdentityFilter {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}
