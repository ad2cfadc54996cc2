use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::date_util::parse_date;
use crate::error::{Error, Result};
use crate::query::period::Era;

/// Service, CI, placeholder and duplicate identities dropped from every count.
/// Matched as case-insensitive substrings of the committer name or email.
const DEFAULT_IDENTITY_EXCLUSIONS: &[&str] = &[
    "dependabot",
    "renovate",
    "github-actions",
    "actions-user",
    "semantic-release",
    "greenkeeper",
    "snyk-bot",
    "codecov",
    "mergify",
    "imgbot",
    "allcontributors",
    "pre-commit-ci",
    "travis",
    "circleci",
    "jenkins",
    "buildkite",
    "gitlab-runner",
    "azure-pipelines",
    "bitbucket-pipelines",
    "deploy-bot",
    "release-bot",
    "ci-bot",
    "build-bot",
    "automation@",
    "noreply@",
    "localhost",
    "localdomain",
    "@example.com",
    "your.email@",
    "(none)",
];

/// An `owner/name` pair naming one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub owner: String,
    pub name: String,
}

impl RepositoryRef {
    pub fn new(owner: &str, name: &str) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
        }
    }

    /// Parse `owner/name`.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(owner, name))
            }
            _ => Err(Error::Config(format!("expected owner/name, got '{s}'"))),
        }
    }
}

/// Time-to-live per metric family, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    pub mad_sum_secs: u64,
    pub new_developers_secs: u64,
    pub time_series_secs: u64,
    pub repository_activity_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            mad_sum_secs: 3600,
            // Full-history scan; the most expensive family.
            new_developers_secs: 6 * 3600,
            time_series_secs: 3600,
            repository_activity_secs: 1800,
        }
    }
}

/// Engine configuration.
///
/// Resolution order: built-in defaults, then a JSON file, then key/value
/// overrides from the `app_config` table (see [`EngineConfig::apply_overrides`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub identity_exclusions: Vec<String>,
    pub repository_exclusions: Vec<RepositoryRef>,
    pub eras: Vec<Era>,
    /// Windows aggregated concurrently per batch.
    pub batch_size: usize,
    pub window_timeout_secs: u64,
    pub rolling_window_days: u32,
    /// Upper bound on calendar-month windows per request.
    pub month_window_cap: usize,
    /// First quarter of the quarter table.
    pub quarter_epoch: NaiveDate,
    pub ttl: TtlConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            identity_exclusions: DEFAULT_IDENTITY_EXCLUSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            repository_exclusions: Vec::new(),
            eras: Vec::new(),
            batch_size: 5,
            window_timeout_secs: 30,
            rolling_window_days: 30,
            month_window_cap: 24,
            quarter_epoch: NaiveDate::from_ymd_opt(2019, 1, 1).unwrap_or_default(),
            ttl: TtlConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Default config file location (`~/.devactivity/config.json`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".devactivity").join("config.json"))
    }

    /// Load from the default location, falling back to built-in defaults when
    /// no file exists there.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let config: EngineConfig = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        log::debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    pub fn window_timeout(&self) -> Duration {
        Duration::from_secs(self.window_timeout_secs)
    }

    /// Apply `app_config` key/value overrides. List values are comma-separated
    /// and replace the configured list wholesale.
    pub fn apply_overrides(&mut self, overrides: &[(String, String)]) -> Result<()> {
        for (key, value) in overrides {
            match key.as_str() {
                "identity_exclusions" => {
                    self.identity_exclusions = split_list(value).map(str::to_string).collect();
                }
                "repository_exclusions" => {
                    self.repository_exclusions = split_list(value)
                        .map(RepositoryRef::parse)
                        .collect::<Result<Vec<_>>>()?;
                }
                "batch_size" => self.batch_size = parse_num(key, value)?,
                "window_timeout_secs" => self.window_timeout_secs = parse_num(key, value)?,
                "rolling_window_days" => self.rolling_window_days = parse_num(key, value)?,
                "month_window_cap" => self.month_window_cap = parse_num(key, value)?,
                "quarter_epoch" => {
                    self.quarter_epoch = parse_date(value).ok_or_else(|| {
                        Error::Config(format!("{key}: expected YYYY-MM-DD, got '{value}'"))
                    })?;
                }
                "ttl.mad_sum" => self.ttl.mad_sum_secs = parse_num(key, value)?,
                "ttl.new_developers" => self.ttl.new_developers_secs = parse_num(key, value)?,
                "ttl.time_series" => self.ttl.time_series_secs = parse_num(key, value)?,
                "ttl.repository_activity" => {
                    self.ttl.repository_activity_secs = parse_num(key, value)?
                }
                other => log::warn!("Ignoring unknown config override '{other}'"),
            }
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.rolling_window_days == 0 {
            return Err(Error::Config("rolling_window_days must be at least 1".into()));
        }
        if self.month_window_cap == 0 {
            return Err(Error::Config("month_window_cap must be at least 1".into()));
        }
        if self.window_timeout_secs == 0 {
            return Err(Error::Config("window_timeout_secs must be at least 1".into()));
        }
        for (i, era) in self.eras.iter().enumerate() {
            if let Some(end) = era.end {
                if end <= era.start {
                    return Err(Error::Config(format!(
                        "era '{}' ends ({end}) before it starts ({})",
                        era.key, era.start
                    )));
                }
            }
            if self.eras[..i].iter().any(|e| e.key.eq_ignore_ascii_case(&era.key)) {
                return Err(Error::Config(format!("duplicate era '{}'", era.key)));
            }
        }
        Ok(())
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: expected a number, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.month_window_cap, 24);
        assert_eq!(config.identity_exclusions.len(), 30);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "batch_size": 3,
                "repository_exclusions": [{{"owner": "upstream", "name": "mirror"}}],
                "eras": [{{"key": "klaytn-2022", "label": "Klaytn", "start": "2022-01-01", "end": "2024-08-29"}}]
            }}"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.repository_exclusions, vec![RepositoryRef::new("upstream", "mirror")]);
        assert_eq!(config.eras.len(), 1);
        assert_eq!(config.rolling_window_days, 30);
        assert_eq!(config.identity_exclusions.len(), 30);
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(EngineConfig::load(file.path()), Err(Error::Config(_))));
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = EngineConfig::default();
        config
            .apply_overrides(&[
                ("identity_exclusions".into(), "bot-a, bot-b,,".into()),
                ("repository_exclusions".into(), "acme/mirror,Other/Fork".into()),
                ("batch_size".into(), "8".into()),
                ("ttl.new_developers".into(), "60".into()),
                ("quarter_epoch".into(), "2020-01-01".into()),
                ("some_unrelated_key".into(), "x".into()),
            ])
            .unwrap();
        assert_eq!(config.identity_exclusions, vec!["bot-a", "bot-b"]);
        assert_eq!(config.repository_exclusions.len(), 2);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.ttl.new_developers_secs, 60);
        assert_eq!(config.quarter_epoch, NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
    }

    #[test]
    fn test_apply_overrides_rejects_bad_values() {
        let mut config = EngineConfig::default();
        assert!(config
            .apply_overrides(&[("batch_size".into(), "many".into())])
            .is_err());
        assert!(config
            .apply_overrides(&[("batch_size".into(), "0".into())])
            .is_err());
        assert!(config
            .apply_overrides(&[("repository_exclusions".into(), "no-slash".into())])
            .is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_era() {
        let config = EngineConfig {
            eras: vec![Era {
                key: "bad".into(),
                label: "Bad".into(),
                start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2023, 1, 1),
            }],
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_repository_ref_parse() {
        assert_eq!(RepositoryRef::parse("a/b").unwrap(), RepositoryRef::new("a", "b"));
        assert!(RepositoryRef::parse("a/").is_err());
        assert!(RepositoryRef::parse("a/b/c").is_err());
    }
}
