use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid period format: {0}")]
    PeriodParse(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Timed out after {after:?} computing {label}")]
    Timeout { label: String, after: Duration },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Malformed input from the caller. The only class allowed to fail a request.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Config(_) | Error::PeriodParse(_))
    }

    /// Store-side failures that are worth a single retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Timeout { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(format!("JSON error: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::Config("end before start".into()).is_configuration());
        assert!(Error::PeriodParse("garbage".into()).is_configuration());
        assert!(!Error::Database("locked".into()).is_configuration());

        assert!(Error::Database("locked".into()).is_transient());
        assert!(Error::Timeout {
            label: "2025-01".into(),
            after: Duration::from_secs(1),
        }
        .is_transient());
        assert!(!Error::Config("x".into()).is_transient());
        assert!(!Error::Cache("x".into()).is_transient());
    }

    #[test]
    fn test_timeout_display_names_label() {
        let e = Error::Timeout {
            label: "2025-Q1".into(),
            after: Duration::from_millis(250),
        };
        assert!(e.to_string().contains("2025-Q1"));
    }
}
