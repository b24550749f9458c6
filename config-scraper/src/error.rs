//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    /// Network/API failure while talking to a scrape source.
    #[error("Source {source_id} error: {message}")]
    Source { source_id: String, message: String },

    #[error("Dependency resolution failed after {attempts} attempts: {message}")]
    DependencyResolution { attempts: u32, message: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn source(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    pub fn invalid_schedule(expr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            expr: expr.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error is worth retrying (network/API or busy database).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Source { .. } | Self::DependencyResolution { .. } => true,
            Self::DatabaseSqlx(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed
            ),
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Whether the error is a configuration problem that only a config update fixes.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::InvalidSchedule { .. } | Self::Validation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::source("aws-prod", "connection reset").is_transient());
        assert!(!Error::source("aws-prod", "connection reset").is_configuration());

        let err = Error::invalid_schedule("every day", "unknown descriptor");
        assert!(err.is_configuration());
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "Invalid schedule 'every day': unknown descriptor");
    }

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found("ScrapeSource", "abc");
        assert_eq!(err.to_string(), "Entity not found: ScrapeSource with id abc");
    }
}
