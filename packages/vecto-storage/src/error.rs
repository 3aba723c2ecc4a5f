//! Error types for vecto-storage

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Database errors (connection, I/O, busy)
    Database,
    /// Serialization/deserialization errors
    Serialization,
    /// Row not found
    NotFound,
    /// Constraint violation that is not part of an idempotent path.
    /// Usually means the schema and the code disagree.
    Constraint,
    /// Row exists but is not in a state that allows the requested change
    InvalidTransition,
    /// Configuration errors
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Constraint => "constraint",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("Job not found: {}", job_id))
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Constraint, message)
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidTransition, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// True when retrying the same operation cannot succeed.
    ///
    /// A row in the wrong state stays in the wrong state, so transition
    /// errors count alongside constraint violations.
    pub fn is_structural(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Constraint
                | ErrorKind::InvalidTransition
                | ErrorKind::Serialization
                | ErrorKind::Config
        )
    }
}

// SQLite error conversions
#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        let is_constraint = match &err {
            sqlx::Error::Database(db) => !matches!(db.kind(), sqlx::error::ErrorKind::Other),
            _ => false,
        };
        if is_constraint {
            StorageError::constraint(format!("SQLite constraint violation: {}", err)).with_source(err)
        } else {
            StorageError::database(format!("SQLite error: {}", err)).with_source(err)
        }
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;
