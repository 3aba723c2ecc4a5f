use thiserror::Error;
use vecto_storage::{ErrorKind, StorageError};

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Stale input for {resource_key}: resolved {age_secs}s ago (max {max_secs}s)")]
    StaleInput {
        resource_key: String,
        age_secs: i64,
        max_secs: u64,
    },

    #[error("Lock busy: {0}")]
    LockBusy(String),

    #[error("Provider chain exhausted for role '{role}': {detail}")]
    ProviderFailure { role: String, detail: String },

    #[error("Quorum not met: {succeeded} of {total} roles succeeded ({required} required)")]
    QuorumNotMet {
        succeeded: usize,
        required: usize,
        total: usize,
    },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Invalid output: {0}")]
    InvalidOutput(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn schema<E: std::fmt::Display>(e: E) -> Self {
        Self::SchemaMismatch(e.to_string())
    }

    pub fn invalid_output<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidOutput(e.to_string())
    }

    /// Stable code recorded on the job and in the audit line
    pub fn code(&self) -> &'static str {
        match self {
            Self::StaleInput { .. } => "STALE_INPUT",
            Self::LockBusy(_) => "LOCK_BUSY",
            Self::ProviderFailure { .. } => "PROVIDER_FAILURE",
            Self::QuorumNotMet { .. } => "QUORUM_NOT_MET",
            Self::SchemaMismatch(_) => "SCHEMA_MISMATCH",
            Self::InvalidOutput(_) => "INVALID_OUTPUT",
            Self::Timeout(_) => "TIMEOUT",
            Self::Cancelled(_) => "CANCELLED",
            // A constraint violation outside the idempotent paths means the
            // schema and the code disagree
            Self::Storage(e) if e.is_structural() && e.kind != ErrorKind::InvalidTransition => {
                "SCHEMA_MISMATCH"
            }
            Self::Storage(_) => "STORAGE",
            Self::Config(_) => "CONFIG",
            Self::Serialization(_) => "SCHEMA_MISMATCH",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ProviderFailure { .. }
            | Self::QuorumNotMet { .. }
            | Self::InvalidOutput(_)
            | Self::Timeout(_)
            | Self::Cancelled(_)
            | Self::LockBusy(_) => ErrorCategory::Transient,
            Self::Storage(e) if e.is_structural() => ErrorCategory::Permanent,
            Self::Storage(_) => ErrorCategory::Transient,
            Self::StaleInput { .. } | Self::SchemaMismatch(_) | Self::Serialization(_) => {
                ErrorCategory::Permanent
            }
            Self::Config(_) | Self::Internal(_) => ErrorCategory::Infrastructure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - retry with backoff (e.g., timeout, quorum miss)
    Transient,
    /// Permanent error - don't retry (e.g., schema mismatch, stale input)
    Permanent,
    /// Infrastructure error - stop and alert ops (e.g., bad config, panic)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
