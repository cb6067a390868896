//! Error taxonomy of the audit pipeline.
//!
//! Each stage has its own error type. Whatever ends a job is reduced to a
//! [`FailureKind`], which is what gets persisted and shown to pollers.

use serde::{Deserialize, Serialize};

use super::jobs::{JobId, JobStatus};
use super::types::{ContractAddress, Network};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    /// No source produced a description. Permanent for this input.
    #[error("no interface description found for {address} on {network}")]
    NotFound {
        address: ContractAddress,
        network: Network,
    },

    /// The registry was reachable but errored (timeout, rate limit, bad payload). Retryable.
    #[error("interface registry unavailable: {0}")]
    RemoteUnavailable(String),
}

impl ResolutionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScoringError {
    #[error("risk model unavailable: {0}")]
    ModelUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("write conflict: {0}")]
    WriteConflict(String),

    #[error("persistence store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::WriteConflict(db_err.message().to_string())
            }
            _ => Self::Unavailable(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Unavailable(format!("corrupt stored document: {err}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {id} is already {state}")]
    AlreadyTerminal { id: JobId, state: JobStatus },

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("execution queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Failure of one pipeline run inside a worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Scoring(#[from] ScoringError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl AuditError {
    pub fn classification(&self) -> FailureKind {
        match self {
            Self::Resolution(ResolutionError::NotFound { .. }) => FailureKind::NotFound,
            Self::Resolution(ResolutionError::RemoteUnavailable(_)) => {
                FailureKind::RemoteUnavailable
            }
            Self::Scoring(ScoringError::ModelUnavailable(_)) => FailureKind::ModelUnavailable,
            Self::Persistence(PersistenceError::WriteConflict(_)) => FailureKind::WriteConflict,
            Self::Persistence(PersistenceError::Unavailable(_)) => {
                FailureKind::PersistenceUnavailable
            }
        }
    }
}

/// Persisted classification of a FAILED job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The contract has no description in any source.
    NotFound,
    /// The registry kept failing; retry later.
    RemoteUnavailable,
    /// Operational issue with the scoring model.
    ModelUnavailable,
    PersistenceUnavailable,
    WriteConflict,
    /// Cancelled while still pending.
    Cancelled,
    /// The process running the job stopped before it finished.
    Interrupted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::RemoteUnavailable => "remote_unavailable",
            Self::ModelUnavailable => "model_unavailable",
            Self::PersistenceUnavailable => "persistence_unavailable",
            Self::WriteConflict => "write_conflict",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "not_found" => Some(Self::NotFound),
            "remote_unavailable" => Some(Self::RemoteUnavailable),
            "model_unavailable" => Some(Self::ModelUnavailable),
            "persistence_unavailable" => Some(Self::PersistenceUnavailable),
            "write_conflict" => Some(Self::WriteConflict),
            "cancelled" => Some(Self::Cancelled),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
