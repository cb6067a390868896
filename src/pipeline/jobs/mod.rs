//! Job state machine and asynchronous execution.
//!
//! ```text
//! PENDING ──claim──▶ RUNNING ──complete──▶ COMPLETED { audit_id }
//!    │                  └─────fail──────▶ FAILED { kind, detail }
//!    └──────cancel─────────────────────▶ FAILED { cancelled }
//! ```
//!
//! Terminal states are immutable. Every transition is a compare-and-set on
//! the `jobs` row, so a job can only be claimed once, and a cancelled job can
//! never be completed by a worker that picked it up late.

mod orchestrator;
mod queue;
mod worker;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use orchestrator::JobOrchestrator;
pub use queue::{ChannelQueue, JobQueue, WorkerPool};
pub use worker::AuditWorker;

use super::abi::InterfaceDescription;
use super::error::{FailureKind, JobError};
use super::record::AuditId;
use super::types::{ContractAddress, Network};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flat status as stored in the `jobs.state` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Job state with the data each state carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed { audit_id: AuditId },
    Failed(JobFailure),
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Pending => JobStatus::Pending,
            Self::Running => JobStatus::Running,
            Self::Completed { .. } => JobStatus::Completed,
            Self::Failed(_) => JobStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// PENDING → RUNNING.
    pub fn start(&self, id: JobId) -> Result<Self, JobError> {
        self.transition(id, JobStatus::Pending, Self::Running)
    }

    /// RUNNING → COMPLETED.
    pub fn complete(&self, id: JobId, audit_id: AuditId) -> Result<Self, JobError> {
        self.transition(id, JobStatus::Running, Self::Completed { audit_id })
    }

    /// RUNNING → FAILED.
    pub fn fail(&self, id: JobId, failure: JobFailure) -> Result<Self, JobError> {
        self.transition(id, JobStatus::Running, Self::Failed(failure))
    }

    /// PENDING → FAILED(cancelled).
    pub fn cancel(&self, id: JobId) -> Result<Self, JobError> {
        self.transition(
            id,
            JobStatus::Pending,
            Self::Failed(JobFailure::new(FailureKind::Cancelled, "cancelled before execution")),
        )
    }

    fn transition(&self, id: JobId, required: JobStatus, next: Self) -> Result<Self, JobError> {
        let current = self.status();
        if current.is_terminal() {
            return Err(JobError::AlreadyTerminal { id, state: current });
        }
        if current != required {
            return Err(JobError::InvalidTransition {
                id,
                from: current,
                to: next.status(),
            });
        }
        Ok(next)
    }
}

/// Per-submission options, persisted with the job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditOptions {
    /// Bypass the cache and fetch from the registry.
    #[serde(default)]
    pub force_refresh: bool,
    /// With `force_refresh`, allow the fetch to replace a manual override.
    #[serde(default)]
    pub override_manual: bool,
    /// Call-scoped description; used as-is and never cached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_abi: Option<InterfaceDescription>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub address: ContractAddress,
    pub network: Network,
    pub options: AuditOptions,
    #[serde(flatten)]
    pub state: JobState,
    /// Resolution attempts made by the last run.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Opaque descriptor handed to the execution substrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub job_id: JobId,
    pub address: ContractAddress,
    pub network: Network,
    pub options: AuditOptions,
}

impl From<&Job> for WorkItem {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            address: job.address,
            network: job.network.clone(),
            options: job.options.clone(),
        }
    }
}
