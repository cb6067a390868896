//! Audit records: the immutable outcome of one successful pipeline run.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::abi::{AbiSourceTag, InterfaceDescription};
use super::jobs::{JobId, JobStatus};
use super::scoring::RiskAssessment;
use super::types::{ContractAddress, Network};

/// Default and maximum page size of [`AuditFilter`] queries.
pub const DEFAULT_AUDIT_LIMIT: u32 = 50;
pub const MAX_AUDIT_LIMIT: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditId(pub i64);

impl fmt::Display for AuditId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only values fetched from the contract (`name`, `symbol`, ...).
pub type ContractMetadata = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub id: AuditId,
    pub job_id: JobId,
    pub address: ContractAddress,
    pub network: Network,
    /// Job status at the time the record was written.
    pub status: JobStatus,
    pub assessment: RiskAssessment,
    pub abi_source: AbiSourceTag,
    pub description: InterfaceDescription,
    pub metadata: ContractMetadata,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to insert a record; the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewAudit {
    pub job_id: JobId,
    pub address: ContractAddress,
    pub network: Network,
    pub assessment: RiskAssessment,
    pub abi_source: AbiSourceTag,
    pub description: InterfaceDescription,
    pub metadata: ContractMetadata,
}

/// Filter for listing audits, newest first.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    pub address: Option<ContractAddress>,
    pub network: Option<Network>,
    pub limit: Option<u32>,
}

impl AuditFilter {
    pub fn for_address(address: ContractAddress) -> Self {
        Self {
            address: Some(address),
            ..Default::default()
        }
    }

    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_AUDIT_LIMIT)
            .clamp(1, MAX_AUDIT_LIMIT)
    }
}
