pub mod abi;
pub mod chain;
pub mod error;
pub mod features;
pub mod jobs;
pub mod record;
pub mod retry;
pub mod scoring;
pub mod store;
pub mod types;

pub use abi::{
    AbiResolver, AbiSourceTag, EtherscanRegistry, InterfaceDescription, RegistryConfig,
    RemoteRegistry, ResolveRequest, ResolvedAbi, StaticFallbackSource,
};
pub use chain::{read_member, ChainError, ChainReader, JsonRpcChainReader};
pub use error::{
    AuditError, FailureKind, JobError, PersistenceError, ResolutionError, ScoringError,
};
pub use features::{extract, FeatureVector, FEATURE_LAYOUT};
pub use jobs::{
    AuditOptions, AuditWorker, ChannelQueue, Job, JobFailure, JobId, JobOrchestrator, JobQueue,
    JobState, JobStatus, WorkItem, WorkerPool,
};
pub use record::{AuditFilter, AuditId, AuditRecord, ContractMetadata, NewAudit};
pub use retry::RetryPolicy;
pub use scoring::{RiskAssessment, RiskLevel, RiskScorer, RiskThresholds, ScoringConfig};
pub use store::{AuditDb, AuditDbConfig};
pub use types::{ContractAddress, Network};
