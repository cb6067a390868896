use std::sync::Arc;
use std::time::Instant;

use super::{JobFailure, JobOrchestrator, WorkItem};
use crate::pipeline::abi::{AbiResolver, InterfaceDescription, ResolveRequest};
use crate::pipeline::chain::{fetch_metadata, ChainReader};
use crate::pipeline::error::{AuditError, JobError, ResolutionError};
use crate::pipeline::features::extract;
use crate::pipeline::record::{ContractMetadata, NewAudit};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::scoring::RiskScorer;

/// Runs the pipeline for one claimed job:
/// resolve (with retry) → enrich → extract → score → persist.
pub struct AuditWorker {
    orchestrator: Arc<JobOrchestrator>,
    resolver: Arc<AbiResolver>,
    scorer: Arc<RiskScorer>,
    chain: Option<Arc<dyn ChainReader>>,
    retry: RetryPolicy,
}

impl AuditWorker {
    pub fn new(
        orchestrator: Arc<JobOrchestrator>,
        resolver: Arc<AbiResolver>,
        scorer: Arc<RiskScorer>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            orchestrator,
            resolver,
            scorer,
            chain: None,
            retry,
        }
    }

    pub fn with_chain_reader(mut self, chain: Arc<dyn ChainReader>) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Claims and executes a work item. Items whose job is no longer PENDING
    /// (duplicate delivery, cancellation) are dropped.
    pub async fn process(&self, item: WorkItem) {
        let id = item.job_id;
        if let Err(e) = self.orchestrator.claim(id).await {
            tracing::debug!(
                target: "auditor::pipeline::jobs",
                job_id = %id,
                error = %e,
                "Dropping work item that cannot be claimed"
            );
            return;
        }

        tracing::debug!(
            target: "auditor::pipeline::jobs",
            job_id = %id,
            address = %item.address,
            network = %item.network,
            "Claimed audit job"
        );

        let result = match self.audit(&item).await {
            Ok(audit) => self.orchestrator.complete(audit).await.map(|_| ()),
            Err(err) => self.fail(&item, &err).await,
        };

        match result {
            Ok(()) => {}
            Err(JobError::Persistence(e)) => {
                // The record could not be written; the job must not stay RUNNING.
                if let Err(e) = self.fail(&item, &AuditError::Persistence(e)).await {
                    tracing::error!(
                        target: "auditor::pipeline::jobs",
                        job_id = %id,
                        error = %e,
                        "Failed to record job failure"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    target: "auditor::pipeline::jobs",
                    job_id = %id,
                    error = %e,
                    "Job changed state while running"
                );
            }
        }
    }

    async fn fail(&self, item: &WorkItem, err: &AuditError) -> Result<(), JobError> {
        let failure = JobFailure::new(err.classification(), err.to_string());
        self.orchestrator.fail(item.job_id, failure).await.map(|_| ())
    }

    async fn audit(&self, item: &WorkItem) -> Result<NewAudit, AuditError> {
        let mut request = ResolveRequest::new(item.address, item.network.clone());
        if let Some(description) = &item.options.caller_abi {
            request = request.with_caller_supplied(description.clone());
        }
        if item.options.force_refresh {
            request = request.with_force_refresh(item.options.override_manual);
        }

        let started = Instant::now();
        let outcome = self
            .retry
            .execute(
                || self.resolver.resolve(request.clone()),
                ResolutionError::is_retryable,
            )
            .await;
        metrics::histogram!("audit_stage_seconds", "stage" => "resolve")
            .record(started.elapsed().as_secs_f64());

        if let Err(e) = self
            .orchestrator
            .record_attempts(item.job_id, outcome.attempts)
            .await
        {
            tracing::warn!(
                target: "auditor::pipeline::jobs",
                job_id = %item.job_id,
                error = %e,
                "Failed to record resolution attempts"
            );
        }
        let resolved = outcome.result?;

        let started = Instant::now();
        let (bytecode, metadata) = self.enrich(item, &resolved.description).await;
        metrics::histogram!("audit_stage_seconds", "stage" => "enrich")
            .record(started.elapsed().as_secs_f64());

        let started = Instant::now();
        let features = extract(&resolved.description, bytecode.as_deref());
        let assessment = self.scorer.score(&features).await?;
        metrics::histogram!("audit_stage_seconds", "stage" => "score")
            .record(started.elapsed().as_secs_f64());

        Ok(NewAudit {
            job_id: item.job_id,
            address: item.address,
            network: item.network.clone(),
            assessment,
            abi_source: resolved.source,
            description: resolved.description,
            metadata,
        })
    }

    /// Bytecode and token metadata when a reader for the job's network exists.
    async fn enrich(
        &self,
        item: &WorkItem,
        description: &InterfaceDescription,
    ) -> (Option<Vec<u8>>, ContractMetadata) {
        let Some(chain) = self
            .chain
            .as_ref()
            .filter(|chain| *chain.network() == item.network)
        else {
            return (None, ContractMetadata::new());
        };

        let bytecode = match chain.code_at(&item.address).await {
            Ok(code) => Some(code),
            Err(e) => {
                tracing::warn!(
                    target: "auditor::pipeline::jobs",
                    job_id = %item.job_id,
                    error = %e,
                    "Bytecode fetch failed, scoring without it"
                );
                None
            }
        };
        let metadata = fetch_metadata(&**chain, &item.address, description).await;
        (bytecode, metadata)
    }
}
