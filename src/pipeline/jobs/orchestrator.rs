use std::sync::Arc;

use chrono::Utc;

use super::{AuditOptions, Job, JobFailure, JobId, JobQueue, JobState, JobStatus, WorkItem};
use crate::pipeline::error::{FailureKind, JobError, PersistenceError};
use crate::pipeline::record::{AuditFilter, AuditId, AuditRecord, NewAudit};
use crate::pipeline::store::AuditDb;
use crate::pipeline::types::{ContractAddress, Network};

/// Pending jobs re-enqueued per startup pass.
const REQUEUE_BATCH: u32 = 10_000;

/// Owns the job lifecycle: submission, transitions and audit lookups.
///
/// Every transition is validated against [`JobState`] first and then applied
/// as a compare-and-set on the stored row; a lost race reports the error the
/// fresh state produces.
pub struct JobOrchestrator {
    db: Arc<AuditDb>,
    queue: Arc<dyn JobQueue>,
}

impl JobOrchestrator {
    pub fn new(db: Arc<AuditDb>, queue: Arc<dyn JobQueue>) -> Self {
        Self { db, queue }
    }

    pub fn db(&self) -> &Arc<AuditDb> {
        &self.db
    }

    /// Persists a PENDING job and hands it to the queue.
    ///
    /// If the queue refuses the item the job stays PENDING and is picked up
    /// by [`Self::requeue_pending`] on the next start.
    pub async fn submit(
        &self,
        address: ContractAddress,
        network: Network,
        options: AuditOptions,
    ) -> Result<JobId, JobError> {
        let job = self.db.insert_job(&address, &network, &options).await?;
        metrics::counter!("jobs_submitted").increment(1);

        tracing::info!(
            target: "auditor::pipeline::jobs",
            job_id = %job.id,
            %address,
            %network,
            force_refresh = options.force_refresh,
            "Submitted audit job"
        );

        self.queue.enqueue(WorkItem::from(&job)).await?;
        Ok(job.id)
    }

    pub async fn status(&self, id: JobId) -> Result<Job, JobError> {
        self.db.get_job(id).await?.ok_or(JobError::NotFound(id))
    }

    /// PENDING → RUNNING. Only one caller can win the claim.
    pub async fn claim(&self, id: JobId) -> Result<Job, JobError> {
        self.apply(id, |state| state.start(id)).await
    }

    /// Writes the audit record and marks the job COMPLETED atomically.
    pub async fn complete(&self, audit: NewAudit) -> Result<AuditId, JobError> {
        let id = audit.job_id;
        let job = self.status(id).await?;
        // Validate before writing anything; the placeholder id is never stored.
        job.state.complete(id, AuditId(0))?;

        match self.db.complete_job_with_audit(&audit).await? {
            Some(audit_id) => {
                metrics::counter!("jobs_completed").increment(1);
                tracing::info!(
                    target: "auditor::pipeline::jobs",
                    job_id = %id,
                    audit_id = %audit_id,
                    risk_level = audit.assessment.level.as_str(),
                    score = audit.assessment.score,
                    "Audit job completed"
                );
                Ok(audit_id)
            }
            None => Err(self.race_error(id, JobStatus::Completed, |state| {
                state.complete(id, AuditId(0))
            })
            .await),
        }
    }

    /// RUNNING → FAILED with a classification.
    pub async fn fail(&self, id: JobId, failure: JobFailure) -> Result<Job, JobError> {
        let kind = failure.kind;
        let detail = failure.detail.clone();
        let job = self.apply(id, move |state| state.fail(id, failure.clone())).await?;

        metrics::counter!("jobs_failed", "kind" => kind.as_str()).increment(1);
        tracing::warn!(
            target: "auditor::pipeline::jobs",
            job_id = %id,
            kind = %kind,
            detail = %detail,
            "Audit job failed"
        );
        Ok(job)
    }

    /// PENDING → FAILED(cancelled). Running and terminal jobs cannot be cancelled.
    pub async fn cancel(&self, id: JobId) -> Result<Job, JobError> {
        let job = self.apply(id, |state| state.cancel(id)).await?;
        tracing::info!(target: "auditor::pipeline::jobs", job_id = %id, "Audit job cancelled");
        Ok(job)
    }

    /// Fails every job left RUNNING by a previous process.
    ///
    /// Must run before workers start: the queue is in-process, so a RUNNING row
    /// at startup has no worker left to finish it.
    pub async fn fail_interrupted(&self) -> Result<usize, JobError> {
        let running = self.db.list_jobs(JobStatus::Running, REQUEUE_BATCH).await?;
        let mut failed = 0;
        for job in &running {
            let failure = JobFailure::new(
                FailureKind::Interrupted,
                "worker stopped before the audit finished; resubmit to retry",
            );
            match self.fail(job.id, failure).await {
                Ok(_) => failed += 1,
                // Finished by someone else in the meantime.
                Err(JobError::AlreadyTerminal { .. } | JobError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if failed > 0 {
            tracing::warn!(
                target: "auditor::pipeline::jobs",
                "Marked {} interrupted job(s) as failed",
                failed
            );
        }
        Ok(failed)
    }

    /// Re-enqueues every PENDING job; duplicates are dropped at claim time.
    pub async fn requeue_pending(&self) -> Result<usize, JobError> {
        let pending = self.db.list_jobs(JobStatus::Pending, REQUEUE_BATCH).await?;
        for job in &pending {
            self.queue.enqueue(WorkItem::from(job)).await?;
        }
        if !pending.is_empty() {
            tracing::info!(
                target: "auditor::pipeline::jobs",
                "Re-enqueued {} pending job(s)",
                pending.len()
            );
        }
        Ok(pending.len())
    }

    pub async fn record_attempts(&self, id: JobId, attempts: u32) -> Result<(), JobError> {
        Ok(self.db.record_job_attempts(id, attempts).await?)
    }

    pub async fn get_audit(&self, id: AuditId) -> Result<Option<AuditRecord>, PersistenceError> {
        self.db.get_audit(id).await
    }

    pub async fn list_audits(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, PersistenceError> {
        self.db.list_audits(filter).await
    }

    async fn apply<F>(&self, id: JobId, transition: F) -> Result<Job, JobError>
    where
        F: Fn(&JobState) -> Result<JobState, JobError>,
    {
        let mut job = self.status(id).await?;
        let next = transition(&job.state)?;

        if self.db.transition_job(id, job.state.status(), &next).await? {
            job.state = next;
            job.updated_at = Utc::now();
            return Ok(job);
        }

        let target = next.status();
        Err(self.race_error(id, target, transition).await)
    }

    /// Error to report after a compare-and-set lost against another writer.
    async fn race_error<F>(&self, id: JobId, target: JobStatus, transition: F) -> JobError
    where
        F: Fn(&JobState) -> Result<JobState, JobError>,
    {
        let current = match self.status(id).await {
            Ok(job) => job,
            Err(e) => return e,
        };
        match transition(&current.state) {
            Err(e) => e,
            Ok(_) => JobError::InvalidTransition {
                id,
                from: current.state.status(),
                to: target,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::abi::{AbiSourceTag, InterfaceDescription};
    use crate::pipeline::features::FeatureVector;
    use crate::pipeline::jobs::ChannelQueue;
    use crate::pipeline::scoring::{RiskAssessment, RiskLevel};
    use crate::pipeline::store::AuditDbConfig;
    use tokio::sync::mpsc;

    fn address() -> ContractAddress {
        "0x5555555555555555555555555555555555555555".parse().unwrap()
    }

    async fn setup() -> (JobOrchestrator, mpsc::Receiver<WorkItem>) {
        let db = Arc::new(AuditDb::in_memory().await.unwrap());
        let (queue, receiver) = ChannelQueue::new(16);
        (JobOrchestrator::new(db, Arc::new(queue)), receiver)
    }

    fn new_audit(job_id: JobId) -> NewAudit {
        NewAudit {
            job_id,
            address: address(),
            network: Network::default(),
            assessment: RiskAssessment {
                score: 0.42,
                level: RiskLevel::Low,
                summary: "low risk".to_string(),
                features: FeatureVector::zeroed(),
            },
            abi_source: AbiSourceTag::CallerSupplied,
            description: InterfaceDescription::default(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_submit_persists_and_enqueues() {
        let (orchestrator, mut receiver) = setup().await;
        let id = orchestrator
            .submit(address(), Network::default(), AuditOptions::default())
            .await
            .unwrap();

        let job = orchestrator.status(id).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(receiver.recv().await.unwrap().job_id, id);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (orchestrator, _receiver) = setup().await;
        let id = orchestrator
            .submit(address(), Network::default(), AuditOptions::default())
            .await
            .unwrap();

        let claimed = orchestrator.claim(id).await.unwrap();
        assert_eq!(claimed.state, JobState::Running);
        assert_eq!(
            orchestrator.claim(id).await.unwrap_err(),
            JobError::InvalidTransition {
                id,
                from: JobStatus::Running,
                to: JobStatus::Running,
            }
        );
    }

    #[tokio::test]
    async fn test_complete_links_record() {
        let (orchestrator, _receiver) = setup().await;
        let id = orchestrator
            .submit(address(), Network::default(), AuditOptions::default())
            .await
            .unwrap();
        orchestrator.claim(id).await.unwrap();

        let audit_id = orchestrator.complete(new_audit(id)).await.unwrap();
        let job = orchestrator.status(id).await.unwrap();
        assert_eq!(job.state, JobState::Completed { audit_id });

        let record = orchestrator.get_audit(audit_id).await.unwrap().unwrap();
        assert_eq!(record.job_id, id);
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_terminal_jobs_reject_transitions() {
        let (orchestrator, _receiver) = setup().await;
        let id = orchestrator
            .submit(address(), Network::default(), AuditOptions::default())
            .await
            .unwrap();
        orchestrator.claim(id).await.unwrap();
        orchestrator
            .fail(id, JobFailure::new(FailureKind::NotFound, "no ABI"))
            .await
            .unwrap();

        let expected = JobError::AlreadyTerminal {
            id,
            state: JobStatus::Failed,
        };
        assert_eq!(orchestrator.claim(id).await.unwrap_err(), expected);
        assert_eq!(orchestrator.cancel(id).await.unwrap_err(), expected);
        assert_eq!(orchestrator.complete(new_audit(id)).await.unwrap_err(), expected);
        assert!(orchestrator
            .list_audits(&AuditFilter::for_address(address()))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let (orchestrator, _receiver) = setup().await;
        let pending = orchestrator
            .submit(address(), Network::default(), AuditOptions::default())
            .await
            .unwrap();
        let cancelled = orchestrator.cancel(pending).await.unwrap();
        match cancelled.state {
            JobState::Failed(failure) => assert_eq!(failure.kind, FailureKind::Cancelled),
            other => panic!("unexpected state {other:?}"),
        }
        assert!(matches!(
            orchestrator.claim(pending).await,
            Err(JobError::AlreadyTerminal { .. })
        ));

        let running = orchestrator
            .submit(address(), Network::default(), AuditOptions::default())
            .await
            .unwrap();
        orchestrator.claim(running).await.unwrap();
        assert!(matches!(
            orchestrator.cancel(running).await,
            Err(JobError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (orchestrator, _receiver) = setup().await;
        assert_eq!(
            orchestrator.status(JobId(999)).await.unwrap_err(),
            JobError::NotFound(JobId(999))
        );
    }

    #[tokio::test]
    async fn test_requeue_pending_only() {
        let (orchestrator, mut receiver) = setup().await;
        let first = orchestrator
            .submit(address(), Network::default(), AuditOptions::default())
            .await
            .unwrap();
        let second = orchestrator
            .submit(address(), Network::default(), AuditOptions::default())
            .await
            .unwrap();
        // Drain the original deliveries.
        receiver.recv().await.unwrap();
        receiver.recv().await.unwrap();

        orchestrator.claim(first).await.unwrap();
        assert_eq!(orchestrator.requeue_pending().await.unwrap(), 1);
        assert_eq!(receiver.recv().await.unwrap().job_id, second);
    }

    #[tokio::test]
    async fn test_running_jobs_fail_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let url = dir.path().join("jobs.db").to_string_lossy().to_string();

        let (running, pending) = {
            let db = Arc::new(AuditDb::new(AuditDbConfig::new(url.clone())).await.unwrap());
            let (queue, _receiver) = ChannelQueue::new(16);
            let orchestrator = JobOrchestrator::new(db, Arc::new(queue));
            let running = orchestrator
                .submit(address(), Network::default(), AuditOptions::default())
                .await
                .unwrap();
            let pending = orchestrator
                .submit(address(), Network::default(), AuditOptions::default())
                .await
                .unwrap();
            orchestrator.claim(running).await.unwrap();
            (running, pending)
        };

        let db = Arc::new(AuditDb::new(AuditDbConfig::new(url)).await.unwrap());
        let (queue, mut receiver) = ChannelQueue::new(16);
        let orchestrator = JobOrchestrator::new(db, Arc::new(queue));

        assert_eq!(orchestrator.fail_interrupted().await.unwrap(), 1);
        assert_eq!(orchestrator.requeue_pending().await.unwrap(), 1);
        assert_eq!(receiver.recv().await.unwrap().job_id, pending);

        let job = orchestrator.status(running).await.unwrap();
        assert!(job.state.is_terminal());
        match job.state {
            JobState::Failed(failure) => assert_eq!(failure.kind, FailureKind::Interrupted),
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(orchestrator.fail_interrupted().await.unwrap(), 0);
    }
}
