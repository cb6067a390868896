//! End-to-end pipeline scenarios against in-memory SQLite, a fake registry and
//! a fake chain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use auditor::pipeline::abi::{
    AbiMember, AbiParam, AbiResolver, AbiSourceTag, InterfaceDescription, Mutability,
    RemoteRegistry, ResolveRequest, StaticFallbackSource,
};
use auditor::pipeline::chain::{selector, ChainError, ChainReader};
use auditor::pipeline::error::{FailureKind, JobError, ResolutionError};
use auditor::pipeline::features::extract;
use auditor::pipeline::jobs::{
    AuditOptions, AuditWorker, ChannelQueue, Job, JobId, JobOrchestrator, JobState, WorkerPool,
};
use auditor::pipeline::record::AuditFilter;
use auditor::pipeline::retry::RetryPolicy;
use auditor::pipeline::scoring::{
    benign_profiles, ForestParams, IsolationForest, RiskLevel, RiskScorer, ScoringConfig,
    REFERENCE_SAMPLES,
};
use auditor::pipeline::store::AuditDb;
use auditor::pipeline::types::{ContractAddress, Network};
use tokio_util::sync::CancellationToken;

struct FakeRegistry {
    calls: AtomicUsize,
    delay: Duration,
    response: Result<Option<InterfaceDescription>, ResolutionError>,
}

impl FakeRegistry {
    fn returning(description: InterfaceDescription) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
            response: Ok(Some(description)),
        })
    }

    fn failing(error: ResolutionError) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            response: Err(error),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteRegistry for FakeRegistry {
    async fn fetch(
        &self,
        _address: &ContractAddress,
        _network: &Network,
    ) -> Result<Option<InterfaceDescription>, ResolutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.response.clone()
    }
}

struct FakeChain {
    network: Network,
    code: Vec<u8>,
    calls: HashMap<[u8; 4], Vec<u8>>,
}

#[async_trait]
impl ChainReader for FakeChain {
    fn network(&self) -> &Network {
        &self.network
    }

    async fn code_at(&self, _address: &ContractAddress) -> Result<Vec<u8>, ChainError> {
        Ok(self.code.clone())
    }

    async fn call(&self, _address: &ContractAddress, calldata: &[u8]) -> Result<Vec<u8>, ChainError> {
        let key: [u8; 4] = calldata[..4].try_into().unwrap();
        self.calls
            .get(&key)
            .cloned()
            .ok_or_else(|| ChainError::Reverted("execution reverted".to_string()))
    }
}

struct Pipeline {
    db: Arc<AuditDb>,
    orchestrator: Arc<JobOrchestrator>,
    resolver: Arc<AbiResolver>,
    pool: WorkerPool,
}

impl Pipeline {
    async fn start(
        registry: Arc<FakeRegistry>,
        retry: RetryPolicy,
        chain: Option<Arc<dyn ChainReader>>,
    ) -> Self {
        let db = Arc::new(AuditDb::in_memory().await.unwrap());
        let resolver = Arc::new(AbiResolver::standard(
            db.clone(),
            Some(registry),
            StaticFallbackSource::new(),
        ));
        let (queue, receiver) = ChannelQueue::new(64);
        let orchestrator = Arc::new(JobOrchestrator::new(db.clone(), Arc::new(queue)));
        let scorer = Arc::new(RiskScorer::new(ScoringConfig::default()));
        scorer.warm_up().await.unwrap();

        let mut worker = AuditWorker::new(orchestrator.clone(), resolver.clone(), scorer, retry);
        if let Some(chain) = chain {
            worker = worker.with_chain_reader(chain);
        }
        let pool = WorkerPool::spawn(receiver, Arc::new(worker), 2, CancellationToken::new());

        Self {
            db,
            orchestrator,
            resolver,
            pool,
        }
    }

    async fn submit(&self, options: AuditOptions) -> JobId {
        self.orchestrator
            .submit(address(), network(), options)
            .await
            .unwrap()
    }

    async fn wait_terminal(&self, id: JobId) -> Job {
        for _ in 0..500 {
            let job = self.orchestrator.status(id).await.unwrap();
            if job.state.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not reach a terminal state");
    }

    async fn stop(self) {
        self.pool.shutdown(Duration::from_secs(5)).await;
    }
}

fn address() -> ContractAddress {
    "0x9999999999999999999999999999999999999999".parse().unwrap()
}

fn network() -> Network {
    Network::new("mainnet")
}

fn read_only_pair() -> InterfaceDescription {
    InterfaceDescription::new(vec![
        AbiMember::function("name", Mutability::View)
            .with_outputs(vec![AbiParam::new("", "string")]),
        AbiMember::function("totalSupply", Mutability::View)
            .with_outputs(vec![AbiParam::new("", "uint256")]),
    ])
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_retries,
        Duration::from_millis(5),
        Duration::from_millis(20),
        2.0,
    )
}

#[tokio::test]
async fn scenario_a_cold_cache_remote_fetch_completes() {
    let registry = FakeRegistry::returning(read_only_pair());
    let pipeline = Pipeline::start(registry.clone(), fast_retry(3), None).await;

    let id = pipeline.submit(AuditOptions::default()).await;
    let job = pipeline.wait_terminal(id).await;

    let JobState::Completed { audit_id } = job.state else {
        panic!("expected COMPLETED, got {:?}", job.state);
    };
    let record = pipeline
        .orchestrator
        .get_audit(audit_id)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        record.assessment.level,
        RiskLevel::Low | RiskLevel::Medium | RiskLevel::High
    ));
    assert_eq!(record.abi_source, AbiSourceTag::RemoteFetch);
    assert_eq!(record.description, read_only_pair());
    assert_eq!(registry.calls(), 1);

    let cached = pipeline.db.get_abi(&address(), &network()).await.unwrap().unwrap();
    assert_eq!(cached.source, AbiSourceTag::RemoteFetch);

    let listed = pipeline
        .orchestrator
        .list_audits(&AuditFilter::for_address(address()))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, audit_id);

    pipeline.stop().await;
}

#[tokio::test]
async fn scenario_b_rate_limited_registry_fails_after_retry_bound() {
    let registry =
        FakeRegistry::failing(ResolutionError::RemoteUnavailable("HTTP 429".to_string()));
    let pipeline = Pipeline::start(registry.clone(), fast_retry(2), None).await;

    let id = pipeline.submit(AuditOptions::default()).await;
    let job = pipeline.wait_terminal(id).await;

    match &job.state {
        JobState::Failed(failure) => {
            assert_eq!(failure.kind, FailureKind::RemoteUnavailable);
            assert!(failure.detail.contains("429"));
        }
        other => panic!("expected FAILED, got {other:?}"),
    }
    // Initial attempt + 2 retries.
    assert_eq!(registry.calls(), 3);
    assert_eq!(job.attempts, 3);
    assert!(pipeline
        .orchestrator
        .list_audits(&AuditFilter::for_address(address()))
        .await
        .unwrap()
        .is_empty());

    pipeline.stop().await;
}

#[tokio::test]
async fn scenario_c_manual_override_wins_over_remote() {
    let registry = FakeRegistry::returning(read_only_pair());
    let pipeline = Pipeline::start(registry.clone(), fast_retry(0), None).await;

    // Warm the cache with the remote description first.
    pipeline
        .resolver
        .resolve(ResolveRequest::new(address(), network()))
        .await
        .unwrap();

    let manual = InterfaceDescription::new(vec![AbiMember::function(
        "emergencyWithdraw",
        Mutability::NonPayable,
    )]);
    pipeline
        .resolver
        .save(address(), network(), &manual)
        .await
        .unwrap();

    for request in [
        ResolveRequest::new(address(), network()),
        ResolveRequest::new(address(), network()),
        ResolveRequest::new(address(), network()).with_force_refresh(false),
    ] {
        let resolved = pipeline.resolver.resolve(request).await.unwrap();
        assert_eq!(resolved.description, manual);
        assert_eq!(resolved.source, AbiSourceTag::ManualOverride);
    }
    assert_eq!(registry.calls(), 1);

    // A job sees the override too.
    let id = pipeline.submit(AuditOptions::default()).await;
    let JobState::Completed { audit_id } = pipeline.wait_terminal(id).await.state else {
        panic!("job did not complete");
    };
    let record = pipeline
        .orchestrator
        .get_audit(audit_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.abi_source, AbiSourceTag::ManualOverride);
    assert!(record
        .assessment
        .features
        .raised_flags()
        .contains(&"withdraw_capability"));

    pipeline.stop().await;
}

#[tokio::test]
async fn scenario_d_concurrent_jobs_share_one_fetch() {
    let registry = FakeRegistry::returning(read_only_pair());
    let pipeline = Pipeline::start(registry.clone(), fast_retry(3), None).await;

    let first = pipeline.submit(AuditOptions::default()).await;
    let second = pipeline.submit(AuditOptions::default()).await;

    let first = pipeline.wait_terminal(first).await;
    let second = pipeline.wait_terminal(second).await;

    let (JobState::Completed { audit_id: a }, JobState::Completed { audit_id: b }) =
        (&first.state, &second.state)
    else {
        panic!("both jobs must complete: {:?} / {:?}", first.state, second.state);
    };
    assert_ne!(a, b);
    assert_eq!(registry.calls(), 1);

    let cached = pipeline.db.get_abi(&address(), &network()).await.unwrap().unwrap();
    assert_eq!(cached.source, AbiSourceTag::RemoteFetch);
    assert_eq!(cached.description, read_only_pair());

    pipeline.stop().await;
}

#[tokio::test]
async fn warm_cache_resolution_makes_no_remote_calls() {
    let registry = FakeRegistry::returning(read_only_pair());
    let pipeline = Pipeline::start(registry.clone(), fast_retry(0), None).await;

    let first = pipeline
        .resolver
        .resolve(ResolveRequest::new(address(), network()))
        .await
        .unwrap();
    let calls = registry.calls();
    let second = pipeline
        .resolver
        .resolve(ResolveRequest::new(address(), network()))
        .await
        .unwrap();

    assert_eq!(registry.calls(), calls);
    assert_eq!(second.source, AbiSourceTag::CacheHit);
    assert_eq!(first.description, second.description);

    pipeline.stop().await;
}

#[tokio::test]
async fn terminal_status_never_regresses() {
    let registry = FakeRegistry::returning(read_only_pair());
    let pipeline = Pipeline::start(registry, fast_retry(0), None).await;

    let id = pipeline.submit(AuditOptions::default()).await;
    let terminal = pipeline.wait_terminal(id).await;

    assert!(matches!(
        pipeline.orchestrator.cancel(id).await,
        Err(JobError::AlreadyTerminal { .. })
    ));
    assert!(matches!(
        pipeline.orchestrator.claim(id).await,
        Err(JobError::AlreadyTerminal { .. })
    ));
    // Redelivery after restart is dropped at claim time.
    pipeline.orchestrator.requeue_pending().await.unwrap();

    for _ in 0..3 {
        let job = pipeline.orchestrator.status(id).await.unwrap();
        assert_eq!(job.state, terminal.state);
    }

    pipeline.stop().await;
}

#[tokio::test]
async fn chain_reader_enriches_audit() {
    let mut name = vec![0u8; 31];
    name.push(32);
    let mut length = vec![0u8; 31];
    length.push(4);
    name.extend(length);
    let mut text = b"Demo".to_vec();
    text.resize(32, 0);
    name.extend(text);

    let chain = Arc::new(FakeChain {
        network: network(),
        // PUSH1 0x80 PUSH1 0x40 MSTORE CALL DELEGATECALL
        code: vec![0x60, 0x80, 0x60, 0x40, 0x52, 0xf1, 0xf4],
        calls: HashMap::from([(selector("name()"), name)]),
    });
    let registry = FakeRegistry::returning(read_only_pair());
    let pipeline = Pipeline::start(registry, fast_retry(0), Some(chain)).await;

    let id = pipeline.submit(AuditOptions::default()).await;
    let JobState::Completed { audit_id } = pipeline.wait_terminal(id).await.state else {
        panic!("job did not complete");
    };
    let record = pipeline
        .orchestrator
        .get_audit(audit_id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.metadata.get("name").map(String::as_str), Some("Demo"));
    // totalSupply reverts on the fake chain and is skipped.
    assert!(!record.metadata.contains_key("totalSupply"));
    assert!(record.assessment.features.get("bytecode_size_kb").unwrap() > 0.0);
    assert!(record.assessment.features.get("call_opcode_density").unwrap() > 0.0);

    pipeline.stop().await;
}

#[test]
fn extraction_is_deterministic() {
    let description = read_only_pair();
    let code = vec![0x60, 0x80, 0xf1, 0xff, 0x00];

    let first = extract(&description, Some(code.as_slice()));
    for _ in 0..10 {
        let again = extract(&description, Some(code.as_slice()));
        let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(first.as_slice()), bits(again.as_slice()));
    }
}

#[test]
fn score_is_monotonic_in_path_length() {
    let forest = IsolationForest::fit(
        &benign_profiles(REFERENCE_SAMPLES, 42),
        ForestParams::default(),
    )
    .unwrap();

    let mut previous = f64::NEG_INFINITY;
    // Decreasing path length, from deep to immediate isolation.
    for step in (0..=40).rev() {
        let path_length = f64::from(step) * 0.5;
        let score = forest.score_from_path_length(path_length);
        assert!(score >= previous, "score dropped at path length {path_length}");
        assert!(score > 0.0 && score <= 1.0);
        previous = score;
    }
}
