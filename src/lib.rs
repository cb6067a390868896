//! Contract auditor - risk assessment pipeline for deployed smart contracts.
//!
//! A submitted contract goes through a job that resolves its interface
//! description (caller-supplied, static fallback, cache or remote registry),
//! derives a feature vector, scores it with an isolation forest and stores an
//! immutable audit record. Jobs run asynchronously on a worker pool and are
//! polled over HTTP.

pub mod http;
pub mod pipeline;

// Re-export commonly used types for embedders
pub use async_trait::async_trait;
pub use axum;
pub use tokio;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any as CorsAny, CorsLayer};

use http::{create_http_router, HttpState};
use pipeline::abi::{AbiResolver, EtherscanRegistry, RegistryConfig, RemoteRegistry, StaticFallbackSource};
use pipeline::chain::{ChainReader, JsonRpcChainReader};
use pipeline::jobs::{AuditWorker, ChannelQueue, JobOrchestrator, WorkerPool};
use pipeline::retry::RetryPolicy;
use pipeline::scoring::{RiskScorer, ScoringConfig};
use pipeline::store::{AuditDb, AuditDbConfig};
use pipeline::types::Network;

/// Configuration for the auditor service.
pub struct AuditorConfig {
    /// Port to listen on.
    pub port: u16,

    /// Host to bind to.
    pub host: String,

    /// SQLite path, `sqlite:` URL or `postgres://` URL.
    pub database_url: String,

    /// Number of concurrent audit workers.
    pub workers: usize,

    /// Capacity of the in-process job queue.
    pub queue_capacity: usize,

    /// Retry policy for the resolution stage.
    pub retry: RetryPolicy,

    /// Remote interface registry settings. Without an API key remote lookups
    /// are disabled.
    pub registry: RegistryConfig,

    /// JSON-RPC endpoint for bytecode, metadata and read-only calls.
    pub chain_rpc_url: Option<String>,

    /// Network the JSON-RPC endpoint serves.
    pub chain_network: Network,

    /// Risk model and thresholds.
    pub scoring: ScoringConfig,

    /// Interface descriptions shipped with the deployment.
    pub fallbacks: StaticFallbackSource,

    /// Graceful shutdown timeout in seconds (default: 30).
    ///
    /// On SIGINT/SIGTERM the workers get up to this long to finish the jobs
    /// they are running.
    pub shutdown_timeout: u64,
}

impl AuditorConfig {
    pub fn builder() -> AuditorConfigBuilder {
        AuditorConfigBuilder::default()
    }
}

/// Builder for AuditorConfig.
#[derive(Default)]
pub struct AuditorConfigBuilder {
    port: Option<u16>,
    host: Option<String>,
    database_url: Option<String>,
    workers: Option<usize>,
    queue_capacity: Option<usize>,
    retry: Option<RetryPolicy>,
    registry: Option<RegistryConfig>,
    chain_rpc_url: Option<String>,
    chain_network: Option<Network>,
    scoring: Option<ScoringConfig>,
    fallbacks: StaticFallbackSource,
    shutdown_timeout: Option<u64>,
}

impl AuditorConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn host(mut self, host: String) -> Self {
        self.host = Some(host);
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn workers(mut self, count: usize) -> Self {
        self.workers = Some(count);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Enables chain reads through a JSON-RPC endpoint serving `network`.
    pub fn chain_rpc(mut self, url: impl Into<String>, network: Network) -> Self {
        self.chain_rpc_url = Some(url.into());
        self.chain_network = Some(network);
        self
    }

    pub fn scoring(mut self, scoring: ScoringConfig) -> Self {
        self.scoring = Some(scoring);
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: StaticFallbackSource) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// Sets the graceful shutdown timeout in seconds.
    pub fn shutdown_timeout(mut self, seconds: u64) -> Self {
        self.shutdown_timeout = Some(seconds);
        self
    }

    pub fn build(self) -> AuditorConfig {
        AuditorConfig {
            port: self.port.unwrap_or(8080),
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            database_url: self
                .database_url
                .unwrap_or_else(|| "./auditor.db".to_string()),
            workers: self.workers.unwrap_or(4),
            queue_capacity: self.queue_capacity.unwrap_or(1024),
            retry: self.retry.unwrap_or_default(),
            registry: self.registry.unwrap_or_default(),
            chain_rpc_url: self.chain_rpc_url,
            chain_network: self.chain_network.unwrap_or_default(),
            scoring: self.scoring.unwrap_or_default(),
            fallbacks: self.fallbacks,
            shutdown_timeout: self.shutdown_timeout.unwrap_or(30),
        }
    }
}

/// Starts the auditor: database, worker pool and HTTP server.
///
/// NOTE: The caller is responsible for initializing the tracing subscriber before calling this function.
pub async fn run(config: AuditorConfig) -> anyhow::Result<()> {
    tracing::info!(
        target: "auditor::main",
        "Starting auditor with {} worker(s) and {} static fallback ABI(s)",
        config.workers,
        config.fallbacks.len()
    );

    let db = Arc::new(
        AuditDb::new(AuditDbConfig::new(&config.database_url))
            .await
            .context("Failed to open audit database")?,
    );

    let registry: Option<Arc<dyn RemoteRegistry>> = if config.registry.api_key.is_some() {
        tracing::info!(
            target: "auditor::main",
            "Remote ABI registry enabled at {}",
            config.registry.base_url
        );
        Some(Arc::new(EtherscanRegistry::new(config.registry)?))
    } else {
        tracing::warn!(
            target: "auditor::main",
            "No registry API key configured, remote ABI lookups are disabled"
        );
        None
    };
    let resolver = Arc::new(AbiResolver::standard(db.clone(), registry, config.fallbacks));

    let chain: Option<Arc<dyn ChainReader>> = match config.chain_rpc_url {
        Some(url) => {
            tracing::info!(
                target: "auditor::main",
                "Chain reads enabled for {} via {}",
                config.chain_network,
                url
            );
            Some(Arc::new(JsonRpcChainReader::new(url, config.chain_network)?))
        }
        None => None,
    };

    let scorer = RiskScorer::global(config.scoring);
    if let Err(e) = scorer.warm_up().await {
        // Jobs will fail with model_unavailable until this is fixed.
        tracing::error!(target: "auditor::main", "Risk model unavailable: {}", e);
    }

    let (queue, receiver) = ChannelQueue::new(config.queue_capacity);
    let orchestrator = Arc::new(JobOrchestrator::new(db.clone(), Arc::new(queue)));

    let mut worker = AuditWorker::new(
        orchestrator.clone(),
        resolver.clone(),
        scorer.clone(),
        config.retry,
    );
    if let Some(chain) = &chain {
        worker = worker.with_chain_reader(chain.clone());
    }

    // RUNNING rows from a previous process have no worker left.
    orchestrator.fail_interrupted().await?;

    // Create cancellation token for graceful shutdown coordination.
    let shutdown_token = CancellationToken::new();
    let pool = WorkerPool::spawn(
        receiver,
        Arc::new(worker),
        config.workers,
        shutdown_token.child_token(),
    );

    // Jobs left PENDING by a previous process.
    orchestrator.requeue_pending().await?;

    let mut state = HttpState::new(orchestrator.clone(), resolver, scorer);
    if let Some(chain) = chain {
        state = state.with_chain_reader(chain);
    }

    let cors = CorsLayer::new()
        .allow_origin(CorsAny)
        .allow_methods(CorsAny)
        .allow_headers(CorsAny);
    let app = create_http_router(state).layer(cors);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!(target: "auditor::main", "Server listening on {}", addr);

    // Setup signal handlers for graceful shutdown
    let server_shutdown_token = shutdown_token.clone();
    let shutdown_signal = async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(target: "auditor::main", "Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!(target: "auditor::main", "Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!(target: "auditor::main", "Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                tracing::info!(target: "auditor::main", "Received SIGTERM, initiating graceful shutdown...");
            }
        }

        server_shutdown_token.cancel();
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal);

    // Give active connections a bounded time to close, then force shutdown.
    const SERVER_SHUTDOWN_TIMEOUT_SECS: u64 = 15;
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!(target: "auditor::main", "Server error: {}", e);
            }
        }
        _ = async {
            shutdown_token.cancelled().await;
            tokio::time::sleep(Duration::from_secs(SERVER_SHUTDOWN_TIMEOUT_SECS)).await;
        } => {
            tracing::warn!(
                target: "auditor::main",
                "Server connections did not close within {}s, forcing shutdown",
                SERVER_SHUTDOWN_TIMEOUT_SECS
            );
        }
    }

    tracing::info!(target: "auditor::main", "HTTP server stopped, waiting for workers to finish...");
    shutdown_token.cancel();
    pool.shutdown(Duration::from_secs(config.shutdown_timeout)).await;

    // Runs abandoned by the drain timeout would otherwise stay RUNNING.
    if let Err(e) = orchestrator.fail_interrupted().await {
        tracing::error!(target: "auditor::main", "Failed to close abandoned jobs: {}", e);
    }

    tracing::info!(target: "auditor::main", "Auditor shutdown complete");

    Ok(())
}
