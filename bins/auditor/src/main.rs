//! Auditor - smart-contract risk assessment service.
//!
//! # Usage
//!
//! ```bash
//! ETHERSCAN_API_KEY=... auditor --database-url ./auditor.db --workers 8
//!
//! curl -X POST localhost:8080/audits -d '{"address": "0x...", "network": "mainnet"}' \
//!      -H 'content-type: application/json'
//! curl localhost:8080/audits/jobs/1
//! ```

mod config;

use anyhow::Result;
use auditor::pipeline::types::Network;
use auditor::AuditorConfig;
use clap::Parser;
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    let config = Config::parse();
    run_auditor(config).await
}

async fn run_auditor(config: Config) -> Result<()> {
    let mut builder = AuditorConfig::builder()
        .host(config.host.clone())
        .port(config.port)
        .database_url(config.database_url.clone())
        .workers(config.workers)
        .queue_capacity(config.queue_capacity)
        .retry_policy(config.retry_policy())
        .registry(config.registry())
        .scoring(config.scoring()?)
        .with_fallbacks(config.fallbacks()?)
        .shutdown_timeout(config.shutdown_timeout);

    if let Some(url) = &config.rpc_url {
        builder = builder.chain_rpc(url.clone(), Network::new(&config.rpc_network));
    }

    auditor::run(builder.build()).await
}
