//! Configuration for the auditor service

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use auditor::pipeline::abi::{InterfaceDescription, RegistryConfig, StaticFallbackSource};
use auditor::pipeline::retry::RetryPolicy;
use auditor::pipeline::scoring::{RiskThresholds, ScoringConfig};
use auditor::pipeline::types::{ContractAddress, Network};
use clap::Parser;

/// Smart-contract risk auditor
///
/// Accepts audit jobs over HTTP, resolves each contract's ABI, scores it with
/// an isolation-forest model and stores the result.
///
/// # Examples
///
/// ```bash
/// # Local SQLite database, remote ABI lookups through Etherscan
/// ETHERSCAN_API_KEY=... auditor --database-url ./auditor.db
///
/// # Ship a known ABI for a contract that is not verified
/// auditor --fallback-abi sepolia:0x1234...abcd:./abis/vault.json
/// ```
#[derive(Parser, Debug)]
#[command(name = "auditor")]
#[command(about = "Audit deployed smart contracts for risky capabilities", long_about = None)]
pub struct Config {
    /// Host to bind the HTTP API to
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port for the HTTP API
    #[arg(long, default_value = "8080")]
    pub port: u16,

    /// SQLite path or URL, or a postgres:// URL
    #[arg(long, env = "DATABASE_URL", default_value = "./auditor.db")]
    pub database_url: String,

    /// Etherscan API key; remote ABI lookups are disabled without it
    #[arg(long, env = "ETHERSCAN_API_KEY")]
    pub etherscan_api_key: Option<String>,

    /// Etherscan-compatible API endpoint
    #[arg(long, env = "ETHERSCAN_API_URL", default_value = "https://api.etherscan.io/v2/api")]
    pub etherscan_api_url: String,

    /// Registry request timeout in seconds
    #[arg(long, default_value = "15")]
    pub registry_timeout: u64,

    /// JSON-RPC endpoint used for bytecode, token metadata and read-only calls
    #[arg(long, env = "WEB3_PROVIDER_URI")]
    pub rpc_url: Option<String>,

    /// Network served by the JSON-RPC endpoint
    #[arg(long, default_value = "sepolia")]
    pub rpc_network: String,

    /// Serialized risk model; trains the default model when omitted
    #[arg(long, env = "AI_MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// Lower bound of the MEDIUM risk level
    #[arg(long, env = "RISK_THRESHOLD_MEDIUM", default_value = "0.55")]
    pub risk_threshold_medium: f64,

    /// Lower bound of the HIGH risk level
    #[arg(long, env = "RISK_THRESHOLD_HIGH", default_value = "0.70")]
    pub risk_threshold_high: f64,

    /// Number of concurrent audit workers
    #[arg(long, env = "AUDIT_WORKERS", default_value = "4")]
    pub workers: usize,

    /// Capacity of the job queue
    #[arg(long, default_value = "1024")]
    pub queue_capacity: usize,

    /// Retries of a failed remote ABI lookup
    #[arg(long, env = "AUDIT_MAX_RETRIES", default_value = "3")]
    pub max_retries: u32,

    /// Initial retry backoff in milliseconds
    #[arg(long, default_value = "1000")]
    pub retry_backoff_ms: u64,

    /// Static fallback ABI as NETWORK:ADDRESS:PATH (repeatable)
    #[arg(long = "fallback-abi")]
    pub fallback_abis: Vec<String>,

    /// Graceful shutdown timeout in seconds
    #[arg(long, default_value = "30")]
    pub shutdown_timeout: u64,
}

impl Config {
    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            base_url: self.etherscan_api_url.clone(),
            api_key: self.etherscan_api_key.clone().filter(|key| !key.is_empty()),
            timeout: Duration::from_secs(self.registry_timeout),
        }
    }

    pub fn scoring(&self) -> Result<ScoringConfig> {
        let thresholds = RiskThresholds::new(self.risk_threshold_medium, self.risk_threshold_high)
            .context("Invalid risk thresholds")?;
        Ok(ScoringConfig {
            model_path: self.model_path.clone(),
            thresholds,
            ..Default::default()
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            ..Default::default()
        }
    }

    /// Loads every `--fallback-abi` file.
    pub fn fallbacks(&self) -> Result<StaticFallbackSource> {
        let mut fallbacks = StaticFallbackSource::new();
        for spec in &self.fallback_abis {
            let (network, address, path) = Self::parse_fallback(spec)?;
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read fallback ABI {}", path.display()))?;
            let description = InterfaceDescription::from_json_str(&raw)
                .with_context(|| format!("Invalid fallback ABI {}", path.display()))?;
            tracing::info!(
                "Loaded fallback ABI for {} on {} ({} members)",
                address,
                network,
                description.len()
            );
            fallbacks.insert(address, network, description);
        }
        Ok(fallbacks)
    }

    /// Parse `NETWORK:ADDRESS:PATH`.
    pub fn parse_fallback(spec: &str) -> Result<(Network, ContractAddress, PathBuf)> {
        let mut parts = spec.splitn(3, ':');
        let (Some(network), Some(address), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            anyhow::bail!("Invalid fallback ABI '{spec}', expected NETWORK:ADDRESS:PATH");
        };
        let address: ContractAddress = address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid address {address}: {e}"))?;
        Ok((Network::new(network), address, PathBuf::from(path)))
    }
}
