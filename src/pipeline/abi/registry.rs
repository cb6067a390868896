//! Remote interface registry (Etherscan-compatible `getabi` endpoint).
//!
//! Failure classification matters more than the happy path here: a contract
//! that is simply not verified is *not found* (permanent), whereas rate
//! limits, timeouts, server errors and malformed payloads are
//! `RemoteUnavailable` (retryable).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use super::InterfaceDescription;
use crate::pipeline::error::ResolutionError;
use crate::pipeline::types::{ContractAddress, Network};

pub const DEFAULT_REGISTRY_URL: &str = "https://api.etherscan.io/v2/api";

/// Lookup of published interface descriptions by address and chain.
#[async_trait]
pub trait RemoteRegistry: Send + Sync {
    /// `Ok(None)` when the registry has no description for the contract.
    async fn fetch(
        &self,
        address: &ContractAddress,
        network: &Network,
    ) -> Result<Option<InterfaceDescription>, ResolutionError>;
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub base_url: String,
    /// Without a key the registry is not consulted at all.
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_REGISTRY_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(15),
        }
    }
}

pub struct EtherscanRegistry {
    client: reqwest::Client,
    config: RegistryConfig,
}

impl EtherscanRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl RemoteRegistry for EtherscanRegistry {
    async fn fetch(
        &self,
        address: &ContractAddress,
        network: &Network,
    ) -> Result<Option<InterfaceDescription>, ResolutionError> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::debug!(
                target: "auditor::pipeline::registry",
                "No registry API key configured, skipping remote lookup"
            );
            return Ok(None);
        };
        let Some(chain_id) = network.chain_id() else {
            tracing::debug!(
                target: "auditor::pipeline::registry",
                %network,
                "Unknown network, no chain id for remote lookup"
            );
            return Ok(None);
        };

        let response = self
            .client
            .get(&self.config.base_url)
            .query(&[
                ("chainid", chain_id.to_string()),
                ("module", "contract".to_string()),
                ("action", "getabi".to_string()),
                ("address", address.to_hex()),
                ("apikey", api_key.to_string()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ResolutionError::RemoteUnavailable("registry request timed out".to_string())
                } else {
                    ResolutionError::RemoteUnavailable(format!("registry request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ResolutionError::RemoteUnavailable(
                "registry rate limit exceeded (HTTP 429)".to_string(),
            ));
        }
        if !status.is_success() {
            return Err(ResolutionError::RemoteUnavailable(format!(
                "registry returned HTTP {status}"
            )));
        }

        let body = response.text().await.map_err(|e| {
            ResolutionError::RemoteUnavailable(format!("registry body unreadable: {e}"))
        })?;

        let parsed = parse_registry_response(&body);
        tracing::debug!(
            target: "auditor::pipeline::registry",
            %address,
            %network,
            found = matches!(parsed, Ok(Some(_))),
            "Registry lookup finished"
        );
        parsed
    }
}

#[derive(Deserialize)]
struct RegistryResponse {
    status: Value,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: Value,
}

/// Classifies an Etherscan-style `getabi` body.
pub fn parse_registry_response(
    body: &str,
) -> Result<Option<InterfaceDescription>, ResolutionError> {
    let response: RegistryResponse = serde_json::from_str(body).map_err(|e| {
        ResolutionError::RemoteUnavailable(format!("malformed registry payload: {e}"))
    })?;

    let ok = match &response.status {
        Value::String(s) => s == "1",
        Value::Number(n) => n.as_u64() == Some(1),
        _ => false,
    };

    if !ok {
        let result = response.result.as_str().unwrap_or_default();
        let text = format!("{} {}", response.message, result).to_lowercase();
        if text.contains("rate limit") {
            return Err(ResolutionError::RemoteUnavailable(format!(
                "registry rate limit: {result}"
            )));
        }
        if ["not verified", "invalid address", "no data", "not found"]
            .iter()
            .any(|needle| text.contains(needle))
        {
            return Ok(None);
        }
        return Err(ResolutionError::RemoteUnavailable(format!(
            "registry error: {} {}",
            response.message, result
        )));
    }

    let description = match &response.result {
        Value::String(raw) => InterfaceDescription::from_json_str(raw),
        other => InterfaceDescription::from_value(other),
    }
    .map_err(|e| ResolutionError::RemoteUnavailable(format!("malformed ABI payload: {e}")))?;

    Ok(Some(description))
}
