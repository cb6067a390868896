//! The individual links of the resolution chain.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::registry::RemoteRegistry;
use super::resolver::ResolveRequest;
use super::{AbiSourceTag, InterfaceDescription, ResolvedAbi};
use crate::pipeline::error::ResolutionError;
use crate::pipeline::store::{AuditDb, CacheWrite};
use crate::pipeline::types::{ContractAddress, ContractKey, Network};

/// One step of the resolution chain.
///
/// `Ok(None)` passes control to the next source. An error aborts the whole
/// resolution.
#[async_trait]
pub trait AbiSource: Send + Sync {
    fn name(&self) -> &str;

    /// Sources that read or write shared state run under the per-contract
    /// in-flight lock of the resolver.
    fn is_shared(&self) -> bool {
        false
    }

    async fn try_resolve(
        &self,
        request: &ResolveRequest,
    ) -> Result<Option<ResolvedAbi>, ResolutionError>;
}

/// Description passed in by the caller for this one request.
#[derive(Debug, Default)]
pub struct CallerSuppliedSource;

#[async_trait]
impl AbiSource for CallerSuppliedSource {
    fn name(&self) -> &str {
        "caller_supplied"
    }

    async fn try_resolve(
        &self,
        request: &ResolveRequest,
    ) -> Result<Option<ResolvedAbi>, ResolutionError> {
        Ok(request
            .caller_supplied
            .clone()
            .map(|description| ResolvedAbi::new(description, AbiSourceTag::CallerSupplied)))
    }
}

/// Descriptions shipped with the deployment, keyed per contract and network.
#[derive(Debug, Default, Clone)]
pub struct StaticFallbackSource {
    entries: HashMap<ContractKey, InterfaceDescription>,
}

impl StaticFallbackSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        address: ContractAddress,
        network: Network,
        description: InterfaceDescription,
    ) -> Self {
        self.insert(address, network, description);
        self
    }

    pub fn insert(
        &mut self,
        address: ContractAddress,
        network: Network,
        description: InterfaceDescription,
    ) {
        self.entries.insert((address, network), description);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AbiSource for StaticFallbackSource {
    fn name(&self) -> &str {
        "static_fallback"
    }

    async fn try_resolve(
        &self,
        request: &ResolveRequest,
    ) -> Result<Option<ResolvedAbi>, ResolutionError> {
        // A forced refresh goes to the registry.
        if request.force_refresh {
            return Ok(None);
        }
        let key = (request.address, request.network.clone());
        Ok(self
            .entries
            .get(&key)
            .cloned()
            .map(|description| ResolvedAbi::new(description, AbiSourceTag::LocalFallback)))
    }
}

/// The persistent `abi_cache` table.
///
/// A stored manual override is reported as such. With `force_refresh` only a
/// manual override is still served, unless `override_manual` is also set.
pub struct CacheSource {
    db: Arc<AuditDb>,
    manual_only: bool,
}

impl CacheSource {
    pub fn new(db: Arc<AuditDb>) -> Self {
        Self {
            db,
            manual_only: false,
        }
    }

    /// Serves manual overrides only. Placed ahead of the static fallback so a
    /// saved description outranks a shipped one.
    pub fn manual_overrides(db: Arc<AuditDb>) -> Self {
        Self {
            db,
            manual_only: true,
        }
    }
}

#[async_trait]
impl AbiSource for CacheSource {
    fn name(&self) -> &str {
        if self.manual_only {
            "manual_override"
        } else {
            "cache"
        }
    }

    fn is_shared(&self) -> bool {
        true
    }

    async fn try_resolve(
        &self,
        request: &ResolveRequest,
    ) -> Result<Option<ResolvedAbi>, ResolutionError> {
        if request.force_refresh && request.override_manual {
            return Ok(None);
        }

        let entry = match self.db.get_abi(&request.address, &request.network).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(
                    target: "auditor::pipeline::abi",
                    address = %request.address,
                    network = %request.network,
                    error = %e,
                    "ABI cache read failed, treating as miss"
                );
                return Ok(None);
            }
        };

        let Some(entry) = entry else {
            return Ok(None);
        };

        let manual = entry.source == AbiSourceTag::ManualOverride;
        if (request.force_refresh || self.manual_only) && !manual {
            return Ok(None);
        }

        metrics::counter!("abi_cache_hits").increment(1);
        let tag = if manual {
            AbiSourceTag::ManualOverride
        } else {
            AbiSourceTag::CacheHit
        };
        Ok(Some(ResolvedAbi::new(entry.description, tag)))
    }
}

/// Remote registry lookup; successful fetches are written back to the cache.
pub struct RegistrySource {
    registry: Arc<dyn RemoteRegistry>,
    db: Arc<AuditDb>,
}

impl RegistrySource {
    pub fn new(registry: Arc<dyn RemoteRegistry>, db: Arc<AuditDb>) -> Self {
        Self { registry, db }
    }
}

#[async_trait]
impl AbiSource for RegistrySource {
    fn name(&self) -> &str {
        "registry"
    }

    fn is_shared(&self) -> bool {
        true
    }

    async fn try_resolve(
        &self,
        request: &ResolveRequest,
    ) -> Result<Option<ResolvedAbi>, ResolutionError> {
        metrics::counter!("abi_remote_fetches").increment(1);
        let Some(description) = self
            .registry
            .fetch(&request.address, &request.network)
            .await?
        else {
            return Ok(None);
        };

        let overwrite_manual = request.force_refresh && request.override_manual;
        let write = self
            .db
            .upsert_abi(
                &request.address,
                &request.network,
                &description,
                AbiSourceTag::RemoteFetch,
                overwrite_manual,
            )
            .await;

        match write {
            Ok(CacheWrite::Written) => {}
            Ok(CacheWrite::KeptManual) => {
                // A manual override landed while we were fetching; it wins.
                if let Ok(Some(entry)) = self.db.get_abi(&request.address, &request.network).await {
                    return Ok(Some(ResolvedAbi::new(
                        entry.description,
                        AbiSourceTag::ManualOverride,
                    )));
                }
            }
            Err(e) => {
                tracing::warn!(
                    target: "auditor::pipeline::abi",
                    address = %request.address,
                    network = %request.network,
                    error = %e,
                    "Failed to cache fetched ABI"
                );
            }
        }

        Ok(Some(ResolvedAbi::new(description, AbiSourceTag::RemoteFetch)))
    }
}
