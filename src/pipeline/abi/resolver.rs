use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

use super::registry::RemoteRegistry;
use super::source::{AbiSource, CacheSource, CallerSuppliedSource, RegistrySource, StaticFallbackSource};
use super::{AbiCacheEntry, AbiSourceTag, InterfaceDescription, ResolvedAbi};
use crate::pipeline::error::{PersistenceError, ResolutionError};
use crate::pipeline::store::AuditDb;
use crate::pipeline::types::{ContractAddress, ContractKey, Network};

/// Input of one resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveRequest {
    pub address: ContractAddress,
    pub network: Network,
    pub caller_supplied: Option<InterfaceDescription>,
    /// Skip the static fallback and non-manual cache entries.
    pub force_refresh: bool,
    /// With `force_refresh`, also skip and replace a manual override.
    pub override_manual: bool,
}

impl ResolveRequest {
    pub fn new(address: ContractAddress, network: Network) -> Self {
        Self {
            address,
            network,
            caller_supplied: None,
            force_refresh: false,
            override_manual: false,
        }
    }

    pub fn with_caller_supplied(mut self, description: InterfaceDescription) -> Self {
        self.caller_supplied = Some(description);
        self
    }

    pub fn with_force_refresh(mut self, override_manual: bool) -> Self {
        self.force_refresh = true;
        self.override_manual = override_manual;
        self
    }

    fn key(&self) -> ContractKey {
        (self.address, self.network.clone())
    }
}

/// Walks the configured sources in order; first one to yield wins.
///
/// Shared sources (cache, registry) run while holding a per-contract lock so
/// that concurrent resolutions of the same contract perform at most one
/// remote fetch: latecomers find the entry the first caller cached.
pub struct AbiResolver {
    sources: Vec<Arc<dyn AbiSource>>,
    db: Arc<AuditDb>,
    in_flight: InFlight,
}

impl AbiResolver {
    pub fn new(sources: Vec<Arc<dyn AbiSource>>, db: Arc<AuditDb>) -> Self {
        Self {
            sources,
            db,
            in_flight: InFlight::default(),
        }
    }

    /// caller-supplied → manual override → static fallback → cache → registry
    /// (when configured).
    pub fn standard(
        db: Arc<AuditDb>,
        registry: Option<Arc<dyn RemoteRegistry>>,
        fallbacks: StaticFallbackSource,
    ) -> Self {
        let mut sources: Vec<Arc<dyn AbiSource>> = vec![
            Arc::new(CallerSuppliedSource),
            Arc::new(CacheSource::manual_overrides(db.clone())),
            Arc::new(fallbacks),
            Arc::new(CacheSource::new(db.clone())),
        ];
        if let Some(registry) = registry {
            sources.push(Arc::new(RegistrySource::new(registry, db.clone())));
        }
        Self::new(sources, db)
    }

    pub async fn resolve(&self, request: ResolveRequest) -> Result<ResolvedAbi, ResolutionError> {
        let mut flight: Option<FlightGuard<'_>> = None;

        for source in &self.sources {
            if source.is_shared() && flight.is_none() {
                flight = Some(self.in_flight.acquire(request.key()).await);
            }

            if let Some(resolved) = source.try_resolve(&request).await? {
                tracing::debug!(
                    target: "auditor::pipeline::abi",
                    address = %request.address,
                    network = %request.network,
                    source = source.name(),
                    tag = %resolved.source,
                    members = resolved.description.len(),
                    "Resolved interface description"
                );
                return Ok(resolved);
            }
        }

        Err(ResolutionError::NotFound {
            address: request.address,
            network: request.network,
        })
    }

    /// Stores `description` as a manual override.
    pub async fn save(
        &self,
        address: ContractAddress,
        network: Network,
        description: &InterfaceDescription,
    ) -> Result<(), PersistenceError> {
        let _flight = self.in_flight.acquire((address, network.clone())).await;
        self.db
            .upsert_abi(&address, &network, description, AbiSourceTag::ManualOverride, false)
            .await?;
        tracing::info!(
            target: "auditor::pipeline::abi",
            %address,
            %network,
            members = description.len(),
            "Saved manual ABI override"
        );
        Ok(())
    }

    /// The stored cache entry, if any.
    pub async fn cached(
        &self,
        address: &ContractAddress,
        network: &Network,
    ) -> Result<Option<AbiCacheEntry>, PersistenceError> {
        self.db.get_abi(address, network).await
    }
}

#[derive(Default)]
struct InFlight {
    locks: Mutex<HashMap<ContractKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl InFlight {
    async fn acquire(&self, key: ContractKey) -> FlightGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key.clone()).or_default().clone()
        };
        FlightGuard {
            key,
            table: self,
            _guard: lock.lock_owned().await,
        }
    }
}

struct FlightGuard<'a> {
    key: ContractKey,
    table: &'a InFlight,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.table.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // The table and this guard hold the only references: nobody is waiting.
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2)
        {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::abi::{AbiMember, Mutability};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingRegistry {
        calls: AtomicUsize,
        response: Result<Option<InterfaceDescription>, ResolutionError>,
    }

    impl CountingRegistry {
        fn new(response: Result<Option<InterfaceDescription>, ResolutionError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                response,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteRegistry for CountingRegistry {
        async fn fetch(
            &self,
            _address: &ContractAddress,
            _network: &Network,
        ) -> Result<Option<InterfaceDescription>, ResolutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.response.clone()
        }
    }

    fn address() -> ContractAddress {
        "0x2222222222222222222222222222222222222222".parse().unwrap()
    }

    fn description(member: &str) -> InterfaceDescription {
        InterfaceDescription::new(vec![AbiMember::function(member, Mutability::View)])
    }

    async fn setup(
        response: Result<Option<InterfaceDescription>, ResolutionError>,
        fallbacks: StaticFallbackSource,
    ) -> (AbiResolver, Arc<CountingRegistry>) {
        let db = Arc::new(AuditDb::in_memory().await.unwrap());
        let registry = CountingRegistry::new(response);
        let resolver = AbiResolver::standard(db, Some(registry.clone()), fallbacks);
        (resolver, registry)
    }

    #[tokio::test]
    async fn test_caller_supplied_wins_and_is_not_cached() {
        let (resolver, registry) =
            setup(Ok(Some(description("remote"))), StaticFallbackSource::new()).await;

        let request = ResolveRequest::new(address(), Network::default())
            .with_caller_supplied(description("mine"));
        let resolved = resolver.resolve(request).await.unwrap();

        assert_eq!(resolved.source, AbiSourceTag::CallerSupplied);
        assert_eq!(registry.calls(), 0);
        assert!(resolver
            .cached(&address(), &Network::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_remote_fetch_is_cached_then_served_from_cache() {
        let (resolver, registry) =
            setup(Ok(Some(description("remote"))), StaticFallbackSource::new()).await;
        let request = ResolveRequest::new(address(), Network::default());

        let first = resolver.resolve(request.clone()).await.unwrap();
        assert_eq!(first.source, AbiSourceTag::RemoteFetch);

        let second = resolver.resolve(request).await.unwrap();
        assert_eq!(second.source, AbiSourceTag::CacheHit);
        assert_eq!(second.description, first.description);
        assert_eq!(registry.calls(), 1);
    }

    #[tokio::test]
    async fn test_static_fallback_precedes_cache_and_registry() {
        let fallbacks =
            StaticFallbackSource::new().with(address(), Network::default(), description("fallback"));
        let (resolver, registry) = setup(Ok(Some(description("remote"))), fallbacks).await;

        let resolved = resolver
            .resolve(ResolveRequest::new(address(), Network::default()))
            .await
            .unwrap();
        assert_eq!(resolved.source, AbiSourceTag::LocalFallback);
        assert_eq!(registry.calls(), 0);
    }

    #[tokio::test]
    async fn test_manual_save_outranks_static_fallback() {
        let network = Network::default();
        let fallbacks =
            StaticFallbackSource::new().with(address(), network.clone(), description("fallback"));
        let (resolver, registry) = setup(Ok(Some(description("remote"))), fallbacks).await;

        resolver
            .save(address(), network.clone(), &description("manual"))
            .await
            .unwrap();

        for request in [
            ResolveRequest::new(address(), network.clone()),
            ResolveRequest::new(address(), network.clone()).with_force_refresh(false),
        ] {
            let resolved = resolver.resolve(request).await.unwrap();
            assert_eq!(resolved.source, AbiSourceTag::ManualOverride);
            assert_eq!(resolved.description, description("manual"));
        }
        assert_eq!(registry.calls(), 0);
    }

    #[tokio::test]
    async fn test_nothing_found_is_not_found() {
        let (resolver, _) = setup(Ok(None), StaticFallbackSource::new()).await;
        let err = resolver
            .resolve(ResolveRequest::new(address(), Network::default()))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ResolutionError::NotFound {
                address: address(),
                network: Network::default(),
            }
        );
    }

    #[tokio::test]
    async fn test_remote_unavailable_propagates() {
        let (resolver, _) = setup(
            Err(ResolutionError::RemoteUnavailable("429".to_string())),
            StaticFallbackSource::new(),
        )
        .await;
        let err = resolver
            .resolve(ResolveRequest::new(address(), Network::default()))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_manual_override_survives_refresh_without_flag() {
        let (resolver, registry) =
            setup(Ok(Some(description("remote"))), StaticFallbackSource::new()).await;
        let network = Network::default();
        resolver
            .save(address(), network.clone(), &description("manual"))
            .await
            .unwrap();

        let plain = resolver
            .resolve(ResolveRequest::new(address(), network.clone()))
            .await
            .unwrap();
        assert_eq!(plain.source, AbiSourceTag::ManualOverride);
        assert_eq!(plain.description, description("manual"));

        let refreshed = resolver
            .resolve(ResolveRequest::new(address(), network.clone()).with_force_refresh(false))
            .await
            .unwrap();
        assert_eq!(refreshed.description, description("manual"));
        assert_eq!(registry.calls(), 0);

        let overridden = resolver
            .resolve(ResolveRequest::new(address(), network.clone()).with_force_refresh(true))
            .await
            .unwrap();
        assert_eq!(overridden.source, AbiSourceTag::RemoteFetch);
        assert_eq!(registry.calls(), 1);

        let entry = resolver.cached(&address(), &network).await.unwrap().unwrap();
        assert_eq!(entry.source, AbiSourceTag::RemoteFetch);
        assert_eq!(entry.description, description("remote"));
    }

    #[tokio::test]
    async fn test_concurrent_resolutions_fetch_once() {
        let (resolver, registry) =
            setup(Ok(Some(description("remote"))), StaticFallbackSource::new()).await;
        let resolver = Arc::new(resolver);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                tokio::spawn(async move {
                    resolver
                        .resolve(ResolveRequest::new(address(), Network::default()))
                        .await
                })
            })
            .collect();

        let mut descriptions = Vec::new();
        for handle in handles {
            descriptions.push(handle.await.unwrap().unwrap().description);
        }

        assert_eq!(registry.calls(), 1);
        assert!(descriptions.iter().all(|d| *d == description("remote")));
        assert!(resolver.in_flight.locks.lock().unwrap().is_empty());
    }
}
