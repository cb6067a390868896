//! Interface description resolution.
//!
//! Descriptions are resolved by walking an ordered chain of sources, first
//! success wins:
//!
//! ```text
//! caller-supplied → static fallback → cache (abi_cache) → remote registry
//!                                                              ↓
//!                                                   upsert as remote_fetch
//! ```
//!
//! Cache writes follow a provenance priority: a `manual_override` entry is
//! never replaced by a remote fetch unless the caller forces a refresh with
//! the explicit override flag.
//!
//! # Usage
//!
//! ```rust,ignore
//! use auditor::pipeline::abi::{AbiResolver, EtherscanRegistry, ResolveRequest};
//!
//! let resolver = AbiResolver::standard(db.clone(), Some(Arc::new(EtherscanRegistry::new(config)?)), fallbacks);
//! let resolved = resolver.resolve(ResolveRequest::new(address, network)).await?;
//! println!("{} members from {}", resolved.description.len(), resolved.source);
//! ```

mod description;
mod registry;
mod resolver;
mod source;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use description::{AbiMember, AbiParam, AbiParseError, InterfaceDescription, MemberKind, Mutability};
pub use registry::{parse_registry_response, EtherscanRegistry, RegistryConfig, RemoteRegistry};
pub use resolver::{AbiResolver, ResolveRequest};
pub use source::{AbiSource, CacheSource, CallerSuppliedSource, RegistrySource, StaticFallbackSource};

use super::types::{ContractAddress, Network};

/// Which source produced a description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbiSourceTag {
    CallerSupplied,
    LocalFallback,
    CacheHit,
    RemoteFetch,
    ManualOverride,
}

impl AbiSourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CallerSupplied => "caller_supplied",
            Self::LocalFallback => "local_fallback",
            Self::CacheHit => "cache_hit",
            Self::RemoteFetch => "remote_fetch",
            Self::ManualOverride => "manual_override",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "caller_supplied" => Some(Self::CallerSupplied),
            "local_fallback" => Some(Self::LocalFallback),
            "cache_hit" => Some(Self::CacheHit),
            "remote_fetch" => Some(Self::RemoteFetch),
            "manual_override" => Some(Self::ManualOverride),
            _ => None,
        }
    }
}

impl fmt::Display for AbiSourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A description together with the source that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedAbi {
    pub description: InterfaceDescription,
    pub source: AbiSourceTag,
}

impl ResolvedAbi {
    pub fn new(description: InterfaceDescription, source: AbiSourceTag) -> Self {
        Self {
            description,
            source,
        }
    }
}

/// Row of the `abi_cache` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbiCacheEntry {
    pub address: ContractAddress,
    pub network: Network,
    pub description: InterfaceDescription,
    /// Stored provenance: `remote_fetch` or `manual_override`.
    pub source: AbiSourceTag,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}
