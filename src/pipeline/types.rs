//! Contract addressing primitives shared by every pipeline stage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Network used when a request does not name one.
pub const DEFAULT_NETWORK: &str = "sepolia";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("address must be 20 bytes (40 hex digits), got {0} digits")]
    Length(usize),
    #[error("address is not valid hex: {0}")]
    Hex(String),
}

/// 20-byte EVM contract address.
///
/// Parsing is case-insensitive and accepts an optional `0x` prefix. The
/// canonical form (display, storage keys) is lowercase with a `0x` prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContractAddress([u8; 20]);

impl ContractAddress {
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl FromStr for ContractAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.len() != 40 {
            return Err(AddressError::Length(digits.len()));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(digits, &mut bytes).map_err(|e| AddressError::Hex(e.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ContractAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ContractAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContractAddress({self})")
    }
}

impl Serialize for ContractAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContractAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Named chain an address lives on (`mainnet`, `sepolia`, ...).
///
/// Names are trimmed and lowercased so `Sepolia` and `sepolia ` share one
/// cache key. A bare decimal chain id is also accepted as a name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Network(String);

impl Network {
    pub fn new(name: impl AsRef<str>) -> Self {
        let normalized = name.as_ref().trim().to_lowercase();
        if normalized.is_empty() {
            Self(DEFAULT_NETWORK.to_string())
        } else {
            Self(normalized)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Chain identifier used by the remote registry, if the network is known.
    pub fn chain_id(&self) -> Option<u64> {
        let id = match self.0.as_str() {
            "mainnet" | "ethereum" => 1,
            "sepolia" => 11_155_111,
            "holesky" => 17_000,
            "hoodi" => 560_048,
            "optimism" => 10,
            "bsc" => 56,
            "polygon" => 137,
            "base" => 8453,
            "arbitrum" => 42_161,
            other => return other.parse().ok(),
        };
        Some(id)
    }
}

impl Default for Network {
    fn default() -> Self {
        Self(DEFAULT_NETWORK.to_string())
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Network({})", self.0)
    }
}

impl<'de> Deserialize<'de> for Network {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::new(String::deserialize(deserializer)?))
    }
}

/// Cache key for one contract on one network.
pub type ContractKey = (ContractAddress, Network);
