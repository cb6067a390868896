//! Read-only chain access.
//!
//! Used for two things: the bytecode that feeds the extractor, and calling
//! zero-argument `view`/`pure` members of a resolved description (token
//! metadata enrichment and the caller-facing call endpoint).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use primitive_types::U256;
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};

use super::abi::{AbiParam, InterfaceDescription};
use super::record::ContractMetadata;
use super::types::{ContractAddress, Network};

/// Members read for metadata enrichment, when present and read-only.
pub const METADATA_MEMBERS: [&str; 4] = ["name", "symbol", "decimals", "totalSupply"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("chain RPC failed: {0}")]
    Rpc(String),

    #[error("call reverted: {0}")]
    Reverted(String),

    #[error("member '{0}' not found")]
    UnknownMember(String),

    #[error("member '{0}' changes state and cannot be called read-only")]
    NotReadOnly(String),

    #[error("member '{0}' takes arguments")]
    RequiresArguments(String),

    #[error("cannot decode {ty}: {reason}")]
    Decode { ty: String, reason: String },
}

/// State reads against one network.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Network this reader is connected to.
    fn network(&self) -> &Network;

    /// Deployed bytecode; empty for accounts without code.
    async fn code_at(&self, address: &ContractAddress) -> Result<Vec<u8>, ChainError>;

    /// `eth_call` against the latest block.
    async fn call(&self, address: &ContractAddress, calldata: &[u8]) -> Result<Vec<u8>, ChainError>;
}

/// Ethereum JSON-RPC over HTTP.
pub struct JsonRpcChainReader {
    client: reqwest::Client,
    url: String,
    network: Network,
    next_id: AtomicU64,
}

impl JsonRpcChainReader {
    pub fn new(url: impl Into<String>, network: Network) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            network,
            next_id: AtomicU64::new(1),
        })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response: Value = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ChainError::Rpc(format!("{method}: {e}")))?
            .json()
            .await
            .map_err(|e| ChainError::Rpc(format!("{method}: invalid response: {e}")))?;

        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(if message.contains("revert") {
                ChainError::Reverted(message)
            } else {
                ChainError::Rpc(format!("{method}: {message}"))
            });
        }

        response
            .get("result")
            .cloned()
            .ok_or_else(|| ChainError::Rpc(format!("{method}: missing result")))
    }
}

#[async_trait]
impl ChainReader for JsonRpcChainReader {
    fn network(&self) -> &Network {
        &self.network
    }

    async fn code_at(&self, address: &ContractAddress) -> Result<Vec<u8>, ChainError> {
        let result = self
            .request("eth_getCode", json!([address.to_hex(), "latest"]))
            .await?;
        decode_hex_result(&result)
    }

    async fn call(&self, address: &ContractAddress, calldata: &[u8]) -> Result<Vec<u8>, ChainError> {
        let call = json!({
            "to": address.to_hex(),
            "data": format!("0x{}", hex::encode(calldata)),
        });
        let result = self.request("eth_call", json!([call, "latest"])).await?;
        decode_hex_result(&result)
    }
}

fn decode_hex_result(value: &Value) -> Result<Vec<u8>, ChainError> {
    let raw = value
        .as_str()
        .ok_or_else(|| ChainError::Rpc("result is not a hex string".to_string()))?;
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(digits).map_err(|e| ChainError::Rpc(format!("result is not valid hex: {e}")))
}

/// First four bytes of the Keccak-256 hash of a member signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = Keccak256::digest(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Calls a read-only, zero-argument member and decodes its outputs.
///
/// One output decodes to a JSON scalar, several to an array, none to `null`.
/// Integers are rendered as decimal strings.
pub async fn read_member(
    reader: &dyn ChainReader,
    address: &ContractAddress,
    description: &InterfaceDescription,
    name: &str,
) -> Result<Value, ChainError> {
    let member = description
        .member(name)
        .ok_or_else(|| ChainError::UnknownMember(name.to_string()))?;
    if !member.is_read_only() {
        return Err(ChainError::NotReadOnly(name.to_string()));
    }
    if !member.inputs.is_empty() {
        return Err(ChainError::RequiresArguments(name.to_string()));
    }

    let output = reader
        .call(address, &selector(&member.signature()))
        .await?;

    match member.outputs.as_slice() {
        [] => Ok(Value::Null),
        [single] => decode_slot(&output, 0, single),
        many => many
            .iter()
            .enumerate()
            .map(|(index, param)| decode_slot(&output, index, param))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
    }
}

/// Best-effort token metadata; members that are absent or fail are skipped.
pub async fn fetch_metadata(
    reader: &dyn ChainReader,
    address: &ContractAddress,
    description: &InterfaceDescription,
) -> ContractMetadata {
    let mut metadata = ContractMetadata::new();
    for name in METADATA_MEMBERS {
        let callable = description
            .member(name)
            .is_some_and(|m| m.is_read_only() && m.inputs.is_empty());
        if !callable {
            continue;
        }
        match read_member(reader, address, description, name).await {
            Ok(Value::String(text)) => {
                metadata.insert(name.to_string(), text);
            }
            Ok(Value::Null) => {}
            Ok(other) => {
                metadata.insert(name.to_string(), other.to_string());
            }
            Err(e) => {
                tracing::debug!(
                    target: "auditor::pipeline::chain",
                    %address,
                    member = name,
                    error = %e,
                    "Metadata read failed"
                );
            }
        }
    }
    metadata
}

fn word(data: &[u8], offset: usize, ty: &str) -> Result<[u8; 32], ChainError> {
    data.get(offset..offset + 32)
        .and_then(|slice| <[u8; 32]>::try_from(slice).ok())
        .ok_or_else(|| ChainError::Decode {
            ty: ty.to_string(),
            reason: format!("output too short for word at {offset}"),
        })
}

fn decode_slot(data: &[u8], index: usize, param: &AbiParam) -> Result<Value, ChainError> {
    let ty = param.canonical_type();
    let head = word(data, index * 32, &ty)?;
    let decode_err = |reason: &str| ChainError::Decode {
        ty: ty.clone(),
        reason: reason.to_string(),
    };

    if ty == "bool" {
        return Ok(Value::Bool(head[31] != 0));
    }
    if ty == "address" {
        return Ok(Value::String(format!("0x{}", hex::encode(&head[12..]))));
    }
    if ty == "string" || ty == "bytes" {
        let offset = U256::from_big_endian(&head);
        if offset.bits() > 32 {
            return Err(decode_err("offset out of range"));
        }
        let offset = offset.low_u64() as usize;
        let length = U256::from_big_endian(&word(data, offset, &ty)?);
        if length.bits() > 32 {
            return Err(decode_err("length out of range"));
        }
        let length = length.low_u64() as usize;
        let start = offset + 32;
        let bytes = data
            .get(start..start + length)
            .ok_or_else(|| decode_err("output too short for payload"))?;
        return Ok(if ty == "string" {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        } else {
            Value::String(format!("0x{}", hex::encode(bytes)))
        });
    }
    if let Some(width) = ty.strip_prefix("bytes") {
        let width: usize = width.parse().map_err(|_| decode_err("bad width"))?;
        if !(1..=32).contains(&width) {
            return Err(decode_err("bad width"));
        }
        return Ok(Value::String(format!("0x{}", hex::encode(&head[..width]))));
    }
    if ty.starts_with("uint") {
        return Ok(Value::String(U256::from_big_endian(&head).to_string()));
    }
    if ty.starts_with("int") {
        let value = U256::from_big_endian(&head);
        // Two's complement, sign-extended to 256 bits by the encoder.
        return Ok(Value::String(if value.bit(255) {
            format!("-{}", (!value).overflowing_add(U256::one()).0)
        } else {
            value.to_string()
        }));
    }

    Err(decode_err("unsupported output type"))
}
