//! Interface description model and tolerant JSON ABI parsing.
//!
//! Only callable members survive parsing: functions, `fallback` and `receive`.
//! Events, errors and constructors are dropped. Malformed entries are skipped
//! instead of failing the whole document, and members are deduplicated on
//! name + input signature (first occurrence wins).

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbiParseError {
    #[error("invalid ABI JSON: {0}")]
    Json(String),
    #[error("ABI must be a JSON array of entries")]
    NotAnArray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberKind {
    Function,
    Fallback,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mutability {
    Pure,
    View,
    NonPayable,
    Payable,
}

impl Mutability {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "pure" => Some(Self::Pure),
            "view" => Some(Self::View),
            "nonpayable" => Some(Self::NonPayable),
            "payable" => Some(Self::Payable),
            _ => None,
        }
    }

    pub fn is_read_only(self) -> bool {
        matches!(self, Self::Pure | Self::View)
    }
}

/// Typed input or output slot of a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiParam {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<AbiParam>,
}

impl AbiParam {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            components: Vec::new(),
        }
    }

    /// Canonical type as used in selectors; tuples expand to `(a,b)[]`.
    pub fn canonical_type(&self) -> String {
        match self.ty.strip_prefix("tuple") {
            Some(suffix) => {
                let inner: Vec<String> = self.components.iter().map(Self::canonical_type).collect();
                format!("({}){suffix}", inner.join(","))
            }
            None => self.ty.clone(),
        }
    }
}

/// One callable member of a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiMember {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MemberKind,
    #[serde(rename = "stateMutability")]
    pub mutability: Mutability,
    #[serde(default)]
    pub inputs: Vec<AbiParam>,
    #[serde(default)]
    pub outputs: Vec<AbiParam>,
}

impl AbiMember {
    pub fn function(name: impl Into<String>, mutability: Mutability) -> Self {
        Self {
            name: name.into(),
            kind: MemberKind::Function,
            mutability,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<AbiParam>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<AbiParam>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.mutability.is_read_only()
    }

    /// `name(type,...)`, the string hashed into a function selector.
    pub fn signature(&self) -> String {
        let inputs: Vec<String> = self.inputs.iter().map(AbiParam::canonical_type).collect();
        format!("{}({})", self.name, inputs.join(","))
    }

    fn dedup_key(&self) -> String {
        match self.kind {
            MemberKind::Function => self.signature(),
            MemberKind::Fallback => "<fallback>".to_string(),
            MemberKind::Receive => "<receive>".to_string(),
        }
    }
}

/// Ordered list of callable members with unique signatures.
///
/// Serializes as a standard JSON ABI array, which is also the stored form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct InterfaceDescription {
    members: Vec<AbiMember>,
}

impl InterfaceDescription {
    /// Build from members, dropping later duplicates.
    pub fn new(members: Vec<AbiMember>) -> Self {
        let mut seen = HashSet::new();
        let members = members
            .into_iter()
            .filter(|m| seen.insert(m.dedup_key()))
            .collect();
        Self { members }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, AbiParseError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| AbiParseError::Json(e.to_string()))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, AbiParseError> {
        let entries = value.as_array().ok_or(AbiParseError::NotAnArray)?;
        let members = entries.iter().filter_map(parse_member).collect();
        Ok(Self::new(members))
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(&self.members).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn members(&self) -> &[AbiMember] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// First member with the given name (overloads share a name).
    pub fn member(&self, name: &str) -> Option<&AbiMember> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.member(name).is_some()
    }
}

impl<'de> Deserialize<'de> for InterfaceDescription {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(serde::de::Error::custom)
    }
}

fn parse_member(entry: &Value) -> Option<AbiMember> {
    let obj = entry.as_object()?;
    let kind = match obj.get("type").and_then(Value::as_str).unwrap_or("function") {
        "function" => MemberKind::Function,
        "fallback" => MemberKind::Fallback,
        "receive" => MemberKind::Receive,
        _ => return None,
    };

    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    if kind == MemberKind::Function && name.is_empty() {
        return None;
    }

    let flag = |key: &str| obj.get(key).and_then(Value::as_bool).unwrap_or(false);
    let mutability = match obj.get("stateMutability").and_then(Value::as_str) {
        Some(raw) => Mutability::parse(raw)?,
        // Pre-0.4.16 ABIs only carry `constant` / `payable`.
        None if flag("constant") => Mutability::View,
        None if flag("payable") || kind == MemberKind::Receive => Mutability::Payable,
        None => Mutability::NonPayable,
    };

    Some(AbiMember {
        name,
        kind,
        mutability,
        inputs: parse_params(obj.get("inputs"))?,
        outputs: parse_params(obj.get("outputs"))?,
    })
}

fn parse_params(value: Option<&Value>) -> Option<Vec<AbiParam>> {
    match value {
        None | Some(Value::Null) => Some(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(parse_param).collect(),
        Some(_) => None,
    }
}

fn parse_param(value: &Value) -> Option<AbiParam> {
    let obj = value.as_object()?;
    let ty = obj.get("type").and_then(Value::as_str)?.trim();
    if ty.is_empty() {
        return None;
    }
    Some(AbiParam {
        name: obj
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        ty: ty.to_string(),
        components: parse_params(obj.get("components"))?,
    })
}
