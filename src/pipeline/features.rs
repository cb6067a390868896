//! Feature extraction.
//!
//! Maps an interface description (and optionally deployed bytecode) to a
//! fixed-shape vector. Extraction is total and deterministic: malformed or
//! empty input degrades to zeros, never to an error.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::abi::{AbiParam, InterfaceDescription, Mutability};

/// Bumped whenever the meaning or order of a dimension changes.
pub const FEATURE_VERSION: u32 = 1;

/// Dimension names, in vector order.
pub const FEATURE_LAYOUT: [&str; 14] = [
    "member_count",
    "state_changing_ratio",
    "payable_ratio",
    "ownership_transfer",
    "self_destruct",
    "delegated_call",
    "mint_capability",
    "pause_capability",
    "withdraw_capability",
    "risky_flag_count",
    "input_type_categories",
    "output_type_categories",
    "bytecode_size_kb",
    "call_opcode_density",
];

pub const FEATURE_COUNT: usize = FEATURE_LAYOUT.len();

// Indices into FEATURE_LAYOUT.
const MEMBER_COUNT: usize = 0;
const STATE_CHANGING_RATIO: usize = 1;
const PAYABLE_RATIO: usize = 2;
const FIRST_FLAG: usize = 3;
const RISKY_FLAG_COUNT: usize = 9;
const INPUT_TYPE_CATEGORIES: usize = 10;
const OUTPUT_TYPE_CATEGORIES: usize = 11;
const BYTECODE_SIZE_KB: usize = 12;
const CALL_OPCODE_DENSITY: usize = 13;

/// CALL, CALLCODE, DELEGATECALL, STATICCALL, SELFDESTRUCT.
const CALL_FAMILY_OPCODES: [u8; 5] = [0xf1, 0xf2, 0xf4, 0xfa, 0xff];

/// Name patterns for each risk flag, in layout order starting at `ownership_transfer`.
/// A member raises the flag when its lowercased name contains any pattern.
const RISK_PATTERNS: [(&str, &[&str]); 6] = [
    (
        "ownership_transfer",
        &["transferownership", "renounceownership", "setowner", "changeowner", "setadmin", "changeadmin"],
    ),
    ("self_destruct", &["selfdestruct", "destroy", "suicide", "kill"]),
    (
        "delegated_call",
        &["delegatecall", "upgradeto", "setimplementation", "functioncall"],
    ),
    ("mint_capability", &["mint"]),
    ("pause_capability", &["pause"]),
    ("withdraw_capability", &["withdraw", "sweep", "rescue"]),
];

/// Fixed-length numeric profile of one contract.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector([f64; FEATURE_COUNT]);

impl FeatureVector {
    pub const fn zeroed() -> Self {
        Self([0.0; FEATURE_COUNT])
    }

    pub const fn from_array(values: [f64; FEATURE_COUNT]) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_LAYOUT
            .iter()
            .position(|n| *n == name)
            .map(|i| self.0[i])
    }

    /// Names of the risk flags this vector raises.
    pub fn raised_flags(&self) -> Vec<&'static str> {
        RISK_PATTERNS
            .iter()
            .enumerate()
            .filter(|(i, _)| self.0[FIRST_FLAG + i] > 0.0)
            .map(|(_, (name, _))| *name)
            .collect()
    }
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Derive the feature vector for a description and optional bytecode.
pub fn extract(description: &InterfaceDescription, bytecode: Option<&[u8]>) -> FeatureVector {
    let mut values = [0.0; FEATURE_COUNT];
    let members = description.members();

    if !members.is_empty() {
        let total = members.len() as f64;
        let state_changing = members.iter().filter(|m| !m.is_read_only()).count();
        let payable = members
            .iter()
            .filter(|m| m.mutability == Mutability::Payable)
            .count();

        values[MEMBER_COUNT] = total;
        values[STATE_CHANGING_RATIO] = state_changing as f64 / total;
        values[PAYABLE_RATIO] = payable as f64 / total;

        let names: Vec<String> = members.iter().map(|m| m.name.to_lowercase()).collect();
        let mut raised = 0.0;
        for (offset, (_, patterns)) in RISK_PATTERNS.iter().enumerate() {
            let hit = names
                .iter()
                .any(|name| patterns.iter().any(|p| name.contains(p)));
            if hit {
                values[FIRST_FLAG + offset] = 1.0;
                raised += 1.0;
            }
        }
        values[RISKY_FLAG_COUNT] = raised;

        values[INPUT_TYPE_CATEGORIES] =
            type_categories(members.iter().flat_map(|m| m.inputs.iter())) as f64;
        values[OUTPUT_TYPE_CATEGORIES] =
            type_categories(members.iter().flat_map(|m| m.outputs.iter())) as f64;
    }

    if let Some(code) = bytecode.filter(|code| !code.is_empty()) {
        let calls = code
            .iter()
            .filter(|byte| CALL_FAMILY_OPCODES.contains(*byte))
            .count();
        values[BYTECODE_SIZE_KB] = code.len() as f64 / 1024.0;
        values[CALL_OPCODE_DENSITY] = calls as f64 / code.len() as f64;
    }

    FeatureVector(values)
}

fn type_categories<'a>(params: impl Iterator<Item = &'a AbiParam>) -> usize {
    params.map(|p| type_category(&p.ty)).collect::<BTreeSet<_>>().len()
}

fn type_category(ty: &str) -> &'static str {
    if ty.ends_with(']') {
        return "array";
    }
    match ty {
        "address" => "address",
        "bool" => "bool",
        "string" => "string",
        "bytes" => "bytes",
        "function" => "function",
        t if t.starts_with("tuple") => "tuple",
        t if t.starts_with("uint") || t.starts_with("int") => "integer",
        t if t.starts_with("fixed") || t.starts_with("ufixed") => "fixed_point",
        t if t.starts_with("bytes") => "fixed_bytes",
        _ => "other",
    }
}
