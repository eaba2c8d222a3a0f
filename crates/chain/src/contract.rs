//! # Contract Client Abstraction
//!
//! Every on-chain getter and transaction goes through [`ContractClient`].
//! Results come back as a [`ContractValue`], a closed set of shapes the
//! device contracts actually return. Callers match on the variant, or use
//! the `expect_*` accessors which turn a shape mismatch into
//! [`ContractError::UnexpectedType`].
//!
//! ## Attribute lists
//!
//! The registry stores device attributes as a flat list of alternating
//! keys and values: `["name", "rpi3", "arch", "arm", ...]`.
//! [`extract_attr`] and [`extract_all`] read that layout.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use anax_common::DbError;

/// The address every zero-initialised address getter returns.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

// ════════════════════════════════════════════════════════════════════════════
// CONTRACT VALUE
// ════════════════════════════════════════════════════════════════════════════

/// A typed contract call parameter or result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ContractValue {
    Str(String),
    Bool(bool),
    StrList(Vec<String>),
    U64(u64),
    /// Transactions and void methods.
    Unit,
}

impl ContractValue {
    pub fn str(s: impl Into<String>) -> Self {
        ContractValue::Str(s.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ContractValue::Str(_) => "string",
            ContractValue::Bool(_) => "bool",
            ContractValue::StrList(_) => "string list",
            ContractValue::U64(_) => "u64",
            ContractValue::Unit => "unit",
        }
    }

    pub fn expect_str(self, method: &str) -> Result<String, ContractError> {
        match self {
            ContractValue::Str(s) => Ok(s),
            other => Err(ContractError::unexpected(method, "string", &other)),
        }
    }

    pub fn expect_bool(self, method: &str) -> Result<bool, ContractError> {
        match self {
            ContractValue::Bool(b) => Ok(b),
            other => Err(ContractError::unexpected(method, "bool", &other)),
        }
    }

    pub fn expect_list(self, method: &str) -> Result<Vec<String>, ContractError> {
        match self {
            ContractValue::StrList(l) => Ok(l),
            other => Err(ContractError::unexpected(method, "string list", &other)),
        }
    }

    pub fn expect_u64(self, method: &str) -> Result<u64, ContractError> {
        match self {
            ContractValue::U64(n) => Ok(n),
            other => Err(ContractError::unexpected(method, "u64", &other)),
        }
    }
}

impl fmt::Display for ContractValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractValue::Str(s) => write!(f, "{}", s),
            ContractValue::Bool(b) => write!(f, "{}", b),
            ContractValue::StrList(l) => write!(f, "{:?}", l),
            ContractValue::U64(n) => write!(f, "{}", n),
            ContractValue::Unit => write!(f, "()"),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ERROR TYPE
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("invoking {method} on {address} failed: {reason}")]
    Invoke {
        method: String,
        address: String,
        reason: String,
    },

    #[error("{method} returned {got}, expected {expected}")]
    UnexpectedType {
        method: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("contract deployment failed: {0}")]
    Deploy(String),

    #[error("contract not found: {0}")]
    NotFound(String),

    /// On-chain state contradicts itself or the local record.
    #[error("inconsistent contract state: {0}")]
    Inconsistent(String),

    #[error("write to {address} not observed: {reason}")]
    WriteNotObserved { address: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Db(#[from] DbError),
}

impl ContractError {
    fn unexpected(method: &str, expected: &'static str, got: &ContractValue) -> Self {
        ContractError::UnexpectedType {
            method: method.to_string(),
            expected,
            got: got.kind(),
        }
    }
}

pub type ContractResult<T> = Result<T, ContractError>;

// ════════════════════════════════════════════════════════════════════════════
// TRAITS
// ════════════════════════════════════════════════════════════════════════════

/// A handle to one deployed contract.
#[async_trait]
pub trait ContractClient: Send + Sync {
    fn contract_address(&self) -> String;

    /// Block number the last read was answered at.
    fn stable_block(&self) -> u64;

    async fn invoke_method(&self, method: &str, params: Vec<ContractValue>) -> ContractResult<ContractValue>;
}

/// Loads and deploys contracts by ABI name.
#[async_trait]
pub trait ContractFactory: Send + Sync {
    /// Deploy a fresh instance of `name` owned by `owner`.
    async fn deploy(&self, name: &str, owner: &str) -> ContractResult<Arc<dyn ContractClient>>;

    /// Bind to an existing contract.
    async fn at(&self, name: &str, owner: &str, address: &str) -> ContractResult<Arc<dyn ContractClient>>;
}

// ════════════════════════════════════════════════════════════════════════════
// ATTRIBUTE HELPERS
// ════════════════════════════════════════════════════════════════════════════

/// Value for `key` in a flat key/value attribute list.
pub fn extract_attr(attrs: &[String], key: &str) -> Option<String> {
    attrs
        .chunks(2)
        .find(|pair| pair.len() == 2 && pair[0] == key)
        .map(|pair| pair[1].clone())
}

/// Every key/value pair of a flat attribute list. A trailing key without a
/// value is dropped.
pub fn extract_all(attrs: &[String]) -> BTreeMap<String, String> {
    attrs
        .chunks(2)
        .filter(|pair| pair.len() == 2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs() -> Vec<String> {
        ["name", "rpi3", "arch", "arm", "hourly_cost_bacon", "10", "dangling"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_extract_attr_reads_pairs() {
        assert_eq!(extract_attr(&attrs(), "arch").as_deref(), Some("arm"));
        assert_eq!(extract_attr(&attrs(), "rpi3"), None);
        assert_eq!(extract_attr(&attrs(), "dangling"), None);
    }

    #[test]
    fn test_extract_all_drops_trailing_key() {
        let all = extract_all(&attrs());
        assert_eq!(all.len(), 3);
        assert_eq!(all["hourly_cost_bacon"], "10");
    }

    #[test]
    fn test_expect_mismatch_is_error() {
        let err = ContractValue::Bool(true).expect_str("get_agreement_id").unwrap_err();
        match err {
            ContractError::UnexpectedType { method, expected, got } => {
                assert_eq!(method, "get_agreement_id");
                assert_eq!(expected, "string");
                assert_eq!(got, "bool");
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(ContractValue::U64(7).expect_u64("get_escrow_amount").unwrap(), 7);
    }
}
