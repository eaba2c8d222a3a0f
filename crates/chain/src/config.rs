//! Blockchain section of the agent configuration.

use std::time::Duration;

use serde::Deserialize;

use anax_common::events::ChainId;

use crate::contract::{ContractError, ContractResult};

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ChainConfig {
    /// Contract gateway the HTTP client talks to.
    pub gateway_url: String,

    /// Account that owns this device's contracts.
    pub account_id: String,

    /// Address of the directory contract.
    pub directory_address: String,

    /// Directory entry version used to resolve registry and token bank.
    pub directory_version: String,

    /// Maximum number of pending contracts registered at once.
    pub max_concurrent_registrations: usize,

    /// Delay between two established contracts in one evaluation pass.
    pub contract_eval_interval_s: u64,

    /// Chain identity announced to protocol handlers.
    pub chain_type: String,
    pub chain_name: String,
    pub chain_org: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            gateway_url: "http://localhost:8545".to_string(),
            account_id: String::new(),
            directory_address: String::new(),
            directory_version: "0".to_string(),
            max_concurrent_registrations: 4,
            contract_eval_interval_s: 30,
            chain_type: "ethereum".to_string(),
            chain_name: "bluehorizon".to_string(),
            chain_org: String::new(),
        }
    }
}

impl ChainConfig {
    pub fn validate(&self) -> ContractResult<()> {
        if self.gateway_url.is_empty() {
            return Err(ContractError::Config("gateway_url is empty".to_string()));
        }
        if self.account_id.is_empty() {
            return Err(ContractError::Config("account_id is empty".to_string()));
        }
        if self.directory_address.is_empty() {
            return Err(ContractError::Config("directory_address is empty".to_string()));
        }
        if self.max_concurrent_registrations == 0 {
            return Err(ContractError::Config(
                "max_concurrent_registrations must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn contract_eval_interval(&self) -> Duration {
        Duration::from_secs(self.contract_eval_interval_s)
    }

    pub fn chain_id(&self) -> ChainId {
        ChainId {
            chain_type: self.chain_type.clone(),
            chain_name: self.chain_name.clone(),
            chain_org: self.chain_org.clone(),
        }
    }
}
