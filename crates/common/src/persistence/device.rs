//! Node registration, user input attributes and workload configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{now_secs, AgentDb, DbError, DbResult};

const DEVICE_KEY: &str = "device";
const SAVED_PATTERN_KEY: &str = "saved_pattern";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigState {
    #[default]
    Configuring,
    Configured,
    Unconfiguring,
    Unconfigured,
}

/// The node's registration with the exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeDevice {
    pub id: String,
    pub org: String,
    pub name: String,
    pub token: String,
    /// Empty for policy-based nodes.
    pub pattern: String,
    /// `device` or `cluster`.
    pub node_type: String,
    pub config_state: ConfigState,
    pub last_state_change: u64,
}

impl ExchangeDevice {
    /// `org/id`, the form the exchange uses.
    pub fn full_id(&self) -> String {
        format!("{}/{}", self.org, self.id)
    }

    pub fn is_pattern_node(&self) -> bool {
        !self.pattern.is_empty()
    }
}

/// User supplied variables applying to one or more services.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub id: String,
    /// Services the attribute applies to as `(url, org)`; empty applies to all.
    pub service_specs: Vec<(String, String)>,
    pub mappings: BTreeMap<String, String>,
}

impl Attribute {
    pub fn applies_to(&self, url: &str, org: &str) -> bool {
        self.service_specs.is_empty() || self.service_specs.iter().any(|(u, o)| u == url && o == org)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub workload_url: String,
    pub org: String,
    pub version_expression: String,
    pub variables: BTreeMap<String, String>,
}

impl WorkloadConfig {
    fn key(&self) -> String {
        format!("{}|{}|{}", self.org, self.workload_url, self.version_expression)
    }
}

impl AgentDb {
    pub fn save_device(&self, device: &ExchangeDevice) -> DbResult<()> {
        if device.id.is_empty() || device.org.is_empty() {
            return Err(DbError::Invalid("device id or org is empty".to_string()));
        }
        self.put_record(self.db_device, DEVICE_KEY, device)
    }

    pub fn find_device(&self) -> DbResult<Option<ExchangeDevice>> {
        self.get_record(self.db_device, DEVICE_KEY)
    }

    pub fn set_device_config_state(&self, state: ConfigState) -> DbResult<Option<ExchangeDevice>> {
        self.update_record(self.db_device, DEVICE_KEY, |d: &mut ExchangeDevice| {
            d.config_state = state;
            d.last_state_change = now_secs();
        })
    }

    pub fn set_device_pattern(&self, pattern: &str) -> DbResult<Option<ExchangeDevice>> {
        self.update_record(self.db_device, DEVICE_KEY, |d: &mut ExchangeDevice| {
            d.pattern = pattern.to_string();
        })
    }

    pub fn delete_device(&self) -> DbResult<bool> {
        self.delete_record(self.db_device, DEVICE_KEY)
    }

    /// A pattern waiting to be applied once the current one is torn down.
    pub fn save_saved_pattern(&self, pattern: &str) -> DbResult<()> {
        self.put_record(self.db_device, SAVED_PATTERN_KEY, &pattern.to_string())
    }

    pub fn find_saved_pattern(&self) -> DbResult<Option<String>> {
        self.get_record(self.db_device, SAVED_PATTERN_KEY)
    }

    pub fn delete_saved_pattern(&self) -> DbResult<bool> {
        self.delete_record(self.db_device, SAVED_PATTERN_KEY)
    }

    pub fn save_attribute(&self, attr: &Attribute) -> DbResult<()> {
        if attr.id.is_empty() {
            return Err(DbError::Invalid("attribute id is empty".to_string()));
        }
        self.put_record(self.db_attributes, &attr.id, attr)
    }

    pub fn find_attributes(&self) -> DbResult<Vec<Attribute>> {
        self.scan_records(self.db_attributes)
    }

    pub fn find_applicable_attributes(&self, url: &str, org: &str) -> DbResult<Vec<Attribute>> {
        Ok(self
            .find_attributes()?
            .into_iter()
            .filter(|a| a.applies_to(url, org))
            .collect())
    }

    pub fn delete_all_attributes(&self) -> DbResult<usize> {
        self.clear_records(self.db_attributes)
    }

    pub fn save_workload_config(&self, cfg: &WorkloadConfig) -> DbResult<()> {
        self.put_record(self.db_workload_config, &cfg.key(), cfg)
    }

    pub fn find_workload_configs(&self) -> DbResult<Vec<WorkloadConfig>> {
        self.scan_records(self.db_workload_config)
    }

    pub fn delete_all_workload_configs(&self) -> DbResult<usize> {
        self.clear_records(self.db_workload_config)
    }
}
