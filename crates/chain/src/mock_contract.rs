//! In-memory contracts for tests.
//!
//! [`MockContract`] answers getters from scripted values and records every
//! call. A write can be wired to change a getter with
//! [`MockContract::on_invoke`], which is how tests model a transaction
//! landing on chain. [`MockContractFactory`] hands out mock contracts for
//! deploy and bind requests.
//!
//! Nothing here touches the network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::contract::{ContractClient, ContractError, ContractFactory, ContractResult, ContractValue};

// ════════════════════════════════════════════════════════════════════════════
// MOCK CONTRACT
// ════════════════════════════════════════════════════════════════════════════

pub struct MockContract {
    address: String,
    block: AtomicU64,
    /// Per-method answers. The last queued value is sticky.
    responses: Mutex<HashMap<String, VecDeque<ContractValue>>>,
    /// Answers that only apply to one exact parameter list.
    keyed: Mutex<HashMap<(String, Vec<ContractValue>), ContractValue>>,
    failures: Mutex<HashMap<String, String>>,
    effects: Mutex<HashMap<String, Vec<(String, ContractValue)>>>,
    calls: Mutex<Vec<(String, Vec<ContractValue>)>>,
}

impl std::fmt::Debug for MockContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockContract")
            .field("address", &self.address)
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

impl MockContract {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            block: AtomicU64::new(1),
            responses: Mutex::new(HashMap::new()),
            keyed: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            effects: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `method` answers `value` from now on.
    pub fn set_value(&self, method: &str, value: ContractValue) {
        self.responses
            .lock()
            .insert(method.to_string(), VecDeque::from(vec![value]));
    }

    /// `method` answers each of `values` in turn, then repeats the last.
    pub fn script(&self, method: &str, values: Vec<ContractValue>) {
        self.responses.lock().insert(method.to_string(), values.into());
    }

    /// `method` called with exactly `params` answers `value`.
    pub fn set_value_for(&self, method: &str, params: Vec<ContractValue>, value: ContractValue) {
        self.keyed.lock().insert((method.to_string(), params), value);
    }

    /// Invoking `method` makes `getter` answer `value` afterwards.
    pub fn on_invoke(&self, method: &str, getter: &str, value: ContractValue) {
        self.effects
            .lock()
            .entry(method.to_string())
            .or_default()
            .push((getter.to_string(), value));
    }

    pub fn fail(&self, method: &str, reason: &str) {
        self.failures.lock().insert(method.to_string(), reason.to_string());
    }

    pub fn clear_failure(&self, method: &str) {
        self.failures.lock().remove(method);
    }

    pub fn calls(&self) -> Vec<(String, Vec<ContractValue>)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|(m, _)| m == method).count()
    }
}

#[async_trait]
impl ContractClient for MockContract {
    fn contract_address(&self) -> String {
        self.address.clone()
    }

    fn stable_block(&self) -> u64 {
        self.block.load(Ordering::SeqCst)
    }

    async fn invoke_method(&self, method: &str, params: Vec<ContractValue>) -> ContractResult<ContractValue> {
        self.calls.lock().push((method.to_string(), params.clone()));
        self.block.fetch_add(1, Ordering::SeqCst);

        if let Some(reason) = self.failures.lock().get(method) {
            return Err(ContractError::Invoke {
                method: method.to_string(),
                address: self.address.clone(),
                reason: reason.clone(),
            });
        }

        let effects = self.effects.lock().get(method).cloned().unwrap_or_default();
        for (getter, value) in effects {
            self.set_value(&getter, value);
        }

        if let Some(v) = self.keyed.lock().get(&(method.to_string(), params)) {
            return Ok(v.clone());
        }

        let mut responses = self.responses.lock();
        Ok(match responses.get_mut(method) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(ContractValue::Unit),
            Some(queue) => queue.front().cloned().unwrap_or(ContractValue::Unit),
            None => ContractValue::Unit,
        })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MOCK FACTORY
// ════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct MockContractFactory {
    contracts: Mutex<HashMap<String, Arc<MockContract>>>,
    deployable: Mutex<VecDeque<Arc<MockContract>>>,
    deploy_failure: Mutex<Option<String>>,
    binds: AtomicUsize,
}

impl std::fmt::Debug for MockContractFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockContractFactory")
            .field("contracts", &self.contracts.lock().len())
            .field("deployable", &self.deployable.lock().len())
            .finish()
    }
}

impl MockContractFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `contract` reachable through [`ContractFactory::at`].
    pub fn register(&self, contract: Arc<MockContract>) {
        self.contracts.lock().insert(contract.contract_address(), contract);
    }

    /// Queue `contract` as the result of the next deploy.
    pub fn prepare_deploy(&self, contract: Arc<MockContract>) {
        self.deployable.lock().push_back(contract);
    }

    pub fn fail_deploy(&self, reason: &str) {
        *self.deploy_failure.lock() = Some(reason.to_string());
    }

    pub fn contract(&self, address: &str) -> Option<Arc<MockContract>> {
        self.contracts.lock().get(address).cloned()
    }

    /// Number of successful `at` calls.
    pub fn bind_count(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContractFactory for MockContractFactory {
    async fn deploy(&self, name: &str, _owner: &str) -> ContractResult<Arc<dyn ContractClient>> {
        if let Some(reason) = self.deploy_failure.lock().clone() {
            return Err(ContractError::Deploy(reason));
        }
        let contract = self
            .deployable
            .lock()
            .pop_front()
            .ok_or_else(|| ContractError::Deploy(format!("no {} contract prepared", name)))?;
        self.register(Arc::clone(&contract));
        Ok(contract)
    }

    async fn at(&self, name: &str, _owner: &str, address: &str) -> ContractResult<Arc<dyn ContractClient>> {
        match self.contract(address) {
            Some(c) => {
                self.binds.fetch_add(1, Ordering::SeqCst);
                Ok(c)
            }
            None => Err(ContractError::NotFound(format!("{} at {}", name, address))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_sticky() {
        let c = MockContract::new("0x1");
        c.script("get_bank", vec![ContractValue::str("0x0"), ContractValue::str("0xbank")]);
        assert_eq!(c.invoke_method("get_bank", vec![]).await.unwrap(), ContractValue::str("0x0"));
        assert_eq!(c.invoke_method("get_bank", vec![]).await.unwrap(), ContractValue::str("0xbank"));
        assert_eq!(c.invoke_method("get_bank", vec![]).await.unwrap(), ContractValue::str("0xbank"));
        assert_eq!(c.call_count("get_bank"), 3);
    }

    #[tokio::test]
    async fn test_on_invoke_updates_getter() {
        let c = MockContract::new("0x1");
        c.set_value("get_agreement_id", ContractValue::str("ag1"));
        c.on_invoke("reject_container", "get_agreement_id", ContractValue::str(""));
        c.invoke_method("reject_container", vec![]).await.unwrap();
        assert_eq!(
            c.invoke_method("get_agreement_id", vec![]).await.unwrap(),
            ContractValue::str("")
        );
    }

    #[tokio::test]
    async fn test_factory_at_unknown_address() {
        let f = MockContractFactory::new();
        assert!(matches!(
            f.at("container_executor", "owner", "0xmissing").await,
            Err(ContractError::NotFound(_))
        ));
    }
}
