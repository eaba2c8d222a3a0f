//! In-memory exchange for tests.
//!
//! [`MockExchange`] keeps the node resource, a service catalog and known
//! agbots in memory and records every write. Failures are injected per
//! operation with [`MockExchange::fail_next`]; each queued error is returned
//! once, in order.
//!
//! Nothing here touches the network.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use anax_common::persistence::{ImageDockerAuth, WorkloadInfo};

use crate::exchange::{
    highest_in_range, AgbotInfo, AgreementState, DeviceStatus, ExchangeApi, ExchangeError, ExchangeNode,
    ExchangeResult, ExchangeService, PatchDeviceRequest, RegisteredService, ServiceConfigState,
};
use crate::policy::VersionRange;

#[derive(Debug, Default)]
struct State {
    device: Option<ExchangeNode>,
    device_deleted: bool,
    patches: Vec<PatchDeviceRequest>,
    deleted_agreements: Vec<String>,
    agreement_states: Vec<(String, String)>,
    signing_keys: HashMap<String, BTreeMap<String, String>>,
    docker_auths: HashMap<String, Vec<ImageDockerAuth>>,
    catalog: Vec<ExchangeService>,
    unregistered: Vec<(String, String)>,
    registered: Vec<RegisteredService>,
    config_states: Vec<ServiceConfigState>,
    agbots: HashSet<String>,
    sent: Vec<(String, serde_json::Value)>,
    statuses: Vec<DeviceStatus>,
    failures: HashMap<&'static str, VecDeque<ExchangeError>>,
    calls: HashMap<&'static str, usize>,
}

#[derive(Debug, Default)]
pub struct MockExchange {
    state: Mutex<State>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same as [`MockExchange::new`] with a registered node resource.
    pub fn with_device(node: ExchangeNode) -> Self {
        let m = Self::new();
        m.state.lock().device = Some(node);
        m
    }

    /// `op` is the `ExchangeApi` method name; `err` is returned on its next call.
    pub fn fail_next(&self, op: &'static str, err: ExchangeError) {
        self.state.lock().failures.entry(op).or_default().push_back(err);
    }

    pub fn add_agbot(&self, agbot_id: &str) {
        self.state.lock().agbots.insert(agbot_id.to_string());
    }

    pub fn publish_service(&self, service: ExchangeService) {
        self.state.lock().catalog.push(service);
    }

    pub fn set_signing_keys(&self, url: &str, keys: BTreeMap<String, String>) {
        self.state.lock().signing_keys.insert(url.to_string(), keys);
    }

    pub fn set_docker_auths(&self, url: &str, auths: Vec<ImageDockerAuth>) {
        self.state.lock().docker_auths.insert(url.to_string(), auths);
    }

    pub fn set_config_states(&self, states: Vec<ServiceConfigState>) {
        self.state.lock().config_states = states;
    }

    pub fn device(&self) -> Option<ExchangeNode> {
        self.state.lock().device.clone()
    }

    pub fn device_deleted(&self) -> bool {
        self.state.lock().device_deleted
    }

    pub fn patches(&self) -> Vec<PatchDeviceRequest> {
        self.state.lock().patches.clone()
    }

    pub fn deleted_agreements(&self) -> Vec<String> {
        self.state.lock().deleted_agreements.clone()
    }

    /// `(agreement id, state)` in the order they were written.
    pub fn agreement_states(&self) -> Vec<(String, String)> {
        self.state.lock().agreement_states.clone()
    }

    pub fn unregistered(&self) -> Vec<(String, String)> {
        self.state.lock().unregistered.clone()
    }

    pub fn registered(&self) -> Vec<RegisteredService> {
        self.state.lock().registered.clone()
    }

    /// Messages sent to agbots as `(agbot id, body)`.
    pub fn sent(&self) -> Vec<(String, serde_json::Value)> {
        self.state.lock().sent.clone()
    }

    /// Sent messages whose `"type"` is `kind`.
    pub fn sent_of_kind(&self, kind: &str) -> Vec<serde_json::Value> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(_, m)| m.get("type").and_then(|t| t.as_str()) == Some(kind))
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn statuses(&self) -> Vec<DeviceStatus> {
        self.state.lock().statuses.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Count the call and pop a queued failure, if any.
    fn enter(&self, op: &'static str) -> ExchangeResult<()> {
        let mut s = self.state.lock();
        *s.calls.entry(op).or_default() += 1;
        match s.failures.get_mut(op).and_then(|q| q.pop_front()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn get_device(&self) -> ExchangeResult<Option<ExchangeNode>> {
        self.enter("get_device")?;
        Ok(self.state.lock().device.clone())
    }

    async fn patch_device(&self, patch: &PatchDeviceRequest) -> ExchangeResult<()> {
        self.enter("patch_device")?;
        let mut s = self.state.lock();
        s.patches.push(patch.clone());
        if let Some(node) = s.device.as_mut() {
            if let Some(p) = &patch.pattern {
                node.pattern = p.clone();
            }
            if let Some(r) = &patch.registered_services {
                node.registered_services = r.clone();
            }
            if let Some(k) = &patch.public_key {
                node.public_key = k.clone();
            }
            if let Some(u) = &patch.user_input {
                node.user_input = u.clone();
            }
        }
        Ok(())
    }

    async fn delete_device(&self) -> ExchangeResult<()> {
        self.enter("delete_device")?;
        let mut s = self.state.lock();
        s.device = None;
        s.device_deleted = true;
        Ok(())
    }

    async fn delete_agreement(&self, agreement_id: &str) -> ExchangeResult<()> {
        self.enter("delete_agreement")?;
        self.state.lock().deleted_agreements.push(agreement_id.to_string());
        Ok(())
    }

    async fn put_agreement_state(&self, agreement_id: &str, state: &AgreementState) -> ExchangeResult<()> {
        self.enter("put_agreement_state")?;
        self.state
            .lock()
            .agreement_states
            .push((agreement_id.to_string(), state.state.clone()));
        Ok(())
    }

    async fn get_object_signing_keys(&self, service: &WorkloadInfo) -> ExchangeResult<BTreeMap<String, String>> {
        self.enter("get_object_signing_keys")?;
        Ok(self.state.lock().signing_keys.get(&service.url).cloned().unwrap_or_default())
    }

    async fn get_service_docker_auths(&self, service: &WorkloadInfo) -> ExchangeResult<Vec<ImageDockerAuth>> {
        self.enter("get_service_docker_auths")?;
        Ok(self.state.lock().docker_auths.get(&service.url).cloned().unwrap_or_default())
    }

    async fn resolve_service_version(
        &self,
        url: &str,
        org: &str,
        range: &VersionRange,
        arch: &str,
    ) -> ExchangeResult<Option<ExchangeService>> {
        self.enter("resolve_service_version")?;
        let candidates: Vec<ExchangeService> = self
            .state
            .lock()
            .catalog
            .iter()
            .filter(|s| s.url == url && s.org == org && (arch.is_empty() || s.arch == arch))
            .cloned()
            .collect();
        Ok(highest_in_range(candidates, range))
    }

    async fn unregister_service(&self, url: &str, org: &str) -> ExchangeResult<()> {
        self.enter("unregister_service")?;
        self.state.lock().unregistered.push((url.to_string(), org.to_string()));
        Ok(())
    }

    async fn register_service(&self, service: &RegisteredService) -> ExchangeResult<()> {
        self.enter("register_service")?;
        self.state.lock().registered.push(service.clone());
        Ok(())
    }

    async fn get_services_config_state(&self) -> ExchangeResult<Vec<ServiceConfigState>> {
        self.enter("get_services_config_state")?;
        Ok(self.state.lock().config_states.clone())
    }

    async fn get_agbot(&self, agbot_id: &str) -> ExchangeResult<Option<AgbotInfo>> {
        self.enter("get_agbot")?;
        let known = self.state.lock().agbots.contains(agbot_id);
        Ok(known.then(|| AgbotInfo {
            public_key: String::new(),
            msg_end_point: String::new(),
        }))
    }

    async fn send_agbot_message(&self, agbot_id: &str, message: &serde_json::Value) -> ExchangeResult<()> {
        self.enter("send_agbot_message")?;
        self.state.lock().sent.push((agbot_id.to_string(), message.clone()));
        Ok(())
    }

    async fn put_device_status(&self, status: &DeviceStatus) -> ExchangeResult<()> {
        self.enter("put_device_status")?;
        self.state.lock().statuses.push(status.clone());
        Ok(())
    }
}
