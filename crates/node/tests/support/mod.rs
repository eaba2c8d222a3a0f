//! Shared fixtures for the governance integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast::{self, error::TryRecvError};

use anax_common::persistence::{
    ConfigState, EstablishedAgreement, EventLogRecord, ExchangeDevice, MicroserviceDefinition, NewAgreement,
    SharingMode, WorkloadInfo,
};
use anax_common::{AgentDb, Message, MessageBus};
use anax_node::policy::{Policy, PolicyHeader, Proposal, Workload, WorkloadPriority};
use anax_node::producer::BASIC_PROTOCOL;
use anax_node::{build_handlers, AgentConfig, ExchangeApi, GovernanceWorker, MockExchange, RetryPolicy};

pub const ORG: &str = "acme";
pub const NODE_ID: &str = "node1";
pub const AGBOT: &str = "acme/agbot1";
pub const ARCH: &str = "amd64";

const SIGNING_SEED: [u8; 32] = [7u8; 32];

/// Drains a bus subscription without waiting.
pub struct BusRecorder {
    rx: broadcast::Receiver<Message>,
    seen: Vec<Message>,
}

impl BusRecorder {
    pub fn new(bus: &MessageBus) -> Self {
        Self {
            rx: bus.subscribe(),
            seen: Vec::new(),
        }
    }

    /// Everything published so far, oldest first.
    pub fn drain(&mut self) -> &[Message] {
        loop {
            match self.rx.try_recv() {
                Ok(m) => self.seen.push(m),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        &self.seen
    }

    pub fn count(&mut self, kind: &str) -> usize {
        self.drain().iter().filter(|m| m.kind() == kind).count()
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub db: AgentDb,
    pub bus: MessageBus,
    pub exchange: Arc<MockExchange>,
    pub worker: Arc<GovernanceWorker>,
    pub recorder: BusRecorder,
}

pub fn test_config(root: &Path) -> AgentConfig {
    AgentConfig {
        db_path: root.join("db"),
        exchange_url: "http://exchange.test/v1".to_string(),
        device_id: NODE_ID.to_string(),
        device_token: "secret".to_string(),
        arch: ARCH.to_string(),
        policy_path: root.join("policy.d"),
        public_key_path: root.join("keys"),
        user_public_key_path: root.join("keys/user"),
        message_key_path: root.join("keys/messaging"),
        exchange_retry_interval_s: 0,
        exchange_retry_count: 1,
        trust_cert_updates_from_org: false,
        trust_docker_auth_from_org: false,
        ..Default::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut AgentConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        tweak(&mut config);
        std::fs::create_dir_all(&config.public_key_path).unwrap();
        write_trusted_key(&config.public_key_path);

        let db = AgentDb::open(&config.db_path).unwrap();
        let bus = MessageBus::default();
        let exchange = Arc::new(MockExchange::new());
        let api: Arc<dyn ExchangeApi> = exchange.clone();
        let retry = RetryPolicy::bounded(config.exchange_retry_interval(), config.exchange_retry_count);
        let handlers = build_handlers(&db, &api, retry, ARCH, &bus, None);
        let recorder = BusRecorder::new(&bus);
        let worker = GovernanceWorker::new(config, db.clone(), bus.clone(), api, handlers);
        Self {
            dir,
            db,
            bus,
            exchange,
            worker,
            recorder,
        }
    }

    pub fn register_device(&self, pattern: &str) {
        self.db
            .save_device(&ExchangeDevice {
                id: NODE_ID.to_string(),
                org: ORG.to_string(),
                name: NODE_ID.to_string(),
                token: "secret".to_string(),
                pattern: pattern.to_string(),
                node_type: "device".to_string(),
                config_state: ConfigState::Configured,
                last_state_change: 0,
            })
            .unwrap();
    }

    /// Persist an agreement running `url` 1.0.0, as if its proposal had
    /// been accepted on our side.
    pub fn save_agreement(&self, agreement_id: &str, url: &str, priority: WorkloadPriority) -> EstablishedAgreement {
        self.save_agreement_with(agreement_id, url, priority, |_| {})
    }

    /// Like [`Harness::save_agreement`], with a last look at the record
    /// before it is stored.
    pub fn save_agreement_with(
        &self,
        agreement_id: &str,
        url: &str,
        priority: WorkloadPriority,
        tweak: impl FnOnce(&mut NewAgreement),
    ) -> EstablishedAgreement {
        let proposal = proposal(agreement_id, &format!("policy-{}", agreement_id), url, priority);
        let mut record = NewAgreement {
            name: format!("policy-{}", agreement_id),
            agreement_id: agreement_id.to_string(),
            consumer_id: AGBOT.to_string(),
            agreement_protocol: BASIC_PROTOCOL.to_string(),
            protocol_version: 1,
            proposal: proposal.marshal(),
            running_workload: WorkloadInfo::new(url, ORG, "1.0.0", ARCH),
            ..Default::default()
        };
        tweak(&mut record);
        self.db.save_new_agreement(record).unwrap()
    }

    pub fn accept(&self, agreement_id: &str) -> EstablishedAgreement {
        let ag = self.db.find_agreement(agreement_id).unwrap().unwrap();
        self.db
            .agreement_state_accepted(agreement_id, &ag.proposal, "", "")
            .unwrap()
    }

    pub fn agreement(&self, agreement_id: &str) -> EstablishedAgreement {
        self.db.find_agreement(agreement_id).unwrap().unwrap()
    }

    pub fn events(&self, code: &str) -> Vec<EventLogRecord> {
        self.db
            .find_event_logs(None)
            .unwrap()
            .into_iter()
            .filter(|e| e.event_code == code)
            .collect()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// DOCUMENT BUILDERS
// ════════════════════════════════════════════════════════════════════════════

pub fn policy(name: &str, url: &str, priority: WorkloadPriority) -> Policy {
    Policy {
        header: PolicyHeader {
            name: name.to_string(),
            version: "2.0".to_string(),
        },
        workloads: vec![Workload {
            workload_url: url.to_string(),
            org: ORG.to_string(),
            version: "1.0.0".to_string(),
            arch: ARCH.to_string(),
            priority,
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn proposal(agreement_id: &str, name: &str, url: &str, priority: WorkloadPriority) -> Proposal {
    Proposal {
        agreement_id: agreement_id.to_string(),
        protocol: BASIC_PROTOCOL.to_string(),
        version: 1,
        consumer_id: AGBOT.to_string(),
        ts_and_cs: serde_json::to_string(&policy(name, url, priority)).unwrap(),
        producer_policy: String::new(),
    }
}

pub fn deployment(image: &str) -> String {
    serde_json::json!({ "services": { "main": { "image": image } } }).to_string()
}

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&SIGNING_SEED)
}

/// Hex ed25519 signature over `sha256(deployment)` with the test key.
pub fn sign(deployment: &str) -> String {
    let digest = Sha256::digest(deployment.as_bytes());
    hex::encode(signing_key().sign(digest.as_slice()).to_bytes())
}

fn write_trusted_key(dir: &Path) {
    let public = hex::encode(signing_key().verifying_key().to_bytes());
    std::fs::write(dir.join("test.pub"), public).unwrap();
}

/// A local definition of `url` 1.0.0; with `image` it carries a signed
/// deployment.
pub fn definition(id: &str, url: &str, sharable: SharingMode, image: Option<&str>) -> MicroserviceDefinition {
    let deployment = image.map(deployment).unwrap_or_default();
    MicroserviceDefinition {
        id: id.to_string(),
        owner: ORG.to_string(),
        label: url.to_string(),
        spec_ref: url.to_string(),
        org: ORG.to_string(),
        version: "1.0.0".to_string(),
        arch: ARCH.to_string(),
        sharable,
        deployment_signature: if deployment.is_empty() { String::new() } else { sign(&deployment) },
        deployment,
        upgrade_version_range: "[1.0.0,INFINITY)".to_string(),
        ..Default::default()
    }
}
