//! # Internal Message Bus
//!
//! Subsystems never call each other directly. Every cross-subsystem signal is
//! a [`Message`] published on the shared [`MessageBus`]; each worker
//! subscribes and translates the messages it cares about into its own
//! commands.
//!
//! ```text
//!  governance ──publish──▶ MessageBus ──broadcast──▶ container / blockchain / ...
//!       ▲                                                   │
//!       └──────────── translator(Message) -> Command ◀──────┘
//! ```

use std::collections::BTreeMap;

use tokio::sync::broadcast;
use tracing::trace;

use crate::persistence::{DeploymentConfig, ImageDockerAuth, ServiceInstancePathElement};

/// Default broadcast buffer; slow subscribers beyond this lag and lose messages.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Why a container set failed to come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchFailure {
    Container,
    ImageLoad,
    ImageData,
    ImageFetch,
    ImageFetchAuth,
    ImageSignature,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkloadEvent {
    ExecutionBegun,
    ExecutionFailed(LaunchFailure),
    Destroyed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContainerEvent {
    Started,
    Failed(LaunchFailure),
    Destroyed,
}

/// Everything the container subsystem needs to start an agreement's workload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgreementLaunchContext {
    pub agreement_id: String,
    pub agreement_protocol: String,
    pub deployment: BTreeMap<String, DeploymentConfig>,
    pub environment: BTreeMap<String, String>,
    pub docker_auths: Vec<ImageDockerAuth>,
    /// Dependent services the workload may reach on the network.
    pub microservices: Vec<ServiceInstancePathElement>,
}

/// Everything the container subsystem needs to start a dependent service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerLaunchContext {
    pub instance_key: String,
    pub agreement_ids: Vec<String>,
    pub deployment: BTreeMap<String, DeploymentConfig>,
    pub environment: BTreeMap<String, String>,
    pub docker_auths: Vec<ImageDockerAuth>,
    pub dependency_path: Vec<ServiceInstancePathElement>,
}

/// Why an on-chain contract is being ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractEndCause {
    Terminated,
    Error,
}

/// A chain client identity: (type, name, org).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ChainId {
    pub chain_type: String,
    pub chain_name: String,
    pub chain_org: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    // ------------------------------------------------------------------------
    // consumed by governance
    // ------------------------------------------------------------------------
    /// A protocol message from an agreement bot, relayed from the exchange.
    ExchangeDeviceMessage {
        message_id: u64,
        agbot_id: String,
        agbot_pubkey: String,
        protocol_message: String,
    },
    Workload {
        event: WorkloadEvent,
        agreement_protocol: String,
        agreement_id: String,
        deployment: BTreeMap<String, DeploymentConfig>,
    },
    Container {
        event: ContainerEvent,
        instance_key: String,
    },
    /// Operator asked for an agreement to be cancelled.
    AgreementCancellationRequested {
        agreement_protocol: String,
        agreement_id: String,
    },
    NodeConfigComplete,
    NodePolicyChanged,
    NodeUserInputChanged {
        services: Vec<(String, String)>,
    },
    NodePatternChanged {
        pattern: String,
    },
    NodeHeartbeatRestored,
    NodeShutdown {
        remove_node: bool,
    },
    BlockchainEvent {
        chain_type: String,
        chain_name: String,
        raw_event: String,
    },
    BlockchainClientInitialized(ChainId),
    BlockchainClientStopping(ChainId),
    BlockchainWritable(ChainId),
    ServiceSuspended {
        services: Vec<(String, String)>,
    },

    // ------------------------------------------------------------------------
    // produced by the blockchain worker
    // ------------------------------------------------------------------------
    ContractRegistered {
        name: String,
        contract_address: String,
    },
    ContractAccepted {
        contract_address: String,
        agreement_id: String,
    },
    ContractEnded {
        contract_address: String,
        agreement_id: String,
    },
    /// Ask the blockchain worker to end the agreement on a device contract.
    EndContractRequested {
        cause: ContractEndCause,
        contract_address: String,
        agreement_id: String,
    },

    // ------------------------------------------------------------------------
    // produced by governance
    // ------------------------------------------------------------------------
    AgreementReached(AgreementLaunchContext),
    /// Liveness nudge for an agreement's workload containers.
    ContainerMaintain {
        agreement_protocol: String,
        agreement_id: String,
        deployment: BTreeMap<String, DeploymentConfig>,
    },
    /// Liveness nudge for a dependent service's containers.
    GovernanceMaintain {
        instance_key: String,
    },
    LoadContainer(ContainerLaunchContext),
    MicroserviceCancellation {
        instance_key: String,
    },
    GovernanceWorkloadCancellation {
        agreement_protocol: String,
        agreement_id: String,
        deployment: BTreeMap<String, DeploymentConfig>,
    },
    /// Tear down resources left over from superseded agreements.
    GovernanceCancellation {
        cause: u64,
        agreement_protocol: String,
        agreement_id: String,
        previous_agreement_ids: Vec<String>,
    },
    DropExcessNetworks,
    AllBlockchainShutdown,
    ExchangeChangesShutdown,
    NodeShutdownComplete {
        error: Option<String>,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ExchangeDeviceMessage { .. } => "exchange_device_message",
            Message::Workload { .. } => "workload",
            Message::Container { .. } => "container",
            Message::AgreementCancellationRequested { .. } => "agreement_cancellation_requested",
            Message::NodeConfigComplete => "node_config_complete",
            Message::NodePolicyChanged => "node_policy_changed",
            Message::NodeUserInputChanged { .. } => "node_user_input_changed",
            Message::NodePatternChanged { .. } => "node_pattern_changed",
            Message::NodeHeartbeatRestored => "node_heartbeat_restored",
            Message::NodeShutdown { .. } => "node_shutdown",
            Message::BlockchainEvent { .. } => "blockchain_event",
            Message::BlockchainClientInitialized(_) => "blockchain_client_initialized",
            Message::BlockchainClientStopping(_) => "blockchain_client_stopping",
            Message::BlockchainWritable(_) => "blockchain_writable",
            Message::ServiceSuspended { .. } => "service_suspended",
            Message::ContractRegistered { .. } => "contract_registered",
            Message::ContractAccepted { .. } => "contract_accepted",
            Message::ContractEnded { .. } => "contract_ended",
            Message::EndContractRequested { .. } => "end_contract_requested",
            Message::AgreementReached(_) => "agreement_reached",
            Message::ContainerMaintain { .. } => "container_maintain",
            Message::GovernanceMaintain { .. } => "governance_maintain",
            Message::LoadContainer(_) => "load_container",
            Message::MicroserviceCancellation { .. } => "microservice_cancellation",
            Message::GovernanceWorkloadCancellation { .. } => "governance_workload_cancellation",
            Message::GovernanceCancellation { .. } => "governance_cancellation",
            Message::DropExcessNetworks => "drop_excess_networks",
            Message::AllBlockchainShutdown => "all_blockchain_shutdown",
            Message::ExchangeChangesShutdown => "exchange_changes_shutdown",
            Message::NodeShutdownComplete { .. } => "node_shutdown_complete",
        }
    }
}

/// Broadcast fan-out shared by every worker. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<Message>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber. A bus with no subscribers drops
    /// the message.
    pub fn publish(&self, msg: Message) {
        let kind = msg.kind();
        match self.tx.send(msg) {
            Ok(n) => trace!("published {} to {} subscribers", kind, n),
            Err(_) => trace!("published {} with no subscribers", kind),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
