//! Governance commands and the bus translation that produces them.

use anax_common::events::{ChainId, ContainerEvent, LaunchFailure, Message, WorkloadEvent};
use anax_common::persistence::STATUS_WORKLOAD_DESTROYED;

use crate::producer::{TermReason, CITIZEN_SCIENTIST};
use crate::protocol::MessageEnvelope;

#[derive(Debug, Clone, PartialEq)]
pub enum GovernanceCommand {
    /// The agreement's workload containers are running.
    StartGovernExecution { agreement_id: String, protocol: String },
    /// End an agreement for a protocol independent reason.
    CleanupExecution {
        agreement_id: String,
        protocol: String,
        reason: TermReason,
    },
    ExchangeMessage {
        envelope: MessageEnvelope,
        protocol_message: String,
    },
    BlockchainEvent {
        chain_type: String,
        chain_name: String,
        raw_event: String,
    },
    /// One of the two teardown markers of a terminated agreement.
    CleanupStatus {
        agreement_id: String,
        protocol: String,
        status: u32,
    },
    BlockchainInitialized(ChainId),
    BlockchainStopping(ChainId),
    BlockchainWritable(ChainId),
    /// Protocol side termination parked until the chain is writable.
    AsyncTermination {
        agreement_id: String,
        protocol: String,
        reason: u64,
    },
    /// Second attempt at removing an agreement from the exchange.
    DeleteExchangeAgreement { agreement_id: String },
    UpdateMicroservice { instance_key: String, event: ContainerEvent },
    UpgradeMicroservice { definition_id: String },
    ReportDeviceStatus,
    NodeShutdown { remove_node: bool },
    StartAgreementLessServices,
    NodeHeartbeatRestored,
    NodePolicyChanged,
    NodeUserInputChanged { services: Vec<(String, String)> },
    NodePatternChanged { pattern: String },
    ServiceSuspended { services: Vec<(String, String)> },
}

impl GovernanceCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            GovernanceCommand::StartGovernExecution { .. } => "start_govern_execution",
            GovernanceCommand::CleanupExecution { .. } => "cleanup_execution",
            GovernanceCommand::ExchangeMessage { .. } => "exchange_message",
            GovernanceCommand::BlockchainEvent { .. } => "blockchain_event",
            GovernanceCommand::CleanupStatus { .. } => "cleanup_status",
            GovernanceCommand::BlockchainInitialized(_) => "blockchain_initialized",
            GovernanceCommand::BlockchainStopping(_) => "blockchain_stopping",
            GovernanceCommand::BlockchainWritable(_) => "blockchain_writable",
            GovernanceCommand::AsyncTermination { .. } => "async_termination",
            GovernanceCommand::DeleteExchangeAgreement { .. } => "delete_exchange_agreement",
            GovernanceCommand::UpdateMicroservice { .. } => "update_microservice",
            GovernanceCommand::UpgradeMicroservice { .. } => "upgrade_microservice",
            GovernanceCommand::ReportDeviceStatus => "report_device_status",
            GovernanceCommand::NodeShutdown { .. } => "node_shutdown",
            GovernanceCommand::StartAgreementLessServices => "start_agreement_less_services",
            GovernanceCommand::NodeHeartbeatRestored => "node_heartbeat_restored",
            GovernanceCommand::NodePolicyChanged => "node_policy_changed",
            GovernanceCommand::NodeUserInputChanged { .. } => "node_user_input_changed",
            GovernanceCommand::NodePatternChanged { .. } => "node_pattern_changed",
            GovernanceCommand::ServiceSuspended { .. } => "service_suspended",
        }
    }
}

/// Termination reason for a workload that failed to launch.
pub fn launch_failure_reason(failure: LaunchFailure) -> TermReason {
    match failure {
        LaunchFailure::Container => TermReason::ContainerFailure,
        LaunchFailure::ImageLoad => TermReason::WorkloadImageLoadFailure,
        LaunchFailure::ImageData => TermReason::ImageDataError,
        LaunchFailure::ImageFetch => TermReason::ImageFetchFailure,
        LaunchFailure::ImageFetchAuth => TermReason::ImageFetchAuthorizationFailure,
        LaunchFailure::ImageSignature => TermReason::ImageSignatureVerificationFailure,
    }
}

/// Bus messages the governance worker reacts to.
pub fn translate(msg: &Message) -> Vec<GovernanceCommand> {
    let cmd = match msg {
        Message::ExchangeDeviceMessage {
            message_id,
            agbot_id,
            agbot_pubkey,
            protocol_message,
        } => GovernanceCommand::ExchangeMessage {
            envelope: MessageEnvelope {
                message_id: *message_id,
                agbot_id: agbot_id.clone(),
                agbot_pubkey: agbot_pubkey.clone(),
            },
            protocol_message: protocol_message.clone(),
        },
        Message::Workload {
            event,
            agreement_protocol,
            agreement_id,
            ..
        } => match event {
            WorkloadEvent::ExecutionBegun => GovernanceCommand::StartGovernExecution {
                agreement_id: agreement_id.clone(),
                protocol: agreement_protocol.clone(),
            },
            WorkloadEvent::ExecutionFailed(failure) => GovernanceCommand::CleanupExecution {
                agreement_id: agreement_id.clone(),
                protocol: agreement_protocol.clone(),
                reason: launch_failure_reason(*failure),
            },
            WorkloadEvent::Destroyed => GovernanceCommand::CleanupStatus {
                agreement_id: agreement_id.clone(),
                protocol: agreement_protocol.clone(),
                status: STATUS_WORKLOAD_DESTROYED,
            },
        },
        Message::Container { event, instance_key } => GovernanceCommand::UpdateMicroservice {
            instance_key: instance_key.clone(),
            event: event.clone(),
        },
        Message::AgreementCancellationRequested {
            agreement_protocol,
            agreement_id,
        } => GovernanceCommand::CleanupExecution {
            agreement_id: agreement_id.clone(),
            protocol: agreement_protocol.clone(),
            reason: TermReason::UserRequested,
        },
        // the consumer ended the agreement on the device contract
        Message::ContractEnded { agreement_id, .. } if !agreement_id.is_empty() => {
            GovernanceCommand::CleanupExecution {
                agreement_id: agreement_id.clone(),
                protocol: CITIZEN_SCIENTIST.to_string(),
                reason: TermReason::ConsumerCancelled,
            }
        }
        Message::NodeConfigComplete => GovernanceCommand::StartAgreementLessServices,
        Message::NodePolicyChanged => GovernanceCommand::NodePolicyChanged,
        Message::NodeUserInputChanged { services } => GovernanceCommand::NodeUserInputChanged {
            services: services.clone(),
        },
        Message::NodePatternChanged { pattern } => GovernanceCommand::NodePatternChanged {
            pattern: pattern.clone(),
        },
        Message::NodeHeartbeatRestored => GovernanceCommand::NodeHeartbeatRestored,
        Message::NodeShutdown { remove_node } => GovernanceCommand::NodeShutdown {
            remove_node: *remove_node,
        },
        Message::BlockchainEvent {
            chain_type,
            chain_name,
            raw_event,
        } => GovernanceCommand::BlockchainEvent {
            chain_type: chain_type.clone(),
            chain_name: chain_name.clone(),
            raw_event: raw_event.clone(),
        },
        Message::BlockchainClientInitialized(chain) => GovernanceCommand::BlockchainInitialized(chain.clone()),
        Message::BlockchainClientStopping(chain) => GovernanceCommand::BlockchainStopping(chain.clone()),
        Message::BlockchainWritable(chain) => GovernanceCommand::BlockchainWritable(chain.clone()),
        Message::ServiceSuspended { services } => GovernanceCommand::ServiceSuspended {
            services: services.clone(),
        },
        _ => return vec![],
    };
    vec![cmd]
}
