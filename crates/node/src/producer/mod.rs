//! # Producer Protocol Handlers
//!
//! One handler per agreement protocol the node speaks. Each handler decides
//! on proposals, persists accepted agreements, maps termination reasons to
//! its own numeric codes and, for blockchain anchored protocols, tracks
//! chain client state and verifies agreements on chain.
//!
//! ## Handlers
//!
//! | Protocol | Handler | Termination | Verification |
//! |----------|---------|-------------|--------------|
//! | `Basic` | [`BasicProtocolHandler`] | cancel message to the agbot | verify message round trip |
//! | `Citizen Scientist` | [`CitizenScientistHandler`] | end the device contract | `get_agreement_id` on chain |
//!
//! Both compose a [`BaseProducerHandler`] that runs the shared proposal
//! pipeline.
//!
//! ## Safety
//!
//! - No `panic!`, `unwrap()`, `expect()`.

mod base;
mod basic;
mod citizen;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::Span;

use anax_chain::{ContractError, ContractFactory};
use anax_common::events::ChainId;
use anax_common::persistence::EstablishedAgreement;
use anax_common::{AgentDb, DbError, MessageBus};

use crate::exchange::{ExchangeApi, ExchangeError, RetryPolicy};
use crate::policy::{PolicyError, Proposal};
use crate::protocol::{MessageEnvelope, ProtocolMessage};

pub use base::{AcceptContext, BaseProducerHandler, Screening};
pub use basic::BasicProtocolHandler;
pub use citizen::CitizenScientistHandler;

pub const BASIC_PROTOCOL: &str = "Basic";
pub const CITIZEN_SCIENTIST: &str = "Citizen Scientist";

/// Code returned for a reason the protocol has no code for.
pub const UNKNOWN_REASON_CODE: u64 = 999;

pub const UNKNOWN_CODE_DESCRIPTION: &str = "unknown reason code, device might be downlevel";

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("unable to demarshal blockchain event {raw}: {reason}")]
    Event { raw: String, reason: String },

    #[error("blockchain client {0} is not available")]
    ChainUnavailable(String),
}

// ════════════════════════════════════════════════════════════════════════════
// TERMINATION REASONS
// ════════════════════════════════════════════════════════════════════════════

/// Protocol independent reasons an agreement ends. Each protocol maps these
/// to its own codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TermReason {
    PolicyChanged,
    ConsumerCancelled,
    ContainerFailure,
    TorrentFailure,
    UserRequested,
    NotFinalized,
    NoReplyAck,
    NotExecuted,
    MicroserviceFailure,
    WorkloadImageLoadFailure,
    MicroserviceImageLoadFailure,
    MicroserviceImageFetchFailure,
    MicroserviceUpgradeRequired,
    MicroserviceDowngradeRequired,
    ImageDataError,
    ImageFetchFailure,
    ImageFetchAuthorizationFailure,
    ImageSignatureVerificationFailure,
    NodeShutdown,
    ServiceSuspended,
    NodeUserInputChanged,
    NodePatternChanged,
}

impl TermReason {
    pub const ALL: [TermReason; 22] = [
        TermReason::PolicyChanged,
        TermReason::ConsumerCancelled,
        TermReason::ContainerFailure,
        TermReason::TorrentFailure,
        TermReason::UserRequested,
        TermReason::NotFinalized,
        TermReason::NoReplyAck,
        TermReason::NotExecuted,
        TermReason::MicroserviceFailure,
        TermReason::WorkloadImageLoadFailure,
        TermReason::MicroserviceImageLoadFailure,
        TermReason::MicroserviceImageFetchFailure,
        TermReason::MicroserviceUpgradeRequired,
        TermReason::MicroserviceDowngradeRequired,
        TermReason::ImageDataError,
        TermReason::ImageFetchFailure,
        TermReason::ImageFetchAuthorizationFailure,
        TermReason::ImageSignatureVerificationFailure,
        TermReason::NodeShutdown,
        TermReason::ServiceSuspended,
        TermReason::NodeUserInputChanged,
        TermReason::NodePatternChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TermReason::PolicyChanged => "PolicyChanged",
            TermReason::ConsumerCancelled => "ConsumerCancelled",
            TermReason::ContainerFailure => "ContainerFailure",
            TermReason::TorrentFailure => "TorrentFailure",
            TermReason::UserRequested => "UserRequested",
            TermReason::NotFinalized => "NotFinalized",
            TermReason::NoReplyAck => "NoReplyAck",
            TermReason::NotExecuted => "NotExecuted",
            TermReason::MicroserviceFailure => "MicroserviceFailure",
            TermReason::WorkloadImageLoadFailure => "WorkloadImageLoadFailure",
            TermReason::MicroserviceImageLoadFailure => "MicroserviceImageLoadFailure",
            TermReason::MicroserviceImageFetchFailure => "MicroserviceImageFetchFailure",
            TermReason::MicroserviceUpgradeRequired => "MicroserviceUpgradeRequired",
            TermReason::MicroserviceDowngradeRequired => "MicroserviceDowngradeRequired",
            TermReason::ImageDataError => "ImageDataError",
            TermReason::ImageFetchFailure => "ImageFetchFailure",
            TermReason::ImageFetchAuthorizationFailure => "ImageFetchAuthorizationFailure",
            TermReason::ImageSignatureVerificationFailure => "ImageSignatureVerificationFailure",
            TermReason::NodeShutdown => "NodeShutdown",
            TermReason::ServiceSuspended => "ServiceSuspended",
            TermReason::NodeUserInputChanged => "NodeUserInputChanged",
            TermReason::NodePatternChanged => "NodePatternChanged",
        }
    }
}

impl std::fmt::Display for TermReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TermReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TermReason::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown termination reason {}", s))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// HANDLER TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// A chain event a handler understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// The consumer ended the agreement on chain.
    ConsumerTermination { agreement_id: String, reason: u64 },
    AgreementCreated { agreement_id: String },
}

/// What a handler did with a protocol message outside the core set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionOutcome {
    NotHandled,
    Handled,
    /// Handled, and the counterparty no longer knows the agreement.
    Cancel(String),
}

#[async_trait]
pub trait ProtocolHandler: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Span every log line of this handler is recorded under.
    fn span(&self) -> &Span;

    /// Evaluate a proposal. Returns whether the message was consumed; an
    /// unhandled proposal is left for a later retry by the sender.
    async fn handle_proposal(&self, proposal: &Proposal, raw: &str, envelope: &MessageEnvelope) -> bool;

    fn termination_code(&self, reason: TermReason) -> u64;

    /// Code for a reason given by name; unknown names map to [`UNKNOWN_REASON_CODE`].
    fn termination_code_for(&self, reason: &str) -> u64 {
        reason
            .parse::<TermReason>()
            .map(|r| self.termination_code(r))
            .unwrap_or(UNKNOWN_REASON_CODE)
    }

    fn termination_reason(&self, code: u64) -> String;

    /// Protocol side of ending an agreement. Errors are logged.
    async fn terminate_agreement(&self, agreement: &EstablishedAgreement, code: u64);

    fn is_blockchain_client_available(&self, chain_type: &str, chain_name: &str) -> bool;

    fn is_blockchain_writable(&self, agreement: &EstablishedAgreement) -> bool;

    fn is_agreement_verifiable(&self, agreement: &EstablishedAgreement) -> bool;

    /// `Ok(false)` means the agreement definitively no longer exists.
    async fn verify_agreement(&self, agreement: &EstablishedAgreement) -> Result<bool, ProducerError>;

    fn accepts_blockchain_event(&self, chain_type: &str, chain_name: &str) -> bool {
        self.is_blockchain_client_available(chain_type, chain_name)
    }

    fn handle_blockchain_event(&self, raw_event: &str) -> Result<Option<ChainEvent>, ProducerError>;

    fn set_blockchain_available(&self, _chain: &ChainId) {}

    fn set_blockchain_not_available(&self, _chain: &ChainId) {}

    fn set_blockchain_writable(&self, _chain: &ChainId) {}

    async fn handle_extension_message(&self, _msg: &ProtocolMessage, _envelope: &MessageEnvelope) -> ExtensionOutcome {
        ExtensionOutcome::NotHandled
    }
}

pub type HandlerMap = BTreeMap<String, Arc<dyn ProtocolHandler>>;

/// Every protocol this node speaks, keyed by protocol name.
pub fn build_handlers(
    db: &AgentDb,
    exchange: &Arc<dyn ExchangeApi>,
    retry: RetryPolicy,
    arch: &str,
    bus: &MessageBus,
    chain: Option<(Arc<dyn ContractFactory>, String)>,
) -> HandlerMap {
    let (factory, account) = match chain {
        Some((f, a)) => (Some(f), a),
        None => (None, String::new()),
    };
    let basic: Arc<dyn ProtocolHandler> = Arc::new(BasicProtocolHandler::new(
        db.clone(),
        Arc::clone(exchange),
        retry,
        arch,
    ));
    let citizen: Arc<dyn ProtocolHandler> = Arc::new(CitizenScientistHandler::new(
        db.clone(),
        Arc::clone(exchange),
        retry,
        arch,
        bus.clone(),
        factory,
        &account,
    ));
    let mut handlers = HandlerMap::new();
    handlers.insert(BASIC_PROTOCOL.to_string(), basic);
    handlers.insert(CITIZEN_SCIENTIST.to_string(), citizen);
    handlers
}
