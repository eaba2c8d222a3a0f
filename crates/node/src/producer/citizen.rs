//! # Citizen Scientist Protocol
//!
//! Blockchain anchored agreement protocol. No cancel message is ever sent:
//! the chain holds the agreement state, so termination ends the device
//! contract and verification reads the agreement id back from the chain.
//!
//! ## Chain client state
//!
//! ```text
//! BlockchainClientInitialized ──▶ ready
//! BlockchainWritable          ──▶ ready + writable
//! BlockchainClientStopping    ──▶ forgotten
//! ```
//!
//! Proposals are only accepted on a chain that is ready; chain events are
//! only accepted from one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn, Instrument, Span};

use anax_chain::registry::DEVICE_CONTRACT;
use anax_chain::ContractFactory;
use anax_common::events::{ChainId, ContractEndCause, Message};
use anax_common::persistence::EstablishedAgreement;
use anax_common::{AgentDb, MessageBus};

use super::base::{AcceptContext, BaseProducerHandler, Screening};
use super::{ChainEvent, ProducerError, ProtocolHandler, TermReason, CITIZEN_SCIENTIST};
use super::{UNKNOWN_CODE_DESCRIPTION, UNKNOWN_REASON_CODE};
use crate::exchange::{ExchangeApi, RetryPolicy};
use crate::policy::{BlockchainSpec, Policy, Proposal};
use crate::protocol::MessageEnvelope;

/// Proposals at any other version are discarded.
pub const PROTOCOL_CURRENT_VERSION: u32 = 2;

const CODES: [(TermReason, u64, &str); 9] = [
    (TermReason::NotFinalized, 100, "agreement never finalized"),
    (TermReason::PolicyChanged, 101, "node policy changed"),
    (TermReason::TorrentFailure, 102, "torrent failed"),
    (TermReason::ContainerFailure, 103, "service terminated"),
    (TermReason::NotExecuted, 104, "service start timeout"),
    (TermReason::UserRequested, 105, "user requested"),
    (TermReason::ConsumerCancelled, 106, "agbot requested"),
    (TermReason::NoReplyAck, 107, "agreement protocol incomplete, no reply ack received"),
    (TermReason::MicroserviceFailure, 108, "dependent service failed"),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ChainState {
    ready: bool,
    writable: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawChainEvent {
    ConsumerTermination {
        agreement_id: String,
        #[serde(default)]
        reason: Option<u64>,
    },
    AgreementCreated {
        agreement_id: String,
    },
    #[serde(other)]
    Other,
}

pub struct CitizenScientistHandler {
    base: BaseProducerHandler,
    bus: MessageBus,
    factory: Option<Arc<dyn ContractFactory>>,
    account_id: String,
    chains: Mutex<HashMap<(String, String), ChainState>>,
}

impl std::fmt::Debug for CitizenScientistHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CitizenScientistHandler")
            .field("base", &self.base)
            .field("account_id", &self.account_id)
            .field("chains", &self.chains.lock().len())
            .finish()
    }
}

impl CitizenScientistHandler {
    /// `factory` is `None` when the node has no blockchain configured; the
    /// handler then never sees a ready chain and rejects every proposal.
    pub fn new(
        db: AgentDb,
        exchange: Arc<dyn ExchangeApi>,
        retry: RetryPolicy,
        arch: &str,
        bus: MessageBus,
        factory: Option<Arc<dyn ContractFactory>>,
        account_id: &str,
    ) -> Self {
        Self {
            base: BaseProducerHandler::new(CITIZEN_SCIENTIST, db, exchange, retry, arch),
            bus,
            factory,
            account_id: account_id.to_string(),
            chains: Mutex::new(HashMap::new()),
        }
    }

    fn state(&self, chain_type: &str, chain_name: &str) -> ChainState {
        self.chains
            .lock()
            .get(&(chain_type.to_string(), chain_name.to_string()))
            .copied()
            .unwrap_or_default()
    }

    /// The chain the terms ask for, if this protocol lists one.
    fn requested_chain(terms: &Policy) -> Option<BlockchainSpec> {
        terms
            .agreement_protocols
            .iter()
            .find(|p| p.name == CITIZEN_SCIENTIST)
            .and_then(|p| p.blockchains.first().cloned())
    }

    fn end_contract_for(&self, agreement: &EstablishedAgreement, code: u64) {
        let ag_id = &agreement.current_agreement_id;
        let contract = match self.base.db().find_contract_by_agreement(ag_id) {
            Ok(c) => c,
            Err(e) => {
                warn!("unable to read contracts to end {}: {}", ag_id, e);
                return;
            }
        };
        match contract {
            Some(c) => {
                info!("ending contract {} for agreement {} with reason {}", c.contract_address, ag_id, code);
                self.bus.publish(Message::EndContractRequested {
                    cause: ContractEndCause::Terminated,
                    contract_address: c.contract_address,
                    agreement_id: ag_id.clone(),
                });
            }
            None => debug!("no device contract holds agreement {}", ag_id),
        }
    }

    fn config_nonce_for(&self, agreement_id: &str) -> String {
        match self.base.db().find_established_contracts(true) {
            Ok(contracts) => contracts
                .into_iter()
                .find(|c| c.current_agreement_id == agreement_id)
                .map(|c| c.configure_nonce)
                .unwrap_or_default(),
            Err(e) => {
                warn!("unable to read contracts for {}: {}", agreement_id, e);
                String::new()
            }
        }
    }
}

#[async_trait]
impl ProtocolHandler for CitizenScientistHandler {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn span(&self) -> &Span {
        self.base.span()
    }

    async fn handle_proposal(&self, proposal: &Proposal, _raw: &str, envelope: &MessageEnvelope) -> bool {
        async {
            if proposal.version != PROTOCOL_CURRENT_VERSION {
                debug!(
                    "discarding proposal {} at protocol version {}",
                    proposal.agreement_id, proposal.version
                );
                return true;
            }

            let (terms, device) = match self.base.screen_proposal(proposal).await {
                Screening::Done(handled) => return handled,
                Screening::Proceed { terms, device } => (terms, device),
            };

            let chain = Self::requested_chain(&terms);
            let rejection = match &chain {
                None => Some("terms name no blockchain".to_string()),
                Some(c) if !self.state(&c.chain_type, &c.name).ready => {
                    Some(format!("blockchain {}/{} is not ready", c.chain_type, c.name))
                }
                Some(_) => self.base.check_terms(&terms),
            };
            let ctx = AcceptContext {
                blockchain: chain,
                config_nonce: self.config_nonce_for(&proposal.agreement_id),
            };
            self.base
                .decide(proposal, envelope, &terms, &device, ctx, rejection)
                .await
        }
        .instrument(self.base.span().clone())
        .await
    }

    fn termination_code(&self, reason: TermReason) -> u64 {
        CODES
            .iter()
            .find(|(r, _, _)| *r == reason)
            .map(|(_, c, _)| *c)
            .unwrap_or(UNKNOWN_REASON_CODE)
    }

    fn termination_reason(&self, code: u64) -> String {
        CODES
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(_, _, d)| *d)
            .unwrap_or(UNKNOWN_CODE_DESCRIPTION)
            .to_string()
    }

    async fn terminate_agreement(&self, agreement: &EstablishedAgreement, code: u64) {
        self.base.span().in_scope(|| self.end_contract_for(agreement, code));
    }

    fn is_blockchain_client_available(&self, chain_type: &str, chain_name: &str) -> bool {
        self.state(chain_type, chain_name).ready
    }

    fn is_blockchain_writable(&self, agreement: &EstablishedAgreement) -> bool {
        self.state(&agreement.blockchain_type, &agreement.blockchain_name).writable
    }

    fn is_agreement_verifiable(&self, agreement: &EstablishedAgreement) -> bool {
        agreement.protocol_version < PROTOCOL_CURRENT_VERSION || !agreement.counter_party_address.is_empty()
    }

    async fn verify_agreement(&self, agreement: &EstablishedAgreement) -> Result<bool, ProducerError> {
        let chain = format!("{}/{}", agreement.blockchain_type, agreement.blockchain_name);
        let factory = match &self.factory {
            Some(f) if self.is_blockchain_client_available(&agreement.blockchain_type, &agreement.blockchain_name) => f,
            _ => return Err(ProducerError::ChainUnavailable(chain)),
        };
        let contract = factory
            .at(DEVICE_CONTRACT, &self.account_id, &agreement.counter_party_address)
            .await?;
        let on_chain = contract
            .invoke_method("get_agreement_id", vec![])
            .await?
            .expect_str("get_agreement_id")?;
        Ok(on_chain == agreement.current_agreement_id)
    }

    fn handle_blockchain_event(&self, raw_event: &str) -> Result<Option<ChainEvent>, ProducerError> {
        let event: RawChainEvent = serde_json::from_str(raw_event).map_err(|e| ProducerError::Event {
            raw: raw_event.to_string(),
            reason: e.to_string(),
        })?;
        match event {
            RawChainEvent::ConsumerTermination { agreement_id, reason } => {
                let reason = reason.ok_or_else(|| ProducerError::Event {
                    raw: raw_event.to_string(),
                    reason: "termination carries no reason code".to_string(),
                })?;
                Ok(Some(ChainEvent::ConsumerTermination { agreement_id, reason }))
            }
            RawChainEvent::AgreementCreated { agreement_id } => Ok(Some(ChainEvent::AgreementCreated { agreement_id })),
            RawChainEvent::Other => {
                debug!("ignoring chain event {}", raw_event);
                Ok(None)
            }
        }
    }

    fn set_blockchain_available(&self, chain: &ChainId) {
        let key = (chain.chain_type.clone(), chain.chain_name.clone());
        self.chains.lock().entry(key).or_default().ready = true;
    }

    fn set_blockchain_not_available(&self, chain: &ChainId) {
        self.chains
            .lock()
            .remove(&(chain.chain_type.clone(), chain.chain_name.clone()));
    }

    fn set_blockchain_writable(&self, chain: &ChainId) {
        let key = (chain.chain_type.clone(), chain.chain_name.clone());
        let mut chains = self.chains.lock();
        let state = chains.entry(key).or_default();
        state.ready = true;
        state.writable = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_exchange::MockExchange;
    use std::time::Duration;

    fn handler() -> (tempfile::TempDir, CitizenScientistHandler) {
        let dir = tempfile::tempdir().unwrap();
        let db = AgentDb::open(dir.path()).unwrap();
        let h = CitizenScientistHandler::new(
            db,
            Arc::new(MockExchange::new()),
            RetryPolicy::bounded(Duration::from_secs(1), 1),
            "amd64",
            MessageBus::default(),
            None,
            "0xowner",
        );
        (dir, h)
    }

    fn chain() -> ChainId {
        ChainId {
            chain_type: "ethereum".to_string(),
            chain_name: "bluehorizon".to_string(),
            chain_org: String::new(),
        }
    }

    #[test]
    fn test_chain_state_follows_client_messages() {
        let (_dir, h) = handler();
        assert!(!h.is_blockchain_client_available("ethereum", "bluehorizon"));
        h.set_blockchain_available(&chain());
        assert!(h.is_blockchain_client_available("ethereum", "bluehorizon"));
        h.set_blockchain_writable(&chain());
        let ag = EstablishedAgreement {
            blockchain_type: "ethereum".to_string(),
            blockchain_name: "bluehorizon".to_string(),
            ..Default::default()
        };
        assert!(h.is_blockchain_writable(&ag));
        h.set_blockchain_not_available(&chain());
        assert!(!h.is_blockchain_client_available("ethereum", "bluehorizon"));
        assert!(!h.is_blockchain_writable(&ag));
    }

    #[test]
    fn test_raw_events() {
        let (_dir, h) = handler();
        let term = h
            .handle_blockchain_event(r#"{"type":"consumer_termination","agreement_id":"ag1","reason":106}"#)
            .unwrap();
        assert_eq!(
            term,
            Some(ChainEvent::ConsumerTermination {
                agreement_id: "ag1".to_string(),
                reason: 106
            })
        );
        let created = h
            .handle_blockchain_event(r#"{"type":"agreement_created","agreement_id":"ag2"}"#)
            .unwrap();
        assert_eq!(created, Some(ChainEvent::AgreementCreated { agreement_id: "ag2".to_string() }));
        assert_eq!(h.handle_blockchain_event(r#"{"type":"bank_funded"}"#).unwrap(), None);
        assert!(h.handle_blockchain_event("not json").is_err());
        assert!(h
            .handle_blockchain_event(r#"{"type":"consumer_termination","agreement_id":"ag1"}"#)
            .is_err());
    }

    #[test]
    fn test_only_core_reasons_have_codes() {
        let (_dir, h) = handler();
        assert_eq!(h.termination_code(TermReason::NotFinalized), 100);
        assert_eq!(h.termination_code(TermReason::MicroserviceFailure), 108);
        assert_eq!(h.termination_code(TermReason::ServiceSuspended), UNKNOWN_REASON_CODE);
        assert_eq!(h.termination_code_for("NoSuchReason"), UNKNOWN_REASON_CODE);
        assert_eq!(h.termination_reason(555), UNKNOWN_CODE_DESCRIPTION);
    }

    #[test]
    fn test_verifiable_needs_counterparty_at_current_version() {
        let (_dir, h) = handler();
        let mut ag = EstablishedAgreement {
            protocol_version: 2,
            ..Default::default()
        };
        assert!(!h.is_agreement_verifiable(&ag));
        ag.counter_party_address = "0xabc".to_string();
        assert!(h.is_agreement_verifiable(&ag));
        ag.counter_party_address.clear();
        ag.protocol_version = 1;
        assert!(h.is_agreement_verifiable(&ag));
    }
}
