//! Proposal pipeline shared by every protocol handler.
//!
//! ```text
//! proposal
//!   │ agreement id already known?            → ignore (handled)
//!   │ terms demarshal                        → error (not handled)
//!   │ self-consistent, device registered,
//!   │ node type and pattern match            → error (handled)
//!   │ same policy name already in agreement? → ignore (handled, no record)
//!   ▼
//! decide → reply to the agbot → persist on accept
//! ```

use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn, Span};

use anax_common::persistence::eventlog::{
    EC_ERROR_IN_PROPOSAL, EC_ERROR_PROCESSING_PROPOSAL, EC_IGNORE_PROPOSAL, EC_RECEIVED_PROPOSAL,
    EC_REJECT_PROPOSAL,
};
use anax_common::persistence::{
    AgreementFilter, EstablishedAgreement, EventSource, ExchangeDevice, NewAgreement, Severity,
};
use anax_common::{AgentDb, DbError, DbResult};

use crate::exchange::{retry_transient, ExchangeApi, RetryPolicy};
use crate::policy::{BlockchainSpec, Policy, Proposal};
use crate::protocol::{MessageEnvelope, ProtocolMessage};

/// Result of the checks that run before a decision is made.
#[derive(Debug)]
pub enum Screening {
    Proceed { terms: Policy, device: ExchangeDevice },
    /// Stop here; the flag is the value `handle_proposal` returns.
    Done(bool),
}

/// Protocol specific inputs to an accepted agreement.
#[derive(Debug, Clone, Default)]
pub struct AcceptContext {
    pub blockchain: Option<BlockchainSpec>,
    pub config_nonce: String,
}

#[derive(Debug)]
pub struct BaseProducerHandler {
    name: String,
    span: Span,
    db: AgentDb,
    exchange: Arc<dyn ExchangeApi>,
    retry: RetryPolicy,
    arch: String,
}

impl BaseProducerHandler {
    pub fn new(name: &str, db: AgentDb, exchange: Arc<dyn ExchangeApi>, retry: RetryPolicy, arch: &str) -> Self {
        Self {
            name: name.to_string(),
            span: info_span!("producer", protocol = name),
            db,
            exchange,
            retry,
            arch: arch.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn db(&self) -> &AgentDb {
        &self.db
    }

    pub fn exchange(&self) -> &Arc<dyn ExchangeApi> {
        &self.exchange
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    fn log(&self, severity: Severity, code: &str, msg: String) {
        self.db.log_event(severity, EventSource::Agreement, code, msg);
    }

    // ════════════════════════════════════════════════════════════════════════
    // SCREENING
    // ════════════════════════════════════════════════════════════════════════

    pub async fn screen_proposal(&self, proposal: &Proposal) -> Screening {
        let ag_id = proposal.agreement_id.as_str();

        match self.db.find_agreement(ag_id) {
            Ok(Some(existing)) if !existing.archived => {
                debug!("agreement {} already exists, ignoring proposal", ag_id);
                self.log(
                    Severity::Info,
                    EC_IGNORE_PROPOSAL,
                    format!("ignoring proposal for existing agreement {}", ag_id),
                );
                return Screening::Done(true);
            }
            Ok(_) => {}
            Err(e) => {
                error!("unable to look up agreement {}: {}", ag_id, e);
                return Screening::Done(false);
            }
        }

        let terms = match proposal.terms() {
            Ok(t) => t,
            Err(e) => {
                error!("unable to demarshal terms of proposal {}: {}", ag_id, e);
                self.log(
                    Severity::Error,
                    EC_ERROR_IN_PROPOSAL,
                    format!("error in proposal {}: {}", ag_id, e),
                );
                return Screening::Done(false);
            }
        };

        self.log(
            Severity::Info,
            EC_RECEIVED_PROPOSAL,
            format!("received proposal {} for policy {}", ag_id, terms.header.name),
        );

        let processing_error = |reason: String| {
            error!("proposal {}: {}", ag_id, reason);
            self.log(
                Severity::Error,
                EC_ERROR_PROCESSING_PROPOSAL,
                format!("error processing proposal {}: {}", ag_id, reason),
            );
            Screening::Done(true)
        };

        if let Err(e) = terms.is_self_consistent() {
            return processing_error(e.to_string());
        }

        let device = match self.db.find_device() {
            Ok(Some(d)) => d,
            Ok(None) => return processing_error("node is not registered".to_string()),
            Err(e) => return processing_error(format!("unable to read node registration: {}", e)),
        };

        if !terms.node_type.is_empty() && !device.node_type.is_empty() && terms.node_type != device.node_type {
            return processing_error(format!(
                "proposal is for node type {}, this node is {}",
                terms.node_type, device.node_type
            ));
        }

        if terms.pattern_id != device.pattern {
            return processing_error(format!(
                "proposal pattern {:?} does not match node pattern {:?}",
                terms.pattern_id, device.pattern
            ));
        }

        match self.find_agreement_with_same_workload(&terms.header.name) {
            Ok(Some(dup)) => {
                warn!(
                    "agreement {} already covers policy {}, ignoring proposal {}",
                    dup.current_agreement_id, terms.header.name, ag_id
                );
                self.log(
                    Severity::Warning,
                    EC_IGNORE_PROPOSAL,
                    format!(
                        "ignoring proposal {}, agreement {} already covers policy {}",
                        ag_id, dup.current_agreement_id, terms.header.name
                    ),
                );
                return Screening::Done(true);
            }
            Ok(None) => {}
            Err(e) => {
                error!("unable to scan agreements for policy {}: {}", terms.header.name, e);
                return Screening::Done(false);
            }
        }

        Screening::Proceed { terms, device }
    }

    /// An active agreement of this protocol whose stored terms carry the
    /// policy `name`.
    pub fn find_agreement_with_same_workload(&self, name: &str) -> DbResult<Option<EstablishedAgreement>> {
        let active = self.db.find_established_agreements(
            &self.name,
            &[AgreementFilter::NotTerminated, AgreementFilter::Unarchived],
        )?;
        for ag in active {
            let terms = match Proposal::demarshal(&ag.proposal).and_then(|p| p.terms()) {
                Ok(t) => t,
                Err(e) => {
                    warn!("unable to read stored proposal of {}: {}", ag.current_agreement_id, e);
                    continue;
                }
            };
            if terms.header.name == name {
                return Ok(Some(ag));
            }
        }
        Ok(None)
    }

    /// Rejection reason the base checks find in `terms`, if any.
    pub fn check_terms(&self, terms: &Policy) -> Option<String> {
        let workload = terms.top_workload()?;
        if !self.arch.is_empty() && workload.arch != self.arch {
            return Some(format!("workload arch {} does not run on {}", workload.arch, self.arch));
        }
        None
    }

    // ════════════════════════════════════════════════════════════════════════
    // DECISION
    // ════════════════════════════════════════════════════════════════════════

    /// Reply to the agbot and, on accept, persist the agreement. A rejection
    /// reason in `rejection` declines the proposal.
    pub async fn decide(
        &self,
        proposal: &Proposal,
        envelope: &MessageEnvelope,
        terms: &Policy,
        device: &ExchangeDevice,
        ctx: AcceptContext,
        rejection: Option<String>,
    ) -> bool {
        let ag_id = proposal.agreement_id.as_str();

        if let Some(reason) = rejection {
            info!("rejecting proposal {}: {}", ag_id, reason);
            self.log(
                Severity::Info,
                EC_REJECT_PROPOSAL,
                format!("rejected proposal {}: {}", ag_id, reason),
            );
            if let Err(e) = self.send_reply(proposal, envelope, device, false).await {
                warn!("unable to send rejection of {} to {}: {}", ag_id, envelope.agbot_id, e);
            }
            return true;
        }

        let deployment = match terms.deployment() {
            Ok(d) => d,
            Err(e) => {
                self.log(
                    Severity::Error,
                    EC_ERROR_PROCESSING_PROPOSAL,
                    format!("error processing proposal {}: {}", ag_id, e),
                );
                return true;
            }
        };
        let running_workload = terms.top_workload().map(|w| w.info()).unwrap_or_default();
        let chain = ctx.blockchain.unwrap_or_default();

        let new = NewAgreement {
            name: terms.header.name.clone(),
            agreement_id: ag_id.to_string(),
            consumer_id: proposal.consumer_id.clone(),
            agreement_protocol: self.name.clone(),
            protocol_version: proposal.version,
            proposal: proposal.marshal(),
            deployment,
            running_workload,
            config_nonce: ctx.config_nonce,
            blockchain_type: chain.chain_type,
            blockchain_name: chain.name,
            blockchain_org: chain.org,
        };

        match self.db.save_new_agreement(new) {
            Ok(_) => {}
            Err(DbError::AlreadyExists(_)) => {
                debug!("agreement {} persisted concurrently", ag_id);
                return true;
            }
            Err(e) => {
                error!("unable to persist agreement {}: {}", ag_id, e);
                return false;
            }
        }

        if let Err(e) = self.send_reply(proposal, envelope, device, true).await {
            error!("unable to reply to {} for {}: {}", envelope.agbot_id, ag_id, e);
            if let Err(e) = self.db.delete_agreement(ag_id) {
                error!("unable to remove unreplied agreement {}: {}", ag_id, e);
            }
            return false;
        }

        info!("accepted proposal {} from {}", ag_id, proposal.consumer_id);
        true
    }

    async fn send_reply(
        &self,
        proposal: &Proposal,
        envelope: &MessageEnvelope,
        device: &ExchangeDevice,
        decision: bool,
    ) -> Result<(), crate::exchange::ExchangeError> {
        let reply = ProtocolMessage::Reply {
            agreement_id: proposal.agreement_id.clone(),
            protocol: self.name.clone(),
            decision,
            device_id: device.full_id(),
        }
        .to_value();
        let target = if envelope.agbot_id.is_empty() {
            proposal.consumer_id.as_str()
        } else {
            envelope.agbot_id.as_str()
        };
        retry_transient(&self.retry, "proposal reply", || self.exchange.send_agbot_message(target, &reply)).await
    }

    /// Send a protocol message to the agreement's consumer.
    pub async fn send_to_consumer(&self, agreement: &EstablishedAgreement, msg: &ProtocolMessage) -> bool {
        let body = msg.to_value();
        match retry_transient(&self.retry, msg.kind(), || {
            self.exchange.send_agbot_message(&agreement.consumer_id, &body)
        })
        .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "unable to send {} for {} to {}: {}",
                    msg.kind(),
                    agreement.current_agreement_id,
                    agreement.consumer_id,
                    e
                );
                false
            }
        }
    }
}
