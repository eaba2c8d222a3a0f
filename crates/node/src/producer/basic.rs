//! Off-chain agreement protocol. Terminations and verifications travel as
//! messages to the agbot through the exchange.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn, Instrument, Span};

use anax_common::persistence::EstablishedAgreement;
use anax_common::AgentDb;

use super::base::{AcceptContext, BaseProducerHandler, Screening};
use super::{ChainEvent, ExtensionOutcome, ProducerError, ProtocolHandler, TermReason, BASIC_PROTOCOL};
use super::{UNKNOWN_CODE_DESCRIPTION, UNKNOWN_REASON_CODE};
use crate::exchange::{ExchangeApi, RetryPolicy};
use crate::policy::Proposal;
use crate::protocol::{MessageEnvelope, ProtocolMessage};

const CODES: [(TermReason, u64, &str); 22] = [
    (TermReason::NotFinalized, 100, "agreement never finalized"),
    (TermReason::PolicyChanged, 101, "node policy changed"),
    (TermReason::TorrentFailure, 102, "torrent failed"),
    (TermReason::ContainerFailure, 103, "service terminated"),
    (TermReason::NotExecuted, 104, "service start timeout"),
    (TermReason::UserRequested, 105, "user requested"),
    (TermReason::ConsumerCancelled, 106, "agbot requested"),
    (TermReason::NoReplyAck, 107, "agreement protocol incomplete, no reply ack received"),
    (TermReason::MicroserviceFailure, 108, "dependent service failed"),
    (TermReason::WorkloadImageLoadFailure, 109, "service image loading failed"),
    (TermReason::MicroserviceImageLoadFailure, 110, "dependent service image loading failed"),
    (TermReason::MicroserviceUpgradeRequired, 111, "required by dependent service upgrade process"),
    (TermReason::ImageDataError, 112, "image data error"),
    (TermReason::ImageFetchFailure, 113, "image fetching failed"),
    (TermReason::ImageFetchAuthorizationFailure, 114, "authorization failed for image fetching"),
    (TermReason::ImageSignatureVerificationFailure, 115, "image signature verification failed"),
    (TermReason::NodeShutdown, 116, "node was unconfigured"),
    (TermReason::MicroserviceImageFetchFailure, 117, "dependent service image fetching failed"),
    (TermReason::MicroserviceDowngradeRequired, 118, "dependent service failed, need to downgrade to lower version"),
    (TermReason::ServiceSuspended, 119, "service suspended"),
    (TermReason::NodeUserInputChanged, 120, "node user input changed"),
    (TermReason::NodePatternChanged, 121, "node pattern changed"),
];

/// Codes an agbot sends when it ends an agreement itself.
const AGBOT_CODES: [(u64, &str); 9] = [
    (201, "agreement bot never received reply to proposal"),
    (202, "agreement bot received negative reply"),
    (203, "agreement bot did not detect data"),
    (204, "agreement bot policy changed"),
    (205, "agreement bot discovered cancellation from producer"),
    (206, "agreement bot user requested"),
    (207, "agreement bot user requested service upgrade"),
    (208, "agreement bot detected node heartbeat stopped"),
    (209, "agreement bot detected agreement missing from node"),
];

#[derive(Debug)]
pub struct BasicProtocolHandler {
    base: BaseProducerHandler,
}

impl BasicProtocolHandler {
    pub fn new(db: AgentDb, exchange: Arc<dyn ExchangeApi>, retry: RetryPolicy, arch: &str) -> Self {
        Self {
            base: BaseProducerHandler::new(BASIC_PROTOCOL, db, exchange, retry, arch),
        }
    }

    async fn answer_verify(&self, agreement_id: &str, envelope: &MessageEnvelope) {
        let exists = match self.base.db().find_agreement(agreement_id) {
            Ok(Some(ag)) => !ag.archived && !ag.is_terminated(),
            Ok(None) => false,
            Err(e) => {
                warn!("unable to look up {} for verification: {}", agreement_id, e);
                return;
            }
        };
        let reply = ProtocolMessage::AgreementVerifyReply {
            agreement_id: agreement_id.to_string(),
            protocol: BASIC_PROTOCOL.to_string(),
            exists,
        }
        .to_value();
        if let Err(e) = self.base.exchange().send_agbot_message(&envelope.agbot_id, &reply).await {
            warn!("unable to answer verification of {} to {}: {}", agreement_id, envelope.agbot_id, e);
        }
    }
}

#[async_trait]
impl ProtocolHandler for BasicProtocolHandler {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn span(&self) -> &Span {
        self.base.span()
    }

    async fn handle_proposal(&self, proposal: &Proposal, _raw: &str, envelope: &MessageEnvelope) -> bool {
        async {
            match self.base.screen_proposal(proposal).await {
                Screening::Done(handled) => handled,
                Screening::Proceed { terms, device } => {
                    let rejection = self.base.check_terms(&terms);
                    self.base
                        .decide(proposal, envelope, &terms, &device, AcceptContext::default(), rejection)
                        .await
                }
            }
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
            .map(|(_, c, d)| (*c, *d))
            .chain(AGBOT_CODES.iter().copied())
            .find(|(c, _)| *c == code)
            .map(|(_, d)| d)
            .unwrap_or(UNKNOWN_CODE_DESCRIPTION)
            .to_string()
    }

    async fn terminate_agreement(&self, agreement: &EstablishedAgreement, code: u64) {
        let ag_id = agreement.current_agreement_id.clone();
        async {
            match self.base.exchange().get_agbot(&agreement.consumer_id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!("agbot {} is gone, not sending cancel for {}", agreement.consumer_id, ag_id);
                    return;
                }
                Err(e) => {
                    warn!("unable to resolve agbot {} for {}: {}", agreement.consumer_id, ag_id, e);
                    return;
                }
            }
            let cancel = ProtocolMessage::Cancel {
                agreement_id: ag_id.clone(),
                protocol: BASIC_PROTOCOL.to_string(),
                reason: code,
            };
            if self.base.send_to_consumer(agreement, &cancel).await {
                info!("sent cancel for {} with reason {}", ag_id, code);
            }
        }
        .instrument(self.base.span().clone())
        .await
    }

    fn is_blockchain_client_available(&self, _chain_type: &str, _chain_name: &str) -> bool {
        true
    }

    fn is_blockchain_writable(&self, _agreement: &EstablishedAgreement) -> bool {
        true
    }

    fn is_agreement_verifiable(&self, _agreement: &EstablishedAgreement) -> bool {
        true
    }

    /// Asks the agbot; the answer arrives later as an `agreement_verify_reply`.
    async fn verify_agreement(&self, agreement: &EstablishedAgreement) -> Result<bool, ProducerError> {
        if self.base.exchange().get_agbot(&agreement.consumer_id).await?.is_none() {
            debug!("agbot {} no longer exists", agreement.consumer_id);
            return Ok(false);
        }
        let verify = ProtocolMessage::AgreementVerify {
            agreement_id: agreement.current_agreement_id.clone(),
            protocol: BASIC_PROTOCOL.to_string(),
        }
        .to_value();
        self.base
            .exchange()
            .send_agbot_message(&agreement.consumer_id, &verify)
            .await?;
        Ok(true)
    }

    fn accepts_blockchain_event(&self, _chain_type: &str, _chain_name: &str) -> bool {
        false
    }

    fn handle_blockchain_event(&self, _raw_event: &str) -> Result<Option<ChainEvent>, ProducerError> {
        Ok(None)
    }

    async fn handle_extension_message(&self, msg: &ProtocolMessage, envelope: &MessageEnvelope) -> ExtensionOutcome {
        match msg {
            ProtocolMessage::AgreementVerify { agreement_id, .. } => {
                self.answer_verify(agreement_id, envelope).await;
                ExtensionOutcome::Handled
            }
            ProtocolMessage::AgreementVerifyReply { agreement_id, exists, .. } => {
                if *exists {
                    if let Err(e) = self.base.db().agreement_ver_attempts_reset(agreement_id) {
                        warn!("unable to reset verification attempts of {}: {}", agreement_id, e);
                    }
                    ExtensionOutcome::Handled
                } else {
                    ExtensionOutcome::Cancel(agreement_id.clone())
                }
            }
            _ => ExtensionOutcome::NotHandled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for (_, c, _) in CODES {
            assert!(seen.insert(c), "duplicate code {}", c);
        }
        for r in TermReason::ALL {
            assert!(CODES.iter().any(|(x, _, _)| *x == r), "{} has no code", r);
        }
    }
}
