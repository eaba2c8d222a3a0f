//! Protocol messages, chain events and node changes that act on agreements.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, error, info, warn};

use anax_common::events::{AgreementLaunchContext, Message};
use anax_common::persistence::eventlog::{
    EC_AGREEMENT_REACHED, EC_CANCEL_AGREEMENT_POLICY_CHANGED, EC_CANCEL_AGREEMENT_SERVICE_SUSPENDED,
    EC_ERROR_AGREEMENT_VERIFICATION, EC_ERROR_START_DEPENDENT_SERVICE, EC_NODE_HEARTBEAT_RESTORED,
    EC_NODE_PATTERN_CHANGED, EC_RECEIVED_CANCEL_AGREEMENT_MESSAGE, EC_RECEIVED_REPLYACK_MESSAGE,
};
use anax_common::persistence::{
    AgreementFilter, EstablishedAgreement, EventSource, InstanceFilter, ServiceInstancePathElement, Severity,
};
use anax_common::DbResult;

use super::{GovernanceError, GovernanceWorker, ShutdownMode};
use crate::exchange::retry_transient;
use crate::policy::{Policy, Proposal, VersionRange};
use crate::producer::{ChainEvent, ExtensionOutcome, ProtocolHandler, TermReason, BASIC_PROTOCOL};
use crate::protocol::{MessageEnvelope, ProtocolMessage};

const POLICY_FILE_SUFFIX: &str = ".policy";

/// The message came from the agreement's consumer, or carries no sender.
fn from_consumer(agreement: &EstablishedAgreement, envelope: &MessageEnvelope) -> bool {
    envelope.agbot_id.is_empty() || envelope.agbot_id == agreement.consumer_id
}

impl GovernanceWorker {
    /// An unarchived agreement that has not been terminated.
    fn active_agreement(&self, agreement_id: &str) -> Option<EstablishedAgreement> {
        match self.db.find_agreement(agreement_id) {
            Ok(Some(ag)) if !ag.archived && !ag.is_terminated() => Some(ag),
            Ok(_) => {
                debug!("agreement {} is not active", agreement_id);
                None
            }
            Err(e) => {
                error!("unable to read agreement {}: {}", agreement_id, e);
                None
            }
        }
    }

    fn active_agreements(&self) -> DbResult<Vec<EstablishedAgreement>> {
        self.db
            .find_established_agreements_all_protocols(&[AgreementFilter::Unarchived, AgreementFilter::NotTerminated])
    }

    // ════════════════════════════════════════════════════════════════════════
    // PROTOCOL MESSAGES
    // ════════════════════════════════════════════════════════════════════════

    pub(super) async fn handle_exchange_message(&self, envelope: &MessageEnvelope, raw: &str) {
        let msg = match ProtocolMessage::demarshal(raw) {
            Ok(m) => m,
            Err(e) => {
                warn!("ignoring undecodable message {} from {}: {}", envelope.message_id, envelope.agbot_id, e);
                return;
            }
        };
        let Some(handler) = self.handler(msg.protocol()) else {
            warn!("ignoring {} for unknown protocol {}", msg.kind(), msg.protocol());
            return;
        };

        match msg {
            ProtocolMessage::Proposal(proposal) => {
                if self.is_shutting_down() {
                    debug!("node is shutting down, ignoring proposal {}", proposal.agreement_id);
                    return;
                }
                if !handler.handle_proposal(&proposal, raw, envelope).await {
                    debug!("proposal {} left unhandled", proposal.agreement_id);
                }
            }
            ProtocolMessage::ReplyAck {
                agreement_id,
                still_valid,
                ..
            } => self.handle_reply_ack(handler.as_ref(), &agreement_id, still_valid, envelope).await,
            ProtocolMessage::DataReceived { agreement_id, protocol } => {
                self.handle_data_received(&agreement_id, &protocol, envelope).await
            }
            ProtocolMessage::Metering {
                agreement_id, amount, ..
            } => info!("metering notice for {}: {}", agreement_id, amount),
            ProtocolMessage::Cancel {
                agreement_id, reason, ..
            } => self.handle_cancel_message(handler.as_ref(), &agreement_id, reason, envelope).await,
            other => match handler.handle_extension_message(&other, envelope).await {
                ExtensionOutcome::Handled => {}
                ExtensionOutcome::NotHandled => {
                    debug!("ignoring {} for {}", other.kind(), other.agreement_id())
                }
                ExtensionOutcome::Cancel(agreement_id) => {
                    info!("consumer no longer knows agreement {}", agreement_id);
                    self.cancel_for_reason(&agreement_id, Some(handler.name()), TermReason::NotExecuted)
                        .await;
                }
            },
        }
    }

    async fn handle_reply_ack(
        &self,
        handler: &dyn ProtocolHandler,
        agreement_id: &str,
        still_valid: bool,
        envelope: &MessageEnvelope,
    ) {
        let Some(ag) = self.active_agreement(agreement_id) else {
            return;
        };
        if !from_consumer(&ag, envelope) {
            warn!(
                "ignoring reply ack for {} from {}, consumer is {}",
                agreement_id, envelope.agbot_id, ag.consumer_id
            );
            return;
        }
        self.log(
            Severity::Info,
            EventSource::Agreement,
            EC_RECEIVED_REPLYACK_MESSAGE,
            format!("received reply ack for agreement {}, still valid: {}", agreement_id, still_valid),
        );

        if !still_valid {
            self.cancel_for_reason(agreement_id, Some(handler.name()), TermReason::NoReplyAck)
                .await;
            return;
        }
        if ag.is_accepted() {
            debug!("duplicate reply ack for {}", agreement_id);
            return;
        }

        let ag = match self
            .db
            .agreement_state_accepted(agreement_id, &ag.proposal, &ag.counter_party_address, &ag.proposal_sig)
        {
            Ok(ag) => ag,
            Err(e) => {
                error!("unable to record acceptance of {}: {}", agreement_id, e);
                return;
            }
        };
        self.record_agreement_state(&ag, "Agreement Accepted").await;

        // the basic protocol has no separate finalization step
        if handler.name() == BASIC_PROTOCOL {
            match self.db.agreement_state_finalized(agreement_id) {
                Ok(ag) => self.launch_agreement(&ag).await,
                Err(e) => error!("unable to finalize {}: {}", agreement_id, e),
            }
        }
    }

    async fn handle_data_received(&self, agreement_id: &str, protocol: &str, envelope: &MessageEnvelope) {
        let Some(ag) = self.active_agreement(agreement_id) else {
            return;
        };
        if !from_consumer(&ag, envelope) {
            warn!("ignoring data notice for {} from {}", agreement_id, envelope.agbot_id);
            return;
        }
        if let Err(e) = self.db.agreement_state_data_received(agreement_id) {
            error!("unable to record data received for {}: {}", agreement_id, e);
            return;
        }
        let ack = ProtocolMessage::DataReceivedAck {
            agreement_id: agreement_id.to_string(),
            protocol: protocol.to_string(),
        }
        .to_value();
        let retry = self.retry_policy();
        if let Err(e) = retry_transient(&retry, "data received ack", || {
            self.exchange.send_agbot_message(&ag.consumer_id, &ack)
        })
        .await
        {
            warn!("unable to acknowledge data for {}: {}", agreement_id, e);
        }
    }

    async fn handle_cancel_message(
        &self,
        handler: &dyn ProtocolHandler,
        agreement_id: &str,
        reason: u64,
        envelope: &MessageEnvelope,
    ) {
        let Some(ag) = self.active_agreement(agreement_id) else {
            return;
        };
        if !from_consumer(&ag, envelope) {
            warn!(
                "ignoring cancel for {} from {}, consumer is {}",
                agreement_id, envelope.agbot_id, ag.consumer_id
            );
            return;
        }
        let description = handler.termination_reason(reason);
        self.log(
            Severity::Info,
            EventSource::Agreement,
            EC_RECEIVED_CANCEL_AGREEMENT_MESSAGE,
            format!("received cancel for agreement {}: {}", agreement_id, description),
        );
        let code = handler.termination_code(TermReason::ConsumerCancelled);
        self.cancel_agreement(agreement_id, handler.name(), code, &description)
            .await;
    }

    // ════════════════════════════════════════════════════════════════════════
    // LAUNCH
    // ════════════════════════════════════════════════════════════════════════

    /// Start the agreement's dependent services and hand the workload to
    /// the container subsystem. A dependency that cannot start cancels the
    /// agreement.
    pub(super) async fn launch_agreement(&self, agreement: &EstablishedAgreement) {
        let ag_id = agreement.current_agreement_id.as_str();
        let services = match self.start_agreement_services(agreement).await {
            Ok(s) => s,
            Err(e) => {
                error!("unable to start services of {}: {}", ag_id, e);
                self.log(
                    Severity::Error,
                    EventSource::Agreement,
                    EC_ERROR_START_DEPENDENT_SERVICE,
                    format!("error starting dependent services of agreement {}: {}", ag_id, e),
                );
                self.cancel_for_reason(ag_id, Some(agreement.agreement_protocol.as_str()), TermReason::MicroserviceFailure)
                    .await;
                return;
            }
        };

        let w = &agreement.running_workload;
        let environment = match self.service_environment(&w.url, &w.org, Some(ag_id), &[]) {
            Ok(env) => env,
            Err(e) => {
                warn!("unable to assemble environment of {}: {}", ag_id, e);
                BTreeMap::new()
            }
        };
        let docker_auths = self.docker_auths(w).await;

        self.runtime.publish(Message::AgreementReached(AgreementLaunchContext {
            agreement_id: ag_id.to_string(),
            agreement_protocol: agreement.agreement_protocol.clone(),
            deployment: agreement.current_deployment.clone(),
            environment,
            docker_auths,
            microservices: services,
        }));
        info!("agreement {} reached, launching {}", ag_id, w.url);
        self.log(
            Severity::Info,
            EventSource::Agreement,
            EC_AGREEMENT_REACHED,
            format!("agreement reached for service {}", w.url),
        );
    }

    /// Start every service the agreement's workload requires. Returns the
    /// started services.
    async fn start_agreement_services(
        &self,
        agreement: &EstablishedAgreement,
    ) -> Result<Vec<ServiceInstancePathElement>, GovernanceError> {
        let w = &agreement.running_workload;
        let retry = self.retry_policy();
        let arch = if w.arch.is_empty() { self.config.arch.as_str() } else { w.arch.as_str() };
        let range = VersionRange::exact(&w.version);
        let top = retry_transient(&retry, "service resolution", || {
            self.exchange.resolve_service_version(&w.url, &w.org, &range, arch)
        })
        .await?;
        let Some(top) = top else {
            debug!("{} {} not in the exchange, assuming no dependencies", w.url, w.version);
            return Ok(Vec::new());
        };

        let root = vec![ServiceInstancePathElement::new(&top.url, &top.org, &top.version)];
        let mut started = Vec::new();
        for dep in &top.required_services {
            let def = self.resolve_definition(dep).await?;
            self.start_microservice(&def, Some(agreement.current_agreement_id.as_str()), root.clone(), None)
                .await?;
            started.push(ServiceInstancePathElement::new(&def.spec_ref, &def.org, &def.version));
        }
        Ok(started)
    }

    pub(super) async fn start_govern_execution(&self, agreement_id: &str, protocol: &str) {
        match self.db.agreement_state_execution_started(agreement_id) {
            Ok(ag) => {
                info!("{} agreement {} is executing", protocol, agreement_id);
                self.record_agreement_state(&ag, "Execution Started").await;
            }
            Err(e) => error!("unable to record execution start of {}: {}", agreement_id, e),
        }
    }

    // ════════════════════════════════════════════════════════════════════════
    // CHAIN EVENTS
    // ════════════════════════════════════════════════════════════════════════

    pub(super) async fn handle_blockchain_event(&self, chain_type: &str, chain_name: &str, raw: &str) {
        let handlers: Vec<_> = self.handlers.values().cloned().collect();
        for handler in handlers {
            if !handler.accepts_blockchain_event(chain_type, chain_name) {
                continue;
            }
            match handler.handle_blockchain_event(raw) {
                Ok(Some(ChainEvent::ConsumerTermination { agreement_id, reason })) => {
                    let Some(ag) = self.active_agreement(&agreement_id) else {
                        continue;
                    };
                    if ag.agreement_protocol != handler.name() {
                        continue;
                    }
                    self.cancel_agreement(&agreement_id, handler.name(), reason, &handler.termination_reason(reason))
                        .await;
                }
                Ok(Some(ChainEvent::AgreementCreated { agreement_id })) => {
                    self.finalize_agreement(handler.as_ref(), &agreement_id).await
                }
                Ok(None) => {}
                Err(e) => warn!("{} ignored chain event: {}", handler.name(), e),
            }
        }
    }

    async fn finalize_agreement(&self, handler: &dyn ProtocolHandler, agreement_id: &str) {
        let Some(ag) = self.active_agreement(agreement_id) else {
            return;
        };
        if ag.agreement_protocol != handler.name() || ag.finalized_time != 0 {
            return;
        }
        if !ag.is_accepted() {
            if let Err(e) = self
                .db
                .agreement_state_accepted(agreement_id, &ag.proposal, &ag.counter_party_address, &ag.proposal_sig)
            {
                error!("unable to record acceptance of {}: {}", agreement_id, e);
                return;
            }
        }
        let ag = match self.db.agreement_state_finalized(agreement_id) {
            Ok(ag) => ag,
            Err(e) => {
                error!("unable to finalize {}: {}", agreement_id, e);
                return;
            }
        };
        info!("agreement {} finalized on chain", agreement_id);
        self.sync_agreement_history(&ag);
        self.record_agreement_state(&ag, "Finalized Agreement").await;
        self.launch_agreement(&ag).await;
    }

    // ════════════════════════════════════════════════════════════════════════
    // NODE CHANGES
    // ════════════════════════════════════════════════════════════════════════

    pub(super) async fn handle_heartbeat_restored(&self) {
        self.log(
            Severity::Info,
            EventSource::Node,
            EC_NODE_HEARTBEAT_RESTORED,
            "node heartbeat restored".to_string(),
        );
        let agreements = match self.active_agreements() {
            Ok(a) => a,
            Err(e) => {
                error!("unable to read agreements: {}", e);
                return;
            }
        };
        for ag in agreements {
            let ag_id = ag.current_agreement_id.clone();
            let Some(handler) = self.handler(&ag.agreement_protocol) else {
                continue;
            };
            if !handler.is_agreement_verifiable(&ag) {
                continue;
            }
            match handler.verify_agreement(&ag).await {
                Ok(true) => debug!("agreement {} verification in order", ag_id),
                Ok(false) => {
                    info!("agreement {} no longer exists on the consumer side", ag_id);
                    self.cancel_for_reason(&ag_id, Some(handler.name()), TermReason::NotExecuted)
                        .await;
                }
                Err(e) => {
                    warn!("unable to verify agreement {}: {}", ag_id, e);
                    self.log(
                        Severity::Error,
                        EventSource::Agreement,
                        EC_ERROR_AGREEMENT_VERIFICATION,
                        format!("error verifying agreement {}: {}", ag_id, e),
                    );
                    if let Err(e) = self.db.agreement_ver_attempt_failed(&ag_id) {
                        error!("unable to record failed verification of {}: {}", ag_id, e);
                    }
                }
            }
        }
    }

    /// Cancel agreements whose producer policy no longer matches a policy
    /// file of the same name.
    pub(super) async fn handle_node_policy_changed(&self) {
        let current = read_policy_files(&self.config.policy_path);
        let agreements = match self.active_agreements() {
            Ok(a) => a,
            Err(e) => {
                error!("unable to read agreements: {}", e);
                return;
            }
        };
        for ag in agreements {
            let agreed = match Proposal::demarshal(&ag.proposal) {
                Ok(p) if !p.producer_policy.is_empty() => match Policy::demarshal(&p.producer_policy) {
                    Ok(policy) => policy,
                    Err(e) => {
                        warn!("unable to read producer policy of {}: {}", ag.current_agreement_id, e);
                        continue;
                    }
                },
                Ok(_) => continue,
                Err(e) => {
                    warn!("unable to read proposal of {}: {}", ag.current_agreement_id, e);
                    continue;
                }
            };
            let unchanged = current.iter().any(|p| *p == agreed);
            if unchanged {
                continue;
            }
            info!("node policy {} changed, cancelling {}", agreed.header.name, ag.current_agreement_id);
            self.log(
                Severity::Info,
                EventSource::Agreement,
                EC_CANCEL_AGREEMENT_POLICY_CHANGED,
                format!(
                    "node policy {} changed, cancelling agreement {}",
                    agreed.header.name, ag.current_agreement_id
                ),
            );
            self.cancel_for_reason(
                &ag.current_agreement_id,
                Some(ag.agreement_protocol.as_str()),
                TermReason::PolicyChanged,
            )
            .await;
        }
    }

    pub(super) async fn handle_user_input_changed(&self, services: &[(String, String)]) {
        self.end_service_users(services, TermReason::NodeUserInputChanged).await;
    }

    pub(super) async fn handle_service_suspended(&self, services: &[(String, String)]) {
        for (url, org) in services {
            self.log(
                Severity::Info,
                EventSource::Agreement,
                EC_CANCEL_AGREEMENT_SERVICE_SUSPENDED,
                format!("service {}/{} suspended, cancelling its agreements", org, url),
            );
        }
        self.end_service_users(services, TermReason::ServiceSuspended).await;
    }

    /// Cancel every agreement that runs or depends on one of `services`, and
    /// clean up agreement-less instances of them.
    async fn end_service_users(&self, services: &[(String, String)], reason: TermReason) {
        if services.is_empty() {
            return;
        }
        let uses = |url: &str, org: &str| services.iter().any(|(u, o)| u == url && o == org);

        let agreements = match self.active_agreements() {
            Ok(a) => a,
            Err(e) => {
                error!("unable to read agreements: {}", e);
                return;
            }
        };
        for ag in agreements {
            let w = &ag.running_workload;
            let affected = uses(&w.url, &w.org)
                || match self.db.find_microservice_instances(&[
                    InstanceFilter::Unarchived,
                    InstanceFilter::Agreement(ag.current_agreement_id.clone()),
                ]) {
                    Ok(insts) => insts.iter().any(|i| uses(&i.spec_ref, &i.org)),
                    Err(e) => {
                        warn!("unable to read services of {}: {}", ag.current_agreement_id, e);
                        false
                    }
                };
            if affected {
                self.cancel_for_reason(&ag.current_agreement_id, Some(ag.agreement_protocol.as_str()), reason)
                    .await;
            }
        }

        let standalone = match self
            .db
            .find_microservice_instances(&[InstanceFilter::Unarchived, InstanceFilter::NotCleanedUp])
        {
            Ok(insts) => insts,
            Err(e) => {
                error!("unable to read service instances: {}", e);
                return;
            }
        };
        let mut restart = false;
        for inst in standalone
            .into_iter()
            .filter(|i| i.agreement_less && uses(&i.spec_ref, &i.org))
        {
            if let Err(e) = self
                .cleanup_microservice(&inst.key(), super::MS_DELETED_BY_AGREEMENT_ENDED, None)
                .await
            {
                error!("unable to clean up {}: {}", inst.key(), e);
            }
            restart = true;
        }
        if restart && reason == TermReason::NodeUserInputChanged {
            if let Err(e) = self
                .runtime
                .try_submit(super::GovernanceCommand::StartAgreementLessServices)
            {
                warn!("unable to queue agreement-less service restart: {}", e);
            }
        }
    }

    pub(super) fn handle_pattern_changed(&self, pattern: &str) {
        match self.db.find_device() {
            Ok(Some(device)) if device.pattern == pattern => {
                debug!("node already uses pattern {:?}", pattern);
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!("ignoring pattern change, node is not registered");
                return;
            }
            Err(e) => {
                error!("unable to read node registration: {}", e);
                return;
            }
        }
        if let Err(e) = self.db.save_saved_pattern(pattern) {
            error!("unable to save new pattern {:?}: {}", pattern, e);
            return;
        }
        self.log(
            Severity::Info,
            EventSource::Node,
            EC_NODE_PATTERN_CHANGED,
            format!("node pattern changing to {:?}", pattern),
        );
        self.start_shutdown(ShutdownMode::PatternChange);
    }
}

/// Every readable `*.policy` file in `dir`. Unreadable files are skipped.
fn read_policy_files(dir: &Path) -> Vec<Policy> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            debug!("no policy files in {}: {}", dir.display(), e);
            return Vec::new();
        }
    };
    let mut policies = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.to_string_lossy().ends_with(POLICY_FILE_SUFFIX) {
            continue;
        }
        match std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|raw| Policy::demarshal(&raw).map_err(|e| e.to_string()))
        {
            Ok(p) => policies.push(p),
            Err(e) => warn!("skipping policy file {}: {}", path.display(), e),
        }
    }
    policies
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_files_are_read_by_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let policy = Policy {
            header: crate::policy::PolicyHeader {
                name: "gps".to_string(),
                version: "2.0".to_string(),
            },
            ..Default::default()
        };
        std::fs::write(dir.path().join("gps.policy"), serde_json::to_string(&policy).unwrap()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a policy").unwrap();
        std::fs::write(dir.path().join("broken.policy"), "{").unwrap();

        let found = read_policy_files(dir.path());
        assert_eq!(found, vec![policy]);
        assert!(read_policy_files(&dir.path().join("missing")).is_empty());
    }

    #[test]
    fn test_envelope_without_sender_is_trusted() {
        let ag = EstablishedAgreement {
            consumer_id: "acme/agbot1".to_string(),
            ..Default::default()
        };
        let mut env = MessageEnvelope::default();
        assert!(from_consumer(&ag, &env));
        env.agbot_id = "acme/agbot2".to_string();
        assert!(!from_consumer(&ag, &env));
        env.agbot_id = "acme/agbot1".to_string();
        assert!(from_consumer(&ag, &env));
    }
}
