//! Agreement cancellation and teardown bookkeeping.
//!
//! ```text
//! cancel_agreement
//!   │ record termination (no-op if already terminated)
//!   │ GovernanceWorkloadCancellation ─▶ container subsystem
//!   │ release dependent services
//!   │ delete the exchange agreement (accepted agreements only)
//!   ▼
//! protocol termination (spawned, or deferred until the chain is writable)
//!   └─▶ CleanupStatus(501) ─┐
//! WorkloadDestroyed ────────┴─▶ CleanupStatus(500) ─▶ archive when both present
//! ```

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use anax_common::events::Message;
use anax_common::persistence::eventlog::{
    EC_AGREEMENT_CANCELED, EC_CANCEL_AGREEMENT, EC_DATABASE_ERROR, EC_ERROR_DELETE_AGREEMENT_IN_EXCHANGE,
};
use anax_common::persistence::{
    EstablishedAgreement, EventSource, Severity, STATUS_AG_PROTOCOL_TERMINATED, STATUS_WORKLOAD_DESTROYED,
};

use super::{GovernanceCommand, GovernanceWorker};
use crate::exchange::{retry_transient, ExchangeResult};
use crate::producer::{ProtocolHandler, TermReason};

impl GovernanceWorker {
    /// End an agreement. Returns whether this call terminated it; calling
    /// again for the same agreement changes nothing and publishes nothing.
    pub async fn cancel_agreement(&self, agreement_id: &str, protocol: &str, reason: u64, description: &str) -> bool {
        let ag = match self.db.agreement_state_terminated(agreement_id, reason, description) {
            Ok(Some((ag, true))) => ag,
            Ok(Some((_, false))) => {
                debug!("agreement {} already terminated", agreement_id);
                return false;
            }
            Ok(None) => {
                warn!("unable to cancel {}: no such agreement", agreement_id);
                return false;
            }
            Err(e) => {
                error!("unable to record termination of {}: {}", agreement_id, e);
                self.log(
                    Severity::Error,
                    EventSource::Database,
                    EC_DATABASE_ERROR,
                    format!("unable to record termination of agreement {}: {}", agreement_id, e),
                );
                return false;
            }
        };

        info!("cancelling agreement {} ({}): {}", agreement_id, reason, description);
        self.log(
            Severity::Info,
            EventSource::Agreement,
            EC_CANCEL_AGREEMENT,
            format!(
                "start terminating agreement {} for {}, reason: {}",
                agreement_id, ag.running_workload.url, description
            ),
        );

        self.runtime.publish(Message::GovernanceWorkloadCancellation {
            agreement_protocol: protocol.to_string(),
            agreement_id: agreement_id.to_string(),
            deployment: ag.current_deployment.clone(),
        });

        self.release_agreement_services(&ag).await;

        if ag.is_accepted() {
            if let Err(e) = self.delete_exchange_agreement(agreement_id).await {
                error!("unable to delete agreement {} from the exchange: {}", agreement_id, e);
                self.log(
                    Severity::Error,
                    EventSource::Exchange,
                    EC_ERROR_DELETE_AGREEMENT_IN_EXCHANGE,
                    format!("error deleting agreement {} in exchange: {}", agreement_id, e),
                );
                if !self.is_shutting_down() {
                    self.runtime.defer(GovernanceCommand::DeleteExchangeAgreement {
                        agreement_id: agreement_id.to_string(),
                    });
                }
            }
        }

        match self.handler(protocol) {
            Some(h) if h.is_blockchain_writable(&ag) => self.spawn_termination(Some(h), ag, reason),
            Some(_) => {
                info!("chain of {} is not writable, deferring termination", agreement_id);
                self.runtime.defer(GovernanceCommand::AsyncTermination {
                    agreement_id: agreement_id.to_string(),
                    protocol: protocol.to_string(),
                    reason,
                });
            }
            None => {
                warn!("no handler for protocol {}, skipping protocol termination", protocol);
                self.spawn_termination(None, ag, reason);
            }
        }
        true
    }

    /// Cancel with the protocol's code for `reason`. Looks the protocol up
    /// from the record when `protocol` is not given.
    pub async fn cancel_for_reason(&self, agreement_id: &str, protocol: Option<&str>, reason: TermReason) -> bool {
        let protocol = match protocol.filter(|p| !p.is_empty()) {
            Some(p) => p.to_string(),
            None => match self.db.find_agreement(agreement_id) {
                Ok(Some(ag)) => ag.agreement_protocol,
                Ok(None) => {
                    debug!("no agreement {} to cancel", agreement_id);
                    return false;
                }
                Err(e) => {
                    error!("unable to read agreement {}: {}", agreement_id, e);
                    return false;
                }
            },
        };
        let Some(h) = self.handler(&protocol) else {
            warn!("unable to cancel {}: unknown protocol {}", agreement_id, protocol);
            return false;
        };
        let code = h.termination_code(reason);
        self.cancel_agreement(agreement_id, &protocol, code, &h.termination_reason(code))
            .await
    }

    /// Run the protocol side of a termination, then mark it done.
    fn spawn_termination(&self, handler: Option<Arc<dyn ProtocolHandler>>, agreement: EstablishedAgreement, reason: u64) {
        let tx = self.runtime.sender();
        let db = self.db.clone();
        self.spawn(async move {
            let ag_id = agreement.current_agreement_id.clone();
            if let Some(h) = handler {
                h.terminate_agreement(&agreement, reason).await;
            }
            db.log_event(
                Severity::Info,
                EventSource::Agreement,
                EC_AGREEMENT_CANCELED,
                format!("agreement {} canceled", ag_id),
            );
            let cmd = GovernanceCommand::CleanupStatus {
                agreement_id: ag_id.clone(),
                protocol: agreement.agreement_protocol.clone(),
                status: STATUS_AG_PROTOCOL_TERMINATED,
            };
            if tx.send(cmd).await.is_err() {
                debug!("governance queue closed before cleanup of {}", ag_id);
            }
        });
    }

    pub(super) fn async_termination(&self, agreement_id: &str, protocol: &str, reason: u64) {
        let ag = match self.db.find_agreement(agreement_id) {
            Ok(Some(ag)) => ag,
            Ok(None) => {
                debug!("agreement {} gone before its termination", agreement_id);
                return;
            }
            Err(e) => {
                error!("unable to read agreement {}: {}", agreement_id, e);
                return;
            }
        };
        match self.handler(protocol) {
            Some(h) if h.is_blockchain_writable(&ag) => self.spawn_termination(Some(h), ag, reason),
            Some(_) => self.runtime.defer(GovernanceCommand::AsyncTermination {
                agreement_id: agreement_id.to_string(),
                protocol: protocol.to_string(),
                reason,
            }),
            None => self.spawn_termination(None, ag, reason),
        }
    }

    async fn delete_exchange_agreement(&self, agreement_id: &str) -> ExchangeResult<()> {
        let retry = self.retry_policy();
        retry_transient(&retry, "agreement delete", || self.exchange.delete_agreement(agreement_id)).await
    }

    pub(super) async fn retry_exchange_agreement_delete(&self, agreement_id: &str) {
        match self.delete_exchange_agreement(agreement_id).await {
            Ok(()) => info!("deleted agreement {} from the exchange on retry", agreement_id),
            Err(e) => {
                error!("giving up deleting agreement {} from the exchange: {}", agreement_id, e);
                self.log(
                    Severity::Error,
                    EventSource::Exchange,
                    EC_ERROR_DELETE_AGREEMENT_IN_EXCHANGE,
                    format!("error deleting agreement {} in exchange: {}", agreement_id, e),
                );
            }
        }
    }

    /// Record one teardown marker. Agreements that were never accepted are
    /// deleted outright; others are archived once both markers are present.
    pub(super) fn cleanup_status(&self, agreement_id: &str, protocol: &str, status: u32) {
        let ag = match self.db.find_agreement(agreement_id) {
            Ok(Some(ag)) => ag,
            Ok(None) => {
                debug!("cleanup status {} for unknown agreement {}", status, agreement_id);
                return;
            }
            Err(e) => {
                error!("unable to read agreement {}: {}", agreement_id, e);
                return;
            }
        };
        if ag.archived {
            return;
        }
        if !ag.is_terminated() {
            debug!(
                "ignoring cleanup status {} for active {} agreement {}",
                status, protocol, agreement_id
            );
            return;
        }

        if !ag.is_accepted() {
            match self.db.delete_agreement(agreement_id) {
                Ok(true) => info!("deleted unaccepted agreement {}", agreement_id),
                Ok(false) => {}
                Err(e) => error!("unable to delete agreement {}: {}", agreement_id, e),
            }
            return;
        }

        let marked = match status {
            STATUS_WORKLOAD_DESTROYED => self.db.agreement_state_workload_terminated(agreement_id),
            STATUS_AG_PROTOCOL_TERMINATED => self.db.agreement_state_protocol_terminated(agreement_id),
            other => {
                warn!("unknown cleanup status {} for {}", other, agreement_id);
                return;
            }
        };
        match marked {
            Ok(ag) if ag.is_cleanup_complete() => match self.db.archive_agreement(agreement_id) {
                Ok(_) => info!("archived agreement {}", agreement_id),
                Err(e) => error!("unable to archive agreement {}: {}", agreement_id, e),
            },
            Ok(_) => debug!("agreement {} waiting for its other cleanup marker", agreement_id),
            Err(e) => error!("unable to record cleanup status {} of {}: {}", status, agreement_id, e),
        }
    }
}
