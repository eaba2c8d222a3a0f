//! Periodic backstops: the agreement sweep, dependent service maintenance,
//! the service config state check and the device status report.
//!
//! Every cancellation issued here may already have happened reactively;
//! cancellation is idempotent, so the sweep never double cancels.

use std::collections::BTreeMap;

use tracing::{debug, error, info, warn};

use anax_common::events::Message;
use anax_common::persistence::eventlog::{EC_CANCEL_AGREEMENT_EXECUTION_TIMEOUT, EC_CANCEL_AGREEMENT_NO_REPLYACK};
use anax_common::persistence::{
    AgreementFilter, DefinitionFilter, EstablishedAgreement, EventSource, InstanceFilter, Severity,
};
use anax_common::WorkerError;

use super::{GovernanceCommand, GovernanceWorker};
use crate::exchange::{retry_transient, DeviceStatus, ServiceStatus};
use crate::producer::TermReason;

/// Executing but never accepted by the consumer.
pub const MAX_AGREEMENT_ACCEPTANCE_WAIT_TIME_S: u64 = 20 * 60;
/// Created but never started executing.
pub const MAX_CONTRACT_PRELAUNCH_TIME_S: u64 = 60 * 60;
/// Created but still waiting for its configuration.
pub const MAX_CONTRACT_UNCONFIGURED_TIME_S: u64 = 20 * 60;

/// What the sweep decided for one agreement, before rule 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepAction {
    Keep,
    Cancel(TermReason, &'static str),
}

/// Rules 1 and 2 of the sweep, in priority order.
fn sweep_action(ag: &EstablishedAgreement, now: u64) -> SweepAction {
    if ag.execution_start_time != 0 {
        if ag.accepted_time == 0
            && now.saturating_sub(ag.execution_start_time) > MAX_AGREEMENT_ACCEPTANCE_WAIT_TIME_S
        {
            return SweepAction::Cancel(TermReason::NoReplyAck, EC_CANCEL_AGREEMENT_NO_REPLYACK);
        }
        return SweepAction::Keep;
    }
    if ag.current_agreement_id.is_empty() {
        return SweepAction::Keep;
    }
    let age = now.saturating_sub(ag.creation_time);
    if age > MAX_CONTRACT_PRELAUNCH_TIME_S
        || (!ag.config_nonce.is_empty() && age > MAX_CONTRACT_UNCONFIGURED_TIME_S)
    {
        return SweepAction::Cancel(TermReason::NotExecuted, EC_CANCEL_AGREEMENT_EXECUTION_TIMEOUT);
    }
    SweepAction::Keep
}

impl GovernanceWorker {
    /// One pass over every unarchived agreement.
    pub async fn govern_agreements(&self, now: u64) {
        let agreements = match self
            .db
            .find_established_agreements_all_protocols(&[AgreementFilter::Unarchived])
        {
            Ok(a) => a,
            Err(e) => {
                error!("unable to read agreements for the sweep: {}", e);
                return;
            }
        };
        debug!("sweeping {} agreements", agreements.len());

        for ag in agreements.into_iter().filter(|a| !a.is_terminated()) {
            let ag_id = ag.current_agreement_id.as_str();
            let protocol = ag.agreement_protocol.as_str();

            if ag.execution_start_time != 0 {
                self.runtime.publish(Message::ContainerMaintain {
                    agreement_protocol: protocol.to_string(),
                    agreement_id: ag_id.to_string(),
                    deployment: ag.current_deployment.clone(),
                });
            }

            if let SweepAction::Cancel(reason, code) = sweep_action(&ag, now) {
                info!("sweep cancelling {} ({})", ag_id, reason);
                self.log(
                    Severity::Info,
                    EventSource::Agreement,
                    code,
                    format!("agreement {} for {} timed out: {}", ag_id, ag.running_workload.url, reason),
                );
                self.cancel_for_reason(ag_id, Some(protocol), reason).await;
            }

            let previous = self.sync_agreement_history(&ag);
            match self.handler(protocol) {
                Some(h) => self.runtime.publish(Message::GovernanceCancellation {
                    cause: h.termination_code(TermReason::ConsumerCancelled),
                    agreement_protocol: protocol.to_string(),
                    agreement_id: ag_id.to_string(),
                    previous_agreement_ids: previous,
                }),
                None => warn!("agreement {} uses unknown protocol {}", ag_id, protocol),
            }
        }
    }

    /// Pull the superseded agreement ids of the contract now holding `ag`
    /// into its record. Returns the resulting history.
    pub(super) fn sync_agreement_history(&self, ag: &EstablishedAgreement) -> Vec<String> {
        let ag_id = ag.current_agreement_id.as_str();
        let contract = match self.db.find_contract_by_agreement(ag_id) {
            Ok(Some(c)) => c,
            Ok(None) => return ag.previous_agreement_ids.clone(),
            Err(e) => {
                warn!("unable to read the contract of {}: {}", ag_id, e);
                return ag.previous_agreement_ids.clone();
            }
        };
        if contract
            .previous_agreements
            .iter()
            .all(|id| id == ag_id || ag.previous_agreement_ids.contains(id))
        {
            return ag.previous_agreement_ids.clone();
        }
        match self.db.agreement_previous_ids(ag_id, &contract.previous_agreements) {
            Ok(updated) => updated.previous_agreement_ids,
            Err(e) => {
                error!("unable to record the history of {}: {}", ag_id, e);
                ag.previous_agreement_ids.clone()
            }
        }
    }

    /// Nudge running service containers and, when due, queue upgrade checks.
    pub(super) fn govern_microservices(&self, upgrade_due: bool) {
        let defs: BTreeMap<String, _> = match self.db.find_microservice_defs(&[]) {
            Ok(d) => d.into_iter().map(|d| (d.id.clone(), d)).collect(),
            Err(e) => {
                error!("unable to read service definitions: {}", e);
                return;
            }
        };
        match self
            .db
            .find_microservice_instances(&[InstanceFilter::Unarchived, InstanceFilter::NotCleanedUp])
        {
            Ok(insts) => {
                for inst in insts.into_iter().filter(|i| i.execution_start_time != 0) {
                    if defs.get(&inst.microservice_def_id).is_some_and(|d| d.has_deployment()) {
                        self.runtime.publish(Message::GovernanceMaintain {
                            instance_key: inst.key(),
                        });
                    }
                }
            }
            Err(e) => error!("unable to read service instances: {}", e),
        }

        if !upgrade_due {
            return;
        }
        for def in defs.values().filter(|d| DefinitionFilter::Unarchived.matches(d) && d.ready_for_upgrade()) {
            let cmd = GovernanceCommand::UpgradeMicroservice {
                definition_id: def.id.clone(),
            };
            match self.runtime.try_submit(cmd.clone()) {
                Ok(()) => {}
                Err(WorkerError::QueueFull(_)) => self.runtime.defer(cmd),
                Err(e) => warn!("unable to queue upgrade check of {}: {}", def.id, e),
            }
        }
    }

    /// Whether an active agreement or a live instance runs `url`.
    fn service_in_use(&self, url: &str, org: &str) -> bool {
        let by_agreement = self
            .db
            .find_established_agreements_all_protocols(&[AgreementFilter::Unarchived, AgreementFilter::NotTerminated])
            .map(|ags| {
                ags.iter()
                    .any(|a| a.running_workload.url == url && a.running_workload.org == org)
            })
            .unwrap_or(false);
        by_agreement
            || self
                .db
                .find_microservice_instances(&[
                    InstanceFilter::Unarchived,
                    InstanceFilter::NotCleanedUp,
                    InstanceFilter::Service {
                        url: url.to_string(),
                        org: org.to_string(),
                    },
                ])
                .map(|insts| !insts.is_empty())
                .unwrap_or(false)
    }

    pub(super) async fn check_service_config_states(&self) {
        let retry = self.retry_policy();
        let states = match retry_transient(&retry, "service config state", || self.exchange.get_services_config_state()).await {
            Ok(s) => s,
            Err(e) => {
                warn!("unable to read service config states: {}", e);
                return;
            }
        };
        let suspended: Vec<(String, String)> = states
            .into_iter()
            .filter(|s| s.is_suspended() && self.service_in_use(&s.url, &s.org))
            .map(|s| (s.url, s.org))
            .collect();
        if !suspended.is_empty() {
            info!("{} running services were suspended", suspended.len());
            self.handle_service_suspended(&suspended).await;
        }
    }

    pub(super) async fn report_device_status(&self) {
        match self.db.find_device() {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => {
                error!("unable to read node registration: {}", e);
                return;
            }
        }

        let mut services = Vec::new();
        match self
            .db
            .find_established_agreements_all_protocols(&[AgreementFilter::Unarchived, AgreementFilter::NotTerminated])
        {
            Ok(ags) => services.extend(ags.into_iter().map(|ag| ServiceStatus {
                containers_started: ag.execution_start_time != 0,
                service_url: ag.running_workload.url,
                org: ag.running_workload.org,
                version: ag.running_workload.version,
                arch: ag.running_workload.arch,
                agreement_id: ag.current_agreement_id,
            })),
            Err(e) => error!("unable to read agreements for the status report: {}", e),
        }
        match self
            .db
            .find_microservice_instances(&[InstanceFilter::Unarchived, InstanceFilter::NotCleanedUp])
        {
            Ok(insts) => services.extend(insts.into_iter().filter(|i| i.agreement_less).map(|i| ServiceStatus {
                agreement_id: String::new(),
                containers_started: i.execution_start_time != 0,
                service_url: i.spec_ref,
                org: i.org,
                version: i.version,
                arch: i.arch,
            })),
            Err(e) => error!("unable to read instances for the status report: {}", e),
        }

        let status = DeviceStatus { services };
        let retry = self.retry_policy();
        if let Err(e) = retry_transient(&retry, "device status", || self.exchange.put_device_status(&status)).await {
            warn!("unable to report device status: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agreement(now: u64) -> EstablishedAgreement {
        EstablishedAgreement {
            current_agreement_id: "ag1".to_string(),
            creation_time: now,
            ..Default::default()
        }
    }

    #[test]
    fn test_execution_without_acceptance_wins_over_prelaunch() {
        let now = 10_000;
        let mut ag = agreement(now - MAX_CONTRACT_PRELAUNCH_TIME_S - 1);
        ag.execution_start_time = now - MAX_AGREEMENT_ACCEPTANCE_WAIT_TIME_S - 1;
        assert_eq!(
            sweep_action(&ag, now),
            SweepAction::Cancel(TermReason::NoReplyAck, EC_CANCEL_AGREEMENT_NO_REPLYACK)
        );

        ag.accepted_time = ag.execution_start_time;
        assert_eq!(sweep_action(&ag, now), SweepAction::Keep);
    }

    #[test]
    fn test_prelaunch_and_unconfigured_limits() {
        let now = 10_000;
        assert_eq!(sweep_action(&agreement(now - 60), now), SweepAction::Keep);

        let stuck = agreement(now - MAX_CONTRACT_PRELAUNCH_TIME_S - 1);
        assert!(matches!(sweep_action(&stuck, now), SweepAction::Cancel(TermReason::NotExecuted, _)));

        let mut unconfigured = agreement(now - MAX_CONTRACT_UNCONFIGURED_TIME_S - 1);
        assert_eq!(sweep_action(&unconfigured, now), SweepAction::Keep);
        unconfigured.config_nonce = "nonce".to_string();
        assert!(matches!(
            sweep_action(&unconfigured, now),
            SweepAction::Cancel(TermReason::NotExecuted, _)
        ));
    }

    #[test]
    fn test_agreement_without_id_is_left_alone() {
        let mut ag = agreement(0);
        ag.current_agreement_id.clear();
        assert_eq!(sweep_action(&ag, 1_000_000), SweepAction::Keep);
    }
}
