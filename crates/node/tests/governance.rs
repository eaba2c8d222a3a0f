//! Agreement and dependent service governance against an in-memory exchange.

mod support;

use std::collections::BTreeMap;
use std::time::Duration;

use anax_common::events::{ContainerEvent, LaunchFailure, Message};
use anax_common::persistence::eventlog::{
    EC_CANCEL_AGREEMENT_POLICY_CHANGED, EC_CANCEL_AGREEMENT_SERVICE_SUSPENDED, EC_COMPLETE_UPGRADE_SERVICE,
    EC_ERROR_AGREEMENT_VERIFICATION, EC_IGNORE_PROPOSAL, EC_NODE_UNREG_COMPLETE, EC_NO_VERSION_TO_DOWNGRADE,
    EC_RECEIVED_CANCEL_AGREEMENT_MESSAGE, EC_START_RETRY_DEPENDENT_SERVICE,
};
use anax_common::persistence::{
    now_secs, DefinitionFilter, InstanceFilter, PendingContract, ServiceDependency, ServiceInstancePathElement,
    SharingMode,
};
use anax_common::CommandHandler;
use anax_node::exchange::ExchangeService;
use anax_node::governance::translate;
use anax_node::policy::WorkloadPriority;
use anax_node::producer::{BASIC_PROTOCOL, CITIZEN_SCIENTIST};
use anax_node::protocol::{MessageEnvelope, ProtocolMessage};
use anax_node::{ExchangeError, GovernanceCommand, ShutdownMode, TermReason};

use support::*;

fn root(url: &str) -> Vec<ServiceInstancePathElement> {
    vec![ServiceInstancePathElement::new(url, ORG, "1.0.0")]
}

fn live_instances(h: &Harness) -> Vec<anax_common::persistence::MicroserviceInstance> {
    h.db
        .find_microservice_instances(&[InstanceFilter::Unarchived, InstanceFilter::NotCleanedUp])
        .unwrap()
}

// ════════════════════════════════════════════════════════════════════════════
// AGREEMENTS
// ════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let mut h = Harness::new();
    h.register_device("");
    h.save_agreement("ag1", "https://svc/top", WorkloadPriority::default());
    h.accept("ag1");
    h.exchange.add_agbot(AGBOT);

    assert!(h.worker.cancel_agreement("ag1", BASIC_PROTOCOL, 105, "user requested").await);
    assert!(
        !h.worker
            .cancel_for_reason("ag1", Some(BASIC_PROTOCOL), TermReason::NodeShutdown)
            .await
    );

    let ag = h.agreement("ag1");
    assert!(ag.is_terminated());
    assert_eq!(ag.terminated_reason, 105);
    assert_eq!(h.recorder.count("governance_workload_cancellation"), 1);
    assert_eq!(h.exchange.deleted_agreements(), vec!["ag1".to_string()]);

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    let cancels = h.exchange.sent_of_kind("cancel");
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0]["reason"], 105);
}

#[tokio::test]
async fn test_unknown_agreement_is_not_cancelled() {
    let mut h = Harness::new();
    assert!(!h.worker.cancel_for_reason("nope", None, TermReason::UserRequested).await);
    assert_eq!(h.recorder.count("governance_workload_cancellation"), 0);
}

fn agbot_message(sender: &str, msg: &ProtocolMessage) -> GovernanceCommand {
    GovernanceCommand::ExchangeMessage {
        envelope: MessageEnvelope {
            message_id: 1,
            agbot_id: sender.to_string(),
            agbot_pubkey: String::new(),
        },
        protocol_message: serde_json::to_string(msg).unwrap(),
    }
}

fn proposal_message(agreement_id: &str, policy_name: &str) -> GovernanceCommand {
    let p = proposal(agreement_id, policy_name, "https://svc/top", WorkloadPriority::default());
    agbot_message(AGBOT, &ProtocolMessage::Proposal(p))
}

#[tokio::test]
async fn test_duplicate_proposal_is_answered_once() {
    let h = Harness::new();
    h.register_device("");

    h.worker.handle_command(proposal_message("ag1", "P")).await;
    h.worker.handle_command(proposal_message("ag1", "P")).await;

    let replies = h.exchange.sent_of_kind("reply");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["decision"], true);
    assert!(!h.agreement("ag1").is_terminated());
    assert_eq!(h.events(EC_IGNORE_PROPOSAL).len(), 1);
}

#[tokio::test]
async fn test_second_proposal_for_same_policy_is_not_persisted() {
    let h = Harness::new();
    h.register_device("");

    h.worker.handle_command(proposal_message("ag1", "P")).await;
    h.worker.handle_command(proposal_message("ag2", "P")).await;

    assert!(h.db.find_agreement("ag2").unwrap().is_none());
    assert_eq!(h.exchange.sent_of_kind("reply").len(), 1);
    assert_eq!(h.events(EC_IGNORE_PROPOSAL).len(), 1);

    h.worker.handle_command(proposal_message("ag3", "Q")).await;
    assert!(h.db.find_agreement("ag3").unwrap().is_some());
}

#[tokio::test]
async fn test_proposal_while_shutting_down_is_ignored() {
    let h = Harness::new();
    h.worker.start_shutdown(ShutdownMode::Unconfigure { remove_node: false });

    h.register_device("");
    h.worker.handle_command(proposal_message("ag1", "P")).await;

    assert!(h.db.find_agreement("ag1").unwrap().is_none());
    assert!(h.exchange.sent_of_kind("reply").is_empty());
}

#[tokio::test]
async fn test_withdrawn_reply_ack_cancels_the_agreement() {
    let h = Harness::new();
    h.register_device("");
    h.save_agreement("ag1", "https://svc/top", WorkloadPriority::default());

    let ack = ProtocolMessage::ReplyAck {
        agreement_id: "ag1".to_string(),
        protocol: BASIC_PROTOCOL.to_string(),
        still_valid: false,
    };
    h.worker.handle_command(agbot_message("acme/other", &ack)).await;
    assert!(!h.agreement("ag1").is_terminated());

    h.worker.handle_command(agbot_message(AGBOT, &ack)).await;
    let ag = h.agreement("ag1");
    assert!(ag.is_terminated());
    assert_eq!(ag.terminated_reason, 107);
    assert!(!ag.is_accepted());
}

#[tokio::test]
async fn test_data_received_is_recorded_and_acknowledged() {
    let h = Harness::new();
    h.register_device("");
    h.save_agreement("ag1", "https://svc/top", WorkloadPriority::default());
    h.accept("ag1");
    assert_eq!(h.agreement("ag1").data_received_time, 0);

    let notice = ProtocolMessage::DataReceived {
        agreement_id: "ag1".to_string(),
        protocol: BASIC_PROTOCOL.to_string(),
    };
    h.worker.handle_command(agbot_message(AGBOT, &notice)).await;

    assert!(h.agreement("ag1").data_received_time > 0);
    let acks = h.exchange.sent_of_kind("data_received_ack");
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0]["agreement_id"], "ag1");
}

#[tokio::test]
async fn test_cancel_message_only_honoured_from_the_consumer() {
    let mut h = Harness::new();
    h.register_device("");
    h.save_agreement("ag1", "https://svc/top", WorkloadPriority::default());
    h.accept("ag1");
    h.exchange.add_agbot(AGBOT);

    let cancel = ProtocolMessage::Cancel {
        agreement_id: "ag1".to_string(),
        protocol: BASIC_PROTOCOL.to_string(),
        reason: 202,
    };
    h.worker.handle_command(agbot_message("acme/intruder", &cancel)).await;
    assert!(!h.agreement("ag1").is_terminated());
    assert_eq!(h.recorder.count("governance_workload_cancellation"), 0);
    assert!(h.events(EC_RECEIVED_CANCEL_AGREEMENT_MESSAGE).is_empty());

    h.worker.handle_command(agbot_message(AGBOT, &cancel)).await;
    let ag = h.agreement("ag1");
    assert!(ag.is_terminated());
    assert_eq!(ag.terminated_reason, 106);
    assert_eq!(h.recorder.count("governance_workload_cancellation"), 1);
    assert_eq!(h.events(EC_RECEIVED_CANCEL_AGREEMENT_MESSAGE).len(), 1);
}

#[tokio::test]
async fn test_contract_ended_on_chain_cancels_the_agreement() {
    let h = Harness::new();
    h.register_device("");
    h.save_agreement_with("ag1", "https://svc/top", WorkloadPriority::default(), |ag| {
        ag.agreement_protocol = CITIZEN_SCIENTIST.to_string();
    });

    let commands = translate(&Message::ContractEnded {
        contract_address: "0xabc".to_string(),
        agreement_id: "ag1".to_string(),
    });
    assert_eq!(commands.len(), 1);
    for cmd in commands {
        h.worker.handle_command(cmd).await;
    }

    let ag = h.agreement("ag1");
    assert!(ag.is_terminated());
    assert_eq!(ag.terminated_reason, 106);
}

#[tokio::test]
async fn test_sweep_cancels_in_rule_order() {
    let mut h = Harness::new();
    h.register_device("");

    // executing, never acknowledged by the agbot, and past the prelaunch limit
    h.save_agreement("unacked", "https://svc/a", WorkloadPriority::default());
    h.db.agreement_state_execution_started("unacked").unwrap();
    // never started
    h.save_agreement("stuck", "https://svc/b", WorkloadPriority::default());
    // healthy
    h.save_agreement("healthy", "https://svc/c", WorkloadPriority::default());
    h.accept("healthy");
    h.db.agreement_state_execution_started("healthy").unwrap();

    h.worker.govern_agreements(now_secs() + 3_700).await;

    assert_eq!(h.agreement("unacked").terminated_reason, 107);
    assert_eq!(h.agreement("stuck").terminated_reason, 104);
    assert!(!h.agreement("healthy").is_terminated());
    assert_eq!(h.recorder.count("container_maintain"), 2);
    assert_eq!(h.recorder.count("governance_cancellation"), 3);
}

#[tokio::test]
async fn test_sweep_leaves_young_agreements_alone() {
    let mut h = Harness::new();
    h.register_device("");
    h.save_agreement("ag1", "https://svc/a", WorkloadPriority::default());

    h.worker.govern_agreements(now_secs() + 60).await;

    assert!(!h.agreement("ag1").is_terminated());
    assert_eq!(h.recorder.count("governance_workload_cancellation"), 0);
    assert_eq!(h.recorder.count("governance_cancellation"), 1);
}

#[tokio::test]
async fn test_sweep_reaps_agreements_superseded_on_the_contract() {
    let mut h = Harness::new();
    h.register_device("");
    let pending = PendingContract {
        name: "edge".to_string(),
        arch: ARCH.to_string(),
        ..Default::default()
    };
    h.db.save_pending_contract(&pending).unwrap();
    h.db.promote_pending_contract(&pending, "0xabc").unwrap();
    h.db.contract_state_in_agreement("0xabc", "ag0", BTreeMap::new()).unwrap();
    h.db.contract_state_new("0xabc").unwrap();
    h.db.contract_state_in_agreement("0xabc", "ag1", BTreeMap::new()).unwrap();
    h.save_agreement("ag1", "https://svc/a", WorkloadPriority::default());

    h.worker.govern_agreements(now_secs() + 60).await;

    let reaped: Vec<Vec<String>> = h
        .recorder
        .drain()
        .iter()
        .filter_map(|m| match m {
            Message::GovernanceCancellation {
                agreement_id,
                previous_agreement_ids,
                ..
            } if agreement_id == "ag1" => Some(previous_agreement_ids.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(reaped, vec![vec!["ag0".to_string()]]);
    assert_eq!(h.agreement("ag1").previous_agreement_ids, vec!["ag0".to_string()]);
}

// ════════════════════════════════════════════════════════════════════════════
// NODE CHANGES
// ════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_heartbeat_restored_counts_failed_verification() {
    let h = Harness::new();
    h.register_device("");
    h.save_agreement("ag1", "https://svc/top", WorkloadPriority::default());
    h.exchange.fail_next(
        "get_agbot",
        ExchangeError::Status {
            status: 500,
            body: "boom".to_string(),
        },
    );

    h.worker.handle_command(GovernanceCommand::NodeHeartbeatRestored).await;

    let ag = h.agreement("ag1");
    assert!(!ag.is_terminated());
    assert_eq!(ag.failed_ver_attempts, 1);
    assert_eq!(h.events(EC_ERROR_AGREEMENT_VERIFICATION).len(), 1);
    assert!(h.exchange.sent_of_kind("agreement_verify").is_empty());
}

#[tokio::test]
async fn test_heartbeat_restored_cancels_agreements_of_vanished_agbots() {
    let h = Harness::new();
    h.register_device("");
    h.save_agreement("ag1", "https://svc/top", WorkloadPriority::default());

    h.worker.handle_command(GovernanceCommand::NodeHeartbeatRestored).await;

    let ag = h.agreement("ag1");
    assert!(ag.is_terminated());
    assert_eq!(ag.terminated_reason, 104);
}

#[tokio::test]
async fn test_heartbeat_restored_asks_known_agbots_to_verify() {
    let h = Harness::new();
    h.register_device("");
    h.save_agreement("ag1", "https://svc/top", WorkloadPriority::default());
    h.exchange.add_agbot(AGBOT);

    h.worker.handle_command(GovernanceCommand::NodeHeartbeatRestored).await;

    assert!(!h.agreement("ag1").is_terminated());
    let asks = h.exchange.sent_of_kind("agreement_verify");
    assert_eq!(asks.len(), 1);
    assert_eq!(asks[0]["agreement_id"], "ag1");
}

#[tokio::test]
async fn test_policy_change_cancels_only_diverged_agreements() {
    let h = Harness::new();
    h.register_device("");
    let kept = policy("gps", "https://svc/gps", WorkloadPriority::default());
    let agreed_net = policy("net", "https://svc/net", WorkloadPriority::default());
    let mut edited_net = agreed_net.clone();
    edited_net.header.version = "3.0".to_string();

    let policy_dir = h.dir.path().join("policy.d");
    std::fs::create_dir_all(&policy_dir).unwrap();
    std::fs::write(policy_dir.join("gps.policy"), serde_json::to_string(&kept).unwrap()).unwrap();
    std::fs::write(policy_dir.join("net.policy"), serde_json::to_string(&edited_net).unwrap()).unwrap();

    for (id, url, agreed) in [("ag1", "https://svc/gps", &kept), ("ag2", "https://svc/net", &agreed_net)] {
        let mut p = proposal(id, &agreed.header.name, url, WorkloadPriority::default());
        p.producer_policy = serde_json::to_string(agreed).unwrap();
        h.save_agreement_with(id, url, WorkloadPriority::default(), |ag| ag.proposal = p.marshal());
    }
    // no producer policy recorded, nothing to compare
    h.save_agreement("ag3", "https://svc/top", WorkloadPriority::default());

    h.worker.handle_command(GovernanceCommand::NodePolicyChanged).await;

    assert!(!h.agreement("ag1").is_terminated());
    assert!(!h.agreement("ag3").is_terminated());
    let ag = h.agreement("ag2");
    assert!(ag.is_terminated());
    assert_eq!(ag.terminated_reason, 101);
    assert_eq!(h.events(EC_CANCEL_AGREEMENT_POLICY_CHANGED).len(), 1);
}

#[tokio::test]
async fn test_user_input_change_cancels_agreements_using_the_service() {
    let h = Harness::new();
    h.register_device("");
    h.save_agreement("ag1", "https://svc/a", WorkloadPriority::default());
    h.save_agreement("ag2", "https://svc/b", WorkloadPriority::default());
    h.save_agreement("ag3", "https://svc/c", WorkloadPriority::default());
    let dep = definition("d1", "https://svc/dep", SharingMode::Multiple, None);
    h.db.save_microservice_def(&dep).unwrap();
    h.worker
        .start_microservice(&dep, Some("ag2"), root("https://svc/b"), None)
        .await
        .unwrap();

    let services = vec![
        ("https://svc/dep".to_string(), ORG.to_string()),
        ("https://svc/c".to_string(), ORG.to_string()),
    ];
    h.worker
        .handle_command(GovernanceCommand::NodeUserInputChanged { services })
        .await;

    assert!(!h.agreement("ag1").is_terminated());
    for id in ["ag2", "ag3"] {
        let ag = h.agreement(id);
        assert!(ag.is_terminated(), "{} should be cancelled", id);
        assert_eq!(ag.terminated_reason, 120);
    }
}

#[tokio::test]
async fn test_suspended_service_ends_agreements_and_standalone_instances() {
    let h = Harness::new();
    h.register_device("");
    h.save_agreement("ag1", "https://svc/a", WorkloadPriority::default());
    h.save_agreement("ag2", "https://svc/b", WorkloadPriority::default());
    let standalone = definition("d1", "https://svc/a", SharingMode::Singleton, None);
    h.db.save_microservice_def(&standalone).unwrap();
    h.worker
        .start_microservice(&standalone, None, Vec::new(), None)
        .await
        .unwrap();
    assert!(live_instances(&h).iter().any(|i| i.agreement_less));

    let services = vec![("https://svc/a".to_string(), ORG.to_string())];
    h.worker
        .handle_command(GovernanceCommand::ServiceSuspended { services })
        .await;

    let ag = h.agreement("ag1");
    assert!(ag.is_terminated());
    assert_eq!(ag.terminated_reason, 119);
    assert!(!h.agreement("ag2").is_terminated());
    assert!(!live_instances(&h).iter().any(|i| i.spec_ref == "https://svc/a"));
    assert_eq!(h.events(EC_CANCEL_AGREEMENT_SERVICE_SUSPENDED).len(), 1);
}

// ════════════════════════════════════════════════════════════════════════════
// DEPENDENT SERVICES
// ════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_multiple_sharing_starts_one_instance_per_agreement() {
    let h = Harness::new();
    h.register_device("");
    h.save_agreement("ag1", "https://svc/a", WorkloadPriority::default());
    h.save_agreement("ag2", "https://svc/b", WorkloadPriority::default());
    let def = definition("d1", "https://svc/dep", SharingMode::Multiple, None);
    h.db.save_microservice_def(&def).unwrap();

    h.worker
        .start_microservice(&def, Some("ag1"), root("https://svc/a"), None)
        .await
        .unwrap();
    h.worker
        .start_microservice(&def, Some("ag2"), root("https://svc/b"), None)
        .await
        .unwrap();

    let insts = live_instances(&h);
    assert_eq!(insts.len(), 2);
    assert!(insts.iter().all(|i| i.associated_agreements.len() == 1));
    assert!(insts.iter().all(|i| i.execution_start_time != 0));
}

#[tokio::test]
async fn test_singleton_sharing_joins_the_running_instance() {
    let h = Harness::new();
    h.register_device("");
    h.save_agreement("ag1", "https://svc/a", WorkloadPriority::default());
    h.save_agreement("ag2", "https://svc/b", WorkloadPriority::default());
    let def = definition("d1", "https://svc/dep", SharingMode::Singleton, None);
    h.db.save_microservice_def(&def).unwrap();

    let first = h
        .worker
        .start_microservice(&def, Some("ag1"), root("https://svc/a"), None)
        .await
        .unwrap();
    let second = h
        .worker
        .start_microservice(&def, Some("ag2"), root("https://svc/b"), None)
        .await
        .unwrap();

    assert_eq!(first.key(), second.key());
    let insts = live_instances(&h);
    assert_eq!(insts.len(), 1);
    assert_eq!(insts[0].associated_agreements, vec!["ag1".to_string(), "ag2".to_string()]);
    assert_eq!(insts[0].parent_path.len(), 2);
}

#[tokio::test]
async fn test_concurrent_start_launches_containers_once() {
    let mut h = Harness::new();
    h.register_device("");
    h.save_agreement("ag1", "https://svc/a", WorkloadPriority::default());
    let def = definition("d1", "https://svc/dep", SharingMode::Exclusive, Some("registry/dep:1.0.0"));
    h.db.save_microservice_def(&def).unwrap();

    let (a, b) = tokio::join!(
        h.worker.start_microservice(&def, Some("ag1"), root("https://svc/a"), None),
        h.worker.start_microservice(&def, Some("ag1"), root("https://svc/a"), None),
    );
    assert_eq!(a.unwrap().key(), b.unwrap().key());

    assert_eq!(live_instances(&h).len(), 1);
    let launches: Vec<_> = h
        .recorder
        .drain()
        .iter()
        .filter_map(|m| match m {
            Message::LoadContainer(ctx) => Some(ctx.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].agreement_ids, vec!["ag1".to_string()]);
    assert_eq!(launches[0].environment.get("HZN_AGREEMENTID").map(String::as_str), Some("ag1"));
    assert_eq!(launches[0].environment.get("HZN_ORGANIZATION").map(String::as_str), Some(ORG));
    assert_eq!(launches[0].dependency_path, root("https://svc/a"));
}

#[tokio::test]
async fn test_unsigned_deployment_is_not_launched() {
    let mut h = Harness::new();
    h.register_device("");
    h.save_agreement("ag1", "https://svc/a", WorkloadPriority::default());
    let mut def = definition("d1", "https://svc/dep", SharingMode::Exclusive, Some("registry/dep:1.0.0"));
    def.deployment_signature = sign("something else");
    h.db.save_microservice_def(&def).unwrap();

    let res = h
        .worker
        .start_microservice(&def, Some("ag1"), root("https://svc/a"), None)
        .await;

    assert!(res.is_err());
    assert_eq!(h.recorder.count("load_container"), 0);
    let inst = &live_instances(&h)[0];
    assert_eq!(inst.execution_failure_code, 202);
}

#[tokio::test]
async fn test_retries_exhausted_then_rollback_without_lower_version() {
    let mut h = Harness::new();
    h.register_device("");
    let priority = WorkloadPriority {
        priority_value: 1,
        retries: Some(2),
        retry_durations: Some(3_600),
    };
    h.save_agreement("ag1", "https://svc/a", priority);
    let def = definition("d1", "https://svc/dep", SharingMode::Exclusive, Some("registry/dep:1.0.0"));
    h.db.save_microservice_def(&def).unwrap();
    let key = h
        .worker
        .start_microservice(&def, Some("ag1"), root("https://svc/a"), None)
        .await
        .unwrap()
        .key();

    let fail = GovernanceCommand::UpdateMicroservice {
        instance_key: key.clone(),
        event: ContainerEvent::Failed(LaunchFailure::Container),
    };

    h.worker.handle_command(fail.clone()).await;
    h.worker.handle_command(fail.clone()).await;
    assert_eq!(h.events(EC_START_RETRY_DEPENDENT_SERVICE).len(), 2);
    assert!(h.events(EC_NO_VERSION_TO_DOWNGRADE).is_empty());
    assert_eq!(h.recorder.count("load_container"), 3);
    for m in h.recorder.drain() {
        if let Message::LoadContainer(ctx) = m {
            assert_eq!(ctx.environment.get("HZN_AGREEMENTID").map(String::as_str), Some("ag1"));
        }
    }
    let inst = h.db.find_microservice_instance(&key).unwrap().unwrap();
    assert_eq!(inst.current_retry_count, 2);
    assert_eq!(inst.max_retries, 2);

    h.worker.handle_command(fail).await;
    assert_eq!(h.events(EC_NO_VERSION_TO_DOWNGRADE).len(), 1);
    assert_eq!(h.agreement("ag1").terminated_reason, 118);
    let inst = h.db.find_microservice_instance(&key).unwrap().unwrap();
    assert_ne!(inst.cleanup_start_time, 0);
    assert_eq!(h.recorder.count("microservice_cancellation"), 1);
    let def = h.db.find_microservice_def_by_id("d1").unwrap().unwrap();
    assert_ne!(def.upgrade_failed_time, 0);
}

#[tokio::test]
async fn test_upgrade_replaces_definition_and_releases_agreements() {
    let h = Harness::new();
    h.register_device("acme/edge");
    h.save_agreement("ag1", "https://svc/a", WorkloadPriority::default());
    let mut def = definition("d1", "https://svc/dep", SharingMode::Singleton, None);
    def.auto_upgrade = true;
    h.db.save_microservice_def(&def).unwrap();
    h.worker
        .start_microservice(&def, Some("ag1"), root("https://svc/a"), None)
        .await
        .unwrap();

    h.exchange.publish_service(ExchangeService {
        url: "https://svc/dep".to_string(),
        org: ORG.to_string(),
        version: "1.1.0".to_string(),
        arch: ARCH.to_string(),
        sharable: SharingMode::Singleton,
        ..Default::default()
    });
    h.worker
        .handle_command(GovernanceCommand::UpgradeMicroservice {
            definition_id: "d1".to_string(),
        })
        .await;

    let old = h.db.find_microservice_def_by_id("d1").unwrap().unwrap();
    assert!(old.archived);
    assert!(!old.active_upgrade);
    assert!(old.upgrade_agreements_cleared_time > 0);
    assert!(old.upgrade_ms_unregistered_time > 0);
    assert!(old.upgrade_ms_reregistered_time > 0);
    assert_eq!(old.upgrade_failed_time, 0);

    let current = h.db.find_microservice_defs(&[DefinitionFilter::Unarchived]).unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].version, "1.1.0");
    assert_eq!(old.upgrade_new_ms_id, current[0].id);

    assert_eq!(
        h.exchange.unregistered(),
        vec![("https://svc/dep".to_string(), ORG.to_string())]
    );
    assert_eq!(h.exchange.registered().len(), 1);
    assert_eq!(h.exchange.registered()[0].version, "1.1.0");

    let ag = h.agreement("ag1");
    assert!(ag.is_terminated());
    assert_eq!(ag.terminated_reason, 111);
    assert!(live_instances(&h).is_empty());
    assert_eq!(h.events(EC_COMPLETE_UPGRADE_SERVICE).len(), 1);
}

#[tokio::test]
async fn test_upgrade_ignores_versions_not_above_current() {
    let h = Harness::new();
    h.register_device("");
    let mut def = definition("d1", "https://svc/dep", SharingMode::Singleton, None);
    def.auto_upgrade = true;
    h.db.save_microservice_def(&def).unwrap();
    h.exchange.publish_service(ExchangeService {
        url: "https://svc/dep".to_string(),
        org: ORG.to_string(),
        version: "1.0.0".to_string(),
        arch: ARCH.to_string(),
        ..Default::default()
    });

    h.worker
        .handle_command(GovernanceCommand::UpgradeMicroservice {
            definition_id: "d1".to_string(),
        })
        .await;

    let def = h.db.find_microservice_def_by_id("d1").unwrap().unwrap();
    assert!(!def.archived);
    assert_eq!(def.upgrade_start_time, 0);
    assert!(h.exchange.unregistered().is_empty());
}

#[tokio::test]
async fn test_shared_instance_outlives_one_agreement() {
    let mut h = Harness::new();
    h.register_device("");
    h.save_agreement("ag1", "https://svc/a", WorkloadPriority::default());
    h.save_agreement("ag2", "https://svc/b", WorkloadPriority::default());
    let def = definition("d1", "https://svc/dep", SharingMode::Singleton, None);
    h.db.save_microservice_def(&def).unwrap();
    let key = h
        .worker
        .start_microservice(&def, Some("ag1"), root("https://svc/a"), None)
        .await
        .unwrap()
        .key();
    h.worker
        .start_microservice(&def, Some("ag2"), root("https://svc/b"), None)
        .await
        .unwrap();

    assert!(h.worker.cancel_for_reason("ag1", None, TermReason::UserRequested).await);
    let inst = h.db.find_microservice_instance(&key).unwrap().unwrap();
    assert!(inst.is_live());
    assert_eq!(inst.associated_agreements, vec!["ag2".to_string()]);
    assert_eq!(inst.parent_path, vec![root("https://svc/b")]);
    assert_eq!(h.recorder.count("drop_excess_networks"), 1);

    assert!(h.worker.cancel_for_reason("ag2", None, TermReason::UserRequested).await);
    let inst = h.db.find_microservice_instance(&key).unwrap().unwrap();
    assert!(inst.archived);
}

#[tokio::test]
async fn test_joining_a_shared_parent_also_joins_its_children() {
    let h = Harness::new();
    h.register_device("");
    h.save_agreement("ag1", "https://svc/a", WorkloadPriority::default());
    h.save_agreement("ag2", "https://svc/b", WorkloadPriority::default());
    let child = definition("d2", "https://svc/child", SharingMode::Singleton, None);
    h.db.save_microservice_def(&child).unwrap();
    let mut parent = definition("d1", "https://svc/parent", SharingMode::Singleton, None);
    parent.required_services = vec![ServiceDependency {
        url: "https://svc/child".to_string(),
        org: ORG.to_string(),
        version: "[1.0.0,INFINITY)".to_string(),
        arch: String::new(),
    }];
    h.db.save_microservice_def(&parent).unwrap();

    h.worker
        .start_microservice(&parent, Some("ag1"), root("https://svc/a"), None)
        .await
        .unwrap();
    h.worker
        .start_microservice(&parent, Some("ag2"), root("https://svc/b"), None)
        .await
        .unwrap();

    let child_of = |h: &Harness| {
        live_instances(h)
            .into_iter()
            .find(|i| i.spec_ref == "https://svc/child")
    };
    let joined = child_of(&h).unwrap();
    assert_eq!(joined.associated_agreements, vec!["ag1".to_string(), "ag2".to_string()]);
    assert_eq!(joined.parent_path.len(), 2);

    assert!(h.worker.cancel_for_reason("ag1", None, TermReason::UserRequested).await);
    let left = child_of(&h).expect("child still serves ag2");
    assert_eq!(left.associated_agreements, vec!["ag2".to_string()]);
    let mut expected = root("https://svc/b");
    expected.push(ServiceInstancePathElement::new("https://svc/parent", ORG, "1.0.0"));
    assert_eq!(left.parent_path, vec![expected]);
}

// ════════════════════════════════════════════════════════════════════════════
// NODE SHUTDOWN
// ════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_agreements_to_archive() {
    let mut h = Harness::new();
    h.register_device("");
    let key_dir = h.dir.path().join("keys/messaging");
    std::fs::create_dir_all(&key_dir).unwrap();
    std::fs::write(key_dir.join("private.key"), "k").unwrap();
    h.save_agreement("ag1", "https://svc/a", WorkloadPriority::default());
    h.accept("ag1");

    h.worker.start_shutdown(ShutdownMode::Unconfigure { remove_node: false });
    assert!(h.worker.is_shutting_down());
    tokio::time::sleep(Duration::from_secs(45)).await;

    let ag = h.agreement("ag1");
    assert_eq!(ag.terminated_reason, 116);
    assert!(!ag.archived);
    assert_eq!(h.recorder.count("node_shutdown_complete"), 0);
    assert!(h.db.find_device().unwrap().is_some());

    h.db.archive_agreement("ag1").unwrap();
    let mut waited = 0;
    while h.recorder.count("node_shutdown_complete") == 0 && waited < 10 {
        tokio::time::sleep(Duration::from_secs(15)).await;
        waited += 1;
    }

    let done = h.recorder.drain().iter().find_map(|m| match m {
        Message::NodeShutdownComplete { error } => Some(error.clone()),
        _ => None,
    });
    assert_eq!(done, Some(None));
    assert!(h.db.find_device().unwrap().is_none());
    assert!(!key_dir.exists());
    assert!(!h.exchange.device_deleted());
    assert_eq!(h.events(EC_NODE_UNREG_COMPLETE).len(), 1);
    assert_eq!(h.recorder.count("exchange_changes_shutdown"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_without_registration_reports_error() {
    let mut h = Harness::new();

    h.worker.start_shutdown(ShutdownMode::Unconfigure { remove_node: true });
    tokio::time::sleep(Duration::from_secs(1)).await;

    let done = h.recorder.drain().iter().find_map(|m| match m {
        Message::NodeShutdownComplete { error } => Some(error.clone()),
        _ => None,
    });
    assert!(matches!(done, Some(Some(_))));
    assert!(!h.exchange.device_deleted());
}
