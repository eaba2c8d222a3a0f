//! Registration and evaluation flows against in-memory contracts.

use std::sync::Arc;
use std::time::Duration;

use anax_chain::contract::{ContractError, ContractValue, ZERO_ADDRESS};
use anax_chain::registry::load_directory;
use anax_chain::{BlockchainWorker, ChainConfig, DeviceContracts, MockContract, MockContractFactory};
use anax_common::events::{ContractEndCause, Message};
use anax_common::persistence::PendingContract;
use anax_common::{AgentDb, MessageBus};
use tokio::sync::broadcast;

struct Fixture {
    _dir: tempfile::TempDir,
    db: AgentDb,
    bus: MessageBus,
    factory: Arc<MockContractFactory>,
    registry: Arc<MockContract>,
    bank: Arc<MockContract>,
    cfg: ChainConfig,
}

fn s(v: &str) -> ContractValue {
    ContractValue::str(v)
}

fn list(items: &[&str]) -> ContractValue {
    ContractValue::StrList(items.iter().map(|i| i.to_string()).collect())
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db = AgentDb::open(dir.path()).unwrap();
    let factory = Arc::new(MockContractFactory::new());

    let directory = Arc::new(MockContract::new("0xdir"));
    directory.set_value_for("get_entry_by_version", vec![s("device_registry"), s("0")], s("0xreg"));
    directory.set_value_for("get_entry_by_version", vec![s("token_bank"), s("0")], s("0xbank"));
    let registry = Arc::new(MockContract::new("0xreg"));
    let bank = Arc::new(MockContract::new("0xbank"));
    bank.set_value("account_balance", ContractValue::U64(100));
    bank.set_value("get_proposer_accepted", ContractValue::Bool(false));

    factory.register(directory);
    factory.register(Arc::clone(&registry));
    factory.register(Arc::clone(&bank));

    let cfg = ChainConfig {
        account_id: "0xowner".to_string(),
        directory_address: "0xdir".to_string(),
        ..Default::default()
    };
    Fixture {
        _dir: dir,
        db,
        bus: MessageBus::default(),
        factory,
        registry,
        bank,
        cfg,
    }
}

fn pending() -> PendingContract {
    PendingContract {
        name: "rpi".to_string(),
        arch: "arm".to_string(),
        cpus: 4,
        ram: 1024,
        hourly_cost_bacon: 5,
        private_app_attributes: [("secret".to_string(), "s3".to_string())].into_iter().collect(),
        ..Default::default()
    }
}

async fn device_contracts(f: &Fixture) -> DeviceContracts {
    let dir = load_directory(f.factory.as_ref(), &f.cfg).await.unwrap();
    DeviceContracts::new(f.db.clone(), f.bus.clone(), f.factory.clone(), "0xowner", dir)
}

/// A device contract the chain reports as in agreement `ag` with provider 0xagbot.
fn device_in_agreement(f: &Fixture, ag: &str) -> Arc<MockContract> {
    let device = Arc::new(MockContract::new("0xdev"));
    device.set_value("get_agreement_id", s(ag));
    device.set_value("in_contract", ContractValue::Bool(true));
    device.set_value("get_container_provider", s("0xagbot"));
    f.factory.register(Arc::clone(&device));
    f.registry
        .set_value("get_description", list(&["name", "rpi", "hourly_cost_bacon", "5", "gps", ""]));
    device
}

fn drain(rx: &mut broadcast::Receiver<Message>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(m) = rx.try_recv() {
        out.push(m);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_register_pending_promotes_and_announces() {
    let f = fixture();
    let mut rx = f.bus.subscribe();
    let device = Arc::new(MockContract::new("0xdev"));
    device.set_value("get_owner", s("0xowner"));
    device.script("get_bank", vec![s(ZERO_ADDRESS), s("0xbank")]);
    f.factory.prepare_deploy(Arc::clone(&device));
    f.registry.on_invoke(
        "register",
        "get_description",
        list(&["name", "rpi", "hourly_cost_bacon", "5"]),
    );
    f.db.save_pending_contract(&pending()).unwrap();

    let dc = device_contracts(&f).await;
    let est = dc.register_pending(&pending()).await.unwrap();

    assert_eq!(est.contract_address, "0xdev");
    assert!(f.db.find_pending_contracts().unwrap().is_empty());
    assert_eq!(device.calls()[1], ("set_bank".to_string(), vec![s("0xbank")]));
    assert_eq!(device.call_count("get_bank"), 2);
    assert_eq!(
        drain(&mut rx),
        vec![Message::ContractRegistered {
            name: "rpi".to_string(),
            contract_address: "0xdev".to_string()
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_register_requires_hourly_cost_attribute() {
    let f = fixture();
    let device = Arc::new(MockContract::new("0xdev"));
    device.set_value("get_owner", s("owner"));
    device.set_value("get_bank", s("0xbank"));
    f.factory.prepare_deploy(device);
    f.registry.on_invoke("register", "get_description", list(&["name", "rpi"]));
    f.db.save_pending_contract(&pending()).unwrap();

    let dc = device_contracts(&f).await;
    let err = dc.register_pending(&pending()).await.unwrap_err();
    assert!(matches!(err, ContractError::Inconsistent(_)));
    assert_eq!(f.db.find_pending_contracts().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_wrong_owner_fails_deploy() {
    let f = fixture();
    let device = Arc::new(MockContract::new("0xdev"));
    device.set_value("get_owner", s("0xsomeoneelse"));
    f.factory.prepare_deploy(device);

    let dc = device_contracts(&f).await;
    assert!(matches!(
        dc.register_pending(&pending()).await,
        Err(ContractError::Deploy(_))
    ));
}

#[tokio::test]
async fn test_new_agreement_meeting_ask_is_pursued() {
    let f = fixture();
    let mut rx = f.bus.subscribe();
    let record = f.db.promote_pending_contract(&pending(), "0xdev").unwrap();
    let device = device_in_agreement(&f, "ag1");
    f.bank.set_value("get_escrow_amount", ContractValue::U64(10));

    let dc = device_contracts(&f).await;
    dc.evaluate_contract_changes(&record, device.as_ref()).await.unwrap();

    let updated = f.db.find_established_contract("0xdev").unwrap().unwrap();
    assert_eq!(updated.current_agreement_id, "ag1");
    let env = &updated.environment_additions;
    assert_eq!(env["MTN_NAME"], "rpi");
    assert_eq!(env["MTN_SECRET"], "s3");
    assert_eq!(env["MTN_CONTRACT"], "0xdev");
    assert_eq!(env["MTN_AGREEMENTID"], "ag1");
    assert!(!env.contains_key("MTN_GPS"));
    assert_eq!(f.bank.call_count("counter_party_vote"), 1);
    assert_eq!(
        drain(&mut rx),
        vec![Message::ContractAccepted {
            contract_address: "0xdev".to_string(),
            agreement_id: "ag1".to_string()
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_underpaid_agreement_is_rejected() {
    let f = fixture();
    let mut rx = f.bus.subscribe();
    let record = f.db.promote_pending_contract(&pending(), "0xdev").unwrap();
    let device = device_in_agreement(&f, "ag1");
    device.on_invoke("reject_container", "get_agreement_id", s(""));
    f.bank.set_value("get_escrow_amount", ContractValue::U64(1));

    let dc = device_contracts(&f).await;
    dc.evaluate_contract_changes(&record, device.as_ref()).await.unwrap();

    assert_eq!(device.call_count("reject_container"), 1);
    assert_eq!(f.bank.call_count("counter_party_vote"), 0);
    let updated = f.db.find_established_contract("0xdev").unwrap().unwrap();
    assert!(updated.current_agreement_id.is_empty());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_chain_leaving_contract_ends_local_agreement() {
    let f = fixture();
    let mut rx = f.bus.subscribe();
    f.db.promote_pending_contract(&pending(), "0xdev").unwrap();
    let record = f
        .db
        .contract_state_in_agreement("0xdev", "ag1", Default::default())
        .unwrap();
    let device = device_in_agreement(&f, "");
    device.set_value("in_contract", ContractValue::Bool(false));

    let dc = device_contracts(&f).await;
    dc.evaluate_contract_changes(&record, device.as_ref()).await.unwrap();

    let updated = f.db.find_established_contract("0xdev").unwrap().unwrap();
    assert!(updated.current_agreement_id.is_empty());
    assert_eq!(updated.previous_agreements, vec!["ag1".to_string()]);
    assert_eq!(
        drain(&mut rx),
        vec![Message::ContractEnded {
            contract_address: "0xdev".to_string(),
            agreement_id: "ag1".to_string()
        }]
    );
}

#[tokio::test]
async fn test_in_contract_without_agreement_id_is_inconsistent() {
    let f = fixture();
    let record = f.db.promote_pending_contract(&pending(), "0xdev").unwrap();
    let device = device_in_agreement(&f, "");

    let dc = device_contracts(&f).await;
    let err = dc.evaluate_contract_changes(&record, device.as_ref()).await.unwrap_err();
    assert!(matches!(err, ContractError::Inconsistent(_)));
}

#[tokio::test]
async fn test_proposer_acceptance_recorded_once() {
    let f = fixture();
    f.db.promote_pending_contract(&pending(), "0xdev").unwrap();
    let record = f
        .db
        .contract_state_in_agreement("0xdev", "ag1", Default::default())
        .unwrap();
    let device = device_in_agreement(&f, "ag1");
    f.bank.set_value("get_proposer_accepted", ContractValue::Bool(true));

    let dc = device_contracts(&f).await;
    dc.evaluate_contract_changes(&record, device.as_ref()).await.unwrap();
    let accepted = f.db.find_established_contract("0xdev").unwrap().unwrap();
    assert_ne!(accepted.agreement_accepted_time, 0);

    dc.evaluate_contract_changes(&accepted, device.as_ref()).await.unwrap();
    let again = f.db.find_established_contract("0xdev").unwrap().unwrap();
    assert_eq!(again.agreement_accepted_time, accepted.agreement_accepted_time);
    assert_eq!(again.current_agreement_id, "ag1");
}

#[tokio::test(start_paused = true)]
async fn test_worker_registers_pending_and_honours_end_contract() {
    let f = fixture();
    let device = Arc::new(MockContract::new("0xdev"));
    device.set_value("get_owner", s("0xowner"));
    device.set_value("get_bank", s("0xbank"));
    device.set_value("in_contract", ContractValue::Bool(false));
    device.set_value("get_agreement_id", s(""));
    f.factory.prepare_deploy(Arc::clone(&device));
    f.registry.on_invoke(
        "register",
        "get_description",
        list(&["name", "rpi", "hourly_cost_bacon", "5"]),
    );
    f.db.save_pending_contract(&pending()).unwrap();

    let worker = Arc::new(BlockchainWorker::new(
        f.cfg.clone(),
        f.db.clone(),
        f.bus.clone(),
        f.factory.clone(),
    ));
    tokio::spawn(Arc::clone(&worker).run());
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(worker.is_loaded());
    assert!(f.db.find_pending_contracts().unwrap().is_empty());
    assert!(f.db.find_established_contract("0xdev").unwrap().is_some());

    f.db.contract_state_in_agreement("0xdev", "ag1", Default::default())
        .unwrap();
    device.set_value("get_agreement_id", s("ag1"));
    device.set_value("in_contract", ContractValue::Bool(true));
    device.set_value("get_container_provider", s("0xagbot"));
    device.on_invoke("reject_container", "get_agreement_id", s(""));
    device.on_invoke("reject_container", "in_contract", ContractValue::Bool(false));

    f.bus.publish(Message::EndContractRequested {
        cause: ContractEndCause::Terminated,
        contract_address: "0xdev".to_string(),
        agreement_id: "stale".to_string(),
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(device.call_count("reject_container"), 0);

    f.bus.publish(Message::EndContractRequested {
        cause: ContractEndCause::Terminated,
        contract_address: "0xdev".to_string(),
        agreement_id: "ag1".to_string(),
    });
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(device.call_count("reject_container"), 1);
    let record = f.db.find_established_contract("0xdev").unwrap().unwrap();
    assert!(record.current_agreement_id.is_empty());
    assert_eq!(record.previous_agreements, vec!["ag1".to_string()]);

    worker.stop();
}
