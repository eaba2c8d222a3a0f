//! # Device Contract Flows
//!
//! Registration of pending device contracts and evaluation of established
//! ones against on-chain state.
//!
//! ## Registration
//!
//! ```text
//! deploy container_executor ─▶ get_owner check ─▶ set_bank / poll get_bank
//!   ─▶ registry.register(attrs) ─▶ verify_change(get_description)
//!   ─▶ promote pending → established (one txn) ─▶ ContractRegistered
//! ```
//!
//! ## Evaluation
//!
//! | on chain                           | local record         | action                        |
//! |------------------------------------|----------------------|-------------------------------|
//! | `in_contract == false`             | has agreement        | reset record, `ContractEnded` |
//! | in contract, proposer accepted     | not accepted         | mark accepted                 |
//! | in contract, id differs            | has agreement        | reset record, `ContractEnded` |
//! | in contract, new id, escrow ≥ ask  | no agreement         | vote, record, `ContractAccepted` |
//! | in contract, new id, escrow < ask  | no agreement         | `reject_container`            |
//! | in contract, empty id              | any                  | error, retried next pass      |
//!
//! Errors never stop the caller's loop; the next pass re-reads everything.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use anax_common::events::Message;
use anax_common::persistence::{EstablishedContract, PendingContract};
use anax_common::{AgentDb, MessageBus};

use crate::config::ChainConfig;
use crate::contract::{
    extract_all, extract_attr, ContractClient, ContractError, ContractFactory, ContractResult, ContractValue,
    ZERO_ADDRESS,
};
use crate::reconciler::{
    verify_change, DescriptionChanged, PollOutcome, AGREEMENT_ID_CHANGED, WRITE_POLL_INTERVAL, WRITE_POLL_TIMEOUT_S,
};

pub const DEVICE_CONTRACT: &str = "container_executor";
pub const DIRECTORY_CONTRACT: &str = "directory";
pub const TOKEN_BANK: &str = "token_bank";
pub const DEVICE_REGISTRY: &str = "device_registry";

/// Method that withdraws the device from its current agreement.
pub const REJECT_METHOD: &str = "reject_container";

const HOURLY_COST_ATTR: &str = "hourly_cost_bacon";

/// Shared contracts resolved through the directory at startup.
#[derive(Clone)]
pub struct DirectoryContracts {
    pub directory: Arc<dyn ContractClient>,
    pub registry: Arc<dyn ContractClient>,
    pub bank: Arc<dyn ContractClient>,
}

/// Bind the directory contract and resolve the registry and token bank from it.
pub async fn load_directory(factory: &dyn ContractFactory, cfg: &ChainConfig) -> ContractResult<DirectoryContracts> {
    let directory = factory
        .at(DIRECTORY_CONTRACT, &cfg.account_id, &cfg.directory_address)
        .await?;

    let mut resolve = Vec::with_capacity(2);
    for name in [DEVICE_REGISTRY, TOKEN_BANK] {
        let address = directory
            .invoke_method(
                "get_entry_by_version",
                vec![ContractValue::str(name), ContractValue::str(cfg.directory_version.as_str())],
            )
            .await?
            .expect_str("get_entry_by_version")?;
        if address.is_empty() || address == ZERO_ADDRESS {
            return Err(ContractError::NotFound(format!("{} not in directory", name)));
        }
        resolve.push(factory.at(name, &cfg.account_id, &address).await?);
    }
    let bank = resolve.pop().ok_or_else(|| ContractError::NotFound(TOKEN_BANK.to_string()))?;
    let registry = resolve
        .pop()
        .ok_or_else(|| ContractError::NotFound(DEVICE_REGISTRY.to_string()))?;

    Ok(DirectoryContracts {
        directory,
        registry,
        bank,
    })
}

// ════════════════════════════════════════════════════════════════════════════
// DEVICE CONTRACTS
// ════════════════════════════════════════════════════════════════════════════

pub struct DeviceContracts {
    db: AgentDb,
    bus: MessageBus,
    factory: Arc<dyn ContractFactory>,
    account_id: String,
    dir: DirectoryContracts,
}

impl DeviceContracts {
    pub fn new(
        db: AgentDb,
        bus: MessageBus,
        factory: Arc<dyn ContractFactory>,
        account_id: &str,
        dir: DirectoryContracts,
    ) -> Self {
        Self {
            db,
            bus,
            factory,
            account_id: account_id.to_string(),
            dir,
        }
    }

    /// Bind a device contract by address.
    pub async fn device_contract(&self, address: &str) -> ContractResult<Arc<dyn ContractClient>> {
        self.factory.at(DEVICE_CONTRACT, &self.account_id, address).await
    }

    // ------------------------------------------------------------------------
    // registration
    // ------------------------------------------------------------------------

    /// Deploy, wire up and register `pending`, then promote it locally.
    pub async fn register_pending(&self, pending: &PendingContract) -> ContractResult<EstablishedContract> {
        info!("starting registration of pending contract {}", pending.name);

        let contract = self.deploy_device_contract().await?;
        self.connect_token_bank(contract.as_ref()).await?;
        self.register_in_directory(contract.as_ref(), pending).await?;

        let address = contract.contract_address();
        let established = self.db.promote_pending_contract(pending, &address)?;
        self.bus.publish(Message::ContractRegistered {
            name: pending.name.clone(),
            contract_address: address.clone(),
        });
        info!("registered pending contract {} at {}", pending.name, address);
        Ok(established)
    }

    async fn deploy_device_contract(&self) -> ContractResult<Arc<dyn ContractClient>> {
        let contract = self.factory.deploy(DEVICE_CONTRACT, &self.account_id).await?;
        info!("{} deployed at {}", DEVICE_CONTRACT, contract.contract_address());

        let owner = contract
            .invoke_method("get_owner", vec![])
            .await?
            .expect_str("get_owner")?;
        if strip_hex(&owner) != strip_hex(&self.account_id) {
            return Err(ContractError::Deploy(format!(
                "wrong owner returned: {} should be {}",
                owner, self.account_id
            )));
        }
        Ok(contract)
    }

    async fn connect_token_bank(&self, contract: &dyn ContractClient) -> ContractResult<()> {
        let bank_address = self.dir.bank.contract_address();
        contract
            .invoke_method("set_bank", vec![ContractValue::str(bank_address.as_str())])
            .await?;

        let deadline = Instant::now() + Duration::from_secs(WRITE_POLL_TIMEOUT_S);
        loop {
            if Instant::now() > deadline {
                return Err(ContractError::WriteNotObserved {
                    address: contract.contract_address(),
                    reason: "get_bank still unset".to_string(),
                });
            }
            let echo = contract
                .invoke_method("get_bank", vec![])
                .await?
                .expect_str("get_bank")?;
            if !echo.is_empty() && echo != ZERO_ADDRESS {
                info!("device using bank at {}", echo);
                break;
            }
            tokio::time::sleep(WRITE_POLL_INTERVAL).await;
        }

        let balance = self.dir.bank.invoke_method("account_balance", vec![]).await?;
        info!("owner bacon balance is {}", balance);
        Ok(())
    }

    async fn register_in_directory(&self, contract: &dyn ContractClient, pending: &PendingContract) -> ContractResult<()> {
        let address = contract.contract_address();
        let mut attrs: Vec<String> = vec![
            "name".into(),
            pending.name.clone(),
            "arch".into(),
            pending.arch.clone(),
            "cpus".into(),
            pending.cpus.to_string(),
            "ram".into(),
            pending.ram.to_string(),
            HOURLY_COST_ATTR.into(),
            pending.hourly_cost_bacon.to_string(),
            "is_loc_enabled".into(),
            pending.is_loc_enabled.to_string(),
        ];
        for (k, v) in &pending.app_attributes {
            attrs.push(k.clone());
            attrs.push(v.clone());
        }
        debug!("contract attributes to register: {:?}", attrs);

        let registry = self.dir.registry.as_ref();
        registry
            .invoke_method(
                "register",
                vec![ContractValue::str(address.as_str()), ContractValue::StrList(attrs)],
            )
            .await?;

        let key = [ContractValue::str(address.as_str())];
        let outcome = verify_change(&DescriptionChanged, registry, &key, &ContractValue::StrList(vec![])).await?;
        if outcome == PollOutcome::TimedOut {
            warn!("registration of {} not yet visible, checking attributes anyway", address);
        }

        let description = registry
            .invoke_method("get_description", key.to_vec())
            .await?
            .expect_list("get_description")?;
        if extract_attr(&description, HOURLY_COST_ATTR).is_none() {
            return Err(ContractError::Inconsistent(format!(
                "{} missing from device registry for {}",
                HOURLY_COST_ATTR, address
            )));
        }
        info!("device registered with {:?}", description);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // evaluation
    // ------------------------------------------------------------------------

    /// Bring `record` in line with what `contract` reports on chain.
    pub async fn evaluate_contract_changes(
        &self,
        record: &EstablishedContract,
        contract: &dyn ContractClient,
    ) -> ContractResult<()> {
        debug!("evaluating changes on contract {}", record.contract_address);

        let top_agreement_id = contract
            .invoke_method("get_agreement_id", vec![])
            .await?
            .expect_str("get_agreement_id")?;
        let in_contract = contract
            .invoke_method("in_contract", vec![])
            .await?
            .expect_bool("in_contract")?;

        if !in_contract {
            return self.end_db_contract(record, &top_agreement_id);
        }
        if top_agreement_id.is_empty() {
            return Err(ContractError::Inconsistent(format!(
                "in_contract is true for {} but agreement id is empty",
                record.contract_address
            )));
        }

        if self
            .handle_accepted_state(record, &top_agreement_id, contract)
            .await?
        {
            return Ok(());
        }
        self.handle_agreement_change(record, &top_agreement_id, contract)
            .await
    }

    /// Record the counterparty's acceptance. Returns true when newly accepted.
    async fn handle_accepted_state(
        &self,
        record: &EstablishedContract,
        top_agreement_id: &str,
        contract: &dyn ContractClient,
    ) -> ContractResult<bool> {
        let provider = contract
            .invoke_method("get_container_provider", vec![])
            .await?
            .expect_str("get_container_provider")?;
        let agreement_id = contract
            .invoke_method("get_agreement_id", vec![])
            .await?
            .expect_str("get_agreement_id")?;
        if agreement_id != top_agreement_id {
            info!(
                "agreement on {} moved during evaluation, skipping acceptance check",
                record.contract_address
            );
            return Ok(false);
        }

        let accepted = self
            .dir
            .bank
            .invoke_method("get_proposer_accepted", self.proposal_params(&provider, record))
            .await?
            .expect_bool("get_proposer_accepted")?;
        if accepted && record.agreement_accepted_time == 0 {
            self.db.contract_state_accepted(&record.contract_address)?;
            info!("agreement {} accepted on {}", top_agreement_id, record.contract_address);
            return Ok(true);
        }
        Ok(false)
    }

    async fn handle_agreement_change(
        &self,
        record: &EstablishedContract,
        top_agreement_id: &str,
        contract: &dyn ContractClient,
    ) -> ContractResult<()> {
        if !record.current_agreement_id.is_empty() {
            if record.current_agreement_id != top_agreement_id {
                debug!(
                    "chain agreement {} differs from local {}",
                    top_agreement_id, record.current_agreement_id
                );
                self.end_db_contract(record, top_agreement_id)?;
            }
            return Ok(());
        }

        info!("contract {} has new agreement {}", record.contract_address, top_agreement_id);
        let provider = contract
            .invoke_method("get_container_provider", vec![])
            .await?
            .expect_str("get_container_provider")?;

        let escrow = self
            .dir
            .bank
            .invoke_method("get_escrow_amount", self.proposal_params(&provider, record))
            .await?
            .expect_u64("get_escrow_amount")?;
        let ask = self.hourly_cost(&record.contract_address).await?;

        if ask > escrow {
            self.end_contract(contract, REJECT_METHOD, top_agreement_id).await?;
            info!(
                "rejected agreement on {} by {}: proposed {} below ask {}",
                record.contract_address, provider, escrow, ask
            );
            return Ok(());
        }

        info!(
            "escrow {} meets ask {}, voting to accept agreement {} on {}",
            escrow, ask, top_agreement_id, record.contract_address
        );
        self.dir
            .bank
            .invoke_method(
                "counter_party_vote",
                vec![
                    ContractValue::str(provider.as_str()),
                    ContractValue::str(record.contract_address.as_str()),
                    ContractValue::Bool(true),
                ],
            )
            .await?;

        let current = contract
            .invoke_method("get_agreement_id", vec![])
            .await?
            .expect_str("get_agreement_id")?;
        let env = self.prep_environment_additions(record, &current).await?;
        let updated = self
            .db
            .contract_state_in_agreement(&record.contract_address, &current, env)?;

        self.bus.publish(Message::ContractAccepted {
            contract_address: updated.contract_address,
            agreement_id: current,
        });
        Ok(())
    }

    async fn hourly_cost(&self, address: &str) -> ContractResult<u64> {
        let attrs = self
            .dir
            .registry
            .invoke_method("get_description", vec![ContractValue::str(address)])
            .await?
            .expect_list("get_description")?;
        let raw = extract_attr(&attrs, HOURLY_COST_ATTR).ok_or_else(|| {
            ContractError::Inconsistent(format!("{} missing from device registry", HOURLY_COST_ATTR))
        })?;
        raw.parse::<u64>()
            .map_err(|e| ContractError::Inconsistent(format!("bogus {} {:?}: {}", HOURLY_COST_ATTR, raw, e)))
    }

    /// Workload environment for an agreement on `record`: registered
    /// attributes and private attributes as `MTN_<KEY>`, plus the contract
    /// address and agreement id.
    pub async fn prep_environment_additions(
        &self,
        record: &EstablishedContract,
        agreement_id: &str,
    ) -> ContractResult<BTreeMap<String, String>> {
        let attrs = self
            .dir
            .registry
            .invoke_method(
                "get_description",
                vec![ContractValue::str(record.contract_address.as_str())],
            )
            .await?
            .expect_list("get_description")?;

        let mut env = BTreeMap::new();
        let public = extract_all(&attrs);
        for (key, val) in public.iter().chain(record.private_environment_additions.iter()) {
            if !val.is_empty() {
                env.insert(format!("MTN_{}", key.to_uppercase()), val.clone());
            }
        }
        env.insert("MTN_CONTRACT".to_string(), record.contract_address.clone());
        env.insert("MTN_AGREEMENTID".to_string(), agreement_id.to_string());
        Ok(env)
    }

    /// Reset the local record when it still holds an agreement the chain has
    /// dropped.
    fn end_db_contract(&self, record: &EstablishedContract, top_agreement_id: &str) -> ContractResult<()> {
        if record.current_agreement_id.is_empty() {
            return Ok(());
        }
        self.db.contract_state_new(&record.contract_address)?;
        debug!(
            "cleared agreement {} on {} (chain reports {:?})",
            record.current_agreement_id, record.contract_address, top_agreement_id
        );
        self.bus.publish(Message::ContractEnded {
            contract_address: record.contract_address.clone(),
            agreement_id: record.current_agreement_id.clone(),
        });
        Ok(())
    }

    /// Invoke `method` on `contract` and wait for `agreement_id` to leave it.
    ///
    /// This does not tear down workloads. The evaluation loop notices the
    /// change and publishes the events that do.
    pub async fn end_contract(
        &self,
        contract: &dyn ContractClient,
        method: &str,
        agreement_id: &str,
    ) -> ContractResult<()> {
        let address = contract.contract_address();
        contract.invoke_method(method, vec![]).await?;

        let outcome = verify_change(&AGREEMENT_ID_CHANGED, contract, &[], &ContractValue::str(agreement_id)).await?;
        if outcome == PollOutcome::TimedOut {
            warn!("agreement {} still current on {} after {}", agreement_id, address, method);
        }
        info!("ended contract {} with {}", address, method);
        self.db.contract_state_new(&address)?;
        Ok(())
    }

    fn proposal_params(&self, provider: &str, record: &EstablishedContract) -> Vec<ContractValue> {
        vec![
            ContractValue::str(provider),
            ContractValue::str(self.account_id.as_str()),
            ContractValue::str(record.contract_address.as_str()),
        ]
    }
}

fn strip_hex(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}
