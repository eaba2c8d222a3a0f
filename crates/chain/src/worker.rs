//! # Blockchain Worker
//!
//! Long-lived subsystem that keeps device contracts in line with the chain.
//!
//! ```text
//!   run()
//!     │ loader: bind directory, registry, token bank (retry every 10s)
//!     ├──▶ pending loop     every 1s   KeyedTaskSet<name> ─▶ register_pending
//!     ├──▶ established loop every 500ms, one contract per eval interval
//!     └──▶ WorkerRuntime::run(commands: EndContract | Shutdown)
//! ```
//!
//! ## Invariants
//!
//! - A pending contract has at most one registration task at a time, and
//!   is never registered again once registration succeeded.
//! - An `EndContract` command is refused when the contract's recorded
//!   agreement differs from the command's.
//! - Per-contract errors are logged; the loops never exit on them.
//!
//! ## Safety
//!
//! - No `panic!`, `unwrap()`, `expect()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use anax_common::events::{ContractEndCause, Message};
use anax_common::{AgentDb, CommandHandler, KeyedTaskSet, MessageBus, SpawnOutcome, WorkerError, WorkerRuntime};

use crate::config::ChainConfig;
use crate::contract::{ContractClient, ContractFactory, ContractResult};
use crate::registry::{load_directory, DeviceContracts, REJECT_METHOD};

pub const LOADER_RETRY_INTERVAL: Duration = Duration::from_secs(10);
pub const PENDING_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const ESTABLISHED_PASS_INTERVAL: Duration = Duration::from_millis(500);

const COMMAND_QUEUE_DEPTH: usize = 100;
const NO_WORK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockchainCommand {
    EndContract {
        cause: ContractEndCause,
        contract_address: String,
        agreement_id: String,
    },
    /// Stop polling; the node is shutting down.
    Shutdown,
}

fn translate(msg: &Message) -> Vec<BlockchainCommand> {
    match msg {
        Message::EndContractRequested {
            cause,
            contract_address,
            agreement_id,
        } => vec![BlockchainCommand::EndContract {
            cause: *cause,
            contract_address: contract_address.clone(),
            agreement_id: agreement_id.clone(),
        }],
        Message::AllBlockchainShutdown => vec![BlockchainCommand::Shutdown],
        _ => vec![],
    }
}

fn end_method(cause: ContractEndCause) -> &'static str {
    match cause {
        ContractEndCause::Terminated | ContractEndCause::Error => REJECT_METHOD,
    }
}

pub struct BlockchainWorker {
    runtime: WorkerRuntime<BlockchainCommand>,
    config: ChainConfig,
    db: AgentDb,
    factory: Arc<dyn ContractFactory>,
    contracts: RwLock<Option<Arc<DeviceContracts>>>,
    pending: KeyedTaskSet<String>,
    cache: Mutex<HashMap<String, Arc<dyn ContractClient>>>,
    stopping: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for BlockchainWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainWorker")
            .field("runtime", &self.runtime)
            .field("loaded", &self.contracts.read().is_some())
            .field("cached_contracts", &self.cache.lock().len())
            .finish()
    }
}

impl BlockchainWorker {
    /// # Guarantees
    ///
    /// - Does NOT contact the chain
    /// - Does NOT spawn any tasks
    pub fn new(config: ChainConfig, db: AgentDb, bus: MessageBus, factory: Arc<dyn ContractFactory>) -> Self {
        let runtime = WorkerRuntime::new("blockchain", bus, COMMAND_QUEUE_DEPTH);
        let pending = KeyedTaskSet::new(config.max_concurrent_registrations, runtime.span().clone());
        Self {
            runtime,
            config,
            db,
            factory,
            contracts: RwLock::new(None),
            pending,
            cache: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
        }
    }

    pub fn runtime(&self) -> &WorkerRuntime<BlockchainCommand> {
        &self.runtime
    }

    pub fn is_loaded(&self) -> bool {
        self.contracts.read().is_some()
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Load contracts, start the polling loops and handle commands until
    /// stopped.
    pub async fn run(self: Arc<Self>) -> Result<(), WorkerError> {
        self.runtime.subscribe(translate);
        let span = self.runtime.span().clone();

        if !self.clone().load_contracts().instrument(span.clone()).await {
            return Ok(());
        }

        tokio::spawn(Arc::clone(&self).poll_pending_contracts().instrument(span.clone()));
        tokio::spawn(Arc::clone(&self).process_established_contracts().instrument(span));

        self.runtime.run(self.as_ref(), NO_WORK_INTERVAL).await
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
        self.runtime.stop();
    }

    /// Resolves once `stop` has been called, even if that was earlier.
    async fn stopped(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Retry until the shared contracts resolve. False if stopped first.
    async fn load_contracts(self: Arc<Self>) -> bool {
        info!("starting blockchain contract loader");
        loop {
            if self.is_stopping() {
                return false;
            }
            match load_directory(self.factory.as_ref(), &self.config).await {
                Ok(dir) => {
                    *self.contracts.write() = Some(Arc::new(DeviceContracts::new(
                        self.db.clone(),
                        self.runtime.bus().clone(),
                        Arc::clone(&self.factory),
                        &self.config.account_id,
                        dir,
                    )));
                    info!("finished loading smart contracts");
                    let chain = self.config.chain_id();
                    self.runtime.publish(Message::BlockchainClientInitialized(chain.clone()));
                    self.runtime.publish(Message::BlockchainWritable(chain));
                    return true;
                }
                Err(e) => debug!("contract loader: {}", e),
            }
            tokio::select! {
                _ = self.stopped() => return false,
                _ = tokio::time::sleep(LOADER_RETRY_INTERVAL) => {}
            }
        }
    }

    fn device_contracts(&self) -> Option<Arc<DeviceContracts>> {
        self.contracts.read().clone()
    }

    async fn poll_pending_contracts(self: Arc<Self>) {
        debug!("polling pending contracts");
        while !self.is_stopping() {
            self.schedule_pending();
            tokio::select! {
                _ = self.stopped() => break,
                _ = tokio::time::sleep(PENDING_POLL_INTERVAL) => {}
            }
        }
        debug!("pending contract loop stopped");
    }

    fn schedule_pending(&self) {
        let Some(contracts) = self.device_contracts() else {
            return;
        };
        let pending = match self.db.find_pending_contracts() {
            Ok(p) => p,
            Err(e) => {
                error!("unable to read pending contracts: {}", e);
                return;
            }
        };
        for p in pending {
            let contracts = Arc::clone(&contracts);
            let name = p.name.clone();
            let outcome = self.pending.try_spawn(name.clone(), async move {
                contracts.register_pending(&p).await.map(|_| ())
            });
            match outcome {
                SpawnOutcome::Spawned => debug!("scheduled registration of pending contract {}", name),
                SpawnOutcome::AtCapacity => debug!("registration slots busy, {} waits", name),
                SpawnOutcome::AlreadyTracked => {}
            }
        }
    }

    async fn process_established_contracts(self: Arc<Self>) {
        let gap = self.config.contract_eval_interval();
        while !self.is_stopping() {
            let records = match self.db.find_established_contracts(true) {
                Ok(r) => r,
                Err(e) => {
                    error!("unable to read established contracts: {}", e);
                    Vec::new()
                }
            };
            debug!("fetched {} established contracts", records.len());

            for record in records {
                if let Err(e) = self.evaluate_one(&record.contract_address).await {
                    error!("unable to operate on contract {}: {}", record.contract_address, e);
                }
                tokio::select! {
                    _ = self.stopped() => return,
                    _ = tokio::time::sleep(gap) => {}
                }
                if self.is_stopping() {
                    return;
                }
            }

            tokio::select! {
                _ = self.stopped() => break,
                _ = tokio::time::sleep(ESTABLISHED_PASS_INTERVAL) => {}
            }
        }
        debug!("established contract loop stopped");
    }

    /// Re-read the record so an update made since the pass started is seen.
    async fn evaluate_one(&self, address: &str) -> ContractResult<()> {
        let Some(contracts) = self.device_contracts() else {
            return Ok(());
        };
        let Some(record) = self.db.find_established_contract(address)? else {
            return Ok(());
        };
        if record.archived {
            return Ok(());
        }
        let contract = self.cached_contract(&contracts, address).await?;
        contracts.evaluate_contract_changes(&record, contract.as_ref()).await
    }

    async fn cached_contract(
        &self,
        contracts: &DeviceContracts,
        address: &str,
    ) -> ContractResult<Arc<dyn ContractClient>> {
        if let Some(c) = self.cache.lock().get(address) {
            return Ok(Arc::clone(c));
        }
        let loaded = contracts.device_contract(address).await?;
        self.cache
            .lock()
            .insert(address.to_string(), Arc::clone(&loaded));
        Ok(loaded)
    }

    async fn end_contract(&self, cause: ContractEndCause, address: &str, agreement_id: &str) -> ContractResult<()> {
        let Some(contracts) = self.device_contracts() else {
            warn!("contracts not loaded, cannot end {}", address);
            return Ok(());
        };
        let Some(record) = self.db.find_established_contract(address)?.filter(|c| !c.archived) else {
            error!("no matching contract record for {}", address);
            return Ok(());
        };
        if !record.current_agreement_id.is_empty() && record.current_agreement_id != agreement_id {
            info!(
                "refusing to end agreement {} on {}: current agreement is {}",
                agreement_id, address, record.current_agreement_id
            );
            return Ok(());
        }

        let method = end_method(cause);
        let contract = self.cached_contract(&contracts, address).await?;
        contracts.end_contract(contract.as_ref(), method, agreement_id).await?;
        info!("ended agreement {} on {} using {}", agreement_id, address, method);
        Ok(())
    }
}

#[async_trait]
impl CommandHandler<BlockchainCommand> for BlockchainWorker {
    async fn handle_command(&self, command: BlockchainCommand) {
        debug!("received command {:?}", command);
        match command {
            BlockchainCommand::EndContract {
                cause,
                contract_address,
                agreement_id,
            } => {
                if let Err(e) = self.end_contract(cause, &contract_address, &agreement_id).await {
                    error!(
                        "failed ending agreement {} on {}: {}",
                        agreement_id, contract_address, e
                    );
                }
            }
            BlockchainCommand::Shutdown => {
                info!("blockchain shutdown requested");
                self.runtime
                    .publish(Message::BlockchainClientStopping(self.config.chain_id()));
                self.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_maps_only_blockchain_messages() {
        let cmds = translate(&Message::EndContractRequested {
            cause: ContractEndCause::Error,
            contract_address: "0xdev".to_string(),
            agreement_id: "ag1".to_string(),
        });
        assert_eq!(cmds.len(), 1);
        assert_eq!(translate(&Message::AllBlockchainShutdown), vec![BlockchainCommand::Shutdown]);
        assert!(translate(&Message::NodePolicyChanged).is_empty());
    }

    #[test]
    fn test_every_cause_rejects_container() {
        assert_eq!(end_method(ContractEndCause::Terminated), "reject_container");
        assert_eq!(end_method(ContractEndCause::Error), "reject_container");
    }
}
