//! # Governance Worker
//!
//! Owns the lifecycle of every agreement and dependent service on the node.
//! Reacts to bus messages (translated into [`GovernanceCommand`]s) and runs
//! periodic backstops on the no-work tick.
//!
//! ```text
//!   MessageBus ──translate──▶ WorkerRuntime<GovernanceCommand>
//!                                   │ match command
//!          ┌────────────┬───────────┼─────────────┬───────────────┐
//!          ▼            ▼           ▼             ▼               ▼
//!     agreement     cancel     microservice     sweep         shutdown
//!   (protocol msgs, (idempotent (start, retry,  (agreement     (spawned,
//!    chain events)   teardown)   rollback,       timeouts,      10 steps)
//!                                upgrade)        maintenance)
//! ```
//!
//! ## Periodic work
//!
//! | Task | Interval |
//! |------|----------|
//! | agreement sweep | `governance_sweep_interval_s` |
//! | service maintenance | 60s |
//! | service upgrade check | `service_upgrade_check_interval_s` |
//! | service config state check | `service_config_state_check_interval_s` |
//! | device status report | `device_status_interval_s` |
//!
//! ## Invariants
//!
//! - Cancelling an agreement twice has no further effect.
//! - Per agreement and per instance failures are logged; neither the command
//!   loop nor the sweep exits on them.
//! - While shutting down, new proposals are ignored and exchange calls retry
//!   transient errors without limit.
//!
//! ## Safety
//!
//! - No `panic!`, `unwrap()`, `expect()`.

mod agreement;
mod cancel;
mod commands;
mod microservice;
mod shutdown;
mod sweep;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use anax_common::persistence::{ConfigState, EstablishedAgreement, EventSource, Severity};
use anax_common::{AgentDb, CommandHandler, DbError, MessageBus, WorkerError, WorkerRuntime};

use crate::config::AgentConfig;
use crate::exchange::{AgreementState, ExchangeApi, ExchangeError, RetryPolicy};
use crate::policy::PolicyError;
use crate::producer::{HandlerMap, ProtocolHandler};
use crate::signature::SignatureError;

pub use commands::{launch_failure_reason, translate, GovernanceCommand};
pub use microservice::{
    ms_reason_description, retry_budget, MS_CLEAR_OLD_AGS_FAILED, MS_DELETED_BY_AGREEMENT_ENDED,
    MS_DELETED_BY_DOWNGRADE_PROCESS, MS_DELETED_BY_UPGRADE_PROCESS, MS_EXEC_FAILED, MS_IMAGE_FETCH_FAILED,
    MS_IMAGE_LOAD_FAILED, MS_REREG_EXCH_FAILED, MS_UNREG_EXCH_FAILED,
};
pub use shutdown::{ShutdownError, ShutdownMode, SHUTDOWN_POLL_INTERVAL};
pub use sweep::{MAX_AGREEMENT_ACCEPTANCE_WAIT_TIME_S, MAX_CONTRACT_PRELAUNCH_TIME_S, MAX_CONTRACT_UNCONFIGURED_TIME_S};

const NO_WORK_INTERVAL: Duration = Duration::from_secs(10);
const SERVICE_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("no protocol handler for {0}")]
    UnknownProtocol(String),

    #[error("service {0} not found in the exchange")]
    ServiceNotFound(String),

    #[error("service definition {0} not found")]
    DefinitionNotFound(String),

    #[error("service instance {0} not found")]
    InstanceNotFound(String),
}

/// When each periodic task last ran.
#[derive(Debug)]
struct Schedule {
    sweep: Instant,
    maintenance: Instant,
    upgrade_check: Instant,
    config_state_check: Instant,
    status_report: Instant,
}

impl Schedule {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            sweep: now,
            maintenance: now,
            upgrade_check: now,
            config_state_check: now,
            status_report: now,
        }
    }
}

/// Whether `interval` has passed since `last`; restarts the clock if so.
fn due(last: &mut Instant, interval: Duration, now: Instant) -> bool {
    if now.duration_since(*last) >= interval {
        *last = now;
        true
    } else {
        false
    }
}

pub struct GovernanceWorker {
    runtime: WorkerRuntime<GovernanceCommand>,
    me: Weak<GovernanceWorker>,
    config: AgentConfig,
    db: AgentDb,
    exchange: Arc<dyn ExchangeApi>,
    handlers: HandlerMap,
    retry: RetryPolicy,
    shutting_down: AtomicBool,
    schedule: Mutex<Schedule>,
}

impl std::fmt::Debug for GovernanceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceWorker")
            .field("runtime", &self.runtime)
            .field("protocols", &self.handlers.keys().collect::<Vec<_>>())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl GovernanceWorker {
    /// # Guarantees
    ///
    /// - Does NOT subscribe to the bus
    /// - Does NOT contact the exchange
    pub fn new(
        config: AgentConfig,
        db: AgentDb,
        bus: MessageBus,
        exchange: Arc<dyn ExchangeApi>,
        handlers: HandlerMap,
    ) -> Arc<Self> {
        let retry = RetryPolicy::bounded(config.exchange_retry_interval(), config.exchange_retry_count);
        Arc::new_cyclic(|me| Self {
            runtime: WorkerRuntime::new("governance", bus, config.command_queue_depth),
            me: me.clone(),
            config,
            db,
            exchange,
            handlers,
            retry,
            shutting_down: AtomicBool::new(false),
            schedule: Mutex::new(Schedule::new()),
        })
    }

    pub fn runtime(&self) -> &WorkerRuntime<GovernanceCommand> {
        &self.runtime
    }

    pub fn db(&self) -> &AgentDb {
        &self.db
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Subscribe to the bus and handle commands until stopped.
    pub async fn run(self: Arc<Self>) -> Result<(), WorkerError> {
        self.runtime.subscribe(translate);
        match self.db.find_device() {
            Ok(Some(device)) if device.config_state == ConfigState::Configured => {
                if let Err(e) = self.runtime.try_submit(GovernanceCommand::StartAgreementLessServices) {
                    warn!("unable to queue agreement-less services: {}", e);
                }
            }
            Ok(_) => debug!("node not configured yet"),
            Err(e) => warn!("unable to read node registration: {}", e),
        }
        self.runtime.run(self.as_ref(), NO_WORK_INTERVAL).await
    }

    pub fn stop(&self) {
        self.runtime.stop();
    }

    fn handler(&self, protocol: &str) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.get(protocol).cloned()
    }

    /// Exchange retry policy; unbounded once shutdown has begun.
    fn retry_policy(&self) -> RetryPolicy {
        if self.is_shutting_down() {
            RetryPolicy::unbounded(self.config.exchange_retry_interval())
        } else {
            self.retry
        }
    }

    fn log(&self, severity: Severity, source: EventSource, code: &str, msg: String) {
        self.db.log_event(severity, source, code, msg);
    }

    /// Tell the exchange where the agreement stands. Failures are logged.
    async fn record_agreement_state(&self, agreement: &EstablishedAgreement, state: &str) {
        let body = AgreementState {
            state: state.to_string(),
            service: agreement.running_workload.clone(),
        };
        let retry = self.retry_policy();
        if let Err(e) = crate::exchange::retry_transient(&retry, "agreement state", || {
            self.exchange.put_agreement_state(&agreement.current_agreement_id, &body)
        })
        .await
        {
            warn!(
                "unable to record state {:?} of {} in the exchange: {}",
                state, agreement.current_agreement_id, e
            );
        }
    }

    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(fut.instrument(self.runtime.span().clone()));
    }
}

#[async_trait]
impl CommandHandler<GovernanceCommand> for GovernanceWorker {
    async fn handle_command(&self, command: GovernanceCommand) {
        debug!("handling {}", command.kind());
        match command {
            GovernanceCommand::StartGovernExecution { agreement_id, protocol } => {
                self.start_govern_execution(&agreement_id, &protocol).await
            }
            GovernanceCommand::CleanupExecution {
                agreement_id,
                protocol,
                reason,
            } => {
                self.cancel_for_reason(&agreement_id, Some(protocol.as_str()), reason).await;
            }
            GovernanceCommand::ExchangeMessage {
                envelope,
                protocol_message,
            } => self.handle_exchange_message(&envelope, &protocol_message).await,
            GovernanceCommand::BlockchainEvent {
                chain_type,
                chain_name,
                raw_event,
            } => self.handle_blockchain_event(&chain_type, &chain_name, &raw_event).await,
            GovernanceCommand::CleanupStatus {
                agreement_id,
                protocol,
                status,
            } => self.cleanup_status(&agreement_id, &protocol, status),
            GovernanceCommand::BlockchainInitialized(chain) => {
                info!("blockchain client {}/{} ready", chain.chain_type, chain.chain_name);
                for h in self.handlers.values() {
                    h.set_blockchain_available(&chain);
                }
            }
            GovernanceCommand::BlockchainStopping(chain) => {
                info!("blockchain client {}/{} stopping", chain.chain_type, chain.chain_name);
                for h in self.handlers.values() {
                    h.set_blockchain_not_available(&chain);
                }
            }
            GovernanceCommand::BlockchainWritable(chain) => {
                for h in self.handlers.values() {
                    h.set_blockchain_writable(&chain);
                }
            }
            GovernanceCommand::AsyncTermination {
                agreement_id,
                protocol,
                reason,
            } => self.async_termination(&agreement_id, &protocol, reason),
            GovernanceCommand::DeleteExchangeAgreement { agreement_id } => {
                self.retry_exchange_agreement_delete(&agreement_id).await
            }
            GovernanceCommand::UpdateMicroservice { instance_key, event } => {
                self.update_microservice(&instance_key, event).await
            }
            GovernanceCommand::UpgradeMicroservice { definition_id } => {
                self.handle_microservice_upgrade(&definition_id).await
            }
            GovernanceCommand::ReportDeviceStatus => self.report_device_status().await,
            GovernanceCommand::NodeShutdown { remove_node } => {
                self.start_shutdown(ShutdownMode::Unconfigure { remove_node })
            }
            GovernanceCommand::StartAgreementLessServices => self.start_agreement_less_services().await,
            GovernanceCommand::NodeHeartbeatRestored => self.handle_heartbeat_restored().await,
            GovernanceCommand::NodePolicyChanged => self.handle_node_policy_changed().await,
            GovernanceCommand::NodeUserInputChanged { services } => {
                self.handle_user_input_changed(&services).await
            }
            GovernanceCommand::NodePatternChanged { pattern } => self.handle_pattern_changed(&pattern),
            GovernanceCommand::ServiceSuspended { services } => self.handle_service_suspended(&services).await,
        }
    }

    async fn no_work(&self) {
        if self.is_shutting_down() {
            return;
        }
        let now = Instant::now();
        let (sweep, maintenance, upgrade, config_state, status) = {
            let mut s = self.schedule.lock();
            let upgrade_interval = self.config.service_upgrade_check_interval();
            (
                due(&mut s.sweep, self.config.governance_sweep_interval(), now),
                due(&mut s.maintenance, SERVICE_MAINTENANCE_INTERVAL, now),
                upgrade_interval.is_some_and(|i| due(&mut s.upgrade_check, i, now)),
                due(
                    &mut s.config_state_check,
                    Duration::from_secs(self.config.service_config_state_check_interval_s),
                    now,
                ),
                due(
                    &mut s.status_report,
                    Duration::from_secs(self.config.device_status_interval_s),
                    now,
                ),
            )
        };

        if sweep {
            self.govern_agreements(anax_common::persistence::now_secs()).await;
        }
        if maintenance || upgrade {
            self.govern_microservices(upgrade);
        }
        if config_state {
            self.check_service_config_states().await;
        }
        if status {
            self.report_device_status().await;
        }
    }
}
