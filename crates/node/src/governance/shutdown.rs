//! # Node Shutdown
//!
//! Quiesces the node in strict order. Each step completes before the next
//! begins; the first error skips to the completion step.
//!
//! | Step | Action |
//! |------|--------|
//! | 1 | require a registration, mark it unconfiguring |
//! | 2 | clear pattern and registered services in the exchange |
//! | 3 | cancel every agreement, wait until none is unarchived |
//! | 4 | clear the messaging key in the exchange and on disk |
//! | 5 | stop exchange change polling and blockchain clients |
//! | 6 | clean up remaining service instances, wait, archive definitions |
//! | 7 | delete workload config, attributes and policy files |
//! | 8 | delete the node from the exchange, if asked |
//! | 9 | delete the registration (or switch pattern) |
//! | 10 | publish `NodeShutdownComplete` |
//!
//! The drain waits of steps 3 and 6 have no upper bound. Exchange calls
//! retry transient errors without limit once shutdown has begun.
//!
//! In pattern change mode user input survives, and step 9 keeps the
//! registration with the new pattern and `config_state = unconfigured`.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use anax_common::events::Message;
use anax_common::persistence::eventlog::{EC_ERROR_NODE_UNREG, EC_NODE_UNREG_COMPLETE, EC_START_NODE_UNREG};
use anax_common::persistence::{AgreementFilter, ConfigState, DefinitionFilter, EventSource, InstanceFilter, Severity};
use anax_common::DbError;

use super::{GovernanceWorker, MS_DELETED_BY_AGREEMENT_ENDED};
use crate::exchange::{retry_transient, ExchangeError, ExchangeResult, PatchDeviceRequest};
use crate::producer::TermReason;

/// How often the drain steps re-check the database.
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(15);

const POLICY_FILE_SUFFIX: &str = ".policy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Operator unconfigure; optionally remove the node from the exchange.
    Unconfigure { remove_node: bool },
    /// The node is switching to the saved pattern.
    PatternChange,
}

impl ShutdownMode {
    fn termination_reason(&self) -> TermReason {
        match self {
            ShutdownMode::Unconfigure { .. } => TermReason::NodeShutdown,
            ShutdownMode::PatternChange => TermReason::NodePatternChanged,
        }
    }

    fn keeps_user_input(&self) -> bool {
        matches!(self, ShutdownMode::PatternChange)
    }
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("node is not registered")]
    NotRegistered,

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("unable to remove {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn remove_path(path: &Path) -> Result<(), ShutdownError> {
    let res = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match res {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ShutdownError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn remove_policy_files(dir: &Path) -> Result<usize, ShutdownError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(ShutdownError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.to_string_lossy().ends_with(POLICY_FILE_SUFFIX) {
            remove_path(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// A node the exchange no longer knows cannot be cleaned up further there.
fn tolerate_missing_node(res: ExchangeResult<()>, what: &str) -> ExchangeResult<()> {
    match res {
        Err(ExchangeError::Unauthorized(msg)) => {
            warn!("{} skipped, node no longer authorized: {}", what, msg);
            Ok(())
        }
        other => other,
    }
}

impl GovernanceWorker {
    /// Begin the shutdown sequence in the background. A second request while
    /// one is running is ignored.
    pub fn start_shutdown(&self, mode: ShutdownMode) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            warn!("shutdown already in progress, ignoring {:?}", mode);
            return;
        }
        let Some(me) = self.me.upgrade() else {
            warn!("governance worker dropped before shutdown");
            return;
        };
        info!("node shutdown starting: {:?}", mode);
        self.spawn(async move {
            let result = me.shutdown_sequence(mode).await;
            me.finish_shutdown(mode, result);
        });
    }

    async fn patch_device(&self, patch: PatchDeviceRequest, what: &str) -> Result<(), ShutdownError> {
        let retry = self.retry_policy();
        let res = retry_transient(&retry, what, || self.exchange.patch_device(&patch)).await;
        tolerate_missing_node(res, what)?;
        Ok(())
    }

    async fn shutdown_sequence(&self, mode: ShutdownMode) -> Result<(), ShutdownError> {
        // 1
        let device = self.db.find_device()?.ok_or(ShutdownError::NotRegistered)?;
        self.log(
            Severity::Info,
            EventSource::Node,
            EC_START_NODE_UNREG,
            format!("start unregistering node {}", device.full_id()),
        );
        self.db.set_device_config_state(ConfigState::Unconfiguring)?;

        // 2
        self.patch_device(
            PatchDeviceRequest {
                pattern: Some(String::new()),
                registered_services: Some(Vec::new()),
                user_input: (!mode.keeps_user_input()).then(Vec::new),
                ..Default::default()
            },
            "clear node registration",
        )
        .await?;
        debug!("node registration cleared in the exchange");

        // 3
        let reason = mode.termination_reason();
        let active = self
            .db
            .find_established_agreements_all_protocols(&[AgreementFilter::Unarchived, AgreementFilter::NotTerminated])?;
        for ag in active {
            self.cancel_for_reason(&ag.current_agreement_id, Some(ag.agreement_protocol.as_str()), reason)
                .await;
        }
        loop {
            let left = self
                .db
                .find_established_agreements_all_protocols(&[AgreementFilter::Unarchived])?;
            if left.is_empty() {
                break;
            }
            info!("waiting for {} agreements to be archived", left.len());
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        // 4
        self.patch_device(
            PatchDeviceRequest {
                public_key: Some(String::new()),
                ..Default::default()
            },
            "clear messaging key",
        )
        .await?;
        remove_path(&self.config.message_key_path)?;

        // 5
        self.runtime.publish(Message::ExchangeChangesShutdown);
        self.runtime.publish(Message::AllBlockchainShutdown);

        // 6
        let insts = self
            .db
            .find_microservice_instances(&[InstanceFilter::Unarchived, InstanceFilter::NotCleanedUp])?;
        for inst in insts {
            if let Err(e) = self
                .cleanup_microservice(&inst.key(), MS_DELETED_BY_AGREEMENT_ENDED, None)
                .await
            {
                warn!("unable to clean up {}: {}", inst.key(), e);
            }
        }
        loop {
            let left = self.db.find_microservice_instances(&[InstanceFilter::Unarchived])?;
            if left.is_empty() {
                break;
            }
            info!("waiting for {} service instances to be archived", left.len());
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
        for def in self.db.find_microservice_defs(&[DefinitionFilter::Unarchived])? {
            self.db.archive_microservice_def(&def.id)?;
        }

        // 7
        self.db.delete_all_workload_configs()?;
        if !mode.keeps_user_input() {
            self.db.delete_all_attributes()?;
        }
        let removed = remove_policy_files(&self.config.policy_path)?;
        debug!("removed {} policy files", removed);

        // 8
        if let ShutdownMode::Unconfigure { remove_node: true } = mode {
            let retry = self.retry_policy();
            let res = retry_transient(&retry, "node delete", || self.exchange.delete_device()).await;
            tolerate_missing_node(res, "node delete")?;
            info!("node {} deleted from the exchange", device.full_id());
        }

        // 9
        match mode {
            ShutdownMode::Unconfigure { .. } => {
                self.db.delete_device()?;
            }
            ShutdownMode::PatternChange => {
                let pattern = self.db.find_saved_pattern()?.unwrap_or_default();
                self.db.set_device_pattern(&pattern)?;
                self.patch_device(
                    PatchDeviceRequest {
                        pattern: Some(pattern.clone()),
                        ..Default::default()
                    },
                    "set node pattern",
                )
                .await?;
                self.db.set_device_config_state(ConfigState::Unconfigured)?;
                self.db.delete_saved_pattern()?;
                info!("node switched to pattern {:?}", pattern);
            }
        }
        Ok(())
    }

    // 10
    fn finish_shutdown(&self, mode: ShutdownMode, result: Result<(), ShutdownError>) {
        let error = match result {
            Ok(()) => {
                info!("node shutdown complete");
                self.log(
                    Severity::Info,
                    EventSource::Node,
                    EC_NODE_UNREG_COMPLETE,
                    "node unregistration complete".to_string(),
                );
                None
            }
            Err(e) => {
                error!("node shutdown failed: {}", e);
                self.log(
                    Severity::Error,
                    EventSource::Node,
                    EC_ERROR_NODE_UNREG,
                    format!("error unregistering node: {}", e),
                );
                Some(e.to_string())
            }
        };
        if mode == ShutdownMode::PatternChange {
            self.shutting_down.store(false, Ordering::SeqCst);
        }
        self.runtime.publish(Message::NodeShutdownComplete { error });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_files_removed_by_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.policy"), "{}").unwrap();
        std::fs::write(dir.path().join("b.policy"), "{}").unwrap();
        std::fs::write(dir.path().join("keep.json"), "{}").unwrap();

        assert_eq!(remove_policy_files(dir.path()).unwrap(), 2);
        assert!(dir.path().join("keep.json").exists());
        assert_eq!(remove_policy_files(&dir.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn test_missing_paths_are_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        let keys = dir.path().join("messaging");
        std::fs::create_dir_all(&keys).unwrap();
        std::fs::write(keys.join("key.pem"), "k").unwrap();
        remove_path(&keys).unwrap();
        assert!(!keys.exists());
        remove_path(&keys).unwrap();
    }

    #[test]
    fn test_unauthorized_means_node_gone() {
        assert!(tolerate_missing_node(Err(ExchangeError::Unauthorized("401".into())), "x").is_ok());
        assert!(tolerate_missing_node(Err(ExchangeError::Transient("io".into())), "x").is_err());
    }
}
