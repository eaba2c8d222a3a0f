//! # Event Log
//!
//! Durable audit trail of lifecycle events. Operators read it to reconstruct
//! what happened to an agreement or service after the fact.
//!
//! Writing an entry never fails the caller: a database error while logging
//! is reported through `tracing` and swallowed.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{now_secs, AgentDb, DbResult};

// ════════════════════════════════════════════════════════════════════════════
// EVENT CODES
// ════════════════════════════════════════════════════════════════════════════

pub const EC_DATABASE_ERROR: &str = "database_error";
pub const EC_EXCHANGE_ERROR: &str = "exchange_error";

pub const EC_NODE_PATTERN_CHANGED: &str = "node_pattern_changed";
pub const EC_START_NODE_UNREG: &str = "start_node_unregistration";
pub const EC_NODE_UNREG_COMPLETE: &str = "node_unregistration_complete";
pub const EC_ERROR_NODE_UNREG: &str = "error_node_unregistration";
pub const EC_NODE_HEARTBEAT_RESTORED: &str = "node_heartbeat_restored";

pub const EC_RECEIVED_PROPOSAL: &str = "received_proposal";
pub const EC_IGNORE_PROPOSAL: &str = "ignore_proposal";
pub const EC_REJECT_PROPOSAL: &str = "reject_proposal";
pub const EC_ERROR_IN_PROPOSAL: &str = "error_in_proposal";
pub const EC_ERROR_PROCESSING_PROPOSAL: &str = "error_processing_proposal";
pub const EC_RECEIVED_REPLYACK_MESSAGE: &str = "received_replyack_message";
pub const EC_RECEIVED_CANCEL_AGREEMENT_MESSAGE: &str = "received_cancel_agreement_message";

pub const EC_AGREEMENT_REACHED: &str = "agreement_reached";
pub const EC_CANCEL_AGREEMENT: &str = "cancel_agreement";
pub const EC_AGREEMENT_CANCELED: &str = "agreement_canceled";
pub const EC_CANCEL_AGREEMENT_EXECUTION_TIMEOUT: &str = "cancel_agreement_execution_timeout";
pub const EC_CANCEL_AGREEMENT_NO_REPLYACK: &str = "cancel_agreement_no_replyack";
pub const EC_CANCEL_AGREEMENT_PER_AGBOT: &str = "cancel_agreement_per_agbot_request";
pub const EC_CANCEL_AGREEMENT_SERVICE_SUSPENDED: &str = "cancel_agreement_service_suspended";
pub const EC_CANCEL_AGREEMENT_POLICY_CHANGED: &str = "cancel_agreement_policy_changed";
pub const EC_ERROR_AGREEMENT_VERIFICATION: &str = "error_in_agreement_verification";
pub const EC_ERROR_DELETE_AGREEMENT_IN_EXCHANGE: &str = "error_delete_agreement_in_exchange";

pub const EC_START_DEPENDENT_SERVICE: &str = "start_dependent_service";
pub const EC_ERROR_START_DEPENDENT_SERVICE: &str = "error_start_dependent_service";
pub const EC_DEPENDENT_SERVICE_FAILED: &str = "dependent_service_failed";
pub const EC_START_RETRY_DEPENDENT_SERVICE: &str = "start_retry_dependent_service";
pub const EC_ERROR_START_RETRY_DEPENDENT_SERVICE: &str = "error_start_retry_dependent_service";
pub const EC_START_AGREEMENTLESS_SERVICE: &str = "start_agreementless_service";
pub const EC_ERROR_START_AGREEMENTLESS_SERVICE: &str = "error_start_agreementless_service";
pub const EC_START_DOWNGRADE_SERVICE: &str = "start_downgrade_service";
pub const EC_COMPLETE_DOWNGRADE_SERVICE: &str = "complete_downgrade_service";
pub const EC_ERROR_DOWNGRADE_SERVICE: &str = "error_downgrade_service";
pub const EC_NO_VERSION_TO_DOWNGRADE: &str = "no_version_to_downgrade";
pub const EC_START_UPGRADE_SERVICE: &str = "start_upgrade_service";
pub const EC_COMPLETE_UPGRADE_SERVICE: &str = "complete_upgrade_service";
pub const EC_ERROR_UPGRADE_SERVICE: &str = "error_upgrade_service";
pub const EC_START_CLEANUP_SERVICE: &str = "start_cleanup_service";
pub const EC_COMPLETE_CLEANUP_SERVICE: &str = "complete_cleanup_service";
pub const EC_ERROR_CLEANUP_SERVICE: &str = "error_cleanup_service";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Agreement,
    Service,
    Database,
    Exchange,
    Node,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogRecord {
    /// Sortable: timestamp then a per-process sequence.
    pub id: String,
    pub timestamp: u64,
    pub severity: Severity,
    pub message: String,
    pub event_code: String,
    pub source: EventSource,
}

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

impl AgentDb {
    /// Append an event log entry. Errors are logged, not returned.
    pub fn log_event(&self, severity: Severity, source: EventSource, event_code: &str, message: impl Into<String>) {
        let timestamp = now_secs();
        let seq = SEQUENCE.fetch_add(1, Ordering::SeqCst);
        let record = EventLogRecord {
            id: format!("{:012}-{:010}", timestamp, seq),
            timestamp,
            severity,
            message: message.into(),
            event_code: event_code.to_string(),
            source,
        };
        if let Err(e) = self.put_record(self.db_event_log, &record.id, &record) {
            warn!("unable to save event log entry {}: {}", record.event_code, e);
        }
    }

    /// All entries in insertion order, optionally restricted to one source.
    pub fn find_event_logs(&self, source: Option<EventSource>) -> DbResult<Vec<EventLogRecord>> {
        let all: Vec<EventLogRecord> = self.scan_records(self.db_event_log)?;
        Ok(all
            .into_iter()
            .filter(|r| source.map_or(true, |s| r.source == s))
            .collect())
    }
}
