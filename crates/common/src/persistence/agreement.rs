//! Agreement records.
//!
//! An agreement is created once a proposal is accepted and is then mutated in
//! place through accepted, finalized, executing and data-received. Termination
//! is recorded exactly once; archival happens after the workload and the
//! protocol side both reported cleanup.

use std::collections::BTreeMap;

use lmdb::{Transaction, WriteFlags};
use serde::{Deserialize, Serialize};

use super::{now_secs, AgentDb, DbError, DbResult};

/// Cleanup marker: the workload containers are gone.
pub const STATUS_WORKLOAD_DESTROYED: u32 = 500;

/// Cleanup marker: the protocol-level termination is done.
pub const STATUS_AG_PROTOCOL_TERMINATED: u32 = 501;

/// How to run one container of a workload or dependent service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub image: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub binds: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
}

/// Parse a deployment descriptor: a JSON object `{"services": {name: config}}`.
pub fn parse_deployment(raw: &str) -> DbResult<BTreeMap<String, DeploymentConfig>> {
    #[derive(Deserialize)]
    struct Descriptor {
        #[serde(default)]
        services: BTreeMap<String, DeploymentConfig>,
    }
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let d: Descriptor = serde_json::from_str(raw)?;
    Ok(d.services)
}

/// The top-level service an agreement runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadInfo {
    pub url: String,
    pub org: String,
    pub version: String,
    pub arch: String,
}

impl WorkloadInfo {
    pub fn new(url: &str, org: &str, version: &str, arch: &str) -> Self {
        Self {
            url: url.to_string(),
            org: org.to_string(),
            version: version.to_string(),
            arch: arch.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstablishedAgreement {
    pub name: String,
    pub current_agreement_id: String,
    pub consumer_id: String,
    pub counter_party_address: String,
    pub agreement_protocol: String,
    pub protocol_version: u32,
    /// Serialized proposal as received.
    pub proposal: String,
    pub proposal_sig: String,

    pub creation_time: u64,
    pub accepted_time: u64,
    pub finalized_time: u64,
    pub execution_start_time: u64,
    pub data_received_time: u64,
    pub terminated_time: u64,
    pub force_terminated_time: u64,
    pub terminated_reason: u64,
    pub terminated_description: String,
    pub protocol_terminated_time: u64,
    pub workload_terminated_time: u64,

    pub current_deployment: BTreeMap<String, DeploymentConfig>,
    pub running_workload: WorkloadInfo,
    /// Set while the provider still has to configure the workload.
    pub config_nonce: String,
    pub previous_agreement_ids: Vec<String>,

    pub failed_ver_attempts: u32,
    pub last_ver_attempt_update_time: u64,

    pub blockchain_type: String,
    pub blockchain_name: String,
    pub blockchain_org: String,
    pub archived: bool,
}

impl EstablishedAgreement {
    pub fn is_terminated(&self) -> bool {
        self.terminated_time != 0
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted_time != 0
    }

    /// Both cleanup markers are present.
    pub fn is_cleanup_complete(&self) -> bool {
        self.workload_terminated_time != 0 && self.protocol_terminated_time != 0
    }
}

/// Inputs for a freshly persisted agreement.
#[derive(Debug, Clone, Default)]
pub struct NewAgreement {
    pub name: String,
    pub agreement_id: String,
    pub consumer_id: String,
    pub agreement_protocol: String,
    pub protocol_version: u32,
    pub proposal: String,
    pub deployment: BTreeMap<String, DeploymentConfig>,
    pub running_workload: WorkloadInfo,
    pub config_nonce: String,
    pub blockchain_type: String,
    pub blockchain_name: String,
    pub blockchain_org: String,
}

/// Selection predicates for agreement queries. All filters must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgreementFilter {
    Unarchived,
    Archived,
    NotTerminated,
    Terminated,
    Id(String),
    /// Accepted but not yet finalized on the counterparty side.
    NotYetFinal,
}

impl AgreementFilter {
    pub fn matches(&self, ag: &EstablishedAgreement) -> bool {
        match self {
            AgreementFilter::Unarchived => !ag.archived,
            AgreementFilter::Archived => ag.archived,
            AgreementFilter::NotTerminated => ag.terminated_time == 0,
            AgreementFilter::Terminated => ag.terminated_time != 0,
            AgreementFilter::Id(id) => &ag.current_agreement_id == id,
            AgreementFilter::NotYetFinal => ag.accepted_time != 0 && ag.finalized_time == 0,
        }
    }
}

impl AgentDb {
    /// Persist a new agreement. Fails with `AlreadyExists` if the id is taken.
    pub fn save_new_agreement(&self, new: NewAgreement) -> DbResult<EstablishedAgreement> {
        if new.agreement_id.is_empty() {
            return Err(DbError::Invalid("agreement id is empty".to_string()));
        }
        if new.agreement_protocol.is_empty() {
            return Err(DbError::Invalid("agreement protocol is empty".to_string()));
        }

        let ag = EstablishedAgreement {
            name: new.name,
            current_agreement_id: new.agreement_id,
            consumer_id: new.consumer_id,
            agreement_protocol: new.agreement_protocol,
            protocol_version: new.protocol_version,
            proposal: new.proposal,
            creation_time: now_secs(),
            current_deployment: new.deployment,
            running_workload: new.running_workload,
            config_nonce: new.config_nonce,
            blockchain_type: new.blockchain_type,
            blockchain_name: new.blockchain_name,
            blockchain_org: new.blockchain_org,
            ..Default::default()
        };

        let blob = serde_json::to_vec(&ag)?;
        let mut wtxn = self.env().begin_rw_txn()?;
        match wtxn.put(
            self.db_agreements,
            &ag.current_agreement_id.as_bytes(),
            &blob,
            WriteFlags::NO_OVERWRITE,
        ) {
            Ok(()) => {}
            Err(lmdb::Error::KeyExist) => {
                return Err(DbError::AlreadyExists(ag.current_agreement_id.clone()));
            }
            Err(e) => return Err(e.into()),
        }
        wtxn.commit()?;
        Ok(ag)
    }

    /// Look up one agreement by id, archived or not.
    pub fn find_agreement(&self, agreement_id: &str) -> DbResult<Option<EstablishedAgreement>> {
        self.get_record(self.db_agreements, agreement_id)
    }

    /// All agreements of `protocol` passing every filter.
    pub fn find_established_agreements(
        &self,
        protocol: &str,
        filters: &[AgreementFilter],
    ) -> DbResult<Vec<EstablishedAgreement>> {
        let all: Vec<EstablishedAgreement> = self.scan_records(self.db_agreements)?;
        Ok(all
            .into_iter()
            .filter(|ag| ag.agreement_protocol == protocol)
            .filter(|ag| filters.iter().all(|f| f.matches(ag)))
            .collect())
    }

    /// Like [`find_established_agreements`](Self::find_established_agreements)
    /// across every protocol.
    pub fn find_established_agreements_all_protocols(
        &self,
        filters: &[AgreementFilter],
    ) -> DbResult<Vec<EstablishedAgreement>> {
        let all: Vec<EstablishedAgreement> = self.scan_records(self.db_agreements)?;
        Ok(all
            .into_iter()
            .filter(|ag| filters.iter().all(|f| f.matches(ag)))
            .collect())
    }

    fn mutate_agreement<F>(&self, agreement_id: &str, f: F) -> DbResult<EstablishedAgreement>
    where
        F: FnOnce(&mut EstablishedAgreement),
    {
        self.update_record(self.db_agreements, agreement_id, f)?
            .ok_or_else(|| DbError::Invalid(format!("no agreement {}", agreement_id)))
    }

    pub fn agreement_state_accepted(
        &self,
        agreement_id: &str,
        proposal: &str,
        counter_party_address: &str,
        proposal_sig: &str,
    ) -> DbResult<EstablishedAgreement> {
        self.mutate_agreement(agreement_id, |ag| {
            ag.accepted_time = now_secs();
            ag.proposal = proposal.to_string();
            ag.counter_party_address = counter_party_address.to_string();
            ag.proposal_sig = proposal_sig.to_string();
        })
    }

    /// Merge superseded agreement ids into the history, newest first.
    pub fn agreement_previous_ids(&self, agreement_id: &str, previous: &[String]) -> DbResult<EstablishedAgreement> {
        self.mutate_agreement(agreement_id, |ag| {
            for id in previous.iter().rev() {
                if id != agreement_id && !ag.previous_agreement_ids.contains(id) {
                    ag.previous_agreement_ids.insert(0, id.clone());
                }
            }
        })
    }

    pub fn agreement_state_finalized(&self, agreement_id: &str) -> DbResult<EstablishedAgreement> {
        self.mutate_agreement(agreement_id, |ag| {
            if ag.finalized_time == 0 {
                ag.finalized_time = now_secs();
            }
        })
    }

    pub fn agreement_state_execution_started(&self, agreement_id: &str) -> DbResult<EstablishedAgreement> {
        self.mutate_agreement(agreement_id, |ag| {
            if ag.execution_start_time == 0 {
                ag.execution_start_time = now_secs();
            }
        })
    }

    pub fn agreement_state_data_received(&self, agreement_id: &str) -> DbResult<EstablishedAgreement> {
        self.mutate_agreement(agreement_id, |ag| ag.data_received_time = now_secs())
    }

    /// Clear the configure nonce once the provider configured the workload.
    pub fn agreement_state_configured(&self, agreement_id: &str) -> DbResult<EstablishedAgreement> {
        self.mutate_agreement(agreement_id, |ag| ag.config_nonce.clear())
    }

    /// Record termination. Returns `(record, applied)`; `applied` is false when
    /// the agreement was already terminated, in which case nothing changed.
    pub fn agreement_state_terminated(
        &self,
        agreement_id: &str,
        reason: u64,
        description: &str,
    ) -> DbResult<Option<(EstablishedAgreement, bool)>> {
        self.update_record_if(self.db_agreements, agreement_id, |ag: &mut EstablishedAgreement| {
            if ag.terminated_time != 0 {
                return false;
            }
            ag.terminated_time = now_secs();
            ag.terminated_reason = reason;
            ag.terminated_description = description.to_string();
            true
        })
    }

    pub fn agreement_state_force_terminated(&self, agreement_id: &str) -> DbResult<EstablishedAgreement> {
        self.mutate_agreement(agreement_id, |ag| {
            if ag.force_terminated_time == 0 {
                ag.force_terminated_time = now_secs();
            }
        })
    }

    pub fn agreement_state_workload_terminated(&self, agreement_id: &str) -> DbResult<EstablishedAgreement> {
        self.mutate_agreement(agreement_id, |ag| {
            if ag.workload_terminated_time == 0 {
                ag.workload_terminated_time = now_secs();
            }
        })
    }

    pub fn agreement_state_protocol_terminated(&self, agreement_id: &str) -> DbResult<EstablishedAgreement> {
        self.mutate_agreement(agreement_id, |ag| {
            if ag.protocol_terminated_time == 0 {
                ag.protocol_terminated_time = now_secs();
            }
        })
    }

    pub fn agreement_ver_attempt_failed(&self, agreement_id: &str) -> DbResult<EstablishedAgreement> {
        self.mutate_agreement(agreement_id, |ag| {
            ag.failed_ver_attempts += 1;
            ag.last_ver_attempt_update_time = now_secs();
        })
    }

    pub fn agreement_ver_attempts_reset(&self, agreement_id: &str) -> DbResult<EstablishedAgreement> {
        self.mutate_agreement(agreement_id, |ag| {
            ag.failed_ver_attempts = 0;
            ag.last_ver_attempt_update_time = now_secs();
        })
    }

    pub fn archive_agreement(&self, agreement_id: &str) -> DbResult<EstablishedAgreement> {
        self.mutate_agreement(agreement_id, |ag| {
            ag.archived = true;
            ag.current_deployment.clear();
        })
    }

    pub fn delete_agreement(&self, agreement_id: &str) -> DbResult<bool> {
        self.delete_record(self.db_agreements, agreement_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> NewAgreement {
        NewAgreement {
            name: "netspeed-policy".to_string(),
            agreement_id: id.to_string(),
            consumer_id: "org/agbot1".to_string(),
            agreement_protocol: "Basic".to_string(),
            protocol_version: 2,
            running_workload: WorkloadInfo::new("https://acme/netspeed", "acme", "1.0.0", "amd64"),
            ..Default::default()
        }
    }

    #[test]
    fn test_save_new_agreement_rejects_duplicate_id() {
        let dir = tempfile::tempdir().unwrap();
        let db = AgentDb::open(dir.path()).unwrap();
        db.save_new_agreement(sample("ag1")).unwrap();
        let err = db.save_new_agreement(sample("ag1")).unwrap_err();
        assert!(matches!(err, DbError::AlreadyExists(_)));
    }

    #[test]
    fn test_terminated_is_recorded_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = AgentDb::open(dir.path()).unwrap();
        db.save_new_agreement(sample("ag1")).unwrap();

        let (first, applied) = db.agreement_state_terminated("ag1", 101, "node policy changed").unwrap().unwrap();
        assert!(applied);
        let (second, applied) = db.agreement_state_terminated("ag1", 105, "user requested").unwrap().unwrap();
        assert!(!applied);
        assert_eq!(second.terminated_time, first.terminated_time);
        assert_eq!(second.terminated_reason, 101);
    }

    #[test]
    fn test_filters_select_unarchived_only() {
        let dir = tempfile::tempdir().unwrap();
        let db = AgentDb::open(dir.path()).unwrap();
        db.save_new_agreement(sample("ag1")).unwrap();
        db.save_new_agreement(sample("ag2")).unwrap();
        db.archive_agreement("ag1").unwrap();

        let active = db
            .find_established_agreements("Basic", &[AgreementFilter::Unarchived])
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].current_agreement_id, "ag2");
        assert!(db
            .find_established_agreements("Citizen Scientist", &[])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_parse_deployment_reads_services() {
        let raw = r#"{"services":{"netspeed":{"image":"acme/netspeed:1.0","environment":{"A":"1"}}}}"#;
        let svcs = parse_deployment(raw).unwrap();
        assert_eq!(svcs["netspeed"].image, "acme/netspeed:1.0");
        assert!(parse_deployment("").unwrap().is_empty());
    }
}
