//! Device contracts: pending registrations and established on-chain contracts.

use std::collections::BTreeMap;

use lmdb::{Transaction, WriteFlags};
use serde::{Deserialize, Serialize};

use super::{now_secs, AgentDb, DbError, DbResult};

/// Environment key carrying the one-time configure nonce.
pub const ENV_CONFIGURE_NONCE: &str = "MTN_CONFIGURE_NONCE";

/// A contract the node wants registered but which is not deployed yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingContract {
    pub name: String,
    pub arch: String,
    pub cpus: u32,
    pub ram: u64,
    pub hourly_cost_bacon: u64,
    pub is_loc_enabled: bool,
    #[serde(default)]
    pub app_attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub private_app_attributes: BTreeMap<String, String>,
}

/// A deployed contract, keyed by its address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstablishedContract {
    pub contract_address: String,
    pub name: String,
    pub archived: bool,
    pub current_agreement_id: String,
    pub previous_agreements: Vec<String>,
    pub configure_nonce: String,
    pub agreement_accepted_time: u64,
    pub agreement_creation_time: u64,
    pub agreement_execution_start_time: u64,
    /// Facts published alongside the contract.
    pub environment_additions: BTreeMap<String, String>,
    /// Facts that never leave the device.
    pub private_environment_additions: BTreeMap<String, String>,
}

impl AgentDb {
    pub fn save_pending_contract(&self, pending: &PendingContract) -> DbResult<()> {
        if pending.name.is_empty() {
            return Err(DbError::Invalid("pending contract name is empty".to_string()));
        }
        self.put_record(self.db_pending_contracts, &pending.name, pending)
    }

    pub fn find_pending_contracts(&self) -> DbResult<Vec<PendingContract>> {
        self.scan_records(self.db_pending_contracts)
    }

    /// Replace the pending record `pending.name` with an established contract
    /// at `address` in one write transaction.
    pub fn promote_pending_contract(
        &self,
        pending: &PendingContract,
        address: &str,
    ) -> DbResult<EstablishedContract> {
        if address.is_empty() {
            return Err(DbError::Invalid("contract address is empty".to_string()));
        }
        let established = EstablishedContract {
            contract_address: address.to_string(),
            name: pending.name.clone(),
            private_environment_additions: pending.private_app_attributes.clone(),
            ..Default::default()
        };
        let blob = serde_json::to_vec(&established)?;

        let mut wtxn = self.env().begin_rw_txn()?;
        match wtxn.del(self.db_pending_contracts, &pending.name.as_bytes(), None) {
            Ok(()) | Err(lmdb::Error::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        wtxn.put(self.db_contracts, &address.as_bytes(), &blob, WriteFlags::empty())?;
        wtxn.commit()?;
        Ok(established)
    }

    pub fn find_established_contracts(&self, unarchived_only: bool) -> DbResult<Vec<EstablishedContract>> {
        let all: Vec<EstablishedContract> = self.scan_records(self.db_contracts)?;
        Ok(all.into_iter().filter(|c| !unarchived_only || !c.archived).collect())
    }

    pub fn find_established_contract(&self, address: &str) -> DbResult<Option<EstablishedContract>> {
        self.get_record(self.db_contracts, address)
    }

    /// The unarchived contract currently holding `agreement_id`.
    pub fn find_contract_by_agreement(&self, agreement_id: &str) -> DbResult<Option<EstablishedContract>> {
        if agreement_id.is_empty() {
            return Ok(None);
        }
        Ok(self
            .find_established_contracts(true)?
            .into_iter()
            .find(|c| c.current_agreement_id == agreement_id))
    }

    fn mutate_contract<F>(&self, address: &str, f: F) -> DbResult<EstablishedContract>
    where
        F: FnOnce(&mut EstablishedContract),
    {
        match self.update_record_if(self.db_contracts, address, |c: &mut EstablishedContract| {
            if c.archived {
                return false;
            }
            f(c);
            true
        })? {
            Some((c, true)) => Ok(c),
            _ => Err(DbError::Invalid(format!("no unarchived contract {}", address))),
        }
    }

    /// Back to "no agreement". The ended agreement id joins the history.
    pub fn contract_state_new(&self, address: &str) -> DbResult<EstablishedContract> {
        self.mutate_contract(address, |c| {
            if !c.current_agreement_id.is_empty() {
                let prev = std::mem::take(&mut c.current_agreement_id);
                c.previous_agreements.insert(0, prev);
            }
            c.agreement_accepted_time = 0;
            c.configure_nonce.clear();
            c.environment_additions.clear();
            c.agreement_creation_time = 0;
            c.agreement_execution_start_time = 0;
        })
    }

    /// In agreement, not yet accepted. A fresh configure nonce is generated
    /// and written into the environment additions.
    pub fn contract_state_in_agreement(
        &self,
        address: &str,
        agreement_id: &str,
        mut environment_additions: BTreeMap<String, String>,
    ) -> DbResult<EstablishedContract> {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        environment_additions.insert(ENV_CONFIGURE_NONCE.to_string(), nonce.clone());
        self.mutate_contract(address, |c| {
            c.current_agreement_id = agreement_id.to_string();
            c.agreement_creation_time = now_secs();
            c.configure_nonce = nonce;
            c.environment_additions = environment_additions;
        })
    }

    pub fn contract_state_accepted(&self, address: &str) -> DbResult<EstablishedContract> {
        self.mutate_contract(address, |c| c.agreement_accepted_time = now_secs())
    }

    pub fn contract_state_execution_started(&self, address: &str) -> DbResult<EstablishedContract> {
        self.mutate_contract(address, |c| c.agreement_execution_start_time = now_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> PendingContract {
        PendingContract {
            name: "bluehorizon".to_string(),
            arch: "arm".to_string(),
            cpus: 4,
            ram: 1024,
            hourly_cost_bacon: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_promote_moves_record_between_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let db = AgentDb::open(dir.path()).unwrap();
        db.save_pending_contract(&pending()).unwrap();

        let est = db.promote_pending_contract(&pending(), "0xabc").unwrap();
        assert_eq!(est.name, "bluehorizon");
        assert!(db.find_pending_contracts().unwrap().is_empty());
        assert_eq!(db.find_established_contracts(true).unwrap().len(), 1);
    }

    #[test]
    fn test_contract_state_cycle_records_history() {
        let dir = tempfile::tempdir().unwrap();
        let db = AgentDb::open(dir.path()).unwrap();
        db.promote_pending_contract(&pending(), "0xabc").unwrap();

        let c = db.contract_state_in_agreement("0xabc", "ag1", BTreeMap::new()).unwrap();
        assert_eq!(c.current_agreement_id, "ag1");
        assert!(!c.configure_nonce.is_empty());
        assert_eq!(c.environment_additions[ENV_CONFIGURE_NONCE], c.configure_nonce);

        let c = db.contract_state_new("0xabc").unwrap();
        assert!(c.current_agreement_id.is_empty());
        assert_eq!(c.previous_agreements, vec!["ag1".to_string()]);

        db.contract_state_in_agreement("0xabc", "ag2", BTreeMap::new()).unwrap();
        assert_eq!(
            db.find_contract_by_agreement("ag2").unwrap().map(|c| c.contract_address),
            Some("0xabc".to_string())
        );
        assert!(db.find_contract_by_agreement("ag1").unwrap().is_none());
        let c = db.contract_state_new("0xabc").unwrap();
        assert_eq!(c.previous_agreements, vec!["ag2".to_string(), "ag1".to_string()]);
    }
}
