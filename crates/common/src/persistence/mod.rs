//! # Agent Database
//!
//! LMDB-backed persistence for everything the agent has to remember across
//! restarts: agreements, service instances and definitions, the device
//! registration, user input attributes, device contracts and the event log.
//!
//! ## Layout
//!
//! One LMDB environment with one named database ("bucket") per record
//! family. Values are JSON documents keyed by the natural identity string
//! of the record (agreement id, instance key, definition id, ...).
//!
//! ## Update Semantics
//!
//! Every mutation of an existing record is a read-modify-write executed in a
//! single write transaction ([`AgentDb::update_record_if`]). LMDB admits one
//! writer at a time, so concurrent updates of the same record serialize.
//! There is no transaction spanning two records except where a function says
//! so explicitly (pending contract promotion, instance find-or-create).
//!
//! ## Safety
//!
//! - No `panic!`, `unwrap()`, `expect()`.
//! - `AgentDb` is `Clone + Send + Sync`; clones share one environment.

pub mod agreement;
pub mod contract;
pub mod device;
pub mod eventlog;
pub mod microservice;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lmdb::{Cursor, Database, DatabaseFlags, Environment, Transaction, WriteFlags};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use agreement::{
    parse_deployment, AgreementFilter, DeploymentConfig, EstablishedAgreement, NewAgreement,
    WorkloadInfo, STATUS_AG_PROTOCOL_TERMINATED, STATUS_WORKLOAD_DESTROYED,
};
pub use contract::{EstablishedContract, PendingContract, ENV_CONFIGURE_NONCE};
pub use device::{Attribute, ConfigState, ExchangeDevice, WorkloadConfig};
pub use eventlog::{EventLogRecord, EventSource, Severity};
pub use microservice::{
    instance_key, DefinitionFilter, ImageDockerAuth, InstanceFilter, MicroserviceDefinition,
    MicroserviceInstance, ServiceDependency, ServiceInstancePathElement, SharingMode, UserInput,
};

// ════════════════════════════════════════════════════════════════════════════
// BUCKET CONSTANTS
// ════════════════════════════════════════════════════════════════════════════

/// Key: agreement id. Value: JSON `EstablishedAgreement`.
pub const BUCKET_AGREEMENTS: &str = "agreements";

/// Key: instance key (org/url/version/instance id). Value: JSON `MicroserviceInstance`.
pub const BUCKET_MS_INSTANCES: &str = "microservice_instances";

/// Key: definition id (uuid). Value: JSON `MicroserviceDefinition`.
pub const BUCKET_MS_DEFINITIONS: &str = "microservice_definitions";

/// Registration record and saved node pattern.
pub const BUCKET_DEVICE: &str = "device";

pub const BUCKET_ATTRIBUTES: &str = "attributes";
pub const BUCKET_WORKLOAD_CONFIG: &str = "workload_config";
pub const BUCKET_PENDING_CONTRACTS: &str = "pending_contracts";
pub const BUCKET_CONTRACTS: &str = "contracts";

/// Key: zero-padded sequence id. Value: JSON `EventLogRecord`.
pub const BUCKET_EVENT_LOG: &str = "event_log";

const MAX_DBS: u32 = 12;
const MAP_SIZE: usize = 1_000_000_000;

// ════════════════════════════════════════════════════════════════════════════
// ERROR TYPE
// ════════════════════════════════════════════════════════════════════════════

/// Errors returned by every persistence operation.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("lmdb error: {0}")]
    Lmdb(#[from] lmdb::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A record with the same identity is already stored.
    #[error("record already exists: {0}")]
    AlreadyExists(String),

    /// The record failed a structural check before it was written.
    #[error("invalid record: {0}")]
    Invalid(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Current unix time in seconds. Every persisted timestamp uses this clock.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ════════════════════════════════════════════════════════════════════════════
// AGENT DB
// ════════════════════════════════════════════════════════════════════════════

/// Handle to the agent's embedded database.
#[derive(Clone)]
pub struct AgentDb {
    env: Arc<Environment>,
    env_path: PathBuf,
    db_agreements: Database,
    db_ms_instances: Database,
    db_ms_definitions: Database,
    db_device: Database,
    db_attributes: Database,
    db_workload_config: Database,
    db_pending_contracts: Database,
    db_contracts: Database,
    db_event_log: Database,
}

impl std::fmt::Debug for AgentDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDb").field("path", &self.env_path).finish()
    }
}

impl AgentDb {
    /// Open (creating if needed) the database directory at `path`.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let p = path.as_ref();
        std::fs::create_dir_all(p)?;

        let env = Environment::new()
            .set_max_dbs(MAX_DBS)
            .set_map_size(MAP_SIZE)
            .open(p)?;

        let db_agreements = env.create_db(Some(BUCKET_AGREEMENTS), DatabaseFlags::empty())?;
        let db_ms_instances = env.create_db(Some(BUCKET_MS_INSTANCES), DatabaseFlags::empty())?;
        let db_ms_definitions = env.create_db(Some(BUCKET_MS_DEFINITIONS), DatabaseFlags::empty())?;
        let db_device = env.create_db(Some(BUCKET_DEVICE), DatabaseFlags::empty())?;
        let db_attributes = env.create_db(Some(BUCKET_ATTRIBUTES), DatabaseFlags::empty())?;
        let db_workload_config = env.create_db(Some(BUCKET_WORKLOAD_CONFIG), DatabaseFlags::empty())?;
        let db_pending_contracts = env.create_db(Some(BUCKET_PENDING_CONTRACTS), DatabaseFlags::empty())?;
        let db_contracts = env.create_db(Some(BUCKET_CONTRACTS), DatabaseFlags::empty())?;
        let db_event_log = env.create_db(Some(BUCKET_EVENT_LOG), DatabaseFlags::empty())?;

        Ok(Self {
            env: Arc::new(env),
            env_path: p.to_path_buf(),
            db_agreements,
            db_ms_instances,
            db_ms_definitions,
            db_device,
            db_attributes,
            db_workload_config,
            db_pending_contracts,
            db_contracts,
            db_event_log,
        })
    }

    pub fn path(&self) -> &Path {
        &self.env_path
    }

    // ------------------------------------------------------------------------
    // generic JSON record helpers, used by the per-family modules
    // ------------------------------------------------------------------------

    pub(crate) fn put_record<T: Serialize>(&self, db: Database, key: &str, value: &T) -> DbResult<()> {
        let blob = serde_json::to_vec(value)?;
        let mut wtxn = self.env.begin_rw_txn()?;
        wtxn.put(db, &key.as_bytes(), &blob, WriteFlags::empty())?;
        wtxn.commit()?;
        Ok(())
    }

    pub(crate) fn get_record<T: DeserializeOwned>(&self, db: Database, key: &str) -> DbResult<Option<T>> {
        let rtxn = self.env.begin_ro_txn()?;
        match rtxn.get(db, &key.as_bytes()) {
            Ok(val) => {
                let record: T = serde_json::from_slice(val)?;
                Ok(Some(record))
            }
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns false when there was nothing to delete.
    pub(crate) fn delete_record(&self, db: Database, key: &str) -> DbResult<bool> {
        let mut wtxn = self.env.begin_rw_txn()?;
        match wtxn.del(db, &key.as_bytes(), None) {
            Ok(()) => {
                wtxn.commit()?;
                Ok(true)
            }
            Err(lmdb::Error::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn scan_records<T: DeserializeOwned>(&self, db: Database) -> DbResult<Vec<T>> {
        let rtxn = self.env.begin_ro_txn()?;
        let mut cursor = rtxn.open_ro_cursor(db)?;
        let mut out = Vec::new();
        for (_key, val) in cursor.iter() {
            out.push(serde_json::from_slice(val)?);
        }
        Ok(out)
    }

    pub(crate) fn clear_records(&self, db: Database) -> DbResult<usize> {
        let mut wtxn = self.env.begin_rw_txn()?;
        let keys: Vec<Vec<u8>> = {
            let mut cursor = wtxn.open_ro_cursor(db)?;
            cursor.iter().map(|(k, _)| k.to_vec()).collect()
        };
        for key in &keys {
            wtxn.del(db, key, None)?;
        }
        wtxn.commit()?;
        Ok(keys.len())
    }

    /// Read-modify-write of one record in a single write transaction.
    ///
    /// `f` returns whether it changed the record; nothing is written when it
    /// returns false. Returns `None` when the key does not exist, otherwise
    /// the record as it is after the call and whether it was written.
    pub(crate) fn update_record_if<T, F>(&self, db: Database, key: &str, f: F) -> DbResult<Option<(T, bool)>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> bool,
    {
        let mut wtxn = self.env.begin_rw_txn()?;
        let mut record: T = match wtxn.get(db, &key.as_bytes()) {
            Ok(val) => serde_json::from_slice(val)?,
            Err(lmdb::Error::NotFound) => {
                wtxn.abort();
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if !f(&mut record) {
            wtxn.abort();
            return Ok(Some((record, false)));
        }

        let blob = serde_json::to_vec(&record)?;
        wtxn.put(db, &key.as_bytes(), &blob, WriteFlags::empty())?;
        wtxn.commit()?;
        Ok(Some((record, true)))
    }

    pub(crate) fn update_record<T, F>(&self, db: Database, key: &str, f: F) -> DbResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let updated = self.update_record_if(db, key, |r: &mut T| {
            f(r);
            true
        })?;
        Ok(updated.map(|(r, _)| r))
    }

    pub(crate) fn env(&self) -> &Environment {
        &self.env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        n: u32,
    }

    #[test]
    fn test_update_record_if_skips_write_when_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let db = AgentDb::open(dir.path()).unwrap();
        db.put_record(db.db_attributes, "k", &Sample { n: 1 }).unwrap();

        let (rec, written) = db
            .update_record_if(db.db_attributes, "k", |p: &mut Sample| {
                if p.n == 1 {
                    return false;
                }
                p.n = 9;
                true
            })
            .unwrap()
            .unwrap();
        assert!(!written);
        assert_eq!(rec.n, 1);

        let missing = db
            .update_record_if(db.db_attributes, "nope", |_p: &mut Sample| true)
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_clear_records_empties_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let db = AgentDb::open(dir.path()).unwrap();
        db.put_record(db.db_workload_config, "a", &Sample { n: 1 }).unwrap();
        db.put_record(db.db_workload_config, "b", &Sample { n: 2 }).unwrap();
        assert_eq!(db.clear_records(db.db_workload_config).unwrap(), 2);
        let left: Vec<Sample> = db.scan_records(db.db_workload_config).unwrap();
        assert!(left.is_empty());
        assert!(!db.delete_record(db.db_workload_config, "a").unwrap());
    }
}
