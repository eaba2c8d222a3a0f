//! # Dependent Service Records
//!
//! Definitions describe a versioned dependent service; instances are the
//! running (or to-be-run) container sets backing a definition, possibly
//! shared by several agreements.
//!
//! ## Invariants
//!
//! - An instance key is derived from (org, url, version, instance id) and is
//!   unique in the bucket.
//! - `cleanup_start_time` is set once and never cleared.
//! - [`AgentDb::find_or_create_instance`] runs the reuse lookup and the
//!   insert in one write transaction, so two concurrent starts for the same
//!   key persist exactly one instance.

use std::collections::BTreeMap;

use lmdb::{Cursor, Transaction, WriteFlags};
use serde::{Deserialize, Serialize};

use super::{now_secs, AgentDb, DbError, DbResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingMode {
    /// One instance per agreement.
    #[default]
    Exclusive,
    Single,
    Singleton,
    /// Every start creates a fresh instance.
    Multiple,
}

impl SharingMode {
    /// Whether an existing live instance may serve another agreement.
    pub fn reuses_instances(&self) -> bool {
        !matches!(self, SharingMode::Multiple)
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, SharingMode::Single | SharingMode::Singleton)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDependency {
    pub url: String,
    pub org: String,
    /// Version range expression, e.g. `[1.0.0,2.0.0)`.
    pub version: String,
    pub arch: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInput {
    pub name: String,
    #[serde(default)]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDockerAuth {
    pub registry: String,
    pub username: String,
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MicroserviceDefinition {
    pub id: String,
    pub owner: String,
    pub label: String,
    pub spec_ref: String,
    pub org: String,
    pub version: String,
    pub arch: String,
    pub sharable: SharingMode,
    pub required_services: Vec<ServiceDependency>,
    pub user_inputs: Vec<UserInput>,
    /// JSON deployment descriptor; empty for metadata-only services.
    pub deployment: String,
    pub deployment_signature: String,

    pub auto_upgrade: bool,
    pub active_upgrade: bool,
    pub upgrade_version_range: String,
    pub upgrade_start_time: u64,
    pub upgrade_ms_unregistered_time: u64,
    pub upgrade_agreements_cleared_time: u64,
    pub upgrade_execution_start_time: u64,
    pub upgrade_ms_reregistered_time: u64,
    pub upgrade_failed_time: u64,
    pub upgrade_failure_reason: u64,
    pub upgrade_failure_description: String,
    pub upgrade_new_ms_id: String,

    pub archived: bool,
}

impl MicroserviceDefinition {
    pub fn has_deployment(&self) -> bool {
        !self.deployment.trim().is_empty()
    }

    /// Eligible for an automatic upgrade check.
    pub fn ready_for_upgrade(&self) -> bool {
        self.auto_upgrade && !self.active_upgrade && !self.archived
    }
}

/// One hop in a dependency path, from the top-level workload downwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInstancePathElement {
    pub url: String,
    pub org: String,
    pub version: String,
}

impl ServiceInstancePathElement {
    pub fn new(url: &str, org: &str, version: &str) -> Self {
        Self {
            url: url.to_string(),
            org: org.to_string(),
            version: version.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MicroserviceInstance {
    pub spec_ref: String,
    pub org: String,
    pub version: String,
    pub arch: String,
    pub instance_id: String,
    pub archived: bool,
    pub instance_create_time: u64,
    pub execution_start_time: u64,
    pub execution_failure_code: u64,
    pub execution_failure_desc: String,
    pub cleanup_start_time: u64,
    pub associated_agreements: Vec<String>,
    pub microservice_def_id: String,
    pub sharable: SharingMode,
    /// Dependency paths that pulled this instance in; the first element of
    /// each path is the top-level workload.
    pub parent_path: Vec<Vec<ServiceInstancePathElement>>,
    /// Started on behalf of the node itself rather than an agreement.
    pub agreement_less: bool,

    pub max_retries: u32,
    pub max_retry_duration: u64,
    pub current_retry_count: u32,
    pub retry_start_time: u64,

    pub env_vars: BTreeMap<String, String>,
}

impl MicroserviceInstance {
    pub fn key(&self) -> String {
        instance_key(&self.org, &self.spec_ref, &self.version, &self.instance_id)
    }

    pub fn is_live(&self) -> bool {
        !self.archived && self.cleanup_start_time == 0
    }

    pub fn has_agreement(&self, agreement_id: &str) -> bool {
        self.associated_agreements.iter().any(|a| a == agreement_id)
    }
}

/// Storage key for an instance; characters outside `[A-Za-z0-9.-]` become `_`.
pub fn instance_key(org: &str, url: &str, version: &str, instance_id: &str) -> String {
    let raw = format!("{}_{}_{}_{}", org, url, version, instance_id);
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceFilter {
    Unarchived,
    NotCleanedUp,
    DefinitionId(String),
    Service { url: String, org: String },
    Agreement(String),
}

impl InstanceFilter {
    pub fn matches(&self, inst: &MicroserviceInstance) -> bool {
        match self {
            InstanceFilter::Unarchived => !inst.archived,
            InstanceFilter::NotCleanedUp => inst.cleanup_start_time == 0,
            InstanceFilter::DefinitionId(id) => &inst.microservice_def_id == id,
            InstanceFilter::Service { url, org } => &inst.spec_ref == url && &inst.org == org,
            InstanceFilter::Agreement(id) => inst.has_agreement(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionFilter {
    Unarchived,
    Service { url: String, org: String },
    Arch(String),
}

impl DefinitionFilter {
    pub fn matches(&self, def: &MicroserviceDefinition) -> bool {
        match self {
            DefinitionFilter::Unarchived => !def.archived,
            DefinitionFilter::Service { url, org } => &def.spec_ref == url && &def.org == org,
            DefinitionFilter::Arch(a) => &def.arch == a,
        }
    }
}

impl AgentDb {
    // ------------------------------------------------------------------------
    // definitions
    // ------------------------------------------------------------------------

    pub fn save_microservice_def(&self, def: &MicroserviceDefinition) -> DbResult<()> {
        if def.id.is_empty() {
            return Err(DbError::Invalid("service definition id is empty".to_string()));
        }
        if def.spec_ref.is_empty() || def.version.is_empty() {
            return Err(DbError::Invalid(format!(
                "service definition {} has no url or version",
                def.id
            )));
        }
        self.put_record(self.db_ms_definitions, &def.id, def)
    }

    pub fn find_microservice_def_by_id(&self, id: &str) -> DbResult<Option<MicroserviceDefinition>> {
        self.get_record(self.db_ms_definitions, id)
    }

    pub fn find_microservice_defs(&self, filters: &[DefinitionFilter]) -> DbResult<Vec<MicroserviceDefinition>> {
        let all: Vec<MicroserviceDefinition> = self.scan_records(self.db_ms_definitions)?;
        Ok(all
            .into_iter()
            .filter(|d| filters.iter().all(|f| f.matches(d)))
            .collect())
    }

    pub fn update_microservice_def<F>(&self, id: &str, f: F) -> DbResult<MicroserviceDefinition>
    where
        F: FnOnce(&mut MicroserviceDefinition),
    {
        self.update_record(self.db_ms_definitions, id, f)?
            .ok_or_else(|| DbError::Invalid(format!("no service definition {}", id)))
    }

    pub fn archive_microservice_def(&self, id: &str) -> DbResult<MicroserviceDefinition> {
        self.update_microservice_def(id, |d| d.archived = true)
    }

    // ------------------------------------------------------------------------
    // instances
    // ------------------------------------------------------------------------

    pub fn find_microservice_instance(&self, key: &str) -> DbResult<Option<MicroserviceInstance>> {
        self.get_record(self.db_ms_instances, key)
    }

    pub fn find_microservice_instances(&self, filters: &[InstanceFilter]) -> DbResult<Vec<MicroserviceInstance>> {
        let all: Vec<MicroserviceInstance> = self.scan_records(self.db_ms_instances)?;
        Ok(all
            .into_iter()
            .filter(|i| filters.iter().all(|f| f.matches(i)))
            .collect())
    }

    /// Find a live instance of `def` to reuse, or create a new one.
    ///
    /// When `def.sharable` allows reuse, any unarchived, not-cleaned-up
    /// instance with the same url, org and version is returned. Otherwise, or
    /// when none exists, an instance keyed by `instance_id` is inserted; if
    /// that key is already present the stored instance is returned instead.
    /// Returns the instance and whether it was created by this call.
    pub fn find_or_create_instance(
        &self,
        def: &MicroserviceDefinition,
        instance_id: &str,
    ) -> DbResult<(MicroserviceInstance, bool)> {
        if instance_id.is_empty() {
            return Err(DbError::Invalid("instance id is empty".to_string()));
        }

        let mut wtxn = self.env().begin_rw_txn()?;

        if def.sharable.reuses_instances() {
            let mut found: Option<MicroserviceInstance> = None;
            {
                let mut cursor = wtxn.open_ro_cursor(self.db_ms_instances)?;
                for (_k, val) in cursor.iter() {
                    let inst: MicroserviceInstance = serde_json::from_slice(val)?;
                    if inst.is_live()
                        && inst.spec_ref == def.spec_ref
                        && inst.org == def.org
                        && inst.version == def.version
                    {
                        found = Some(inst);
                        break;
                    }
                }
            }
            if let Some(inst) = found {
                wtxn.abort();
                return Ok((inst, false));
            }
        }

        let key = instance_key(&def.org, &def.spec_ref, &def.version, instance_id);
        match wtxn.get(self.db_ms_instances, &key.as_bytes()) {
            Ok(val) => {
                let inst: MicroserviceInstance = serde_json::from_slice(val)?;
                wtxn.abort();
                return Ok((inst, false));
            }
            Err(lmdb::Error::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let inst = MicroserviceInstance {
            spec_ref: def.spec_ref.clone(),
            org: def.org.clone(),
            version: def.version.clone(),
            arch: def.arch.clone(),
            instance_id: instance_id.to_string(),
            instance_create_time: now_secs(),
            microservice_def_id: def.id.clone(),
            sharable: def.sharable,
            ..Default::default()
        };
        let blob = serde_json::to_vec(&inst)?;
        wtxn.put(self.db_ms_instances, &key.as_bytes(), &blob, WriteFlags::empty())?;
        wtxn.commit()?;
        Ok((inst, true))
    }

    fn mutate_instance<F>(&self, key: &str, f: F) -> DbResult<MicroserviceInstance>
    where
        F: FnOnce(&mut MicroserviceInstance),
    {
        self.update_record(self.db_ms_instances, key, f)?
            .ok_or_else(|| DbError::Invalid(format!("no service instance {}", key)))
    }

    /// Record execution start, or a failure when `failure_code != 0`.
    pub fn update_ms_instance_execution_state(
        &self,
        key: &str,
        started: bool,
        failure_code: u64,
        failure_desc: &str,
    ) -> DbResult<MicroserviceInstance> {
        self.mutate_instance(key, |i| {
            if started && i.execution_start_time == 0 {
                i.execution_start_time = now_secs();
            }
            i.execution_failure_code = failure_code;
            i.execution_failure_desc = failure_desc.to_string();
        })
    }

    pub fn add_ms_instance_agreement(&self, key: &str, agreement_id: &str) -> DbResult<MicroserviceInstance> {
        self.mutate_instance(key, |i| {
            if !i.has_agreement(agreement_id) {
                i.associated_agreements.push(agreement_id.to_string());
            }
        })
    }

    pub fn remove_ms_instance_agreement(&self, key: &str, agreement_id: &str) -> DbResult<MicroserviceInstance> {
        self.mutate_instance(key, |i| i.associated_agreements.retain(|a| a != agreement_id))
    }

    pub fn set_ms_instance_agreement_less(&self, key: &str) -> DbResult<MicroserviceInstance> {
        self.mutate_instance(key, |i| i.agreement_less = true)
    }

    pub fn add_ms_instance_dependency_path(
        &self,
        key: &str,
        path: &[ServiceInstancePathElement],
    ) -> DbResult<MicroserviceInstance> {
        self.mutate_instance(key, |i| {
            if !path.is_empty() && !i.parent_path.iter().any(|p| p.as_slice() == path) {
                i.parent_path.push(path.to_vec());
            }
        })
    }

    /// Drop every dependency path rooted at `root`.
    pub fn remove_ms_instance_parent_path(
        &self,
        key: &str,
        root: &ServiceInstancePathElement,
    ) -> DbResult<MicroserviceInstance> {
        self.mutate_instance(key, |i| i.parent_path.retain(|p| p.first() != Some(root)))
    }

    /// Start a new retry cycle with the given budget.
    pub fn update_ms_instance_retry_state(
        &self,
        key: &str,
        max_retries: u32,
        max_retry_duration: u64,
    ) -> DbResult<MicroserviceInstance> {
        self.mutate_instance(key, |i| {
            i.max_retries = max_retries;
            i.max_retry_duration = max_retry_duration;
            i.current_retry_count = 0;
            i.retry_start_time = now_secs();
        })
    }

    pub fn update_ms_instance_current_retry_count(&self, key: &str, count: u32) -> DbResult<MicroserviceInstance> {
        self.mutate_instance(key, |i| i.current_retry_count = count)
    }

    /// Clear execution state so the instance can be started again.
    pub fn reset_ms_instance_execution_status(&self, key: &str) -> DbResult<MicroserviceInstance> {
        self.mutate_instance(key, |i| {
            i.execution_start_time = 0;
            i.execution_failure_code = 0;
            i.execution_failure_desc.clear();
        })
    }

    /// Returns `(record, applied)`; `applied` is false if cleanup had already started.
    pub fn ms_instance_cleanup_started(&self, key: &str) -> DbResult<Option<(MicroserviceInstance, bool)>> {
        self.update_record_if(self.db_ms_instances, key, |i: &mut MicroserviceInstance| {
            if i.cleanup_start_time != 0 {
                return false;
            }
            i.cleanup_start_time = now_secs();
            true
        })
    }

    pub fn archive_ms_instance(&self, key: &str) -> DbResult<MicroserviceInstance> {
        self.mutate_instance(key, |i| i.archived = true)
    }

    pub fn set_ms_instance_env_vars(
        &self,
        key: &str,
        env: BTreeMap<String, String>,
    ) -> DbResult<MicroserviceInstance> {
        self.mutate_instance(key, |i| i.env_vars = env)
    }

    pub fn delete_ms_instance(&self, key: &str) -> DbResult<bool> {
        self.delete_record(self.db_ms_instances, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(mode: SharingMode) -> MicroserviceDefinition {
        MicroserviceDefinition {
            id: "def1".to_string(),
            spec_ref: "https://acme/gps".to_string(),
            org: "acme".to_string(),
            version: "2.0.1".to_string(),
            arch: "amd64".to_string(),
            sharable: mode,
            ..Default::default()
        }
    }

    #[test]
    fn test_singleton_reuses_live_instance() {
        let dir = tempfile::tempdir().unwrap();
        let db = AgentDb::open(dir.path()).unwrap();
        let d = def(SharingMode::Singleton);

        let (a, created_a) = db.find_or_create_instance(&d, "ag1").unwrap();
        let (b, created_b) = db.find_or_create_instance(&d, "ag2").unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a.key(), b.key());

        db.ms_instance_cleanup_started(&a.key()).unwrap();
        let (c, created_c) = db.find_or_create_instance(&d, "ag3").unwrap();
        assert!(created_c);
        assert_ne!(c.key(), a.key());
    }

    #[test]
    fn test_multiple_never_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let db = AgentDb::open(dir.path()).unwrap();
        let d = def(SharingMode::Multiple);
        db.find_or_create_instance(&d, "i1").unwrap();
        db.find_or_create_instance(&d, "i2").unwrap();
        assert_eq!(db.find_microservice_instances(&[InstanceFilter::Unarchived]).unwrap().len(), 2);
    }

    #[test]
    fn test_cleanup_started_applies_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = AgentDb::open(dir.path()).unwrap();
        let (inst, _) = db.find_or_create_instance(&def(SharingMode::Exclusive), "ag1").unwrap();
        let (_, first) = db.ms_instance_cleanup_started(&inst.key()).unwrap().unwrap();
        let (_, second) = db.ms_instance_cleanup_started(&inst.key()).unwrap().unwrap();
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn test_remove_parent_path_by_root() {
        let dir = tempfile::tempdir().unwrap();
        let db = AgentDb::open(dir.path()).unwrap();
        let (inst, _) = db.find_or_create_instance(&def(SharingMode::Single), "x").unwrap();
        let w1 = ServiceInstancePathElement::new("https://acme/app1", "acme", "1.0.0");
        let w2 = ServiceInstancePathElement::new("https://acme/app2", "acme", "1.0.0");
        let leaf = ServiceInstancePathElement::new("https://acme/gps", "acme", "2.0.1");
        db.add_ms_instance_dependency_path(&inst.key(), &[w1.clone(), leaf.clone()]).unwrap();
        db.add_ms_instance_dependency_path(&inst.key(), &[w2.clone(), leaf]).unwrap();

        let after = db.remove_ms_instance_parent_path(&inst.key(), &w1).unwrap();
        assert_eq!(after.parent_path.len(), 1);
        assert_eq!(after.parent_path[0][0], w2);
    }

    #[test]
    fn test_instance_key_is_sanitized() {
        let k = instance_key("acme", "https://acme/gps", "1.0", "id-1");
        assert_eq!(k, "acme_https___acme_gps_1.0_id-1");
    }
}
