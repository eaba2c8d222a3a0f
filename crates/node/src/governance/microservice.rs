//! # Dependent Service Lifecycle
//!
//! ```text
//!  start ──▶ containers loading ──▶ executing
//!    ▲               │ failed
//!    │ retry         ▼
//!    └──── within budget? ── no ──▶ rollback (next lower version)
//!                                      │ none left
//!                                      ▼
//!                              cleanup started ──▶ archived
//! ```
//!
//! ## Invariants
//!
//! - The retry budget is computed once per retry cycle from the agreements
//!   associated with the instance when the cycle opens.
//! - Cleanup runs at most once per instance; the persisted cleanup marker
//!   gates re-entry.
//! - Staged signing keys are removed whether verification passes or not.
//! - Environment variables are first-write-wins: node attributes, then
//!   workload configuration, then agent supplied `HZN_*` values, then
//!   service defaults.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, error, info, warn};

use anax_common::events::{ContainerEvent, ContainerLaunchContext, LaunchFailure, Message};
use anax_common::persistence::eventlog::{
    EC_COMPLETE_CLEANUP_SERVICE, EC_COMPLETE_DOWNGRADE_SERVICE, EC_COMPLETE_UPGRADE_SERVICE,
    EC_DEPENDENT_SERVICE_FAILED, EC_ERROR_CLEANUP_SERVICE, EC_ERROR_DOWNGRADE_SERVICE,
    EC_ERROR_START_AGREEMENTLESS_SERVICE, EC_ERROR_START_RETRY_DEPENDENT_SERVICE, EC_ERROR_UPGRADE_SERVICE,
    EC_NO_VERSION_TO_DOWNGRADE, EC_START_AGREEMENTLESS_SERVICE, EC_START_CLEANUP_SERVICE,
    EC_START_DEPENDENT_SERVICE, EC_START_DOWNGRADE_SERVICE, EC_START_RETRY_DEPENDENT_SERVICE,
    EC_START_UPGRADE_SERVICE,
};
use anax_common::persistence::{
    now_secs, parse_deployment, DefinitionFilter, EstablishedAgreement, EventSource, ImageDockerAuth,
    InstanceFilter, MicroserviceDefinition, MicroserviceInstance, ServiceDependency, ServiceInstancePathElement,
    Severity, SharingMode, UserInput, WorkloadInfo,
};

use super::{GovernanceError, GovernanceWorker};
use crate::exchange::{retry_transient, RegisteredService};
use crate::policy::{compare_versions, Proposal, VersionRange};
use crate::producer::TermReason;
use crate::signature::{verify_deployment, StagedKeys};

pub const MS_UNREG_EXCH_FAILED: u64 = 200;
pub const MS_CLEAR_OLD_AGS_FAILED: u64 = 201;
pub const MS_EXEC_FAILED: u64 = 202;
pub const MS_REREG_EXCH_FAILED: u64 = 203;
pub const MS_IMAGE_LOAD_FAILED: u64 = 204;
pub const MS_DELETED_BY_UPGRADE_PROCESS: u64 = 205;
pub const MS_DELETED_BY_AGREEMENT_ENDED: u64 = 206;
pub const MS_IMAGE_FETCH_FAILED: u64 = 207;
pub const MS_DELETED_BY_DOWNGRADE_PROCESS: u64 = 208;

pub fn ms_reason_description(code: u64) -> &'static str {
    match code {
        MS_UNREG_EXCH_FAILED => "unregistering the service from the exchange failed",
        MS_CLEAR_OLD_AGS_FAILED => "clearing the agreements of the old service version failed",
        MS_EXEC_FAILED => "service containers failed to execute",
        MS_REREG_EXCH_FAILED => "registering the service with the exchange failed",
        MS_IMAGE_LOAD_FAILED => "service image failed to load",
        MS_DELETED_BY_UPGRADE_PROCESS => "service removed by the upgrade process",
        MS_DELETED_BY_AGREEMENT_ENDED => "service removed because its agreements ended",
        MS_IMAGE_FETCH_FAILED => "service image could not be fetched",
        MS_DELETED_BY_DOWNGRADE_PROCESS => "service removed by the downgrade process",
        _ => "unknown service failure",
    }
}

fn failure_code(failure: LaunchFailure) -> u64 {
    match failure {
        LaunchFailure::ImageLoad => MS_IMAGE_LOAD_FAILED,
        LaunchFailure::ImageFetch | LaunchFailure::ImageFetchAuth => MS_IMAGE_FETCH_FAILED,
        _ => MS_EXEC_FAILED,
    }
}

/// Retry budget `(count, duration_s)` from the `(retries, retry_durations)`
/// requested by each agreement using an instance.
///
/// Each field is the ceiling average of the values that are present. An
/// explicit zero counts; an omitted value does not. With no values present
/// the defaults apply.
pub fn retry_budget(values: &[(Option<u32>, Option<u64>)], default_count: u32, default_duration: u64) -> (u32, u64) {
    let counts: Vec<u64> = values.iter().filter_map(|(c, _)| c.map(u64::from)).collect();
    let durations: Vec<u64> = values.iter().filter_map(|(_, d)| *d).collect();
    let count = ceil_average(&counts)
        .map(|c| u32::try_from(c).unwrap_or(u32::MAX))
        .unwrap_or(default_count);
    let duration = ceil_average(&durations).unwrap_or(default_duration);
    (count, duration)
}

fn ceil_average(values: &[u64]) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as u128;
    let sum: u128 = values.iter().map(|v| u128::from(*v)).sum();
    Some(u64::try_from(sum.div_ceil(n)).unwrap_or(u64::MAX))
}

fn path_element(def: &MicroserviceDefinition) -> ServiceInstancePathElement {
    ServiceInstancePathElement::new(&def.spec_ref, &def.org, &def.version)
}

fn service_info(def: &MicroserviceDefinition) -> WorkloadInfo {
    WorkloadInfo::new(&def.spec_ref, &def.org, &def.version, &def.arch)
}

impl GovernanceWorker {
    // ════════════════════════════════════════════════════════════════════════
    // START
    // ════════════════════════════════════════════════════════════════════════

    /// Start (or join) an instance of `def` and everything it requires.
    ///
    /// With `agreement_id` the instance serves that agreement, otherwise the
    /// node itself. An instance that already existed is joined without a
    /// second container launch. `retry_key` restarts that existing instance.
    pub fn start_microservice<'a>(
        &'a self,
        def: &'a MicroserviceDefinition,
        agreement_id: Option<&'a str>,
        parent_path: Vec<ServiceInstancePathElement>,
        retry_key: Option<&'a str>,
    ) -> BoxFuture<'a, Result<MicroserviceInstance, GovernanceError>> {
        async move {
            let inst = match retry_key {
                Some(key) => self
                    .db
                    .find_microservice_instance(key)?
                    .ok_or_else(|| GovernanceError::InstanceNotFound(key.to_string()))?,
                None => {
                    let instance_id = match agreement_id {
                        Some(id) => id.to_string(),
                        None => uuid::Uuid::new_v4().to_string(),
                    };
                    let (inst, created) = self.db.find_or_create_instance(def, &instance_id)?;
                    let key = inst.key();
                    let mut inst = match agreement_id {
                        Some(id) => self.db.add_ms_instance_agreement(&key, id)?,
                        None => self.db.set_ms_instance_agreement_less(&key)?,
                    };
                    if !parent_path.is_empty() {
                        inst = self.db.add_ms_instance_dependency_path(&key, &parent_path)?;
                    }

                    // children serve every agreement their parent serves
                    let mut own_path = parent_path.clone();
                    own_path.push(path_element(def));
                    for dep in &def.required_services {
                        let child = self.resolve_definition(dep).await?;
                        self.start_microservice(&child, agreement_id, own_path.clone(), None)
                            .await?;
                    }

                    if !created {
                        debug!("joining running instance {}", key);
                        return Ok(inst);
                    }
                    inst
                }
            };
            let key = inst.key();

            info!("starting service {} {} as {}", def.spec_ref, def.version, key);
            self.log(
                Severity::Info,
                EventSource::Service,
                EC_START_DEPENDENT_SERVICE,
                format!("start dependent service {}/{} {}", def.org, def.spec_ref, def.version),
            );

            if !def.has_deployment() {
                return Ok(self.db.update_ms_instance_execution_state(&key, true, 0, "")?);
            }

            let service = service_info(def);
            if let Err(e) = self.verify_service_deployment(def, &key, &service).await {
                warn!("deployment of {} rejected: {}", key, e);
                self.db
                    .update_ms_instance_execution_state(&key, false, MS_EXEC_FAILED, &e.to_string())?;
                return Err(e);
            }

            let docker_auths = self.docker_auths(&service).await;
            let environment = self.service_environment(&def.spec_ref, &def.org, agreement_id, &def.user_inputs)?;
            let inst = self.db.set_ms_instance_env_vars(&key, environment.clone())?;
            let deployment = parse_deployment(&def.deployment)?;

            self.runtime.publish(Message::LoadContainer(ContainerLaunchContext {
                instance_key: key,
                agreement_ids: inst.associated_agreements.clone(),
                deployment,
                environment,
                docker_auths,
                dependency_path: inst.parent_path.first().cloned().unwrap_or_default(),
            }));
            Ok(inst)
        }
        .boxed()
    }

    /// Stage the publisher's signing keys when trusted, then check the
    /// deployment signature. Staged keys are gone when this returns.
    async fn verify_service_deployment(
        &self,
        def: &MicroserviceDefinition,
        key: &str,
        service: &WorkloadInfo,
    ) -> Result<(), GovernanceError> {
        let _staged = if self.config.trust_cert_updates_from_org {
            let retry = self.retry_policy();
            let keys = retry_transient(&retry, "signing keys", || self.exchange.get_object_signing_keys(service)).await?;
            Some(StagedKeys::stage(&self.config.user_public_key_path, key, &keys)?)
        } else {
            None
        };
        verify_deployment(&def.deployment, &def.deployment_signature, &self.config.trusted_key_dirs())?;
        Ok(())
    }

    pub(super) async fn docker_auths(&self, service: &WorkloadInfo) -> Vec<ImageDockerAuth> {
        if !self.config.trust_docker_auth_from_org {
            return Vec::new();
        }
        let retry = self.retry_policy();
        match retry_transient(&retry, "docker auths", || self.exchange.get_service_docker_auths(service)).await {
            Ok(auths) => auths,
            Err(e) => {
                warn!("unable to read registry credentials for {}: {}", service.url, e);
                Vec::new()
            }
        }
    }

    /// Environment for a service's containers. The first source to set a
    /// variable wins.
    pub(super) fn service_environment(
        &self,
        url: &str,
        org: &str,
        agreement_id: Option<&str>,
        user_inputs: &[UserInput],
    ) -> Result<BTreeMap<String, String>, GovernanceError> {
        let mut env = BTreeMap::new();
        let mut set = |k: &str, v: &str| {
            env.entry(k.to_string()).or_insert_with(|| v.to_string());
        };

        for attr in self.db.find_applicable_attributes(url, org)? {
            for (k, v) in &attr.mappings {
                set(k, v);
            }
        }
        for cfg in self.db.find_workload_configs()? {
            if cfg.workload_url == url && cfg.org == org {
                for (k, v) in &cfg.variables {
                    set(k, v);
                }
            }
        }

        let device = self.db.find_device()?.unwrap_or_default();
        let device_id = if device.id.is_empty() { self.config.device_id.as_str() } else { device.id.as_str() };
        set("HZN_DEVICE_ID", device_id);
        set("HZN_ORGANIZATION", &device.org);
        set("HZN_PATTERN", &device.pattern);
        set("HZN_ARCH", &self.config.arch);
        set("HZN_EXCHANGE_URL", &self.config.exchange_url);
        if let Some(id) = agreement_id {
            set("HZN_AGREEMENTID", id);
        }

        for input in user_inputs {
            if let Some(v) = &input.default_value {
                set(&input.name, v);
            }
        }
        Ok(env)
    }

    /// A local definition satisfying `dep`, or a new one built from the
    /// highest matching version in the exchange.
    pub(super) async fn resolve_definition(
        &self,
        dep: &ServiceDependency,
    ) -> Result<MicroserviceDefinition, GovernanceError> {
        let arch = if dep.arch.is_empty() { self.config.arch.as_str() } else { dep.arch.as_str() };
        let range = VersionRange::parse(&dep.version)?;

        let local = self.db.find_microservice_defs(&[
            DefinitionFilter::Unarchived,
            DefinitionFilter::Service {
                url: dep.url.clone(),
                org: dep.org.clone(),
            },
            DefinitionFilter::Arch(arch.to_string()),
        ])?;
        let best = local
            .into_iter()
            .filter(|d| range.contains(&d.version))
            .max_by(|a, b| compare_versions(&a.version, &b.version).unwrap_or(Ordering::Equal));
        if let Some(def) = best {
            return Ok(def);
        }

        let retry = self.retry_policy();
        let found = retry_transient(&retry, "service resolution", || {
            self.exchange.resolve_service_version(&dep.url, &dep.org, &range, arch)
        })
        .await?;
        let svc = found.ok_or_else(|| GovernanceError::ServiceNotFound(format!("{}/{} {}", dep.org, dep.url, dep.version)))?;
        let def = svc.to_definition(&dep.version);
        self.db.save_microservice_def(&def)?;
        debug!("saved definition {} for {} {}", def.id, def.spec_ref, def.version);
        Ok(def)
    }

    pub(super) async fn start_agreement_less_services(&self) {
        if self.is_shutting_down() {
            return;
        }
        for svc in &self.config.agreement_less_services {
            let running = match self.db.find_microservice_instances(&[
                InstanceFilter::Unarchived,
                InstanceFilter::NotCleanedUp,
                InstanceFilter::Service {
                    url: svc.url.clone(),
                    org: svc.org.clone(),
                },
            ]) {
                Ok(insts) => insts.iter().any(|i| i.agreement_less),
                Err(e) => {
                    error!("unable to read instances of {}: {}", svc.url, e);
                    continue;
                }
            };
            if running {
                debug!("agreement-less service {} already running", svc.url);
                continue;
            }

            let dep = ServiceDependency {
                url: svc.url.clone(),
                org: svc.org.clone(),
                version: svc.version.clone(),
                arch: svc.arch.clone(),
            };
            let started = match self.resolve_definition(&dep).await {
                Ok(def) => self.start_microservice(&def, None, Vec::new(), None).await,
                Err(e) => Err(e),
            };
            match started {
                Ok(inst) => self.log(
                    Severity::Info,
                    EventSource::Service,
                    EC_START_AGREEMENTLESS_SERVICE,
                    format!("started agreement-less service {}/{} as {}", svc.org, svc.url, inst.key()),
                ),
                Err(e) => {
                    error!("unable to start agreement-less service {}: {}", svc.url, e);
                    self.log(
                        Severity::Error,
                        EventSource::Service,
                        EC_ERROR_START_AGREEMENTLESS_SERVICE,
                        format!("error starting agreement-less service {}/{}: {}", svc.org, svc.url, e),
                    );
                }
            }
        }
    }

    // ════════════════════════════════════════════════════════════════════════
    // CONTAINER EVENTS, RETRY AND ROLLBACK
    // ════════════════════════════════════════════════════════════════════════

    pub(super) async fn update_microservice(&self, key: &str, event: ContainerEvent) {
        let inst = match self.db.find_microservice_instance(key) {
            Ok(Some(i)) if !i.archived => i,
            Ok(_) => {
                debug!("ignoring {:?} for unknown instance {}", event, key);
                return;
            }
            Err(e) => {
                error!("unable to read instance {}: {}", key, e);
                return;
            }
        };
        let cleaning_up = inst.cleanup_start_time != 0;

        let code = match event {
            ContainerEvent::Started => {
                if let Err(e) = self.db.update_ms_instance_execution_state(key, true, 0, "") {
                    error!("unable to record start of {}: {}", key, e);
                }
                return;
            }
            ContainerEvent::Destroyed if cleaning_up => {
                match self.db.archive_ms_instance(key) {
                    Ok(_) => info!("archived instance {}", key),
                    Err(e) => error!("unable to archive instance {}: {}", key, e),
                }
                return;
            }
            _ if cleaning_up => return,
            ContainerEvent::Failed(f) => failure_code(f),
            ContainerEvent::Destroyed => MS_EXEC_FAILED,
        };

        let desc = ms_reason_description(code);
        if let Err(e) = self.db.update_ms_instance_execution_state(key, false, code, desc) {
            error!("unable to record failure of {}: {}", key, e);
        }
        self.log(
            Severity::Error,
            EventSource::Service,
            EC_DEPENDENT_SERVICE_FAILED,
            format!("dependent service {} failed: {}", key, desc),
        );
        self.handle_microservice_exec_failure(key).await;
    }

    /// Retry budget of an instance from the agreements it serves.
    fn instance_retry_budget(&self, inst: &MicroserviceInstance) -> (u32, u64) {
        let mut values = Vec::new();
        for ag_id in &inst.associated_agreements {
            let terms = match self.db.find_agreement(ag_id) {
                Ok(Some(ag)) => Proposal::demarshal(&ag.proposal).and_then(|p| p.terms()),
                _ => continue,
            };
            match terms {
                Ok(policy) => {
                    if let Some(w) = policy.top_workload() {
                        values.push((w.priority.retries, w.priority.retry_durations));
                    }
                }
                Err(e) => debug!("no retry terms in agreement {}: {}", ag_id, e),
            }
        }
        retry_budget(
            &values,
            self.config.default_service_retry_count,
            self.config.default_service_retry_duration_s,
        )
    }

    async fn handle_microservice_exec_failure(&self, key: &str) {
        let inst = match self.db.find_microservice_instance(key) {
            Ok(Some(i)) => i,
            Ok(None) => return,
            Err(e) => {
                error!("unable to read instance {}: {}", key, e);
                return;
            }
        };

        let now = now_secs();
        let new_cycle =
            inst.retry_start_time == 0 || now.saturating_sub(inst.retry_start_time) > inst.max_retry_duration;
        let inst = if new_cycle {
            let (count, duration) = self.instance_retry_budget(&inst);
            debug!("retry cycle for {}: {} attempts within {}s", key, count, duration);
            match self.db.update_ms_instance_retry_state(key, count, duration) {
                Ok(i) => i,
                Err(e) => {
                    error!("unable to open retry cycle for {}: {}", key, e);
                    return;
                }
            }
        } else {
            inst
        };

        let def = match self.db.find_microservice_def_by_id(&inst.microservice_def_id) {
            Ok(Some(d)) => d,
            Ok(None) => {
                warn!("no definition {} for instance {}", inst.microservice_def_id, key);
                return;
            }
            Err(e) => {
                error!("unable to read definition of {}: {}", key, e);
                return;
            }
        };

        if inst.current_retry_count >= inst.max_retries {
            info!("retries exhausted for {} after {} attempts", key, inst.current_retry_count);
            self.rollback_microservice(&def).await;
            return;
        }

        let attempt = inst.current_retry_count + 1;
        let prepared = self
            .db
            .update_ms_instance_current_retry_count(key, attempt)
            .and_then(|_| self.db.reset_ms_instance_execution_status(key));
        if let Err(e) = prepared {
            error!("unable to record retry {} of {}: {}", attempt, key, e);
            return;
        }
        self.log(
            Severity::Info,
            EventSource::Service,
            EC_START_RETRY_DEPENDENT_SERVICE,
            format!("retry {} of {} for dependent service {}", attempt, inst.max_retries, key),
        );
        let agreement_id = inst.associated_agreements.first().map(String::as_str);
        if let Err(e) = self.start_microservice(&def, agreement_id, Vec::new(), Some(key)).await {
            error!("retry of {} failed to start: {}", key, e);
            self.log(
                Severity::Error,
                EventSource::Service,
                EC_ERROR_START_RETRY_DEPENDENT_SERVICE,
                format!("error restarting dependent service {}: {}", key, e),
            );
            self.rollback_microservice(&def).await;
        }
    }

    /// Move the service to the next lower version, or give up on it and the
    /// agreements that need it.
    async fn rollback_microservice(&self, def: &MicroserviceDefinition) {
        self.log(
            Severity::Info,
            EventSource::Service,
            EC_START_DOWNGRADE_SERVICE,
            format!("start downgrading service {}/{} {}", def.org, def.spec_ref, def.version),
        );
        let retry = self.retry_policy();
        let range = VersionRange::below(&def.version);
        let lower = retry_transient(&retry, "service resolution", || {
            self.exchange.resolve_service_version(&def.spec_ref, &def.org, &range, &def.arch)
        })
        .await;

        match lower {
            Ok(Some(svc)) => {
                let new_def = svc.to_definition(&def.upgrade_version_range);
                self.upgrade_microservice(def.clone(), new_def, false).await;
            }
            other => {
                if let Err(e) = other {
                    warn!("unable to look up lower versions of {}: {}", def.spec_ref, e);
                }
                self.log(
                    Severity::Error,
                    EventSource::Service,
                    EC_NO_VERSION_TO_DOWNGRADE,
                    format!("no lower version of {}/{} below {}", def.org, def.spec_ref, def.version),
                );
                self.record_upgrade_failure(&def.id, MS_EXEC_FAILED);
                self.cleanup_definition_instances(
                    &def.id,
                    MS_DELETED_BY_DOWNGRADE_PROCESS,
                    TermReason::MicroserviceDowngradeRequired,
                )
                .await;
            }
        }
    }

    /// Clean up every live instance of a definition. Returns whether all of
    /// them were cleaned up.
    async fn cleanup_definition_instances(&self, def_id: &str, reason: u64, term: TermReason) -> bool {
        let insts = match self.db.find_microservice_instances(&[
            InstanceFilter::Unarchived,
            InstanceFilter::NotCleanedUp,
            InstanceFilter::DefinitionId(def_id.to_string()),
        ]) {
            Ok(i) => i,
            Err(e) => {
                error!("unable to read instances of {}: {}", def_id, e);
                return false;
            }
        };
        let mut ok = true;
        for inst in insts {
            if let Err(e) = self.cleanup_microservice(&inst.key(), reason, Some(term)).await {
                error!("unable to clean up {}: {}", inst.key(), e);
                ok = false;
            }
        }
        ok
    }

    // ════════════════════════════════════════════════════════════════════════
    // UPGRADE
    // ════════════════════════════════════════════════════════════════════════

    pub(super) async fn handle_microservice_upgrade(&self, def_id: &str) {
        if self.is_shutting_down() {
            return;
        }
        let def = match self.db.find_microservice_def_by_id(def_id) {
            Ok(Some(d)) if d.ready_for_upgrade() => d,
            Ok(_) => return,
            Err(e) => {
                error!("unable to read definition {}: {}", def_id, e);
                return;
            }
        };
        let range = match VersionRange::parse(&def.upgrade_version_range) {
            Ok(r) => r,
            Err(e) => {
                warn!("definition {} has an unusable upgrade range: {}", def_id, e);
                return;
            }
        };
        let retry = self.retry_policy();
        let candidate = retry_transient(&retry, "service resolution", || {
            self.exchange.resolve_service_version(&def.spec_ref, &def.org, &range, &def.arch)
        })
        .await;
        match candidate {
            Ok(Some(svc)) if matches!(compare_versions(&svc.version, &def.version), Ok(Ordering::Greater)) => {
                info!("upgrading {} from {} to {}", def.spec_ref, def.version, svc.version);
                let new_def = svc.to_definition(&def.upgrade_version_range);
                self.upgrade_microservice(def, new_def, true).await;
            }
            Ok(_) => debug!("{} {} is current", def.spec_ref, def.version),
            Err(e) => warn!("unable to check upgrades of {}: {}", def.spec_ref, e),
        }
    }

    fn record_upgrade_failure(&self, def_id: &str, code: u64) {
        let res = self.db.update_microservice_def(def_id, |d| {
            d.upgrade_failed_time = now_secs();
            d.upgrade_failure_reason = code;
            d.upgrade_failure_description = ms_reason_description(code).to_string();
        });
        if let Err(e) = res {
            error!("unable to record failure {} of definition {}: {}", code, def_id, e);
        }
    }

    fn mark_upgrade_step<F>(&self, def_id: &str, f: F)
    where
        F: FnOnce(&mut MicroserviceDefinition),
    {
        if let Err(e) = self.db.update_microservice_def(def_id, f) {
            error!("unable to record upgrade progress of {}: {}", def_id, e);
        }
    }

    /// Replace `old` with `new`. `upgrade` distinguishes an upgrade from a
    /// rollback to a lower version.
    fn upgrade_microservice(
        &self,
        old: MicroserviceDefinition,
        new: MicroserviceDefinition,
        upgrade: bool,
    ) -> BoxFuture<'_, ()> {
        async move {
            let (cleanup_reason, term, complete_code, error_code) = if upgrade {
                (
                    MS_DELETED_BY_UPGRADE_PROCESS,
                    TermReason::MicroserviceUpgradeRequired,
                    EC_COMPLETE_UPGRADE_SERVICE,
                    EC_ERROR_UPGRADE_SERVICE,
                )
            } else {
                (
                    MS_DELETED_BY_DOWNGRADE_PROCESS,
                    TermReason::MicroserviceDowngradeRequired,
                    EC_COMPLETE_DOWNGRADE_SERVICE,
                    EC_ERROR_DOWNGRADE_SERVICE,
                )
            };
            if upgrade {
                self.log(
                    Severity::Info,
                    EventSource::Service,
                    EC_START_UPGRADE_SERVICE,
                    format!("start upgrading {}/{} from {} to {}", old.org, old.spec_ref, old.version, new.version),
                );
            }

            if let Err(e) = self.db.save_microservice_def(&new) {
                error!("unable to save definition of {} {}: {}", new.spec_ref, new.version, e);
                self.log(
                    Severity::Error,
                    EventSource::Service,
                    error_code,
                    format!("error saving {}/{} {}: {}", new.org, new.spec_ref, new.version, e),
                );
                return;
            }
            let new_id = new.id.clone();
            self.mark_upgrade_step(&old.id, |d| {
                d.archived = true;
                d.active_upgrade = true;
                d.upgrade_start_time = now_secs();
                d.upgrade_new_ms_id = new_id;
            });

            let standalone = self
                .db
                .find_microservice_instances(&[
                    InstanceFilter::Unarchived,
                    InstanceFilter::NotCleanedUp,
                    InstanceFilter::DefinitionId(old.id.clone()),
                ])
                .map(|insts| insts.into_iter().filter(|i| i.agreement_less).count())
                .unwrap_or(0);

            let mut failed = false;
            if self.cleanup_definition_instances(&old.id, cleanup_reason, term).await {
                self.mark_upgrade_step(&old.id, |d| d.upgrade_agreements_cleared_time = now_secs());
            } else {
                self.record_upgrade_failure(&old.id, MS_CLEAR_OLD_AGS_FAILED);
                failed = true;
            }

            let retry = self.retry_policy();
            match retry_transient(&retry, "service unregistration", || {
                self.exchange.unregister_service(&old.spec_ref, &old.org)
            })
            .await
            {
                Ok(()) => self.mark_upgrade_step(&old.id, |d| d.upgrade_ms_unregistered_time = now_secs()),
                Err(e) => {
                    warn!("unable to unregister {} from the exchange: {}", old.spec_ref, e);
                    self.record_upgrade_failure(&old.id, MS_UNREG_EXCH_FAILED);
                    failed = true;
                }
            }

            let pattern_node = matches!(self.db.find_device(), Ok(Some(d)) if d.is_pattern_node());
            if pattern_node {
                let reg = RegisteredService {
                    url: new.spec_ref.clone(),
                    org: new.org.clone(),
                    version: new.version.clone(),
                    arch: new.arch.clone(),
                };
                match retry_transient(&retry, "service registration", || self.exchange.register_service(&reg)).await {
                    Ok(()) => self.mark_upgrade_step(&old.id, |d| d.upgrade_ms_reregistered_time = now_secs()),
                    Err(e) => {
                        warn!("unable to register {} {} with the exchange: {}", new.spec_ref, new.version, e);
                        self.record_upgrade_failure(&old.id, MS_REREG_EXCH_FAILED);
                        failed = true;
                    }
                }
            }

            for _ in 0..standalone {
                match self.start_microservice(&new, None, Vec::new(), None).await {
                    Ok(inst) => {
                        debug!("started {} for the node", inst.key());
                        self.mark_upgrade_step(&old.id, |d| d.upgrade_execution_start_time = now_secs());
                    }
                    Err(e) => {
                        warn!("{} {} failed to start: {}", new.spec_ref, new.version, e);
                        self.record_upgrade_failure(&new.id, MS_EXEC_FAILED);
                        self.log(
                            Severity::Error,
                            EventSource::Service,
                            error_code,
                            format!("error starting {}/{} {}: {}", new.org, new.spec_ref, new.version, e),
                        );
                        self.rollback_microservice(&new).await;
                        return;
                    }
                }
            }

            self.mark_upgrade_step(&old.id, |d| d.active_upgrade = false);
            if failed {
                self.log(
                    Severity::Error,
                    EventSource::Service,
                    error_code,
                    format!("{}/{} moved to {} with errors", old.org, old.spec_ref, new.version),
                );
            } else {
                self.log(
                    Severity::Info,
                    EventSource::Service,
                    complete_code,
                    format!("{}/{} moved from {} to {}", old.org, old.spec_ref, old.version, new.version),
                );
            }
        }
        .boxed()
    }

    // ════════════════════════════════════════════════════════════════════════
    // CLEANUP
    // ════════════════════════════════════════════════════════════════════════

    /// Tear down an instance once. With `term`, every agreement it serves is
    /// cancelled for that reason first.
    pub(super) fn cleanup_microservice<'a>(
        &'a self,
        key: &'a str,
        reason: u64,
        term: Option<TermReason>,
    ) -> BoxFuture<'a, Result<(), GovernanceError>> {
        async move {
            let inst = match self.db.ms_instance_cleanup_started(key)? {
                Some((inst, true)) => inst,
                Some((_, false)) => {
                    debug!("cleanup of {} already started", key);
                    return Ok(());
                }
                None => return Err(GovernanceError::InstanceNotFound(key.to_string())),
            };
            info!("cleaning up {}: {}", key, ms_reason_description(reason));
            self.log(
                Severity::Info,
                EventSource::Service,
                EC_START_CLEANUP_SERVICE,
                format!("start cleaning up dependent service {}: {}", key, ms_reason_description(reason)),
            );

            if let Some(term) = term {
                for ag_id in &inst.associated_agreements {
                    self.cancel_for_reason(ag_id, None, term).await;
                }
            }

            let has_containers = match self.db.find_microservice_def_by_id(&inst.microservice_def_id) {
                Ok(Some(def)) => def.has_deployment(),
                Ok(None) => false,
                Err(e) => {
                    self.log(
                        Severity::Error,
                        EventSource::Service,
                        EC_ERROR_CLEANUP_SERVICE,
                        format!("error cleaning up dependent service {}: {}", key, e),
                    );
                    return Err(e.into());
                }
            };
            if has_containers {
                self.runtime.publish(Message::MicroserviceCancellation {
                    instance_key: key.to_string(),
                });
            } else {
                self.db.archive_ms_instance(key)?;
            }
            self.log(
                Severity::Info,
                EventSource::Service,
                EC_COMPLETE_CLEANUP_SERVICE,
                format!("dependent service {} cleanup requested", key),
            );
            Ok(())
        }
        .boxed()
    }

    /// Detach an ending agreement from its services. Instances nothing else
    /// needs are cleaned up; shared ones only lose this agreement's path.
    pub(super) async fn release_agreement_services(&self, agreement: &EstablishedAgreement) {
        let ag_id = agreement.current_agreement_id.as_str();
        let insts = match self
            .db
            .find_microservice_instances(&[InstanceFilter::Unarchived, InstanceFilter::Agreement(ag_id.to_string())])
        {
            Ok(i) => i,
            Err(e) => {
                error!("unable to read services of {}: {}", ag_id, e);
                return;
            }
        };

        let w = &agreement.running_workload;
        let root = ServiceInstancePathElement::new(&w.url, &w.org, &w.version);
        for inst in insts {
            let key = inst.key();
            let inst = match self.db.remove_ms_instance_agreement(&key, ag_id) {
                Ok(i) => i,
                Err(e) => {
                    error!("unable to detach {} from {}: {}", ag_id, key, e);
                    continue;
                }
            };

            if inst.associated_agreements.is_empty() && !inst.agreement_less {
                if let Err(e) = self
                    .cleanup_microservice(&key, MS_DELETED_BY_AGREEMENT_ENDED, None)
                    .await
                {
                    error!("unable to clean up {}: {}", key, e);
                }
                continue;
            }

            let root_shared = inst.associated_agreements.iter().any(|other| {
                matches!(self.db.find_agreement(other), Ok(Some(o))
                    if o.running_workload.url == root.url
                        && o.running_workload.org == root.org
                        && o.running_workload.version == root.version)
            });
            if !root_shared {
                if let Err(e) = self.db.remove_ms_instance_parent_path(&key, &root) {
                    error!("unable to drop the path of {} from {}: {}", ag_id, key, e);
                }
            }
            if inst.sharable == SharingMode::Singleton {
                self.runtime.publish(Message::DropExcessNetworks);
            }
        }
    }
}
