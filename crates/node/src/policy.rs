//! # Policy Subset
//!
//! The pieces of a policy the agent itself needs: demarshal the terms and
//! conditions carried in a proposal, check they are self-consistent, and read
//! the workload's retry priority. Matching policies is the agbot's job.
//!
//! Version expressions follow the `[low,high)` interval form; a bare version
//! `1.2.3` means `[1.2.3,INFINITY)`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use anax_common::persistence::{DeploymentConfig, WorkloadInfo};

pub const INFINITY: &str = "INFINITY";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("unable to demarshal policy: {0}")]
    Demarshal(String),

    #[error("policy {policy} is inconsistent: {reason}")]
    Inconsistent { policy: String, reason: String },

    #[error("invalid version {0}")]
    Version(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyHeader {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Retry budget requested for a workload. Omitted fields are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadPriority {
    #[serde(default)]
    pub priority_value: u32,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_durations: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub workload_url: String,
    pub org: String,
    pub version: String,
    pub arch: String,
    /// JSON deployment descriptor.
    #[serde(default)]
    pub deployment: String,
    #[serde(default)]
    pub deployment_signature: String,
    #[serde(default)]
    pub priority: WorkloadPriority,
}

impl Workload {
    pub fn info(&self) -> WorkloadInfo {
        WorkloadInfo::new(&self.workload_url, &self.org, &self.version, &self.arch)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainSpec {
    #[serde(rename = "type")]
    pub chain_type: String,
    pub name: String,
    #[serde(default)]
    pub org: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementProtocolSpec {
    pub name: String,
    #[serde(default)]
    pub protocol_version: u32,
    #[serde(default)]
    pub blockchains: Vec<BlockchainSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub header: PolicyHeader,
    /// `org/pattern` for pattern based agreements.
    #[serde(default)]
    pub pattern_id: String,
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub agreement_protocols: Vec<AgreementProtocolSpec>,
    #[serde(default)]
    pub workloads: Vec<Workload>,
}

impl Policy {
    pub fn demarshal(raw: &str) -> Result<Policy, PolicyError> {
        serde_json::from_str(raw).map_err(|e| PolicyError::Demarshal(e.to_string()))
    }

    pub fn is_self_consistent(&self) -> Result<(), PolicyError> {
        let fail = |reason: &str| PolicyError::Inconsistent {
            policy: self.header.name.clone(),
            reason: reason.to_string(),
        };
        if self.header.name.is_empty() {
            return Err(fail("header name is empty"));
        }
        if self.workloads.is_empty() {
            return Err(fail("no workloads"));
        }
        for w in &self.workloads {
            if w.workload_url.is_empty() || w.org.is_empty() || w.version.is_empty() || w.arch.is_empty() {
                return Err(fail("workload is missing url, org, version or arch"));
            }
            if !w.deployment.trim().is_empty() {
                anax_common::persistence::parse_deployment(&w.deployment)
                    .map_err(|e| fail(&format!("bad deployment for {}: {}", w.workload_url, e)))?;
            }
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.agreement_protocols {
            if !seen.insert(p.name.as_str()) {
                return Err(fail("agreement protocol listed twice"));
            }
        }
        Ok(())
    }

    /// The workload the agreement runs.
    pub fn top_workload(&self) -> Option<&Workload> {
        self.workloads.first()
    }

    pub fn deployment(&self) -> Result<std::collections::BTreeMap<String, DeploymentConfig>, PolicyError> {
        match self.top_workload() {
            Some(w) if !w.deployment.trim().is_empty() => anax_common::persistence::parse_deployment(&w.deployment)
                .map_err(|e| PolicyError::Demarshal(e.to_string())),
            _ => Ok(Default::default()),
        }
    }
}

/// An offer from an agbot; becomes an agreement once accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub agreement_id: String,
    pub protocol: String,
    pub version: u32,
    /// The agbot that sent the proposal, `org/id`.
    pub consumer_id: String,
    /// Merged policy both parties agree to, as JSON.
    pub ts_and_cs: String,
    #[serde(default)]
    pub producer_policy: String,
}

impl Proposal {
    pub fn demarshal(raw: &str) -> Result<Proposal, PolicyError> {
        serde_json::from_str(raw).map_err(|e| PolicyError::Demarshal(e.to_string()))
    }

    pub fn marshal(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn terms(&self) -> Result<Policy, PolicyError> {
        Policy::demarshal(&self.ts_and_cs)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// VERSIONS
// ════════════════════════════════════════════════════════════════════════════

fn version_parts(v: &str) -> Result<Vec<u64>, PolicyError> {
    let v = v.trim();
    if v.is_empty() {
        return Err(PolicyError::Version(v.to_string()));
    }
    v.split('.')
        .map(|p| p.parse::<u64>().map_err(|_| PolicyError::Version(v.to_string())))
        .collect()
}

/// Compare two dotted versions; missing trailing parts count as zero.
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering, PolicyError> {
    let (pa, pb) = (version_parts(a)?, version_parts(b)?);
    let n = pa.len().max(pb.len());
    for i in 0..n {
        let (x, y) = (pa.get(i).copied().unwrap_or(0), pb.get(i).copied().unwrap_or(0));
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return Ok(other),
        }
    }
    Ok(Ordering::Equal)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    start: String,
    start_inclusive: bool,
    end: Option<String>,
    end_inclusive: bool,
}

impl VersionRange {
    pub fn parse(expr: &str) -> Result<Self, PolicyError> {
        let e = expr.trim();
        if e.is_empty() {
            return Ok(Self::from_start("0.0.0"));
        }
        let first = e.chars().next().unwrap_or(' ');
        if first != '[' && first != '(' {
            version_parts(e)?;
            return Ok(Self::from_start(e));
        }
        let last = e.chars().last().unwrap_or(' ');
        if last != ']' && last != ')' {
            return Err(PolicyError::Version(expr.to_string()));
        }
        let inner = &e[1..e.len() - 1];
        let (lo, hi) = inner
            .split_once(',')
            .ok_or_else(|| PolicyError::Version(expr.to_string()))?;
        let (lo, hi) = (lo.trim(), hi.trim());
        version_parts(lo)?;
        let end = if hi == INFINITY {
            None
        } else {
            version_parts(hi)?;
            Some(hi.to_string())
        };
        Ok(Self {
            start: lo.to_string(),
            start_inclusive: first == '[',
            end,
            end_inclusive: last == ']',
        })
    }

    fn from_start(v: &str) -> Self {
        Self {
            start: v.to_string(),
            start_inclusive: true,
            end: None,
            end_inclusive: false,
        }
    }

    /// Everything strictly below `version`.
    pub fn below(version: &str) -> Self {
        Self {
            start: "0.0.0".to_string(),
            start_inclusive: true,
            end: Some(version.to_string()),
            end_inclusive: false,
        }
    }

    /// Exactly `version`.
    pub fn exact(version: &str) -> Self {
        Self {
            start: version.to_string(),
            start_inclusive: true,
            end: Some(version.to_string()),
            end_inclusive: true,
        }
    }

    pub fn contains(&self, version: &str) -> bool {
        let lower = match compare_versions(version, &self.start) {
            Ok(Ordering::Greater) => true,
            Ok(Ordering::Equal) => self.start_inclusive,
            _ => false,
        };
        if !lower {
            return false;
        }
        match &self.end {
            None => true,
            Some(end) => match compare_versions(version, end) {
                Ok(Ordering::Less) => true,
                Ok(Ordering::Equal) => self.end_inclusive,
                _ => false,
            },
        }
    }
}

impl std::fmt::Display for VersionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{},{}{}",
            if self.start_inclusive { '[' } else { '(' },
            self.start,
            self.end.as_deref().unwrap_or(INFINITY),
            if self.end_inclusive { ']' } else { ')' }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_json(name: &str) -> String {
        serde_json::json!({
            "header": {"name": name},
            "agreement_protocols": [{"name": "Basic", "protocol_version": 2}],
            "workloads": [{
                "workload_url": "https://acme/netspeed",
                "org": "acme",
                "version": "2.1.0",
                "arch": "amd64",
                "priority": {"retries": 3}
            }]
        })
        .to_string()
    }

    #[test]
    fn test_demarshal_keeps_omitted_retry_duration_as_none() {
        let p = Policy::demarshal(&policy_json("netspeed")).unwrap();
        assert!(p.is_self_consistent().is_ok());
        let prio = &p.top_workload().unwrap().priority;
        assert_eq!(prio.retries, Some(3));
        assert_eq!(prio.retry_durations, None);
    }

    #[test]
    fn test_policy_without_workloads_is_inconsistent() {
        let p = Policy {
            header: PolicyHeader {
                name: "empty".to_string(),
                version: String::new(),
            },
            ..Default::default()
        };
        assert!(matches!(p.is_self_consistent(), Err(PolicyError::Inconsistent { .. })));
    }

    #[test]
    fn test_garbage_policy_fails_to_demarshal() {
        assert!(matches!(Policy::demarshal("{not json"), Err(PolicyError::Demarshal(_))));
    }

    #[test]
    fn test_version_compare_pads_missing_parts() {
        assert_eq!(compare_versions("1.2", "1.2.0").unwrap(), Ordering::Equal);
        assert_eq!(compare_versions("1.10.0", "1.9.9").unwrap(), Ordering::Greater);
        assert!(compare_versions("1.x", "1.0").is_err());
    }

    #[test]
    fn test_range_bounds() {
        let r = VersionRange::parse("[1.0.0,2.0.0)").unwrap();
        assert!(r.contains("1.0.0"));
        assert!(r.contains("1.9.3"));
        assert!(!r.contains("2.0.0"));

        let open = VersionRange::parse("1.5").unwrap();
        assert!(open.contains("7.0.0"));
        assert!(!open.contains("1.4.9"));
        assert_eq!(open.to_string(), "[1.5,INFINITY)");

        assert!(VersionRange::below("1.2.0").contains("1.1.9"));
        assert!(!VersionRange::below("1.2.0").contains("1.2.0"));
        assert!(VersionRange::exact("1.2.0").contains("1.2"));
    }
}
