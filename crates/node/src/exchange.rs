//! # Exchange Client
//!
//! The exchange is the node's registry and its message relay to agbots.
//! [`ExchangeApi`] is the surface the agent uses; [`ExchangeClient`] is the
//! HTTP implementation.
//!
//! ## Error Levels
//!
//! ```text
//! ExchangeError
//!   ├─ Transient     connect / timeout / 5xx / 429   → retried by retry_transient
//!   └─ hard          Status / Decode / Unauthorized  → returned to the caller
//! ```
//!
//! [`retry_transient`] retries only the transient kind, with a fixed
//! interval. During node shutdown the retry count is unbounded
//! ([`RetryPolicy::unbounded`]) so teardown completes once connectivity
//! returns.
//!
//! ## Safety
//!
//! - No `panic!`, `unwrap()`, `expect()`.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use anax_common::persistence::{
    ImageDockerAuth, MicroserviceDefinition, ServiceDependency, SharingMode, UserInput, WorkloadInfo,
};

use crate::policy::{compare_versions, VersionRange};

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// Worth retrying: the exchange could not be reached or is overloaded.
    #[error("transient exchange error: {0}")]
    Transient(String),

    #[error("exchange returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unable to decode exchange response: {0}")]
    Decode(String),

    #[error("exchange rejected credentials: {0}")]
    Unauthorized(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

// ════════════════════════════════════════════════════════════════════════════
// WIRE TYPES
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredService {
    pub url: String,
    pub org: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub arch: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeNode {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub registered_services: Vec<RegisteredService>,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub user_input: Vec<serde_json::Value>,
}

/// Fields left `None` are not touched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchDeviceRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered_services: Option<Vec<RegisteredService>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_input: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementState {
    pub state: String,
    pub service: WorkloadInfo,
}

/// A service definition as published in the exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeService {
    pub url: String,
    pub org: String,
    pub version: String,
    pub arch: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub sharable: SharingMode,
    #[serde(default)]
    pub required_services: Vec<ServiceDependency>,
    #[serde(default)]
    pub user_input: Vec<UserInput>,
    #[serde(default)]
    pub deployment: String,
    #[serde(default)]
    pub deployment_signature: String,
}

impl ExchangeService {
    /// A fresh local definition for this service version.
    pub fn to_definition(&self, upgrade_version_range: &str) -> MicroserviceDefinition {
        MicroserviceDefinition {
            id: uuid::Uuid::new_v4().to_string(),
            owner: self.owner.clone(),
            label: self.label.clone(),
            spec_ref: self.url.clone(),
            org: self.org.clone(),
            version: self.version.clone(),
            arch: self.arch.clone(),
            sharable: self.sharable,
            required_services: self.required_services.clone(),
            user_inputs: self.user_input.clone(),
            deployment: self.deployment.clone(),
            deployment_signature: self.deployment_signature.clone(),
            auto_upgrade: true,
            upgrade_version_range: upgrade_version_range.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfigState {
    pub url: String,
    pub org: String,
    pub config_state: String,
}

impl ServiceConfigState {
    pub fn is_suspended(&self) -> bool {
        self.config_state == "suspended"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgbotInfo {
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub msg_end_point: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub agreement_id: String,
    pub service_url: String,
    pub org: String,
    pub version: String,
    pub arch: String,
    pub containers_started: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub services: Vec<ServiceStatus>,
}

// ════════════════════════════════════════════════════════════════════════════
// API
// ════════════════════════════════════════════════════════════════════════════

/// Calls the agent makes against the exchange, on behalf of this node.
#[async_trait]
pub trait ExchangeApi: Send + Sync + std::fmt::Debug {
    /// `None` if the node resource no longer exists.
    async fn get_device(&self) -> ExchangeResult<Option<ExchangeNode>>;

    async fn patch_device(&self, patch: &PatchDeviceRequest) -> ExchangeResult<()>;

    async fn delete_device(&self) -> ExchangeResult<()>;

    async fn delete_agreement(&self, agreement_id: &str) -> ExchangeResult<()>;

    async fn put_agreement_state(&self, agreement_id: &str, state: &AgreementState) -> ExchangeResult<()>;

    /// Signing keys published with a service, file name to key content.
    async fn get_object_signing_keys(&self, service: &WorkloadInfo) -> ExchangeResult<BTreeMap<String, String>>;

    async fn get_service_docker_auths(&self, service: &WorkloadInfo) -> ExchangeResult<Vec<ImageDockerAuth>>;

    /// Highest published version of `url` in `range` for `arch`.
    async fn resolve_service_version(
        &self,
        url: &str,
        org: &str,
        range: &VersionRange,
        arch: &str,
    ) -> ExchangeResult<Option<ExchangeService>>;

    async fn unregister_service(&self, url: &str, org: &str) -> ExchangeResult<()>;

    async fn register_service(&self, service: &RegisteredService) -> ExchangeResult<()>;

    async fn get_services_config_state(&self) -> ExchangeResult<Vec<ServiceConfigState>>;

    async fn get_agbot(&self, agbot_id: &str) -> ExchangeResult<Option<AgbotInfo>>;

    async fn send_agbot_message(&self, agbot_id: &str, message: &serde_json::Value) -> ExchangeResult<()>;

    async fn put_device_status(&self, status: &DeviceStatus) -> ExchangeResult<()>;
}

// ════════════════════════════════════════════════════════════════════════════
// RETRY
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// Attempts including the first; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn bounded(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }
}

/// Run `op`, retrying transient errors per `policy`. Hard errors return at once.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> ExchangeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ExchangeResult<T>>,
{
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => {
                if policy.max_attempts.is_some_and(|max| attempts >= max) {
                    warn!("{} failed after {} attempts: {}", what, attempts, e);
                    return Err(e);
                }
                debug!("{} attempt {} failed, retrying in {:?}: {}", what, attempts, policy.interval, e);
                tokio::time::sleep(policy.interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// HTTP CLIENT
// ════════════════════════════════════════════════════════════════════════════

/// Split `org/id`; an id without an org uses `org` as-is.
fn split_id(full: &str) -> (&str, &str) {
    full.split_once('/').unwrap_or(("", full))
}

/// Exchange resource id of a service version.
pub fn service_id(url: &str, version: &str, arch: &str) -> String {
    let base: String = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '-' })
        .collect();
    format!("{}_{}_{}", base, version, arch)
}

fn classify(e: reqwest::Error) -> ExchangeError {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        ExchangeError::Transient(e.to_string())
    } else if e.is_decode() {
        ExchangeError::Decode(e.to_string())
    } else {
        ExchangeError::Transient(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeClient {
    client: Client,
    base: String,
    org: String,
    node_id: String,
    token: String,
}

#[derive(Deserialize)]
struct NodesResponse {
    #[serde(default)]
    nodes: BTreeMap<String, ExchangeNode>,
}

#[derive(Deserialize)]
struct ServicesResponse {
    #[serde(default)]
    services: BTreeMap<String, ExchangeService>,
}

#[derive(Deserialize)]
struct AgbotsResponse {
    #[serde(default)]
    agbots: BTreeMap<String, AgbotInfo>,
}

#[derive(Deserialize)]
struct ConfigStateResponse {
    #[serde(default)]
    configstates: Vec<ServiceConfigState>,
}

impl ExchangeClient {
    /// `device_id` is the full `org/id` form.
    pub fn new(base_url: &str, device_id: &str, token: &str) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(EXCHANGE_TIMEOUT).build()?;
        let (org, node_id) = split_id(device_id);
        if org.is_empty() || node_id.is_empty() {
            return Err(anyhow::anyhow!("device id {} is not of the form org/id", device_id));
        }
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self {
            client,
            base,
            org: org.to_string(),
            node_id: node_id.to_string(),
            token: token.to_string(),
        })
    }

    fn node_url(&self) -> String {
        format!("{}orgs/{}/nodes/{}", self.base, self.org, self.node_id)
    }

    async fn send(&self, method: Method, url: &str, body: Option<&serde_json::Value>) -> ExchangeResult<Option<String>> {
        let mut req = self
            .client
            .request(method, url)
            .basic_auth(format!("{}/{}", self.org, self.node_id), Some(&self.token));
        if let Some(b) = body {
            req = req.json(b);
        }
        let r = req.send().await.map_err(classify)?;
        let status = r.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let s = r.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    ExchangeError::Unauthorized(format!("{} {}", status, s))
                }
                StatusCode::TOO_MANY_REQUESTS => ExchangeError::Transient(format!("{} {}", status, s)),
                s5 if s5.is_server_error() => ExchangeError::Transient(format!("{} {}", status, s)),
                _ => ExchangeError::Status {
                    status: status.as_u16(),
                    body: s,
                },
            });
        }
        Ok(Some(r.text().await.map_err(classify)?))
    }

    async fn get_json<R: DeserializeOwned>(&self, url: &str) -> ExchangeResult<Option<R>> {
        match self.send(Method::GET, url, None).await? {
            None => Ok(None),
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| ExchangeError::Decode(e.to_string())),
        }
    }

    async fn write<B: Serialize + ?Sized>(&self, method: Method, url: &str, body: &B) -> ExchangeResult<()> {
        let v = serde_json::to_value(body).map_err(|e| ExchangeError::Decode(e.to_string()))?;
        self.send(method, url, Some(&v)).await.map(|_| ())
    }
}

#[async_trait]
impl ExchangeApi for ExchangeClient {
    async fn get_device(&self) -> ExchangeResult<Option<ExchangeNode>> {
        let resp: Option<NodesResponse> = self.get_json(&self.node_url()).await?;
        Ok(resp.and_then(|r| r.nodes.into_values().next()))
    }

    async fn patch_device(&self, patch: &PatchDeviceRequest) -> ExchangeResult<()> {
        self.write(Method::PATCH, &self.node_url(), patch).await
    }

    async fn delete_device(&self) -> ExchangeResult<()> {
        self.send(Method::DELETE, &self.node_url(), None).await.map(|_| ())
    }

    async fn delete_agreement(&self, agreement_id: &str) -> ExchangeResult<()> {
        let url = format!("{}/agreements/{}", self.node_url(), agreement_id);
        self.send(Method::DELETE, &url, None).await.map(|_| ())
    }

    async fn put_agreement_state(&self, agreement_id: &str, state: &AgreementState) -> ExchangeResult<()> {
        let url = format!("{}/agreements/{}", self.node_url(), agreement_id);
        self.write(Method::PUT, &url, state).await
    }

    async fn get_object_signing_keys(&self, service: &WorkloadInfo) -> ExchangeResult<BTreeMap<String, String>> {
        let url = format!(
            "{}orgs/{}/services/{}/keys",
            self.base,
            service.org,
            service_id(&service.url, &service.version, &service.arch)
        );
        Ok(self.get_json(&url).await?.unwrap_or_default())
    }

    async fn get_service_docker_auths(&self, service: &WorkloadInfo) -> ExchangeResult<Vec<ImageDockerAuth>> {
        let url = format!(
            "{}orgs/{}/services/{}/dockauths",
            self.base,
            service.org,
            service_id(&service.url, &service.version, &service.arch)
        );
        Ok(self.get_json(&url).await?.unwrap_or_default())
    }

    async fn resolve_service_version(
        &self,
        url: &str,
        org: &str,
        range: &VersionRange,
        arch: &str,
    ) -> ExchangeResult<Option<ExchangeService>> {
        let q = format!("{}orgs/{}/services", self.base, org);
        let req = self.client.get(&q).query(&[("url", url), ("arch", arch)]).build().map_err(classify)?;
        let resp: Option<ServicesResponse> = self.get_json(req.url().as_str()).await?;
        Ok(highest_in_range(
            resp.map(|r| r.services.into_values().collect()).unwrap_or_default(),
            range,
        ))
    }

    async fn unregister_service(&self, url: &str, org: &str) -> ExchangeResult<()> {
        let Some(node) = self.get_device().await? else {
            return Ok(());
        };
        let remaining: Vec<RegisteredService> = node
            .registered_services
            .into_iter()
            .filter(|s| !(s.url == url && s.org == org))
            .collect();
        self.patch_device(&PatchDeviceRequest {
            registered_services: Some(remaining),
            ..Default::default()
        })
        .await
    }

    async fn register_service(&self, service: &RegisteredService) -> ExchangeResult<()> {
        let node = self.get_device().await?.unwrap_or_default();
        let mut services: Vec<RegisteredService> = node
            .registered_services
            .into_iter()
            .filter(|s| !(s.url == service.url && s.org == service.org))
            .collect();
        services.push(service.clone());
        self.patch_device(&PatchDeviceRequest {
            registered_services: Some(services),
            ..Default::default()
        })
        .await
    }

    async fn get_services_config_state(&self) -> ExchangeResult<Vec<ServiceConfigState>> {
        let url = format!("{}/services_configstate", self.node_url());
        let resp: Option<ConfigStateResponse> = self.get_json(&url).await?;
        Ok(resp.map(|r| r.configstates).unwrap_or_default())
    }

    async fn get_agbot(&self, agbot_id: &str) -> ExchangeResult<Option<AgbotInfo>> {
        let (org, id) = split_id(agbot_id);
        let url = format!("{}orgs/{}/agbots/{}", self.base, org, id);
        let resp: Option<AgbotsResponse> = self.get_json(&url).await?;
        Ok(resp.and_then(|r| r.agbots.into_values().next()))
    }

    async fn send_agbot_message(&self, agbot_id: &str, message: &serde_json::Value) -> ExchangeResult<()> {
        let (org, id) = split_id(agbot_id);
        let url = format!("{}orgs/{}/agbots/{}/msgs", self.base, org, id);
        let body = serde_json::json!({ "message": message.to_string(), "ttl": 180 });
        self.write(Method::POST, &url, &body).await
    }

    async fn put_device_status(&self, status: &DeviceStatus) -> ExchangeResult<()> {
        let url = format!("{}/status", self.node_url());
        self.write(Method::PUT, &url, status).await
    }
}

/// Pick the highest version inside `range`; unparseable versions are skipped.
pub fn highest_in_range(services: Vec<ExchangeService>, range: &VersionRange) -> Option<ExchangeService> {
    services
        .into_iter()
        .filter(|s| range.contains(&s.version))
        .fold(None, |best: Option<ExchangeService>, s| match &best {
            Some(b) if compare_versions(&s.version, &b.version).map_or(true, |o| o.is_le()) => best,
            _ => Some(s),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn svc(version: &str) -> ExchangeService {
        ExchangeService {
            url: "https://acme/gps".to_string(),
            org: "acme".to_string(),
            version: version.to_string(),
            arch: "arm64".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_highest_in_range_respects_bounds() {
        let all = vec![svc("1.0.0"), svc("1.4.2"), svc("2.0.0")];
        let r = VersionRange::parse("[1.0.0,2.0.0)").unwrap();
        assert_eq!(highest_in_range(all.clone(), &r).unwrap().version, "1.4.2");
        assert_eq!(highest_in_range(all.clone(), &VersionRange::below("1.0.0")), None);
        assert_eq!(highest_in_range(all, &VersionRange::below("1.4.2")).unwrap().version, "1.0.0");
    }

    #[test]
    fn test_patch_request_omits_untouched_fields() {
        let p = PatchDeviceRequest {
            pattern: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&p).unwrap(), serde_json::json!({"pattern": ""}));
    }

    #[test]
    fn test_client_requires_org_qualified_id() {
        assert!(ExchangeClient::new("https://x/v1", "rpi-7", "tok").is_err());
        let c = ExchangeClient::new("https://x/v1", "acme/rpi-7", "tok").unwrap();
        assert_eq!(c.node_url(), "https://x/v1/orgs/acme/nodes/rpi-7");
    }

    #[test]
    fn test_service_id_strips_scheme() {
        assert_eq!(service_id("https://acme.com/gps", "1.0.0", "arm64"), "acme.com-gps_1.0.0_arm64");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_hard_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::bounded(Duration::from_secs(10), 5);
        let r: ExchangeResult<()> = retry_transient(&policy, "patch", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::Status { status: 400, body: "bad".to_string() }) }
        })
        .await;
        assert!(r.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retry_gives_up_on_transient() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::bounded(Duration::from_secs(10), 3);
        let r: ExchangeResult<()> = retry_transient(&policy, "get", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::Transient("refused".to_string())) }
        })
        .await;
        assert!(r.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_retry_outlasts_outage() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::unbounded(Duration::from_secs(10));
        let r = retry_transient(&policy, "delete", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 20 {
                    Err(ExchangeError::Transient("down".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(r, Ok(20));
    }
}
