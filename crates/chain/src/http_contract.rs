//! Contract gateway client.
//!
//! The agent does not speak the chain's RPC itself. A gateway process holds
//! the ABIs and exposes two JSON endpoints:
//!
//! - `POST {base}/contracts` with `{"name", "owner"}` deploys and answers `{"address"}`
//! - `POST {base}/contracts/{address}/invoke` with `{"name", "owner", "method", "params"}`
//!   answers `{"result", "block"}`
//!
//! `params` and `result` use the tagged [`ContractValue`] encoding.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::contract::{ContractClient, ContractError, ContractFactory, ContractResult, ContractValue};

const GATEWAY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct DeployRequest<'a> {
    name: &'a str,
    owner: &'a str,
}

#[derive(Debug, Deserialize)]
struct DeployResponse {
    address: String,
}

#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    name: &'a str,
    owner: &'a str,
    method: &'a str,
    params: &'a [ContractValue],
}

#[derive(Debug, Deserialize)]
struct InvokeResponse {
    result: ContractValue,
    #[serde(default)]
    block: u64,
}

async fn post_json<B: Serialize, R: for<'de> Deserialize<'de>>(client: &Client, url: &str, body: &B) -> Result<R> {
    let r = client.post(url).json(body).send().await?;
    let status = r.status();
    if !status.is_success() {
        let s = r.text().await.unwrap_or_default();
        return Err(anyhow::anyhow!("gateway error: {} {}", status, s));
    }
    Ok(r.json::<R>().await?)
}

// ════════════════════════════════════════════════════════════════════════════
// CONTRACT HANDLE
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct HttpContract {
    client: Client,
    base: String,
    name: String,
    owner: String,
    address: String,
    stable_block: AtomicU64,
}

#[async_trait]
impl ContractClient for HttpContract {
    fn contract_address(&self) -> String {
        self.address.clone()
    }

    fn stable_block(&self) -> u64 {
        self.stable_block.load(Ordering::SeqCst)
    }

    async fn invoke_method(&self, method: &str, params: Vec<ContractValue>) -> ContractResult<ContractValue> {
        let url = format!("{}/contracts/{}/invoke", self.base, self.address);
        let body = InvokeRequest {
            name: &self.name,
            owner: &self.owner,
            method,
            params: &params,
        };
        let resp: InvokeResponse = post_json(&self.client, &url, &body)
            .await
            .map_err(|e| ContractError::Invoke {
                method: method.to_string(),
                address: self.address.clone(),
                reason: e.to_string(),
            })?;
        self.stable_block.fetch_max(resp.block, Ordering::SeqCst);
        Ok(resp.result)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// FACTORY
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct HttpContractFactory {
    client: Client,
    base: String,
}

impl HttpContractFactory {
    pub fn new(base: impl Into<String>) -> ContractResult<Self> {
        let client = Client::builder()
            .timeout(GATEWAY_TIMEOUT)
            .build()
            .map_err(|e| ContractError::Config(format!("gateway client: {}", e)))?;
        Ok(Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    fn handle(&self, name: &str, owner: &str, address: &str) -> Arc<dyn ContractClient> {
        Arc::new(HttpContract {
            client: self.client.clone(),
            base: self.base.clone(),
            name: name.to_string(),
            owner: owner.to_string(),
            address: address.to_string(),
            stable_block: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl ContractFactory for HttpContractFactory {
    async fn deploy(&self, name: &str, owner: &str) -> ContractResult<Arc<dyn ContractClient>> {
        let url = format!("{}/contracts", self.base);
        let resp: DeployResponse = post_json(&self.client, &url, &DeployRequest { name, owner })
            .await
            .map_err(|e| ContractError::Deploy(e.to_string()))?;
        if resp.address.is_empty() {
            return Err(ContractError::Deploy(format!("{} deployed without an address", name)));
        }
        Ok(self.handle(name, owner, &resp.address))
    }

    async fn at(&self, name: &str, owner: &str, address: &str) -> ContractResult<Arc<dyn ContractClient>> {
        if address.is_empty() {
            return Err(ContractError::NotFound(format!("{} has no address", name)));
        }
        Ok(self.handle(name, owner, address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_body_uses_tagged_values() {
        let params = vec![ContractValue::str("0xdev"), ContractValue::Bool(true)];
        let body = InvokeRequest {
            name: "token_bank",
            owner: "0xme",
            method: "counter_party_vote",
            params: &params,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["params"][0]["type"], "str");
        assert_eq!(v["params"][1]["value"], true);
    }

    #[test]
    fn test_response_decodes_list() {
        let resp: InvokeResponse =
            serde_json::from_str(r#"{"result":{"type":"str_list","value":["name","rpi"]},"block":12}"#).unwrap();
        assert_eq!(resp.result, ContractValue::StrList(vec!["name".into(), "rpi".into()]));
        assert_eq!(resp.block, 12);
    }

    #[tokio::test]
    async fn test_at_rejects_empty_address() {
        let f = HttpContractFactory::new("http://localhost:9/").unwrap();
        assert!(f.at("directory", "0xme", "").await.is_err());
    }
}
