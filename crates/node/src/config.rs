//! # Agent Configuration
//!
//! `AgentConfig` is read from a TOML file and then overridden by `ANAX_*`
//! environment variables. Environment files are loaded first, see
//! [`load_env_file`].
//!
//! ## Keys
//!
//! | key | default |
//! |-----|---------|
//! | `db_path` | `./anax-db` |
//! | `exchange_url` | (required) |
//! | `device_id` / `device_token` | empty |
//! | `policy_path` | `./policy.d` |
//! | `public_key_path` | `./keys` |
//! | `user_public_key_path` | `./keys/user` |
//! | `message_key_path` | `./keys/messaging` |
//! | `default_service_retry_count` | 2 |
//! | `default_service_retry_duration_s` | 600 |
//! | `service_upgrade_check_interval_s` | 300 (0 disables) |
//! | `governance_sweep_interval_s` | 600 |
//! | `service_config_state_check_interval_s` | 60 |
//! | `device_status_interval_s` | 60 |
//! | `exchange_retry_interval_s` | 10 |
//! | `exchange_retry_count` | 3 |
//! | `trust_cert_updates_from_org` | true |
//! | `trust_docker_auth_from_org` | true |
//! | `command_queue_depth` | 200 |
//! | `[blockchain]` | absent |

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use anax_chain::ChainConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A dependent service the node runs without any agreement.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct AgreementLessService {
    pub url: String,
    pub org: String,
    /// Version range expression.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub arch: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub db_path: PathBuf,
    pub exchange_url: String,
    pub device_id: String,
    pub device_token: String,
    /// Node architecture reported to services, defaults to the build target.
    pub arch: String,

    pub policy_path: PathBuf,
    /// Trusted keys shipped with the agent.
    pub public_key_path: PathBuf,
    /// Keys added by the user or staged from the exchange.
    pub user_public_key_path: PathBuf,
    /// Key pair used on the agbot messaging channel.
    pub message_key_path: PathBuf,

    pub default_service_retry_count: u32,
    pub default_service_retry_duration_s: u64,
    pub service_upgrade_check_interval_s: u64,
    pub governance_sweep_interval_s: u64,
    pub service_config_state_check_interval_s: u64,
    pub device_status_interval_s: u64,

    pub exchange_retry_interval_s: u64,
    pub exchange_retry_count: u32,

    pub trust_cert_updates_from_org: bool,
    pub trust_docker_auth_from_org: bool,

    pub command_queue_depth: usize,

    pub agreement_less_services: Vec<AgreementLessService>,

    pub blockchain: Option<ChainConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            db_path: PathBuf::from("./anax-db"),
            exchange_url: String::new(),
            device_id: String::new(),
            device_token: String::new(),
            arch: env::consts::ARCH.to_string(),
            policy_path: PathBuf::from("./policy.d"),
            public_key_path: PathBuf::from("./keys"),
            user_public_key_path: PathBuf::from("./keys/user"),
            message_key_path: PathBuf::from("./keys/messaging"),
            default_service_retry_count: 2,
            default_service_retry_duration_s: 600,
            service_upgrade_check_interval_s: 300,
            governance_sweep_interval_s: 600,
            service_config_state_check_interval_s: 60,
            device_status_interval_s: 60,
            exchange_retry_interval_s: 10,
            exchange_retry_count: 3,
            trust_cert_updates_from_org: true,
            trust_docker_auth_from_org: true,
            command_queue_depth: 200,
            agreement_less_services: Vec::new(),
            blockchain: None,
        }
    }
}

/// Load config from a TOML file path. Missing keys take their defaults.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<AgentConfig, ConfigError> {
    let p = path.as_ref();
    let s = fs::read_to_string(p).map_err(|source| ConfigError::Io {
        path: p.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: p.to_path_buf(),
        source,
    })
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

impl AgentConfig {
    /// Apply `ANAX_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|k| env::var(k).ok())
    }

    /// Apply overrides from `lookup`, keyed by `ANAX_<UPPERCASE KEY>`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ANAX_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ANAX_EXCHANGE_URL") {
            self.exchange_url = v;
        }
        if let Some(v) = lookup("ANAX_DEVICE_ID") {
            self.device_id = v;
        }
        if let Some(v) = lookup("ANAX_DEVICE_TOKEN") {
            self.device_token = v;
        }
        if let Some(v) = lookup("ANAX_POLICY_PATH") {
            self.policy_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ANAX_PUBLIC_KEY_PATH") {
            self.public_key_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ANAX_USER_PUBLIC_KEY_PATH") {
            self.user_public_key_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ANAX_SERVICE_RETRY_COUNT") {
            self.default_service_retry_count = parse_env("ANAX_SERVICE_RETRY_COUNT", &v)?;
        }
        if let Some(v) = lookup("ANAX_SERVICE_RETRY_DURATION_S") {
            self.default_service_retry_duration_s = parse_env("ANAX_SERVICE_RETRY_DURATION_S", &v)?;
        }
        if let Some(v) = lookup("ANAX_SERVICE_UPGRADE_CHECK_INTERVAL_S") {
            self.service_upgrade_check_interval_s = parse_env("ANAX_SERVICE_UPGRADE_CHECK_INTERVAL_S", &v)?;
        }
        if let Some(v) = lookup("ANAX_GOVERNANCE_SWEEP_INTERVAL_S") {
            self.governance_sweep_interval_s = parse_env("ANAX_GOVERNANCE_SWEEP_INTERVAL_S", &v)?;
        }
        if let Some(v) = lookup("ANAX_EXCHANGE_RETRY_INTERVAL_S") {
            self.exchange_retry_interval_s = parse_env("ANAX_EXCHANGE_RETRY_INTERVAL_S", &v)?;
        }
        if let Some(v) = lookup("ANAX_EXCHANGE_RETRY_COUNT") {
            self.exchange_retry_count = parse_env("ANAX_EXCHANGE_RETRY_COUNT", &v)?;
        }
        if let Some(v) = lookup("ANAX_TRUST_CERT_UPDATES_FROM_ORG") {
            self.trust_cert_updates_from_org = parse_bool("ANAX_TRUST_CERT_UPDATES_FROM_ORG", &v)?;
        }
        if let Some(v) = lookup("ANAX_TRUST_DOCKER_AUTH_FROM_ORG") {
            self.trust_docker_auth_from_org = parse_bool("ANAX_TRUST_DOCKER_AUTH_FROM_ORG", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("db_path is empty".to_string()));
        }
        if self.exchange_url.is_empty() {
            return Err(ConfigError::Invalid("exchange_url is empty".to_string()));
        }
        if self.governance_sweep_interval_s == 0 {
            return Err(ConfigError::Invalid("governance_sweep_interval_s must be > 0".to_string()));
        }
        if self.exchange_retry_interval_s == 0 {
            return Err(ConfigError::Invalid("exchange_retry_interval_s must be > 0".to_string()));
        }
        if self.command_queue_depth == 0 {
            return Err(ConfigError::Invalid("command_queue_depth must be > 0".to_string()));
        }
        if let Some(bc) = &self.blockchain {
            bc.validate()
                .map_err(|e| ConfigError::Invalid(format!("blockchain: {}", e)))?;
        }
        Ok(())
    }

    pub fn governance_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.governance_sweep_interval_s)
    }

    pub fn exchange_retry_interval(&self) -> Duration {
        Duration::from_secs(self.exchange_retry_interval_s)
    }

    /// `None` when upgrade checks are disabled.
    pub fn service_upgrade_check_interval(&self) -> Option<Duration> {
        (self.service_upgrade_check_interval_s > 0)
            .then(|| Duration::from_secs(self.service_upgrade_check_interval_s))
    }

    /// Directories holding trusted deployment signing keys.
    pub fn trusted_key_dirs(&self) -> Vec<PathBuf> {
        vec![self.public_key_path.clone(), self.user_public_key_path.clone()]
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ENV FILE LOADING
// ════════════════════════════════════════════════════════════════════════════

/// Load environment variables from an env file.
///
/// Priority order:
/// 1. `ANAX_ENV_FILE` environment variable (custom path)
/// 2. `.env.mainnet`
/// 3. `.env`
///
/// Returns the file that was loaded, if any. Runs before tracing is
/// initialised, so failures other than a missing file go to stderr.
pub fn load_env_file() -> Option<PathBuf> {
    let env_file = env::var("ANAX_ENV_FILE").unwrap_or_else(|_| {
        if Path::new(".env.mainnet").exists() {
            ".env.mainnet".to_string()
        } else {
            ".env".to_string()
        }
    });

    match dotenvy::from_filename(&env_file) {
        Ok(path) => Some(path),
        Err(e) => {
            if !matches!(e, dotenvy::Error::Io(_)) {
                eprintln!("warning: failed to load {}: {}", env_file, e);
            }
            None
        }
    }
}
