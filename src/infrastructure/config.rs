use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const SYNC_JSON: &str = "sync.json";
const SUPPORTED_SCHEMA: u64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    /// Public HTTPS endpoint receiving push notifications. Channels are not
    /// renewed while this is unset.
    pub address: Option<String>,
    pub ttl_seconds: u64,
    /// Channels expiring within this window are renewed ahead of time.
    #[serde(default = "default_renew_before_seconds")]
    pub renew_before_seconds: u64,
}

fn default_renew_before_seconds() -> u64 {
    24 * 60 * 60
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            address: None,
            ttl_seconds: 7 * 24 * 60 * 60,
            renew_before_seconds: default_renew_before_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub schema: u8,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub watch: WatchConfig,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            schema: 1,
            retry: RetryConfig::default(),
            request_timeout_ms: default_request_timeout_ms(),
            log_level: default_log_level(),
            watch: WatchConfig::default(),
        }
    }
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    let path = config_dir.join(SYNC_JSON);
    if !path.exists() {
        let formatted = serde_json::to_string_pretty(&SyncConfig::default())?;
        fs::write(&path, format!("{formatted}\n"))?;
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != SUPPORTED_SCHEMA {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_sync_config(config_dir: &Path) -> Result<SyncConfig, InfraError> {
    let path = config_dir.join(SYNC_JSON);
    let config: SyncConfig = serde_json::from_value(read_config(&path)?)?;
    if config.request_timeout_ms == 0 {
        return Err(InfraError::InvalidConfig(format!(
            "requestTimeoutMs must be > 0 in {}",
            path.display()
        )));
    }
    if config.watch.ttl_seconds == 0 {
        return Err(InfraError::InvalidConfig(format!(
            "watch.ttlSeconds must be > 0 in {}",
            path.display()
        )));
    }
    Ok(config)
}
