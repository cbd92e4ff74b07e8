//! Runtime configuration for kv-connector.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! The connector-facing part (`ConnectorConfig`) is immutable once handed to
//! the factory and is shared as `Arc<ConnectorConfig>`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::connector::base::RuntimeVersion;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-connector", about = "KV-cache transfer connector host")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Admin API listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Major-version mode of the hosting runtime.
    pub runtime: RuntimeVersion,

    /// Connector selection and transfer tuning.
    pub kv_transfer: ConnectorConfig,

    /// Admin HTTP surface.
    pub admin: AdminConfig,
}

/// Admin API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Listen address (e.g. "0.0.0.0:9090").
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Everything a connector implementation is constructed from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Registered connector name (e.g. "StorageConnector").
    pub kv_connector: String,

    /// Module path used when `kv_connector` is not registered.
    pub kv_connector_module_path: Option<String>,

    /// Identifier of the engine instance hosting this connector.
    pub engine_id: String,

    /// Role hint from the deployment ("producer", "consumer", "both").
    pub kv_role: Option<String>,

    /// KV layout shared by both roles.
    pub layout: KvLayout,

    /// Transfer capacity and timeout knobs.
    pub transfer: TransferConfig,

    /// Backend-specific options.
    pub extra_config: serde_json::Map<String, serde_json::Value>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            kv_connector: "StorageConnector".to_string(),
            kv_connector_module_path: None,
            engine_id: uuid::Uuid::new_v4().to_string(),
            kv_role: None,
            layout: KvLayout::default(),
            transfer: TransferConfig::default(),
            extra_config: serde_json::Map::new(),
        }
    }
}

impl ConnectorConfig {
    /// Config for the named connector with default tuning.
    pub fn for_connector(name: impl Into<String>) -> Self {
        Self {
            kv_connector: name.into(),
            ..Default::default()
        }
    }

    /// Builder-style backend option.
    pub fn with_option(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extra_config.insert(key.to_string(), value);
        self
    }

    /// Get a typed backend option.
    pub fn get_option<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.extra_config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Get a string backend option.
    pub fn get_string_option(&self, key: &str) -> Option<String> {
        self.extra_config
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// Derive the config view handed to a composite's sub-connector.
    ///
    /// Engine id, layout and transfer tuning are inherited; name, module path
    /// and backend options come from the sub-connector entry.
    pub fn sub_config(&self, entry: &SubConnectorEntry) -> ConnectorConfig {
        ConnectorConfig {
            kv_connector: entry.kv_connector.clone(),
            kv_connector_module_path: entry.kv_connector_module_path.clone(),
            extra_config: entry.extra_config.clone(),
            ..self.clone()
        }
    }
}

/// One entry of a composite connector's `extra_config.connectors` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubConnectorEntry {
    pub kv_connector: String,

    #[serde(default)]
    pub kv_connector_module_path: Option<String>,

    #[serde(default)]
    pub extra_config: serde_json::Map<String, serde_json::Value>,
}

/// KV cache geometry both roles agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvLayout {
    /// Number of transformer layers (one pre/post hook pair each).
    pub num_layers: usize,

    /// Tokens per block.
    pub block_size: usize,

    /// Blocks in the worker-local pool.
    pub num_blocks: usize,
}

impl Default for KvLayout {
    fn default() -> Self {
        Self {
            num_layers: 32,
            block_size: 16,
            num_blocks: 4096,
        }
    }
}

/// What to do when outstanding transfer volume exceeds capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Park new transfers until capacity frees up.
    #[default]
    Throttle,
    /// Reject new transfers with a capacity error.
    FailFast,
}

/// Transfer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum bytes of save traffic outstanding at once.
    pub max_inflight_bytes: usize,

    /// Policy once `max_inflight_bytes` is reached.
    pub backpressure: BackpressurePolicy,

    /// Bound on a pre-attention wait before falling back to recompute.
    pub load_timeout_ms: u64,

    /// Consecutive failures before a backend is reported degraded.
    pub health_failure_threshold: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_inflight_bytes: 256 * 1024 * 1024, // 256 MB
            backpressure: BackpressurePolicy::Throttle,
            load_timeout_ms: 5_000,
            health_failure_threshold: 5,
        }
    }
}

impl TransferConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.runtime, RuntimeVersion::Current);
        assert_eq!(cfg.kv_transfer.kv_connector, "StorageConnector");
        assert_eq!(cfg.kv_transfer.transfer.backpressure, BackpressurePolicy::Throttle);
        assert!(!cfg.kv_transfer.engine_id.is_empty());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{
            "runtime": "legacy",
            "kv_transfer": {
                "kv_connector": "MultiConnector",
                "engine_id": "prefill-0",
                "transfer": { "backpressure": "fail_fast" }
            }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.runtime, RuntimeVersion::Legacy);
        assert_eq!(cfg.kv_transfer.engine_id, "prefill-0");
        assert_eq!(cfg.kv_transfer.transfer.backpressure, BackpressurePolicy::FailFast);
        assert_eq!(cfg.kv_transfer.transfer.load_timeout_ms, 5_000);
        assert_eq!(cfg.kv_transfer.layout, KvLayout::default());
    }

    #[test]
    fn test_sub_config_inherits_engine_id() {
        let parent = ConnectorConfig {
            engine_id: "decode-3".to_string(),
            ..ConnectorConfig::for_connector("MultiConnector")
        }
        .with_option("connectors", serde_json::json!([]));

        let entry = SubConnectorEntry {
            kv_connector: "StorageConnector".to_string(),
            kv_connector_module_path: None,
            extra_config: serde_json::Map::new(),
        };
        let sub = parent.sub_config(&entry);
        assert_eq!(sub.engine_id, "decode-3");
        assert_eq!(sub.kv_connector, "StorageConnector");
        assert!(sub.extra_config.is_empty());
    }
}
