//! Role- and version-checked connector construction.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{ConnectorConfig, SubConnectorEntry};
use crate::connector::base::{
    BuildContext, ConnectorInstance, ConnectorRole, RuntimeVersion, SchedulerConnector,
    WorkerConnector,
};
use crate::connector::registry::ConnectorRegistry;
use crate::error::{ConfigurationError, Result};
use crate::transfer::store::{DiskStore, KvStore};

/// Builds connector instances from configuration.
///
/// Holds the registry by reference and the runtime's major-version mode.
/// Every `create` call yields a fresh instance. The only thing shared between
/// instances is the set of named stores, so the scheduler and worker halves
/// of one deployment look at the same backend.
pub struct ConnectorFactory {
    registry: Arc<ConnectorRegistry>,
    runtime: RuntimeVersion,
    stores: Mutex<HashMap<String, Arc<dyn KvStore>>>,
}

impl ConnectorFactory {
    pub fn new(registry: Arc<ConnectorRegistry>, runtime: RuntimeVersion) -> Self {
        Self {
            registry,
            runtime,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Make `store` available to connectors under `name`.
    pub fn with_store(self, name: impl Into<String>, store: Arc<dyn KvStore>) -> Self {
        self.add_store(name, store);
        self
    }

    pub fn add_store(&self, name: impl Into<String>, store: Arc<dyn KvStore>) {
        self.stores.lock().insert(name.into(), store);
    }

    pub fn store(&self, name: &str) -> Option<Arc<dyn KvStore>> {
        self.stores.lock().get(name).cloned()
    }

    /// Named store, created with `make` on first use.
    pub fn store_or_insert_with(
        &self,
        name: &str,
        make: impl FnOnce() -> Arc<dyn KvStore>,
    ) -> Arc<dyn KvStore> {
        self.stores
            .lock()
            .entry(name.to_string())
            .or_insert_with(make)
            .clone()
    }

    pub fn registry(&self) -> &Arc<ConnectorRegistry> {
        &self.registry
    }

    pub fn runtime(&self) -> RuntimeVersion {
        self.runtime
    }

    /// Open every disk-backed store referenced by `config`, including the
    /// sub-connectors of a composite.
    ///
    /// Disk stores index their directory asynchronously, so they are opened
    /// during bootstrap rather than inside the synchronous `create`.
    pub async fn open_stores(&self, config: &ConnectorConfig) -> Result<()> {
        let mut pending = vec![config.clone()];
        while let Some(config) = pending.pop() {
            if let Some(entries) = config.get_option::<Vec<SubConnectorEntry>>("connectors") {
                pending.extend(entries.iter().map(|entry| config.sub_config(entry)));
            }
            if config.get_string_option("backend").as_deref() != Some("disk") {
                continue;
            }

            let name = config
                .get_string_option("store")
                .unwrap_or_else(|| config.kv_connector.clone());
            if self.store(&name).is_some() {
                continue;
            }
            let path = config.get_string_option("path").ok_or_else(|| {
                ConfigurationError::InvalidOption {
                    connector: config.kv_connector.clone(),
                    message: "disk backend requires a 'path' option".to_string(),
                }
            })?;
            let zstd_level = config.get_option::<i32>("zstd_level");
            let store = DiskStore::open(&name, &path, config.layout.num_layers, zstd_level).await?;
            info!(store = %name, path = %path, "Opened disk store");
            self.add_store(name, Arc::new(store));
        }
        Ok(())
    }

    /// Resolve, validate and construct a connector for `role`.
    pub fn create(
        &self,
        role: ConnectorRole,
        config: impl Into<Arc<ConnectorConfig>>,
    ) -> Result<ConnectorInstance> {
        let config: Arc<ConnectorConfig> = config.into();
        let class = self.registry.get_connector_class(&config)?;

        if !class.supported_versions().contains(&self.runtime) {
            return Err(ConfigurationError::VersionMismatch {
                connector: config.kv_connector.clone(),
                runtime: self.runtime,
                supported: class.supported_versions().to_vec(),
            }
            .into());
        }
        if !class.supports_role(role) {
            return Err(ConfigurationError::RoleMismatch {
                connector: config.kv_connector.clone(),
                role,
            }
            .into());
        }

        info!(
            connector = %config.kv_connector,
            engine_id = %config.engine_id,
            role = %role,
            "Creating connector"
        );

        let ctx = BuildContext {
            config: config.clone(),
            role,
            factory: self,
        };
        let instance = class.build(&ctx)?;

        // A class that hands back the other half does not satisfy the contract.
        if instance.role() != role {
            return Err(ConfigurationError::RoleMismatch {
                connector: config.kv_connector.clone(),
                role,
            }
            .into());
        }
        debug!(connector = %config.kv_connector, class = class.class_name(), "Connector constructed");
        Ok(instance)
    }

    pub fn create_scheduler(
        &self,
        config: impl Into<Arc<ConnectorConfig>>,
    ) -> Result<Box<dyn SchedulerConnector>> {
        let instance = self.create(ConnectorRole::Scheduler, config)?;
        let name = instance.name().to_string();
        instance.into_scheduler().ok_or_else(|| {
            ConfigurationError::RoleMismatch {
                connector: name,
                role: ConnectorRole::Scheduler,
            }
            .into()
        })
    }

    pub fn create_worker(
        &self,
        config: impl Into<Arc<ConnectorConfig>>,
    ) -> Result<Box<dyn WorkerConnector>> {
        let instance = self.create(ConnectorRole::Worker, config)?;
        let name = instance.name().to_string();
        instance.into_worker().ok_or_else(|| {
            ConfigurationError::RoleMismatch {
                connector: name,
                role: ConnectorRole::Worker,
            }
            .into()
        })
    }
}
