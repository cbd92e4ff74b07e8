//! Connector registry: name -> deferred loader -> connector class.
//!
//! The registry is an explicit object built once at startup and handed to the
//! factory by reference. Loaders run lazily on first resolution and at most
//! once per name: concurrent first users block on the same initialization
//! and all observe the same class.
//!
//! Out-of-tree plugins cannot be imported by path at runtime in Rust, so
//! "modules" are entries in a [`ModuleCatalog`]: plugin crates linked into the
//! binary add their classes under a module path during bootstrap, and a
//! connector that is not registered by name is looked up there by
//! `(kv_connector_module_path, kv_connector)`.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::ConnectorConfig;
use crate::connector::base::ConnectorClass;
use crate::connector::{multi, storage};
use crate::error::ConfigurationError;

/// Deferred resolution step producing a connector class.
pub type ClassLoader =
    Box<dyn Fn() -> Result<Arc<dyn ConnectorClass>, ConfigurationError> + Send + Sync>;

/// Constructor of a class exported by a catalog module.
pub type ClassConstructor = Arc<dyn Fn() -> Arc<dyn ConnectorClass> + Send + Sync>;

type ResolvedCell = Arc<OnceCell<Arc<dyn ConnectorClass>>>;

/// Modules that connector classes can be resolved from by path.
#[derive(Default)]
pub struct ModuleCatalog {
    modules: RwLock<HashMap<String, HashMap<String, ClassConstructor>>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog containing the in-tree connector modules.
    pub fn with_builtins() -> Self {
        let catalog = Self::new();
        catalog.add_class(storage::MODULE_PATH, storage::CLASS_NAME, Arc::new(storage::current_class));
        catalog.add_class(storage::MODULE_PATH, storage::LEGACY_CLASS_NAME, Arc::new(storage::legacy_class));
        catalog.add_class(multi::MODULE_PATH, multi::CLASS_NAME, Arc::new(multi::class));
        catalog
    }

    /// Export `class_name` from `module_path`.
    pub fn add_class(&self, module_path: &str, class_name: &str, constructor: ClassConstructor) {
        self.modules
            .write()
            .entry(module_path.to_string())
            .or_default()
            .insert(class_name.to_string(), constructor);
    }

    /// Instantiate `class_name` from `module_path`.
    pub fn load(
        &self,
        module_path: &str,
        class_name: &str,
    ) -> Result<Arc<dyn ConnectorClass>, ConfigurationError> {
        let modules = self.modules.read();
        let module = modules
            .get(module_path)
            .ok_or_else(|| ConfigurationError::UnknownClass {
                module_path: module_path.to_string(),
                class_name: class_name.to_string(),
            })?;
        let constructor = module
            .get(class_name)
            .ok_or_else(|| ConfigurationError::UnknownClass {
                module_path: module_path.to_string(),
                class_name: class_name.to_string(),
            })?;
        Ok(constructor())
    }
}

struct RegistryEntry {
    module_path: String,
    loader: ClassLoader,
    resolved: ResolvedCell,
}

/// Mapping from connector name to a lazily resolved implementation.
pub struct ConnectorRegistry {
    entries: RwLock<HashMap<String, Arc<RegistryEntry>>>,
    catalog: Arc<ModuleCatalog>,

    /// Classes resolved through the catalog fallback, keyed by (module, name).
    external: Mutex<HashMap<(String, String), ResolvedCell>>,
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorRegistry {
    /// Empty registry over an empty catalog.
    pub fn new() -> Self {
        Self::with_catalog(Arc::new(ModuleCatalog::new()))
    }

    pub fn with_catalog(catalog: Arc<ModuleCatalog>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            catalog,
            external: Mutex::new(HashMap::new()),
        }
    }

    /// Registry with the in-tree connectors registered.
    pub fn with_builtins() -> Self {
        let registry = Self::with_catalog(Arc::new(ModuleCatalog::with_builtins()));
        if let Err(e) = registry.register_builtins() {
            warn!(error = %e, "Failed to register built-in connectors");
        }
        registry
    }

    /// Register the in-tree connectors under their class names.
    pub fn register_builtins(&self) -> Result<(), ConfigurationError> {
        let builtins = [
            (storage::CLASS_NAME, storage::MODULE_PATH, storage::CLASS_NAME),
            (storage::LEGACY_CLASS_NAME, storage::MODULE_PATH, storage::LEGACY_CLASS_NAME),
            (multi::CLASS_NAME, multi::MODULE_PATH, multi::CLASS_NAME),
        ];
        for (name, module_path, class_name) in builtins {
            self.register_connector(name, module_path, class_name)?;
        }
        Ok(())
    }

    pub fn catalog(&self) -> &Arc<ModuleCatalog> {
        &self.catalog
    }

    /// Register `name` with an arbitrary deferred loader.
    pub fn register(
        &self,
        name: &str,
        module_path: &str,
        loader: ClassLoader,
    ) -> Result<(), ConfigurationError> {
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(ConfigurationError::DuplicateName(name.to_string()));
        }
        entries.insert(
            name.to_string(),
            Arc::new(RegistryEntry {
                module_path: module_path.to_string(),
                loader,
                resolved: Arc::new(OnceCell::new()),
            }),
        );
        debug!(connector = name, module_path, "Registered connector");
        Ok(())
    }

    /// Register `name` to load `class_name` from `module_path` on first use.
    pub fn register_connector(
        &self,
        name: &str,
        module_path: &str,
        class_name: &str,
    ) -> Result<(), ConfigurationError> {
        let catalog = self.catalog.clone();
        let module = module_path.to_string();
        let class = class_name.to_string();
        self.register(
            name,
            module_path,
            Box::new(move || catalog.load(&module, &class)),
        )
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a connector class by name, falling back to `module_path`.
    ///
    /// A failed loader is not cached; the next resolution retries it.
    pub fn resolve(
        &self,
        name: &str,
        module_path: Option<&str>,
    ) -> Result<Arc<dyn ConnectorClass>, ConfigurationError> {
        let entry = self.entries.read().get(name).cloned();
        if let Some(entry) = entry {
            return entry
                .resolved
                .get_or_try_init(|| {
                    info!(connector = name, module_path = %entry.module_path, "Loading connector class");
                    (entry.loader)()
                })
                .cloned();
        }

        let Some(module_path) = module_path else {
            return Err(ConfigurationError::UnsupportedConnector(name.to_string()));
        };

        let cell = self
            .external
            .lock()
            .entry((module_path.to_string(), name.to_string()))
            .or_default()
            .clone();
        cell.get_or_try_init(|| {
            info!(connector = name, module_path, "Loading external connector class");
            self.catalog.load(module_path, name)
        })
        .cloned()
    }

    /// Resolve the class selected by a connector config.
    pub fn get_connector_class(
        &self,
        config: &ConnectorConfig,
    ) -> Result<Arc<dyn ConnectorClass>, ConfigurationError> {
        self.resolve(
            &config.kv_connector,
            config.kv_connector_module_path.as_deref(),
        )
    }
}
