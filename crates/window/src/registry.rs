//! Context module registry — discovers, loads, and manages modules.
//!
//! Discovery sources, later overriding earlier on id collision:
//!   1. Built-in modules:  the platform's module directory
//!   2. Agent-pack modules: installed pack directories
//!   3. User modules:       the user's private module directory
//!
//! Modules are self-contained directories with a `manifest.json`; the
//! manifest names a handler *factory* registered in code, the statically
//! typed counterpart of loading a handler class at runtime. Lookups read
//! an immutable map swapped in atomically at the end of discovery, so
//! `get_module`/`get_handler` never contend with a running discovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokenweave_core::error::{ModuleError, RegistryError};
use tokenweave_core::module::{ContextModule, PurgeOutcome};
use tracing::{debug, error, info, warn};

use crate::manifest::{
    InstalledModuleInfo, ManifestCapabilities, ModuleDefinition, ModuleManifest, ModuleSource,
};

/// Produces handler instances for manifests naming this factory.
pub trait ModuleFactory: Send + Sync {
    /// Capabilities the produced handlers support; manifests must not
    /// declare more.
    fn capabilities(&self) -> ManifestCapabilities;

    fn create(&self, manifest: &ModuleManifest) -> Result<Arc<dyn ContextModule>, RegistryError>;
}

/// A factory built from a closure, for handlers that cannot fail to
/// construct.
pub struct FactoryFn {
    capabilities: ManifestCapabilities,
    create: Box<dyn Fn(&ModuleManifest) -> Arc<dyn ContextModule> + Send + Sync>,
}

impl FactoryFn {
    pub fn new<F>(capabilities: ManifestCapabilities, create: F) -> Arc<dyn ModuleFactory>
    where
        F: Fn(&ModuleManifest) -> Arc<dyn ContextModule> + Send + Sync + 'static,
    {
        Arc::new(Self {
            capabilities,
            create: Box::new(create),
        })
    }
}

impl ModuleFactory for FactoryFn {
    fn capabilities(&self) -> ManifestCapabilities {
        self.capabilities
    }

    fn create(&self, manifest: &ModuleManifest) -> Result<Arc<dyn ContextModule>, RegistryError> {
        Ok((self.create)(manifest))
    }
}

type ModuleMap = HashMap<String, Arc<ModuleDefinition>>;

/// The module registry.
pub struct ModuleRegistry {
    builtin_dir: PathBuf,
    pack_dirs: Vec<PathBuf>,
    user_dir: PathBuf,
    factories: HashMap<String, Arc<dyn ModuleFactory>>,
    modules: std::sync::RwLock<Arc<ModuleMap>>,
    /// Serializes discovery, install, and uninstall.
    write_lock: std::sync::Mutex<()>,
}

impl ModuleRegistry {
    pub fn new(
        builtin_dir: impl Into<PathBuf>,
        pack_dirs: Vec<PathBuf>,
        user_dir: impl Into<PathBuf>,
        factories: HashMap<String, Arc<dyn ModuleFactory>>,
    ) -> Self {
        Self {
            builtin_dir: builtin_dir.into(),
            pack_dirs,
            user_dir: user_dir.into(),
            factories,
            modules: std::sync::RwLock::new(Arc::new(HashMap::new())),
            write_lock: std::sync::Mutex::new(()),
        }
    }

    pub fn with_module_paths(
        paths: &tokenweave_config::ModulePaths,
        factories: HashMap<String, Arc<dyn ModuleFactory>>,
    ) -> Self {
        Self::new(
            paths.builtin_dir.clone(),
            paths.pack_dirs.clone(),
            paths.user_dir.clone(),
            factories,
        )
    }

    /// Discover and load modules from all sources. Idempotent; replaces
    /// every handler instance.
    pub fn discover_modules(&self) -> Arc<ModuleMap> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = self.run_discovery();
        *self.modules.write().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();
        snapshot
    }

    fn run_discovery(&self) -> Arc<ModuleMap> {
        let mut modules = ModuleMap::new();
        self.discover_from(&self.builtin_dir, ModuleSource::Builtin, &mut modules);
        for pack_dir in &self.pack_dirs {
            self.discover_from(pack_dir, ModuleSource::Pack, &mut modules);
        }
        self.discover_from(&self.user_dir, ModuleSource::User, &mut modules);

        let count_by = |source: ModuleSource| modules.values().filter(|m| m.source == source).count();
        info!(
            total = modules.len(),
            builtin = count_by(ModuleSource::Builtin),
            pack = count_by(ModuleSource::Pack),
            user = count_by(ModuleSource::User),
            "Context module registry loaded"
        );
        Arc::new(modules)
    }

    fn discover_from(&self, base: &Path, source: ModuleSource, out: &mut ModuleMap) {
        if !base.exists() {
            return;
        }
        let Ok(entries) = std::fs::read_dir(base) else {
            warn!(dir = %base.display(), "Cannot read module directory");
            return;
        };
        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            match self.load_module(&dir, source) {
                Ok(definition) => {
                    let id = definition.module_id().to_string();
                    debug!(module_id = %id, source = source.as_str(), "Loaded context module");
                    if let Some(previous) = out.insert(id.clone(), Arc::new(definition)) {
                        warn!(
                            module_id = %id,
                            previous = previous.source.as_str(),
                            overriding = source.as_str(),
                            "Module id collision; later source overrides"
                        );
                    }
                }
                Err(RegistryError::ManifestMissing(path)) => {
                    warn!(path = %path, "Skipping module directory without manifest");
                }
                Err(e) => {
                    error!(dir = %dir.display(), error = %e, "Failed to load context module");
                }
            }
        }
    }

    fn load_module(
        &self,
        dir: &Path,
        source: ModuleSource,
    ) -> Result<ModuleDefinition, RegistryError> {
        let manifest_path = dir.join("manifest.json");
        if !manifest_path.exists() {
            return Err(RegistryError::ManifestMissing(
                manifest_path.display().to_string(),
            ));
        }

        let raw = std::fs::read_to_string(&manifest_path).map_err(|e| {
            RegistryError::Io(format!("Cannot read {}: {e}", manifest_path.display()))
        })?;
        let mut manifest: ModuleManifest =
            serde_json::from_str(&raw).map_err(|e| RegistryError::ManifestInvalid {
                path: manifest_path.display().to_string(),
                reason: e.to_string(),
            })?;
        if manifest.module_id.is_empty() {
            return Err(RegistryError::ManifestInvalid {
                path: manifest_path.display().to_string(),
                reason: "module_id is empty".into(),
            });
        }
        if manifest.display_name.is_empty() {
            manifest.display_name = manifest.module_id.clone();
        }

        let factory_key = manifest.factory_key().to_string();
        let factory =
            self.factories
                .get(&factory_key)
                .ok_or_else(|| RegistryError::FactoryNotFound {
                    module_id: manifest.module_id.clone(),
                    factory: factory_key.clone(),
                })?;

        if let Some(capability) = factory.capabilities().supports(&manifest.capabilities) {
            return Err(RegistryError::UnsupportedCapability {
                module_id: manifest.module_id.clone(),
                capability: capability.into(),
            });
        }

        let handler = factory.create(&manifest)?;
        if handler.module_id() != manifest.module_id {
            warn!(
                manifest_id = %manifest.module_id,
                handler_id = %handler.module_id(),
                "Handler reports a different module id than its manifest"
            );
        }

        Ok(ModuleDefinition {
            manifest,
            handler,
            source,
            source_path: dir.to_path_buf(),
        })
    }

    fn snapshot(&self) -> Arc<ModuleMap> {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get_module(&self, module_id: &str) -> Option<Arc<ModuleDefinition>> {
        self.snapshot().get(module_id).cloned()
    }

    pub fn get_handler(&self, module_id: &str) -> Option<Arc<dyn ContextModule>> {
        self.get_module(module_id).map(|d| d.handler.clone())
    }

    pub fn module_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.snapshot().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Metadata snapshots for UI display, sorted by module id.
    pub fn get_installed_modules(&self) -> Vec<InstalledModuleInfo> {
        let snapshot = self.snapshot();
        let mut infos: Vec<InstalledModuleInfo> =
            snapshot.values().map(|d| InstalledModuleInfo::from(d.as_ref())).collect();
        infos.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        infos
    }

    /// Install a module from a filesystem path: copy its directory into
    /// the user module location, load it, register it.
    pub fn install_module(&self, path: &Path) -> Result<Arc<ModuleDefinition>, RegistryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let manifest_path = path.join("manifest.json");
        if !manifest_path.exists() {
            return Err(RegistryError::ManifestMissing(
                manifest_path.display().to_string(),
            ));
        }
        let raw = std::fs::read_to_string(&manifest_path).map_err(|e| {
            RegistryError::Io(format!("Cannot read {}: {e}", manifest_path.display()))
        })?;
        let manifest: ModuleManifest =
            serde_json::from_str(&raw).map_err(|e| RegistryError::ManifestInvalid {
                path: manifest_path.display().to_string(),
                reason: e.to_string(),
            })?;

        if self.snapshot().contains_key(&manifest.module_id) {
            return Err(RegistryError::AlreadyInstalled(manifest.module_id));
        }

        let target = self.user_dir.join(&manifest.module_id);
        copy_dir_all(path, &target)
            .map_err(|e| RegistryError::Io(format!("Cannot copy module directory: {e}")))?;

        let definition = match self.load_module(&target, ModuleSource::User) {
            Ok(def) => Arc::new(def),
            Err(e) => {
                let _ = std::fs::remove_dir_all(&target);
                return Err(e);
            }
        };

        let mut modules = (*self.snapshot()).clone();
        modules.insert(definition.module_id().to_string(), definition.clone());
        *self.modules.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(modules);

        info!(module_id = %definition.module_id(), from = %path.display(), "Installed context module");
        Ok(definition)
    }

    /// Uninstall a non-built-in, non-required module: remove it from disk
    /// and from the registry.
    pub fn uninstall_module(&self, module_id: &str) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let definition = self
            .get_module(module_id)
            .ok_or_else(|| RegistryError::NotFound(module_id.to_string()))?;
        if definition.source == ModuleSource::Builtin {
            return Err(RegistryError::BuiltinImmutable(module_id.to_string()));
        }
        if definition.required() {
            return Err(RegistryError::RequiredImmutable(module_id.to_string()));
        }

        if definition.source_path.exists() {
            std::fs::remove_dir_all(&definition.source_path).map_err(|e| {
                RegistryError::Io(format!(
                    "Cannot remove {}: {e}",
                    definition.source_path.display()
                ))
            })?;
        }

        let mut modules = (*self.snapshot()).clone();
        modules.remove(module_id);
        *self.modules.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(modules);

        info!(module_id, "Uninstalled context module");
        Ok(())
    }

    /// Purge a module's cached/accumulated data for a user (and session,
    /// when non-empty).
    pub async fn purge_module(
        &self,
        module_id: &str,
        session_id: &str,
        user_id: &str,
    ) -> Result<PurgeOutcome, ModuleError> {
        let definition = self
            .get_module(module_id)
            .ok_or_else(|| ModuleError::NotFound(module_id.to_string()))?;
        if !definition.purgeable() {
            return Err(ModuleError::NotPurgeable(module_id.to_string()));
        }
        definition.handler.purge(session_id, user_id).await
    }

    /// Hot-reload: re-run discovery, replacing handler instances.
    pub fn reload(&self) {
        info!("Hot-reloading context module registry");
        self.discover_modules();
    }
}

fn copy_dir_all(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
