//! Module registration for `validate_module`.
//!
//! A module is a Python package directory holding an `__init__.py`. Once
//! validated it is registered under its directory name and every later
//! execution can import it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Entry file every module directory must contain.
pub const ENTRY_FILE: &str = "__init__.py";

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("modulePath is required")]
    PathRequired,
    #[error("module path not found: {0}")]
    NotFound(String),
    #[error("module path is outside the allowed root: {0}")]
    Forbidden(String),
    #[error("module entry file not found: {0}")]
    EntryMissing(String),
}

impl ModuleError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::PathRequired => "MODULE_PATH_REQUIRED",
            Self::NotFound(_) | Self::EntryMissing(_) => "MODULE_NOT_FOUND",
            Self::Forbidden(_) => "MODULE_PATH_FORBIDDEN",
        }
    }
}

/// A module directory that passed path checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedModule {
    pub name: String,
    pub dir: PathBuf,
    pub entry: PathBuf,
}

impl ResolvedModule {
    fn from_dir(name: &str, dir: &Path) -> Self {
        Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            entry: dir.join(ENTRY_FILE),
        }
    }
}

#[derive(Debug, Default)]
pub struct ModuleLoader {
    allowed_root: Option<PathBuf>,
    registry: Mutex<HashMap<String, PathBuf>>,
}

impl ModuleLoader {
    pub fn new(allowed_root: Option<PathBuf>) -> Self {
        Self {
            allowed_root,
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn allowed_root(&self) -> Option<&Path> {
        self.allowed_root.as_deref()
    }

    /// Checks `raw_path` and locates its entry file. The module name is the
    /// directory's final component.
    pub fn resolve(&self, raw_path: Option<&str>) -> Result<ResolvedModule, ModuleError> {
        let raw = raw_path.map(str::trim).unwrap_or_default();
        if raw.is_empty() {
            return Err(ModuleError::PathRequired);
        }
        let path = std::path::absolute(raw).map_err(|_| ModuleError::NotFound(raw.to_string()))?;
        if !path.is_dir() {
            return Err(ModuleError::NotFound(path.display().to_string()));
        }
        let dir = path
            .canonicalize()
            .map_err(|_| ModuleError::NotFound(path.display().to_string()))?;

        if let Some(root) = &self.allowed_root {
            let Ok(root) = root.canonicalize() else {
                warn!("Allowed module root {} cannot be resolved", root.display());
                return Err(ModuleError::Forbidden(dir.display().to_string()));
            };
            // Path::starts_with compares whole components.
            if !dir.starts_with(&root) {
                return Err(ModuleError::Forbidden(dir.display().to_string()));
            }
        }

        let entry = dir.join(ENTRY_FILE);
        if !entry.is_file() {
            return Err(ModuleError::EntryMissing(entry.display().to_string()));
        }
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ModuleError::NotFound(dir.display().to_string()))?;
        Ok(ResolvedModule { name, dir, entry })
    }

    /// Returns whether the name was already registered (a reload).
    pub fn register(&self, module: &ResolvedModule) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let reloaded = registry
            .insert(module.name.clone(), module.dir.clone())
            .is_some();
        info!(
            "{} module {} from {}",
            if reloaded { "Reloaded" } else { "Registered" },
            module.name,
            module.dir.display()
        );
        reloaded
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Registered modules whose entry file still exists, sorted by name.
    pub fn registered(&self) -> Vec<ResolvedModule> {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let mut modules: Vec<ResolvedModule> = registry
            .iter()
            .map(|(name, dir)| ResolvedModule::from_dir(name, dir))
            .filter(|module| module.entry.is_file())
            .collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        modules
    }
}
