use serde::Deserialize;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::worker::DEFAULT_MEMORY_LIMIT_MB;

/// Used when no config path is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "config/bridge.toml";

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub modules: ModulesConfig,
    pub exec: ExecConfig,
    pub policy: PolicyConfig,
    pub context: ContextConfig,
    pub host: HostConfig,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Missing or non-positive disables the bridge.
    pub port: Option<i64>,
    /// Shared secret for the `x-bridge-token` header.
    /// Supports ${ENV_VAR} substitution
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ModulesConfig {
    /// `validate_module` paths must resolve inside this directory
    pub allowed_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ExecConfig {
    /// Run `exec` / `validate_module` one at a time
    pub serialize: bool,
    /// Run each job in a worker process so a crashing script cannot take
    /// the bridge down
    pub isolate: bool,
    /// Address-space cap for worker processes; 0 means unlimited
    pub worker_memory_mb: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            serialize: true,
            isolate: true,
            worker_memory_mb: DEFAULT_MEMORY_LIMIT_MB,
        }
    }
}

/// Omitted lists keep the built-in defaults.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    pub blocked_modules: Option<Vec<String>>,
    pub blocked_builtins: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ContextConfig {
    /// Most-expendable slice first
    pub drop_order: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct HostConfig {
    pub name: Option<String>,
    pub version: Option<String>,
    pub document: Option<String>,
    pub background: Option<bool>,
}

impl ServerConfig {
    /// The port to bind, or `None` when the bridge is disabled.
    pub fn listen_port(&self) -> Option<u16> {
        self.port
            .and_then(|port| u16::try_from(port).ok())
            .filter(|port| *port > 0)
    }

    /// Empty tokens count as no token.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }
}

impl HostConfig {
    /// A host is attached when any fact is configured.
    pub fn is_configured(&self) -> bool {
        self.name.is_some()
            || self.version.is_some()
            || self.document.is_some()
            || self.background.is_some()
    }
}

impl Config {
    /// Loads `path`, or the default path when it exists, or the defaults.
    /// Environment overrides are applied last.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(Path::new(path))?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${BRIDGE_SECRET}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// `BRIDGE_PORT`, `BRIDGE_TOKEN` and `BRIDGE_ALLOWED_MODULE_ROOT` win
    /// over the file.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(port) = lookup("BRIDGE_PORT").filter(|p| !p.trim().is_empty()) {
            let port = port
                .trim()
                .parse::<i64>()
                .with_context(|| format!("BRIDGE_PORT is not a number: {port}"))?;
            self.server.port = Some(port);
        }
        if let Some(token) = lookup("BRIDGE_TOKEN") {
            self.server.token = Some(token);
        }
        if let Some(root) = lookup("BRIDGE_ALLOWED_MODULE_ROOT").filter(|r| !r.trim().is_empty()) {
            self.modules.allowed_root = Some(PathBuf::from(root.trim()));
        }
        Ok(())
    }
}
