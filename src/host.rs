//! The host application the bridge runs inside.
//!
//! The bridge only reads a handful of facts about its host. Scripts see
//! them through the `host` module, rebuilt from [`HostFacts`] inside each
//! execution.

use serde::{Deserialize, Serialize};

use crate::config::HostConfig;

pub trait HostApplication: Send + Sync {
    fn name(&self) -> Option<String>;
    fn version(&self) -> Option<String>;
    fn document_path(&self) -> Option<String>;
    fn is_background(&self) -> Option<bool>;

    /// `false` when the bridge runs without a live host.
    fn is_reachable(&self) -> bool {
        true
    }
}

/// Facts fixed at startup, usually from the `[host]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticHost {
    pub name: Option<String>,
    pub version: Option<String>,
    pub document: Option<String>,
    pub background: Option<bool>,
}

impl StaticHost {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            name: config.name.clone(),
            version: config.version.clone(),
            document: config.document.clone(),
            background: config.background,
        }
    }
}

impl HostApplication for StaticHost {
    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }

    fn document_path(&self) -> Option<String> {
        self.document.clone()
    }

    fn is_background(&self) -> Option<bool> {
        self.background
    }
}

/// No host attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedHost;

impl HostApplication for DetachedHost {
    fn name(&self) -> Option<String> {
        None
    }

    fn version(&self) -> Option<String> {
        None
    }

    fn document_path(&self) -> Option<String> {
        None
    }

    fn is_background(&self) -> Option<bool> {
        None
    }

    fn is_reachable(&self) -> bool {
        false
    }
}

/// Attributes of the `host` module bound in every execution namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFacts {
    pub name: Option<String>,
    pub version: Option<String>,
    pub document: Option<String>,
    pub background: Option<bool>,
    /// The bridge process, not the execution worker.
    pub pid: u32,
}

impl HostFacts {
    /// `None` when the host is unreachable.
    pub fn collect(host: &dyn HostApplication) -> Option<Self> {
        host.is_reachable().then(|| Self {
            name: host.name(),
            version: host.version(),
            document: host.document_path(),
            background: host.is_background(),
            pid: std::process::id(),
        })
    }
}
