//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skyward_common::{AppDirs, ProxySetting};

use crate::version::VersionComparator;

/// Tunables read from `<app dir>/update.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-mirror request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Download write block size in bytes
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Explicit proxy URL; the system proxy is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// Root for per-target temporary directories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_root: Option<PathBuf>,

    /// Configuration store file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_store: Option<PathBuf>,

    /// Pre-release qualifiers in ascending rank, replacing the defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualifiers: Option<Vec<String>>,

    /// Relaunch automatically when elevation or a client self-update needs it
    #[serde(default = "default_true")]
    pub allow_relaunch: bool,

    /// Program used to relaunch with elevated privilege (e.g. `pkexec`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation_launcher: Option<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_block_size() -> usize {
    64 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            block_size: default_block_size(),
            proxy: None,
            temp_root: None,
            config_store: None,
            qualifiers: None,
            allow_relaunch: true,
            elevation_launcher: None,
        }
    }
}

impl EngineConfig {
    /// Load from the standard location, falling back to defaults.
    pub fn load(dirs: &AppDirs) -> Self {
        Self::load_from(&dirs.config_file())
    }

    /// Load from `path`; a missing or unparsable file yields defaults.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring unparsable {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save config to `path`.
    pub fn save_to(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Block size, never zero.
    pub fn block_size(&self) -> usize {
        self.block_size.max(1)
    }

    pub fn proxy_setting(&self) -> ProxySetting {
        match &self.proxy {
            Some(url) if !url.is_empty() => ProxySetting::Explicit(url.clone()),
            _ => ProxySetting::System,
        }
    }

    pub fn comparator(&self) -> VersionComparator {
        match &self.qualifiers {
            Some(words) => VersionComparator::new(words),
            None => VersionComparator::default(),
        }
    }

    pub fn temp_root(&self, dirs: &AppDirs) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(|| dirs.temp_root())
    }

    pub fn config_store_path(&self, dirs: &AppDirs) -> PathBuf {
        self.config_store
            .clone()
            .unwrap_or_else(|| dirs.config_store_file())
    }
}
