//! Run configuration (`relmig.toml`)
//!
//! Every section has defaults, so an absent file is a valid configuration.
//! Precedence, lowest first: file, environment (`RELMIG_*`), command line.

pub mod load;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::OrphanPolicy;
use crate::target::sqlite::database_path;

pub use load::{LoadConfig, LoadConfigBuilder};

/// Config file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "relmig.toml";

pub const ENV_TARGET_URL: &str = "RELMIG_TARGET_URL";
pub const ENV_EXPORT_DIR: &str = "RELMIG_EXPORT_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub url: String,
    pub busy_timeout_ms: u64,
    /// Run lock path; defaults to `<database>.relmig.lock`
    pub lock_file: Option<PathBuf>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://target.db".to_string(),
            busy_timeout_ms: 5000,
            lock_file: None,
        }
    }
}

impl TargetConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Where the run lock lives, `None` for in-memory targets without an
    /// explicit lock file
    pub fn lock_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.lock_file {
            return Some(path.clone());
        }
        database_path(&self.url).map(|db| {
            let mut name = db.into_os_string();
            name.push(".relmig.lock");
            PathBuf::from(name)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub dir: PathBuf,
    pub extension: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("export"),
            extension: "sql".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Catalog TOML; the live schema is introspected when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Orphan policy for tables that do not set their own
    pub default_policy: OrphanPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub json: Option<PathBuf>,
    pub csv: Option<PathBuf>,
    pub excel: Option<PathBuf>,
}

/// Complete run configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub target: TargetConfig,
    pub export: ExportConfig,
    pub catalog: CatalogConfig,
    pub load: LoadConfig,
    pub repair: RepairConfig,
    pub report: ReportConfig,
}

impl Config {
    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse configuration TOML")
    }

    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, `relmig.toml` in the working
    /// directory is used when present, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    log::debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                    return Ok(Self::default());
                }
                default
            }
        };

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Apply `RELMIG_*` overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_TARGET_URL).filter(|v| !v.is_empty()) {
            log::debug!("Target URL overridden by {}", ENV_TARGET_URL);
            self.target.url = url;
        }
        if let Some(dir) = lookup(ENV_EXPORT_DIR).filter(|v| !v.is_empty()) {
            log::debug!("Export directory overridden by {}", ENV_EXPORT_DIR);
            self.export.dir = PathBuf::from(dir);
        }
    }
}
