//! Daemon configuration.
//!
//! Configuration sources (highest priority first):
//! 1. `--config <path>` on the command line
//! 2. `CONDUIT_CONFIG` environment variable
//! 3. `.conduit/config.yaml` in the current directory or any parent
//!
//! `CONDUIT_DRIVER_DIR` and `CONDUIT_HOME` override the trusted driver
//! directory and the state directory. Relative paths in the file are
//! resolved against the directory containing the config file.

pub mod watcher;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{DriverMeta, DriverSource, FeatureConfig, FeatureSpec};
use crate::service::{ServicePlan, ServiceSettings};

pub const CONFIG_ENV: &str = "CONDUIT_CONFIG";
pub const DRIVER_DIR_ENV: &str = "CONDUIT_DRIVER_DIR";
pub const HOME_ENV: &str = "CONDUIT_HOME";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Service name, passed to every driver as its first argument
    pub service: String,

    /// State directory (lock files)
    #[serde(default)]
    pub home: Option<String>,

    /// Trusted directory for built-in drivers
    #[serde(default)]
    pub driver_dir: Option<String>,

    #[serde(default)]
    pub drivers: BTreeMap<String, DriverEntry>,

    /// Global feature -> driver map
    #[serde(default)]
    pub feature_map: BTreeMap<String, String>,

    #[serde(default)]
    pub features: BTreeMap<String, FeatureEntry>,

    #[serde(default)]
    pub timeouts: Timeouts,
}

/// One driver definition: exactly one of `builtin` or `path`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builtin: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Driver type; defaults to the driver name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
}

/// One feature the service requires
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureEntry {
    /// Driver name; falls back to `feature_map`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub data: Value,

    #[serde(default)]
    pub dynamic_data: Value,
}

/// Timing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_rpc_secs")]
    pub rpc_secs: u64,

    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,

    #[serde(default = "default_readiness_secs")]
    pub readiness_secs: u64,

    #[serde(default = "default_cold_grace_ms")]
    pub cold_grace_ms: u64,

    #[serde(default = "default_recovery_attempts")]
    pub recovery_attempts: u32,

    #[serde(default = "default_recovery_backoff_ms")]
    pub recovery_backoff_ms: u64,
}

fn default_rpc_secs() -> u64 {
    10
}
fn default_poll_ms() -> u64 {
    1000
}
fn default_readiness_secs() -> u64 {
    10
}
fn default_cold_grace_ms() -> u64 {
    2000
}
fn default_recovery_attempts() -> u32 {
    5
}
fn default_recovery_backoff_ms() -> u64 {
    500
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            rpc_secs: default_rpc_secs(),
            poll_ms: default_poll_ms(),
            readiness_secs: default_readiness_secs(),
            cold_grace_ms: default_cold_grace_ms(),
            recovery_attempts: default_recovery_attempts(),
            recovery_backoff_ms: default_recovery_backoff_ms(),
        }
    }
}

/// Configuration with paths resolved and overrides applied
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub service: String,
    pub home: PathBuf,
    pub driver_dir: PathBuf,
    /// Path to the config file this was loaded from
    pub config_file: PathBuf,
    pub file: ConfigFile,
}

impl ResolvedConfig {
    /// Service settings for the runtime
    pub fn settings(&self) -> ServiceSettings {
        let t = &self.file.timeouts;
        ServiceSettings {
            driver_dir: self.driver_dir.clone(),
            rpc_timeout: Duration::from_secs(t.rpc_secs),
            poll_interval: Duration::from_millis(t.poll_ms.max(1)),
            readiness_timeout: Duration::from_secs(t.readiness_secs),
            cold_grace: Duration::from_millis(t.cold_grace_ms),
            recovery_attempts: t.recovery_attempts,
            recovery_backoff: Duration::from_millis(t.recovery_backoff_ms),
        }
    }

    /// Lock file guarding this service's drivers
    pub fn lock_path(&self) -> PathBuf {
        self.home.join(format!("{}.lock", self.service))
    }

    /// Resolve every driver and feature into a plan
    pub fn plan(&self) -> Result<ServicePlan> {
        let base = self.base_dir();
        let mut drivers = HashMap::new();

        for (name, entry) in &self.file.drivers {
            let source = match (&entry.builtin, &entry.path) {
                (Some(builtin), None) => DriverSource::Builtin(builtin.clone()),
                (None, Some(path)) => DriverSource::Path(resolve_path(base, path)),
                (Some(_), Some(_)) => bail!("driver {}: set either builtin or path, not both", name),
                (None, None) => bail!("driver {}: one of builtin or path is required", name),
            };

            drivers.insert(
                name.clone(),
                DriverMeta {
                    name: name.clone(),
                    kind: entry.kind.clone().unwrap_or_else(|| name.clone()),
                    source,
                    args: entry.args.clone(),
                },
            );
        }

        let mut features = Vec::new();
        for (feature, entry) in &self.file.features {
            let driver_name = entry
                .driver
                .as_ref()
                .or_else(|| self.file.feature_map.get(feature))
                .with_context(|| format!("feature {}: no driver configured or mapped", feature))?;
            let driver = drivers
                .get(driver_name)
                .with_context(|| format!("feature {}: undefined driver {}", feature, driver_name))?;

            features.push(FeatureSpec {
                feature: feature.clone(),
                driver: driver.clone(),
                config: FeatureConfig::new(entry.data.clone(), entry.dynamic_data.clone()),
                required: entry.required,
            });
        }

        Ok(ServicePlan { drivers, features })
    }

    fn base_dir(&self) -> &Path {
        self.config_file.parent().unwrap_or(Path::new("."))
    }
}

/// Find config file by searching `start` and its parents
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".conduit").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let file: ConfigFile = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    if file.service.trim().is_empty() {
        bail!("config file {}: service name is empty", path.display());
    }
    Ok(file)
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Locate the config file: explicit path, then `CONDUIT_CONFIG`, then
/// discovery from the current directory
pub fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    find_config_file(&cwd).with_context(|| {
        format!(
            "No .conduit/config.yaml found in {} or its parents (set {} or pass --config)",
            cwd.display(),
            CONFIG_ENV
        )
    })
}

/// Load and resolve the configuration
pub fn load(explicit: Option<&Path>) -> Result<ResolvedConfig> {
    let path = locate(explicit)?;
    let file = load_config_file(&path)?;
    resolve(file, &path)
}

/// Apply path resolution and environment overrides
pub fn resolve(file: ConfigFile, config_path: &Path) -> Result<ResolvedConfig> {
    let base = config_path.parent().unwrap_or(Path::new("."));

    let driver_dir = if let Ok(dir) = std::env::var(DRIVER_DIR_ENV) {
        PathBuf::from(dir)
    } else if let Some(ref dir) = file.driver_dir {
        resolve_path(base, dir)
    } else {
        base.join("drivers")
    };

    let home = if let Ok(home) = std::env::var(HOME_ENV) {
        PathBuf::from(home)
    } else if let Some(ref home) = file.home {
        resolve_path(base, home)
    } else {
        dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".conduit")
    };

    Ok(ResolvedConfig {
        service: file.service.clone(),
        home,
        driver_dir,
        config_file: config_path.to_path_buf(),
        file,
    })
}
