use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_RUNTIME_ROOT: &str = "/run/brig";
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const DEFAULT_CGROUP_PARENT: &str = "brig";
pub const DEFAULT_EXEC_ROOT: &str = "/brig-execroot";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("container image must not be empty")]
    EmptyImage,
    #[error("exec_root must be an absolute path, got '{0}'")]
    RelativeExecRoot(String),
    #[error("init_command must not be empty")]
    EmptyInitCommand,
    #[error("stats_poll_interval_ms must be greater than zero")]
    ZeroPollInterval,
}

/// How a container's root filesystem is materialized from image layers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RootfsStrategy {
    /// Overlay when the process may mount, copy otherwise.
    #[default]
    Auto,
    Overlay,
    Copy,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Join a namespace with external connectivity.
    #[default]
    Enabled,
    /// Fresh namespace with loopback only.
    Off,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::Enabled => write!(f, "enabled"),
            NetworkMode::Off => write!(f, "off"),
        }
    }
}

/// Optional cgroup limits. Accounting works without any of them.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
    #[serde(default)]
    pub memory_limit_bytes: Option<i64>,
    #[serde(default)]
    pub cpu_quota_micros: Option<i64>,
    #[serde(default)]
    pub cpu_period_micros: Option<u64>,
    #[serde(default)]
    pub pids_limit: Option<i64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.memory_limit_bytes.is_none()
            && self.cpu_quota_micros.is_none()
            && self.cpu_period_micros.is_none()
            && self.pids_limit.is_none()
    }
}

/// Configuration injected into the provider. Every field has a default, so an
/// empty TOML document is a valid configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// OCI runtime binary. Auto-detected (crun, runc, youki) when unset.
    #[serde(default)]
    pub runtime: Option<PathBuf>,
    /// State directory passed to the runtime as `--root`.
    #[serde(default = "default_runtime_root")]
    pub runtime_root: PathBuf,
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,
    /// Cgroup directory, relative to `cgroup_root`, that holds one child per container.
    #[serde(default = "default_cgroup_parent")]
    pub cgroup_parent: String,
    /// In-container mount point of the caller's working directory.
    #[serde(default = "default_exec_root")]
    pub exec_root: String,
    #[serde(default)]
    pub rootfs: RootfsStrategy,
    #[serde(default)]
    pub network: NetworkMode,
    #[serde(default = "default_poll_interval_ms")]
    pub stats_poll_interval_ms: u64,
    /// Idle process that keeps the container's namespaces alive between execs.
    #[serde(default = "default_init_command")]
    pub init_command: Vec<String>,
    /// Directories appended to the default `PATH`.
    #[serde(default)]
    pub extra_path: Vec<String>,
    #[serde(default)]
    pub resources: ResourceLimits,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            runtime_root: default_runtime_root(),
            cgroup_root: default_cgroup_root(),
            cgroup_parent: default_cgroup_parent(),
            exec_root: default_exec_root(),
            rootfs: RootfsStrategy::default(),
            network: NetworkMode::default(),
            stats_poll_interval_ms: default_poll_interval_ms(),
            init_command: default_init_command(),
            extra_path: Vec::new(),
            resources: ResourceLimits::default(),
        }
    }
}

impl ProviderConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.exec_root.starts_with('/') {
            return Err(ConfigError::RelativeExecRoot(self.exec_root.clone()));
        }
        if self.init_command.is_empty() {
            return Err(ConfigError::EmptyInitCommand);
        }
        if self.stats_poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }

    #[inline]
    pub fn stats_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stats_poll_interval_ms)
    }
}

fn default_runtime_root() -> PathBuf {
    PathBuf::from(DEFAULT_RUNTIME_ROOT)
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from(DEFAULT_CGROUP_ROOT)
}

fn default_cgroup_parent() -> String {
    DEFAULT_CGROUP_PARENT.to_owned()
}

fn default_exec_root() -> String {
    DEFAULT_EXEC_ROOT.to_owned()
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_init_command() -> Vec<String> {
    vec!["sleep".to_owned(), "2147483647".to_owned()]
}
