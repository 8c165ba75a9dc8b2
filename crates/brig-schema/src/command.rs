use crate::config::NetworkMode;
use crate::types::ImageRef;
use serde::{Deserialize, Serialize};

/// Exit code reported when the process produced none (killed by a signal
/// that the runtime did not translate, or never started).
pub const NO_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A command to execute inside a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Command {
    pub arguments: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

impl Command {
    pub fn new<I, S>(arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            arguments: arguments.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvVar::new(name, value));
        self
    }
}

/// Resource usage of a container's cgroup.
///
/// `peak_memory_bytes` and `cpu_nanos` never decrease across snapshots of the
/// same container; `memory_bytes` is the latest resident value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageStats {
    pub peak_memory_bytes: u64,
    pub memory_bytes: u64,
    pub cpu_nanos: u64,
}

impl UsageStats {
    /// Fold a newer sample into this one, keeping peak and CPU monotonic.
    #[must_use]
    pub fn merge(self, newer: UsageStats) -> UsageStats {
        UsageStats {
            peak_memory_bytes: self
                .peak_memory_bytes
                .max(newer.peak_memory_bytes)
                .max(newer.memory_bytes),
            memory_bytes: newer.memory_bytes,
            cpu_nanos: self.cpu_nanos.max(newer.cpu_nanos),
        }
    }
}

/// Outcome of one Run or Exec. A non-zero `exit_code` is a normal result, not
/// an error: infrastructure failures are reported through the surrounding
/// `Result` instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub usage_stats: Option<UsageStats>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Everything the provider needs to instantiate a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInit {
    pub image: ImageRef,
    /// Overrides the provider's default network mode.
    pub network: Option<NetworkMode>,
}

impl ContainerInit {
    pub fn new(image: ImageRef) -> Self {
        Self {
            image,
            network: None,
        }
    }

    #[must_use]
    pub fn with_network(mut self, mode: NetworkMode) -> Self {
        self.network = Some(mode);
        self
    }
}
