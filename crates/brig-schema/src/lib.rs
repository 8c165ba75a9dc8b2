//! Shared data model for brig containers.
//!
//! This crate defines the types every other layer agrees on: image references and
//! registry credentials (`ImageRef`, `Credentials`), the commands executed inside a
//! container and their results (`Command`, `CommandResult`, `UsageStats`), the
//! provider configuration loaded from TOML (`ProviderConfig`), and the container
//! lifecycle state machine (`ContainerState`, `validate_transition`).

pub mod command;
pub mod config;
pub mod state;
pub mod types;

pub use command::{Command, CommandResult, ContainerInit, EnvVar, UsageStats, NO_EXIT_CODE};
pub use config::{
    ConfigError, NetworkMode, ProviderConfig, ResourceLimits, RootfsStrategy,
    DEFAULT_CGROUP_PARENT, DEFAULT_CGROUP_ROOT, DEFAULT_EXEC_ROOT, DEFAULT_RUNTIME_ROOT,
};
pub use state::{validate_transition, ContainerState, InvalidTransition};
pub use types::{ContainerId, Credentials, ImageRef, LayerDigest};
