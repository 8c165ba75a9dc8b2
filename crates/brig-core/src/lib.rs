//! Container lifecycle management for brig.
//!
//! This crate ties the image cache, rootfs builder, bundle generator, runtime
//! driver and cgroup accounting together into the `Container` trait, the unit
//! clients drive through create, exec, pause, stats and remove. A `Provider`
//! binds a build root and shared services and hands out containers.

pub mod container;
pub mod provider;
pub mod signal;

pub use container::{Container, ContainerHandle, OciContainer};
pub use provider::Provider;
pub use signal::{install_signal_handler, shutdown_requested};

pub use brig_runtime::{Context, ExecStdio};

use brig_image::ImageError;
use brig_runtime::RuntimeError;
use brig_schema::{ConfigError, InvalidTransition};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("image pull failed: {0}")]
    Pull(#[from] ImageError),
    #[error("container create failed: {0}")]
    Create(String),
    #[error("exec failed: {0}")]
    Exec(String),
    #[error("container teardown failed: {0}")]
    Teardown(String),
    #[error("container {0} not found or already removed")]
    NotFound(String),
    #[error(transparent)]
    InvalidState(#[from] InvalidTransition),
    #[error("operation cancelled")]
    Cancelled,
    #[error("runtime error: {0}")]
    Runtime(RuntimeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::Config(e.to_string())
    }
}

impl From<RuntimeError> for CoreError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Cancelled(_) => CoreError::Cancelled,
            RuntimeError::ContainerNotFound(id) => CoreError::NotFound(id),
            RuntimeError::RuntimeNotFound
            | RuntimeError::RuntimeUnusable(_)
            | RuntimeError::MountNotPermitted => CoreError::Config(e.to_string()),
            other => CoreError::Runtime(other),
        }
    }
}

impl From<brig_runtime::Cancelled> for CoreError {
    fn from(_: brig_runtime::Cancelled) -> Self {
        CoreError::Cancelled
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        CoreError::Io(std::io::Error::other(e))
    }
}

impl CoreError {
    /// Wrap a failure that happened while creating a container. Cancellation
    /// stays distinguishable.
    pub(crate) fn create(e: impl Into<CoreError>) -> Self {
        match e.into() {
            CoreError::Cancelled => CoreError::Cancelled,
            CoreError::Create(msg) => CoreError::Create(msg),
            other => CoreError::Create(other.to_string()),
        }
    }

    pub(crate) fn exec(e: impl Into<CoreError>) -> Self {
        match e.into() {
            CoreError::Cancelled => CoreError::Cancelled,
            CoreError::Exec(msg) => CoreError::Exec(msg),
            other => CoreError::Exec(other.to_string()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brig_schema::ContainerState;
    use std::path::PathBuf;

    #[test]
    fn runtime_errors_map_to_categories() {
        assert!(matches!(
            CoreError::from(RuntimeError::Cancelled(brig_runtime::Cancelled)),
            CoreError::Cancelled
        ));
        assert!(CoreError::from(RuntimeError::ContainerNotFound("c1".to_owned())).is_not_found());
        assert!(matches!(
            CoreError::from(RuntimeError::RuntimeNotFound),
            CoreError::Config(_)
        ));
        assert!(matches!(
            CoreError::from(RuntimeError::Busy {
                path: PathBuf::from("/m")
            }),
            CoreError::Runtime(_)
        ));
    }

    #[test]
    fn create_wrapper_keeps_runtime_stderr() {
        let err = CoreError::create(RuntimeError::CommandFailed {
            op: "create",
            code: 1,
            stderr: "mount /nonexistent: no such file".to_owned(),
        });
        let msg = err.to_string();
        assert!(msg.starts_with("container create failed"));
        assert!(msg.contains("/nonexistent"));
        assert!(matches!(
            CoreError::create(RuntimeError::Cancelled(brig_runtime::Cancelled)),
            CoreError::Cancelled
        ));
    }

    #[test]
    fn invalid_state_displays_transition() {
        let err = CoreError::from(InvalidTransition {
            from: ContainerState::Paused,
            to: ContainerState::Running,
        });
        assert_eq!(err.to_string(), "invalid state transition: paused -> running");
    }
}
