//! Execution layer for brig containers.
//!
//! This crate holds the pieces a container is assembled from: the rootfs builder
//! (`overlay`, overlayfs or plain copy), the OCI bundle generator (`bundle`), the
//! async driver for the external OCI runtime binary (`driver`), cgroup v2
//! accounting with a background sampler (`monitor`), the network setup contract
//! (`network`), cancellation (`context`) and host prerequisite checks (`prereq`).

pub mod bundle;
pub mod context;
pub mod driver;
pub mod monitor;
pub mod network;
pub mod overlay;
pub mod prereq;

pub use bundle::{BundleOptions, OciSpec, ProcessSpec};
pub use context::{Cancelled, Context};
pub use driver::{find_runtime, ExecOutput, ExecStdio, OciRuntime, RuntimeState};
pub use monitor::{CgroupReader, UsageSampler};
pub use network::{HostNetwork, NetworkSetup};
pub use overlay::{has_mount_permission, is_mounted, resolve_strategy, MountKind, OverlayMount};
pub use prereq::{check_prereqs, format_missing, MissingPrereq};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no OCI runtime found (tried crun, runc, youki)")]
    RuntimeNotFound,
    #[error("runtime binary '{0}' is not usable")]
    RuntimeUnusable(PathBuf),
    #[error("runtime {op} failed (exit {code}): {stderr}")]
    CommandFailed {
        op: &'static str,
        code: i32,
        stderr: String,
    },
    #[error("container '{0}' does not exist")]
    ContainerNotFound(String),
    #[error("mount of {path} failed: {reason}")]
    Mount { path: PathBuf, reason: String },
    #[error("{path} is still busy after retrying unmount")]
    Busy { path: PathBuf },
    #[error("overlay mounts need CAP_SYS_ADMIN; use the copy rootfs strategy instead")]
    MountNotPermitted,
    #[error("cgroup accounting unavailable at {path}: {reason}")]
    Accounting { path: PathBuf, reason: String },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl RuntimeError {
    pub fn mount(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Mount {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
