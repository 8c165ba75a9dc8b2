use crate::driver::find_runtime;
use crate::overlay::has_mount_permission;
use brig_schema::ProviderConfig;
use std::fmt;
use std::path::Path;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn cgroup_v2_available(cgroup_root: &Path) -> bool {
    cgroup_root.join("cgroup.controllers").is_file()
}

/// Check what the provider needs on this host under `config`.
/// Empty list means all prerequisites are met.
pub fn check_prereqs(config: &ProviderConfig) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if find_runtime(config.runtime.as_deref()).is_err() {
        missing.push(MissingPrereq {
            name: "OCI runtime",
            purpose: "container execution",
            install_hint: match config.runtime {
                Some(_) => "the configured runtime does not answer --version; fix the path or unset it",
                None => "install one of: crun, runc, or youki",
            },
        });
    }

    if !cgroup_v2_available(&config.cgroup_root) {
        missing.push(MissingPrereq {
            name: "cgroup v2",
            purpose: "resource accounting",
            install_hint: "boot with systemd.unified_cgroup_hierarchy=1 or point cgroup_root at a cgroup2 mount",
        });
    }

    if !has_mount_permission() {
        missing.push(MissingPrereq {
            name: "mount privilege",
            purpose: "overlay root filesystems and OCI runtime namespaces",
            install_hint: "run as root or grant CAP_SYS_ADMIN",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nbrig requires these to run containers.");
    msg
}
