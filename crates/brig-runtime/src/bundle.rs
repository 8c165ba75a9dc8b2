//! OCI runtime bundle (`config.json`) generation.
//!
//! Only the subset of the OCI runtime spec that brig emits is modelled. Field
//! names follow its camelCase JSON.

use crate::RuntimeError;
use brig_schema::{EnvVar, NetworkMode, ResourceLimits};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const OCI_VERSION: &str = "1.0.2";
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
pub const CONTAINER_HOSTNAME: &str = "localhost";
const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";
const HOSTS_CONTENT: &str = "127.0.0.1\tlocalhost\n::1\tlocalhost ip6-localhost ip6-loopback\n";

const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_AUDIT_WRITE",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_MKNOD",
    "CAP_NET_BIND_SERVICE",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYS_CHROOT",
];

const MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

const READONLY_PATHS: &[&str] = &[
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    pub oci_version: String,
    pub process: ProcessSpec,
    pub root: Root,
    pub hostname: String,
    pub mounts: Vec<Mount>,
    pub linux: Linux,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Root {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    #[serde(default)]
    pub terminal: bool,
    pub user: User,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub capabilities: Capabilities,
    #[serde(default)]
    pub no_new_privileges: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub bounding: Vec<String>,
    pub effective: Vec<String>,
    pub permitted: Vec<String>,
}

impl Default for Capabilities {
    fn default() -> Self {
        let caps: Vec<String> = DEFAULT_CAPABILITIES.iter().map(|c| (*c).to_owned()).collect();
        Self {
            bounding: caps.clone(),
            effective: caps.clone(),
            permitted: caps,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Mount {
    fn new(destination: &str, mount_type: &str, source: &str, options: &[&str]) -> Self {
        Self {
            destination: destination.to_owned(),
            mount_type: mount_type.to_owned(),
            source: source.to_owned(),
            options: options.iter().map(|o| (*o).to_owned()).collect(),
        }
    }

    pub fn bind(source: &Path, destination: &str, readonly: bool) -> Self {
        let mut options = vec!["rbind".to_owned(), "rprivate".to_owned()];
        options.push(if readonly { "ro" } else { "rw" }.to_owned());
        Self {
            destination: destination.to_owned(),
            mount_type: "bind".to_owned(),
            source: source.display().to_string(),
            options,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    pub namespaces: Vec<Namespace>,
    pub devices: Vec<Device>,
    pub cgroups_path: String,
    pub resources: Resources,
    pub masked_paths: Vec<String>,
    pub readonly_paths: Vec<String>,
}

impl Linux {
    pub fn namespace(&self, ns_type: &str) -> Option<&Namespace> {
        self.namespaces.iter().find(|ns| ns.ns_type == ns_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Namespace {
    fn new(ns_type: &str) -> Self {
        Self {
            ns_type: ns_type.to_owned(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(rename = "type")]
    pub device_type: String,
    pub path: String,
    pub major: i64,
    pub minor: i64,
    pub file_mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Device {
    fn char(path: &str, major: i64, minor: i64) -> Self {
        Self {
            device_type: "c".to_owned(),
            path: path.to_owned(),
            major,
            minor,
            file_mode: 0o666,
            uid: 0,
            gid: 0,
        }
    }
}

/// The device nodes every container gets.
pub fn standard_devices() -> Vec<Device> {
    vec![
        Device::char("/dev/null", 1, 3),
        Device::char("/dev/zero", 1, 5),
        Device::char("/dev/random", 1, 8),
        Device::char("/dev/urandom", 1, 9),
    ]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resources {
    pub devices: Vec<DeviceRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Cpu>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids: Option<Pids>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceRule {
    pub allow: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor: Option<i64>,
    pub access: String,
}

impl DeviceRule {
    fn deny_all() -> Self {
        Self {
            allow: false,
            device_type: None,
            major: None,
            minor: None,
            access: "rwm".to_owned(),
        }
    }

    fn allow_char(major: i64, minor: Option<i64>) -> Self {
        Self {
            allow: true,
            device_type: Some("c".to_owned()),
            major: Some(major),
            minor,
            access: "rwm".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Memory {
    pub limit: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cpu {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pids {
    pub limit: i64,
}

impl Resources {
    fn from_limits(limits: &ResourceLimits) -> Self {
        let mut devices = vec![DeviceRule::deny_all()];
        devices.extend(
            standard_devices()
                .iter()
                .map(|d| DeviceRule::allow_char(d.major, Some(d.minor))),
        );
        // /dev/ptmx and the pty slaves.
        devices.push(DeviceRule::allow_char(5, Some(2)));
        devices.push(DeviceRule::allow_char(136, None));

        let cpu = if limits.cpu_quota_micros.is_some() || limits.cpu_period_micros.is_some() {
            Some(Cpu {
                quota: limits.cpu_quota_micros,
                period: limits.cpu_period_micros,
            })
        } else {
            None
        };

        Self {
            devices,
            memory: limits.memory_limit_bytes.map(|limit| Memory { limit }),
            cpu,
            pids: limits.pids_limit.map(|limit| Pids { limit }),
        }
    }
}

/// Everything that varies between bundles.
#[derive(Debug, Clone)]
pub struct BundleOptions {
    /// Merged root filesystem.
    pub rootfs: PathBuf,
    /// Host directory mounted at `exec_root`.
    pub workdir: PathBuf,
    pub exec_root: String,
    pub extra_path: Vec<String>,
    /// `NAME=value` entries from the image config.
    pub image_env: Vec<String>,
    pub network: NetworkMode,
    /// Network namespace to join when the network is enabled. `None` shares
    /// the host's.
    pub netns: Option<PathBuf>,
    /// Cgroup path relative to the cgroup root, `<parent>/<id>`.
    pub cgroup_path: String,
    pub resources: ResourceLimits,
}

impl BundleOptions {
    /// Baseline environment, lowest priority.
    fn baseline_env(&self) -> Vec<(String, String)> {
        vec![
            ("HOME".to_owned(), "/root".to_owned()),
            ("HOSTNAME".to_owned(), CONTAINER_HOSTNAME.to_owned()),
            ("PATH".to_owned(), DEFAULT_PATH.to_owned()),
            ("PWD".to_owned(), self.exec_root.clone()),
            ("SHLVL".to_owned(), "1".to_owned()),
        ]
    }

    /// Baseline, then image config, then `command_env`. Later entries win on
    /// name collision; the result is sorted by name.
    ///
    /// `extra_path` is appended to whichever PATH the baseline and image
    /// leave behind, before the command's own variables are applied.
    pub fn merged_env(&self, command_env: &[EnvVar]) -> Vec<String> {
        let mut env: BTreeMap<String, String> = self.baseline_env().into_iter().collect();
        for entry in &self.image_env {
            if let Some((name, value)) = entry.split_once('=') {
                env.insert(name.to_owned(), value.to_owned());
            }
        }
        let path = env.entry("PATH".to_owned()).or_default();
        for extra in &self.extra_path {
            if path.split(':').any(|dir| dir == extra) {
                continue;
            }
            if !path.is_empty() {
                path.push(':');
            }
            path.push_str(extra);
        }
        for var in command_env {
            env.insert(var.name.clone(), var.value.clone());
        }
        env.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    pub fn process(&self, args: &[String], command_env: &[EnvVar]) -> ProcessSpec {
        ProcessSpec {
            terminal: false,
            user: User::default(),
            args: args.to_vec(),
            env: self.merged_env(command_env),
            cwd: self.exec_root.clone(),
            capabilities: Capabilities::default(),
            no_new_privileges: true,
        }
    }

    fn isolates_network(&self) -> bool {
        self.network == NetworkMode::Off || self.netns.is_some()
    }

    fn namespaces(&self) -> Vec<Namespace> {
        let mut namespaces = vec![
            Namespace::new("pid"),
            Namespace::new("mount"),
            Namespace::new("uts"),
            Namespace::new("ipc"),
        ];
        match (self.network, &self.netns) {
            (NetworkMode::Off, _) => namespaces.push(Namespace::new("network")),
            (NetworkMode::Enabled, Some(path)) => namespaces.push(Namespace {
                ns_type: "network".to_owned(),
                path: Some(path.display().to_string()),
            }),
            (NetworkMode::Enabled, None) => {}
        }
        namespaces
    }

    fn mounts(&self, bundle_dir: &Path) -> Vec<Mount> {
        let mut mounts = vec![
            Mount::new("/proc", "proc", "proc", &[]),
            Mount::new(
                "/dev",
                "tmpfs",
                "tmpfs",
                &["nosuid", "strictatime", "mode=755", "size=65536k"],
            ),
            Mount::new(
                "/dev/pts",
                "devpts",
                "devpts",
                &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
            ),
            Mount::new(
                "/dev/shm",
                "tmpfs",
                "shm",
                &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
            ),
            Mount::new("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
        ];

        // A fresh sysfs needs its own network namespace; otherwise bind the host's.
        if self.isolates_network() {
            mounts.push(Mount::new(
                "/sys",
                "sysfs",
                "sysfs",
                &["nosuid", "noexec", "nodev", "ro"],
            ));
        } else {
            mounts.push(Mount::new(
                "/sys",
                "bind",
                "/sys",
                &["rbind", "nosuid", "noexec", "nodev", "ro"],
            ));
        }
        mounts.push(Mount::new(
            "/sys/fs/cgroup",
            "cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev", "relatime", "ro"],
        ));

        mounts.push(Mount::bind(&self.workdir, &self.exec_root, false));
        mounts.push(Mount::bind(&hosts_path(bundle_dir), "/etc/hosts", true));
        if self.network == NetworkMode::Enabled && Path::new(HOST_RESOLV_CONF).exists() {
            mounts.push(Mount::bind(
                Path::new(HOST_RESOLV_CONF),
                "/etc/resolv.conf",
                true,
            ));
        }
        mounts
    }

    /// Full runtime config for a container whose init process runs `init_args`.
    pub fn spec(&self, bundle_dir: &Path, init_args: &[String]) -> OciSpec {
        OciSpec {
            oci_version: OCI_VERSION.to_owned(),
            process: self.process(init_args, &[]),
            root: Root {
                path: self.rootfs.display().to_string(),
                readonly: false,
            },
            hostname: CONTAINER_HOSTNAME.to_owned(),
            mounts: self.mounts(bundle_dir),
            linux: Linux {
                namespaces: self.namespaces(),
                devices: standard_devices(),
                cgroups_path: self.cgroup_path.clone(),
                resources: Resources::from_limits(&self.resources),
                masked_paths: MASKED_PATHS.iter().map(|p| (*p).to_owned()).collect(),
                readonly_paths: READONLY_PATHS.iter().map(|p| (*p).to_owned()).collect(),
            },
        }
    }
}

pub fn config_path(bundle_dir: &Path) -> PathBuf {
    bundle_dir.join("config.json")
}

pub fn hosts_path(bundle_dir: &Path) -> PathBuf {
    bundle_dir.join("hosts")
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), RuntimeError> {
    let content = serde_json::to_vec_pretty(value)?;
    let mut file = fs::File::create(path)?;
    file.write_all(&content)?;
    file.sync_all()?;
    Ok(())
}

/// Write `config.json` and the generated hosts file into `bundle_dir`.
pub fn write_bundle(bundle_dir: &Path, spec: &OciSpec) -> Result<(), RuntimeError> {
    fs::create_dir_all(bundle_dir)?;
    fs::write(hosts_path(bundle_dir), HOSTS_CONTENT)?;
    write_json(&config_path(bundle_dir), spec)
}

/// Write a process spec for `exec --process`.
pub fn write_process(path: &Path, process: &ProcessSpec) -> Result<(), RuntimeError> {
    write_json(path, process)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_value<'a>(process: &'a ProcessSpec, name: &str) -> Option<&'a str> {
        process.env.iter().find_map(|e| {
            e.split_once('=')
                .filter(|(k, _)| *k == name)
                .map(|(_, v)| v)
        })
    }

    fn options() -> BundleOptions {
        BundleOptions {
            rootfs: PathBuf::from("/build/work.overlay/merged"),
            workdir: PathBuf::from("/build/work"),
            exec_root: "/brig-execroot".to_owned(),
            extra_path: vec!["/opt/tools/bin".to_owned()],
            image_env: vec!["PATH=/image/bin".to_owned(), "LANG=C.UTF-8".to_owned()],
            network: NetworkMode::Enabled,
            netns: None,
            cgroup_path: "/brig/c1".to_owned(),
            resources: ResourceLimits::default(),
        }
    }

    #[test]
    fn env_priority_and_order() {
        let mut opts = options();
        opts.image_env = vec!["LANG=C.UTF-8".to_owned(), "HOME=/home/image".to_owned()];
        let env = opts.merged_env(&[
            EnvVar::new("GREETING", "Hello"),
            EnvVar::new("HOME", "/home/cmd"),
        ]);
        assert_eq!(
            env,
            vec![
                "GREETING=Hello".to_owned(),
                "HOME=/home/cmd".to_owned(),
                "HOSTNAME=localhost".to_owned(),
                "LANG=C.UTF-8".to_owned(),
                format!("PATH={DEFAULT_PATH}:/opt/tools/bin"),
                "PWD=/brig-execroot".to_owned(),
                "SHLVL=1".to_owned(),
            ]
        );
    }

    #[test]
    fn image_env_overrides_baseline() {
        let process = options().process(&["true".to_owned()], &[]);
        assert_eq!(env_value(&process, "PATH"), Some("/image/bin:/opt/tools/bin"));
        assert_eq!(env_value(&process, "LANG"), Some("C.UTF-8"));
        assert_eq!(process.cwd, "/brig-execroot");
    }

    #[test]
    fn extra_path_survives_image_path() {
        let mut opts = options();
        opts.extra_path = vec!["/test/bin".to_owned()];
        opts.image_env = vec![format!("PATH={DEFAULT_PATH}")];
        let process = opts.process(&["true".to_owned()], &[]);
        assert_eq!(
            env_value(&process, "PATH").map(str::to_owned),
            Some(format!("{DEFAULT_PATH}:/test/bin"))
        );
    }

    #[test]
    fn extra_path_is_not_duplicated() {
        let mut opts = options();
        opts.image_env = vec!["PATH=/bin:/opt/tools/bin".to_owned()];
        let env = opts.merged_env(&[]);
        assert!(env.contains(&"PATH=/bin:/opt/tools/bin".to_owned()), "{env:?}");
    }

    #[test]
    fn command_path_replaces_everything() {
        let env = options().merged_env(&[EnvVar::new("PATH", "/only")]);
        assert!(env.contains(&"PATH=/only".to_owned()), "{env:?}");
    }

    #[test]
    fn default_capabilities_leave_out_raw_sockets() {
        let process = options().process(&["true".to_owned()], &[]);
        let caps = &process.capabilities;
        for set in [&caps.bounding, &caps.effective, &caps.permitted] {
            assert!(!set.iter().any(|c| c == "CAP_NET_RAW"), "{set:?}");
            assert!(set.iter().any(|c| c == "CAP_NET_BIND_SERVICE"));
        }
    }

    #[test]
    fn standard_device_numbers() {
        let spec = options().spec(Path::new("/b"), &["sleep".to_owned()]);
        let devices: Vec<_> = spec
            .linux
            .devices
            .iter()
            .map(|d| (d.path.as_str(), d.device_type.as_str(), d.major, d.minor))
            .collect();
        assert_eq!(
            devices,
            vec![
                ("/dev/null", "c", 1, 3),
                ("/dev/zero", "c", 1, 5),
                ("/dev/random", "c", 1, 8),
                ("/dev/urandom", "c", 1, 9),
            ]
        );
        let rules = &spec.linux.resources.devices;
        assert!(!rules[0].allow);
        assert!(rules
            .iter()
            .any(|r| r.allow && r.major == Some(1) && r.minor == Some(9)));
    }

    #[test]
    fn namespaces_follow_network_mode() {
        let mut opts = options();
        let shared = opts.spec(Path::new("/b"), &[]);
        for ns in ["pid", "mount", "uts", "ipc"] {
            assert!(shared.linux.namespace(ns).is_some(), "missing {ns}");
        }
        assert!(shared.linux.namespace("network").is_none());

        opts.netns = Some(PathBuf::from("/var/run/netns/c1"));
        let joined = opts.spec(Path::new("/b"), &[]);
        assert_eq!(
            joined.linux.namespace("network").and_then(|n| n.path.as_deref()),
            Some("/var/run/netns/c1")
        );

        opts.network = NetworkMode::Off;
        opts.netns = None;
        let isolated = opts.spec(Path::new("/b"), &[]);
        let ns = isolated.linux.namespace("network").unwrap();
        assert!(ns.path.is_none());
        assert!(!isolated
            .mounts
            .iter()
            .any(|m| m.destination == "/etc/resolv.conf"));
    }

    #[test]
    fn workdir_is_bound_at_exec_root() {
        let spec = options().spec(Path::new("/b"), &[]);
        let mount = spec
            .mounts
            .iter()
            .find(|m| m.destination == "/brig-execroot")
            .unwrap();
        assert_eq!(mount.source, "/build/work");
        assert!(mount.options.contains(&"rw".to_owned()));
        let hosts = spec.mounts.iter().find(|m| m.destination == "/etc/hosts").unwrap();
        assert_eq!(hosts.source, "/b/hosts");
    }

    #[test]
    fn limits_are_optional() {
        let mut opts = options();
        let spec = opts.spec(Path::new("/b"), &[]);
        assert!(spec.linux.resources.memory.is_none());
        assert!(spec.linux.resources.cpu.is_none());

        opts.resources.memory_limit_bytes = Some(1 << 30);
        opts.resources.pids_limit = Some(512);
        let spec = opts.spec(Path::new("/b"), &[]);
        assert_eq!(spec.linux.resources.memory, Some(Memory { limit: 1 << 30 }));
        assert_eq!(spec.linux.resources.pids, Some(Pids { limit: 512 }));
    }

    #[test]
    fn config_json_uses_oci_field_names() {
        let spec = options().spec(Path::new("/b"), &["sleep".to_owned()]);
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["ociVersion"], OCI_VERSION);
        assert_eq!(json["linux"]["cgroupsPath"], "/brig/c1");
        assert_eq!(json["process"]["noNewPrivileges"], true);
        assert_eq!(json["linux"]["devices"][0]["fileMode"], 0o666);
        assert_eq!(json["hostname"], "localhost");
    }

    #[test]
    fn write_bundle_creates_config_and_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let spec = options().spec(dir.path(), &["sleep".to_owned()]);
        write_bundle(dir.path(), &spec).unwrap();

        let written: OciSpec =
            serde_json::from_slice(&fs::read(config_path(dir.path())).unwrap()).unwrap();
        assert_eq!(written, spec);
        assert!(fs::read_to_string(hosts_path(dir.path()))
            .unwrap()
            .contains("localhost"));
    }
}
