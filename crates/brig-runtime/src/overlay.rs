use crate::RuntimeError;
use brig_image::{
    is_opaque_dir, is_whiteout, LayerSet, WhiteoutForm, OPAQUE_WHITEOUT, WHITEOUT_PREFIX,
};
use brig_schema::RootfsStrategy;
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const BUSY_RETRY_DELAY: Duration = Duration::from_millis(200);

/// How the container root was materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Overlay,
    /// Layers copied into `upper`, which then doubles as the root.
    Copy,
}

/// Pick the concrete rootfs strategy. `Overlay` without mount privilege is an
/// error rather than a silent downgrade.
pub fn resolve_strategy(strategy: RootfsStrategy) -> Result<MountKind, RuntimeError> {
    match strategy {
        RootfsStrategy::Copy => Ok(MountKind::Copy),
        RootfsStrategy::Overlay if has_mount_permission() => Ok(MountKind::Overlay),
        RootfsStrategy::Overlay => Err(RuntimeError::MountNotPermitted),
        RootfsStrategy::Auto if has_mount_permission() => Ok(MountKind::Overlay),
        RootfsStrategy::Auto => {
            debug!("no mount privilege, using copy rootfs strategy");
            Ok(MountKind::Copy)
        }
    }
}

/// A container's root filesystem built from a [`LayerSet`].
///
/// Lower directories are never written to. `upper`, `work` and `merged` belong
/// to exactly one container and are removed by [`unmount`](Self::unmount).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayMount {
    pub lower_dirs: Vec<PathBuf>,
    pub upper_dir: PathBuf,
    pub work_dir: PathBuf,
    pub merged_dir: PathBuf,
    container_dir: PathBuf,
    kind: MountKind,
}

impl OverlayMount {
    /// Materialize the rootfs under `container_dir`.
    ///
    /// On failure everything created here is removed again.
    pub fn build(
        layers: &LayerSet,
        container_dir: &Path,
        kind: MountKind,
    ) -> Result<Self, RuntimeError> {
        if container_dir.exists() {
            return Err(RuntimeError::mount(
                container_dir,
                "container directory already exists",
            ));
        }
        if kind == MountKind::Overlay && layers.whiteouts() == WhiteoutForm::Marker {
            return Err(RuntimeError::mount(
                container_dir,
                "image layers keep whiteout marker files that overlayfs cannot interpret; \
                 remove the cached layers and pull again with mount privilege",
            ));
        }
        let upper_dir = container_dir.join("upper");
        let work_dir = container_dir.join("work");
        let merged_dir = match kind {
            MountKind::Overlay => container_dir.join("merged"),
            MountKind::Copy => upper_dir.clone(),
        };
        let mount = Self {
            lower_dirs: layers.as_slice().to_vec(),
            upper_dir,
            work_dir,
            merged_dir,
            container_dir: container_dir.to_path_buf(),
            kind,
        };

        if let Err(e) = mount.materialize() {
            if let Err(cleanup) = mount.unmount() {
                warn!(
                    "cleanup of {} after failed build: {cleanup}",
                    container_dir.display()
                );
            }
            return Err(e);
        }
        debug!(
            "rootfs for {} ready ({:?}, {} layers)",
            container_dir.display(),
            kind,
            mount.lower_dirs.len()
        );
        Ok(mount)
    }

    fn materialize(&self) -> Result<(), RuntimeError> {
        match self.kind {
            MountKind::Overlay => {
                let options = mount_options(&self.lower_dirs, &self.upper_dir, &self.work_dir)?;
                for dir in [&self.upper_dir, &self.work_dir, &self.merged_dir] {
                    fs::create_dir_all(dir)?;
                }
                sys_mount_overlay(&self.merged_dir, &options)
                    .map_err(|e| RuntimeError::mount(&self.merged_dir, e))
            }
            MountKind::Copy => {
                fs::create_dir_all(&self.upper_dir)?;
                for layer in &self.lower_dirs {
                    copy_layer(layer, &self.upper_dir)?;
                }
                Ok(())
            }
        }
    }

    /// Unmount `merged` and remove every per-container directory. A busy mount
    /// point is retried once, then reported as [`RuntimeError::Busy`]; the
    /// directories are still removed on a best-effort basis.
    pub fn unmount(&self) -> Result<(), RuntimeError> {
        let mut result = Ok(());
        // Attempted even when the mount table does not list `merged`; EINVAL
        // means there was nothing to unmount.
        if self.kind == MountKind::Overlay && self.merged_dir.exists() {
            result = unmount_with_retry(&self.merged_dir);
        }

        let still_mounted = self.kind == MountKind::Overlay && is_mounted(&self.merged_dir);
        if still_mounted {
            // Removing through a live mount would delete lower layer content.
            return result;
        }
        for dir in [&self.merged_dir, &self.work_dir, &self.upper_dir] {
            if let Err(e) = remove_tree(dir) {
                warn!("failed to remove {}: {e}", dir.display());
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        match fs::remove_dir(&self.container_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove {}: {e}", self.container_dir.display()),
        }
        result
    }
}

/// `lowerdir` lists the most specific layer first, the reverse of a LayerSet.
/// Paths containing the option separators `,` or `:` are rejected.
fn mount_options(lower: &[PathBuf], upper: &Path, work: &Path) -> Result<String, RuntimeError> {
    let option_path = |path: &Path| {
        let text = path.display().to_string();
        if text.contains([',', ':']) {
            Err(RuntimeError::mount(
                path,
                "overlay paths must not contain ',' or ':'",
            ))
        } else {
            Ok(text)
        }
    };
    let lowerdir = lower
        .iter()
        .rev()
        .map(|p| option_path(p.as_path()))
        .collect::<Result<Vec<_>, _>>()?
        .join(":");
    Ok(format!(
        "lowerdir={lowerdir},upperdir={},workdir={}",
        option_path(upper)?,
        option_path(work)?
    ))
}

fn remove_tree(path: &Path) -> Result<(), std::io::Error> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn unmount_with_retry(merged: &Path) -> Result<(), RuntimeError> {
    match sys_unmount(merged) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
            warn!("{} busy, retrying unmount", merged.display());
            std::thread::sleep(BUSY_RETRY_DELAY);
            match sys_unmount(merged) {
                Ok(()) => Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => Err(RuntimeError::Busy {
                    path: merged.to_path_buf(),
                }),
                Err(e) => Err(RuntimeError::mount(merged, e)),
            }
        }
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Ok(()),
        Err(e) => Err(RuntimeError::mount(merged, e)),
    }
}

/// Whether `path` is a mount point according to `/proc/mounts`.
pub fn is_mounted(path: &Path) -> bool {
    let canonical = match fs::canonicalize(path) {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => path.to_string_lossy().to_string(),
    };
    match fs::read_to_string("/proc/mounts") {
        Ok(mounts) => mount_points(&mounts).any(|point| point == canonical),
        Err(_) => false,
    }
}

/// Mount points of a `/proc/mounts` table, with the kernel's octal escapes
/// (`\040` for a space and so on) decoded.
fn mount_points(table: &str) -> impl Iterator<Item = String> + '_ {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount_field)
}

fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let escaped = bytes
                .get(i + 1..i + 4)
                .filter(|d| d.iter().all(|b| (b'0'..=b'7').contains(b)))
                .map(|d| d.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0')));
            if let Some(Ok(byte)) = escaped.map(u8::try_from) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Check mount privilege by bind-mounting a scratch directory onto itself.
pub fn has_mount_permission() -> bool {
    let Ok(dir) = tempfile::tempdir() else {
        return false;
    };
    let target = dir.path();
    if sys_bind_mount(target, target).is_err() {
        return false;
    }
    if let Err(e) = sys_unmount(target) {
        warn!("failed to undo test mount at {}: {e}", target.display());
    }
    true
}

fn c_path(path: &Path) -> Result<CString, std::io::Error> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
}

fn c_str(s: &str) -> Result<CString, std::io::Error> {
    CString::new(s).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
}

#[allow(unsafe_code)]
fn sys_mount_overlay(target: &Path, options: &str) -> Result<(), std::io::Error> {
    let source = c_str("overlay")?;
    let fstype = c_str("overlay")?;
    let target = c_path(target)?;
    let data = c_str(options)?;
    // SAFETY: every pointer refers to a live NUL-terminated CString.
    let rc = unsafe {
        libc::mount(
            source.as_ptr(),
            target.as_ptr(),
            fstype.as_ptr(),
            0,
            data.as_ptr().cast::<libc::c_void>(),
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[allow(unsafe_code)]
fn sys_bind_mount(source: &Path, target: &Path) -> Result<(), std::io::Error> {
    let source = c_path(source)?;
    let target = c_path(target)?;
    // SAFETY: source and target are live CStrings; fstype and data may be null
    // for MS_BIND.
    let rc = unsafe {
        libc::mount(
            source.as_ptr(),
            target.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND,
            std::ptr::null(),
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[allow(unsafe_code)]
fn sys_unmount(target: &Path) -> Result<(), std::io::Error> {
    let target = c_path(target)?;
    // SAFETY: target is a live NUL-terminated CString.
    let rc = unsafe { libc::umount2(target.as_ptr(), 0) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Apply one layer on top of `dest`, honouring both whiteout forms.
fn copy_layer(layer: &Path, dest: &Path) -> Result<(), RuntimeError> {
    if layer.join(OPAQUE_WHITEOUT).exists() || is_opaque_dir(layer) {
        clear_dir(dest)?;
    }

    for entry in fs::read_dir(layer)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        let src = entry.path();
        let meta = fs::symlink_metadata(&src)?;

        if name_str == OPAQUE_WHITEOUT {
            continue;
        }
        if let Some(hidden) = name_str.strip_prefix(WHITEOUT_PREFIX) {
            remove_any(&dest.join(hidden))?;
            continue;
        }
        if is_whiteout(&src) {
            remove_any(&dest.join(&name))?;
            continue;
        }

        let target = dest.join(&name);
        let file_type = meta.file_type();
        if file_type.is_dir() {
            if target.symlink_metadata().is_ok_and(|m| !m.is_dir()) {
                remove_any(&target)?;
            }
            fs::create_dir_all(&target)?;
            // Keep the tree removable without privilege.
            let mode = meta.permissions().mode() | 0o700;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
            copy_layer(&src, &target)?;
        } else if file_type.is_symlink() {
            remove_any(&target)?;
            std::os::unix::fs::symlink(fs::read_link(&src)?, &target)?;
        } else if file_type.is_file() {
            remove_any(&target)?;
            fs::copy(&src, &target)?;
        } else if file_type.is_char_device() || file_type.is_block_device() {
            debug!("skipping device node {}", src.display());
        }
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> Result<(), std::io::Error> {
    for entry in fs::read_dir(dir)? {
        remove_any(&entry?.path())?;
    }
    Ok(())
}

fn remove_any(path: &Path) -> Result<(), std::io::Error> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(root: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = root.join(name);
        for (path, content) in files {
            let p = dir.join(path);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, content).unwrap();
        }
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn lowerdir_lists_most_specific_first() {
        let opts = mount_options(
            &[PathBuf::from("/l/base"), PathBuf::from("/l/mid"), PathBuf::from("/l/top")],
            Path::new("/c/upper"),
            Path::new("/c/work"),
        )
        .unwrap();
        assert_eq!(
            opts,
            "lowerdir=/l/top:/l/mid:/l/base,upperdir=/c/upper,workdir=/c/work"
        );
    }

    #[test]
    fn mount_options_reject_separators() {
        for bad in ["/l/a,b", "/l/a:b"] {
            let err = mount_options(&[PathBuf::from(bad)], Path::new("/c/upper"), Path::new("/c/work"))
                .unwrap_err();
            assert!(err.to_string().contains(bad), "{err}");
        }
        assert!(mount_options(&[], Path::new("/c,x/upper"), Path::new("/c/work")).is_err());
        assert!(mount_options(&[], Path::new("/c x/upper"), Path::new("/c x/work")).is_ok());
    }

    #[test]
    fn mount_table_escapes_are_decoded() {
        let table = "proc /proc proc rw 0 0\n\
                     overlay /tmp/my\\040work.overlay/merged overlay rw,lowerdir=/l 0 0\n\
                     tmpfs /tab\\011bed tmpfs rw 0 0\n";
        let points: Vec<_> = mount_points(table).collect();
        assert_eq!(
            points,
            vec!["/proc", "/tmp/my work.overlay/merged", "/tab\tbed"]
        );
    }

    #[test]
    fn unescape_keeps_plain_backslashes() {
        assert_eq!(unescape_mount_field("a\\134b"), "a\\b");
        assert_eq!(unescape_mount_field("a\\xyz"), "a\\xyz");
        assert_eq!(unescape_mount_field("end\\04"), "end\\04");
        assert_eq!(unescape_mount_field("\\777"), "\\777");
    }

    #[test]
    fn overlay_refuses_marker_whiteouts() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(dir.path(), "base", &[("etc/.wh.motd", "")]);
        let container = dir.path().join("work.overlay");
        let layers = LayerSet::new(vec![base]).with_whiteouts(WhiteoutForm::Marker);

        let err = OverlayMount::build(&layers, &container, MountKind::Overlay).unwrap_err();
        assert!(err.to_string().contains("marker"), "{err}");
        assert!(!container.exists());
    }

    #[test]
    fn overlay_with_space_in_path_is_torn_down() {
        if !has_mount_permission() {
            eprintln!("skipping: no mount privilege");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let base = layer(dir.path(), "base", &[("bin/tool", "v1")]);
        let container = dir.path().join("my work.overlay");

        let mount =
            OverlayMount::build(&LayerSet::new(vec![base.clone()]), &container, MountKind::Overlay)
                .unwrap();
        assert!(is_mounted(&mount.merged_dir));
        assert_eq!(fs::read_to_string(mount.merged_dir.join("bin/tool")).unwrap(), "v1");

        mount.unmount().unwrap();
        assert!(!container.exists());
        assert_eq!(fs::read_to_string(base.join("bin/tool")).unwrap(), "v1");
    }

    #[test]
    fn copy_strategy_honours_unpacked_whiteouts() {
        use brig_image::{unpack_layer, LayerBuilder};

        let dir = tempfile::tempdir().unwrap();
        let base = layer(dir.path(), "base", &[("var/cache/a", "1"), ("etc/motd", "hi")]);
        let mut builder = LayerBuilder::new();
        builder
            .dir("etc", 0o755)
            .unwrap()
            .file("etc/.wh.motd", 0o644, b"")
            .unwrap()
            .dir("var/cache", 0o755)
            .unwrap()
            .file("var/cache/.wh..wh..opq", 0o644, b"")
            .unwrap()
            .file("var/cache/c", 0o644, b"3")
            .unwrap();
        let top = dir.path().join("top");
        // Overlay form when privileged, marker files otherwise.
        unpack_layer(builder.finish().unwrap().as_slice(), &top).unwrap();

        let container = dir.path().join("work.overlay");
        let mount =
            OverlayMount::build(&LayerSet::new(vec![base, top]), &container, MountKind::Copy)
                .unwrap();
        let root = &mount.merged_dir;
        assert!(!root.join("var/cache/a").exists());
        assert!(root.join("var/cache/c").exists());
        assert!(!root.join("etc/motd").exists());
        assert!(!root.join("etc/.wh.motd").exists());
        assert!(!root.join("var/cache").join(OPAQUE_WHITEOUT).exists());
    }

    #[test]
    fn copy_strategy_layers_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(dir.path(), "base", &[("bin/tool", "v1"), ("etc/motd", "hi")]);
        let top = layer(dir.path(), "top", &[("bin/tool", "v2")]);
        let container = dir.path().join("work.overlay");

        let mount =
            OverlayMount::build(&LayerSet::new(vec![base, top]), &container, MountKind::Copy)
                .unwrap();
        assert_eq!(mount.merged_dir, container.join("upper"));
        assert_eq!(fs::read_to_string(mount.merged_dir.join("bin/tool")).unwrap(), "v2");
        assert_eq!(fs::read_to_string(mount.merged_dir.join("etc/motd")).unwrap(), "hi");
    }

    #[test]
    fn copy_strategy_honours_whiteout_markers() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(
            dir.path(),
            "base",
            &[("etc/motd", "hi"), ("var/cache/a", "1"), ("var/cache/b", "2")],
        );
        let top = layer(
            dir.path(),
            "top",
            &[("etc/.wh.motd", ""), ("var/cache/.wh..wh..opq", ""), ("var/cache/c", "3")],
        );
        let container = dir.path().join("work.overlay");

        let mount =
            OverlayMount::build(&LayerSet::new(vec![base, top]), &container, MountKind::Copy)
                .unwrap();
        let root = &mount.merged_dir;
        assert!(!root.join("etc/motd").exists());
        assert!(!root.join("etc/.wh.motd").exists());
        assert!(!root.join("var/cache/a").exists());
        assert!(root.join("var/cache/c").exists());
    }

    #[test]
    fn copy_leaves_lower_layers_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(dir.path(), "base", &[("bin/tool", "v1")]);
        let container = dir.path().join("work.overlay");

        let mount =
            OverlayMount::build(&LayerSet::new(vec![base.clone()]), &container, MountKind::Copy)
                .unwrap();
        fs::write(mount.merged_dir.join("bin/foo.txt"), "new").unwrap();
        fs::write(mount.merged_dir.join("bin/tool"), "changed").unwrap();

        assert!(!base.join("bin/foo.txt").exists());
        assert_eq!(fs::read_to_string(base.join("bin/tool")).unwrap(), "v1");
        assert!(mount.upper_dir.join("bin/foo.txt").exists());
    }

    #[test]
    fn unmount_removes_container_dirs_only() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(dir.path(), "base", &[("bin/tool", "v1")]);
        let container = dir.path().join("work.overlay");

        let mount =
            OverlayMount::build(&LayerSet::new(vec![base.clone()]), &container, MountKind::Copy)
                .unwrap();
        mount.unmount().unwrap();
        assert!(!container.exists());
        assert!(base.join("bin/tool").exists());
        // Second unmount is a no-op.
        mount.unmount().unwrap();
    }

    #[test]
    fn build_refuses_existing_container_dir() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("work.overlay");
        fs::create_dir_all(&container).unwrap();
        let err = OverlayMount::build(&LayerSet::default(), &container, MountKind::Copy)
            .unwrap_err();
        assert!(err.to_string().contains("work.overlay"));
    }

    #[test]
    fn is_mounted_returns_false_for_regular_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_mounted(dir.path()));
    }

    #[test]
    fn copy_strategy_always_resolves() {
        assert_eq!(resolve_strategy(RootfsStrategy::Copy).unwrap(), MountKind::Copy);
    }
}
