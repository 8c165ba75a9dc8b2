use crate::ImageError;
use std::ffi::CString;
use std::fs;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// OCI whiteout marker prefix: `.wh.<name>` deletes `<name>` from lower layers.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// OCI opaque marker: hides every lower entry of the containing directory.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

const OVERLAY_OPAQUE_XATTR: &str = "trusted.overlay.opaque";

/// Ordered layer directories of one image, lowest priority first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerSet {
    dirs: Vec<PathBuf>,
    whiteouts: WhiteoutForm,
}

impl LayerSet {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            whiteouts: WhiteoutForm::Overlay,
        }
    }

    #[must_use]
    pub fn with_whiteouts(mut self, whiteouts: WhiteoutForm) -> Self {
        self.whiteouts = whiteouts;
        self
    }

    /// `Marker` as soon as one layer kept `.wh.` marker files.
    pub fn whiteouts(&self) -> WhiteoutForm {
        self.whiteouts
    }

    pub fn as_slice(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PathBuf> {
        self.dirs.iter()
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}

impl<'a> IntoIterator for &'a LayerSet {
    type Item = &'a PathBuf;
    type IntoIter = std::slice::Iter<'a, PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.dirs.iter()
    }
}

/// How a whiteout was recorded in an unpacked layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WhiteoutForm {
    /// 0/0 character device or opaque xattr, understood by overlayfs. Also
    /// the form of a layer without any whiteouts.
    #[default]
    Overlay,
    /// `.wh.` marker file kept verbatim (no privilege to create devices).
    Marker,
}

/// Extract an uncompressed layer tarball into `target_dir`, translating OCI
/// whiteouts into overlayfs form where the process is allowed to.
pub fn unpack_layer<R: Read>(data: R, target_dir: &Path) -> Result<WhiteoutForm, ImageError> {
    fs::create_dir_all(target_dir)?;
    let mut ar = tar::Archive::new(data);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(false);
    ar.set_unpack_xattrs(false);
    ar.set_overwrite(true);

    let mut form = WhiteoutForm::Overlay;
    for entry in ar.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        let Some(rel) = sanitize(&rel) else {
            warn!("skipping layer entry outside the layer root: {}", rel.display());
            continue;
        };

        let name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if name == OPAQUE_WHITEOUT {
            let dir = target_dir.join(rel.parent().unwrap_or(Path::new("")));
            fs::create_dir_all(&dir)?;
            if set_opaque(&dir).is_err() {
                fs::write(dir.join(OPAQUE_WHITEOUT), b"")?;
                form = WhiteoutForm::Marker;
            }
            continue;
        }

        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            let parent = target_dir.join(rel.parent().unwrap_or(Path::new("")));
            fs::create_dir_all(&parent)?;
            if make_whiteout_device(&parent.join(hidden)).is_err() {
                fs::write(parent.join(&name), b"")?;
                form = WhiteoutForm::Marker;
            }
            continue;
        }

        entry.unpack_in(target_dir)?;
    }

    debug!("unpacked layer into {}", target_dir.display());
    Ok(form)
}

/// Whether a directory entry hides a lower-layer path, in either form.
pub fn is_whiteout(path: &Path) -> bool {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let is_marker = path
        .file_name()
        .is_some_and(|n| n.to_string_lossy().starts_with(WHITEOUT_PREFIX));
    if is_marker {
        return true;
    }
    match path.symlink_metadata() {
        Ok(meta) => meta.file_type().is_char_device() && meta.rdev() == 0,
        Err(_) => false,
    }
}

/// Whether `dir` carries the overlayfs opaque xattr.
#[allow(unsafe_code)]
pub fn is_opaque_dir(dir: &Path) -> bool {
    let (Ok(cpath), Ok(name)) = (c_path(dir), CString::new(OVERLAY_OPAQUE_XATTR)) else {
        return false;
    };
    let mut value = [0u8; 4];
    // SAFETY: cpath and name are live NUL-terminated strings and the buffer
    // length passed matches `value`.
    let len = unsafe {
        libc::getxattr(
            cpath.as_ptr(),
            name.as_ptr(),
            value.as_mut_ptr().cast::<libc::c_void>(),
            value.len(),
        )
    };
    len == 1 && value[0] == b'y'
}

/// Drop absolute prefixes and reject `..` so entries stay inside the layer.
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn c_path(path: &Path) -> Result<CString, std::io::Error> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
}

#[allow(unsafe_code)]
fn make_whiteout_device(path: &Path) -> Result<(), std::io::Error> {
    let cpath = c_path(path)?;
    // SAFETY: cpath is a valid NUL-terminated string that outlives the call.
    let rc = unsafe { libc::mknod(cpath.as_ptr(), libc::S_IFCHR, libc::makedev(0, 0)) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[allow(unsafe_code)]
fn set_opaque(dir: &Path) -> Result<(), std::io::Error> {
    let cpath = c_path(dir)?;
    let name = CString::new(OVERLAY_OPAQUE_XATTR)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let value = b"y";
    // SAFETY: all pointers are valid for the duration of the call and the
    // value length matches the buffer.
    let rc = unsafe {
        libc::setxattr(
            cpath.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast::<libc::c_void>(),
            value.len(),
            0,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// In-memory builder for small synthetic layers (e.g. the host busybox image).
///
/// Timestamps are zeroed and ownership is root:root so identical input yields
/// identical bytes.
pub struct LayerBuilder {
    ar: tar::Builder<Vec<u8>>,
}

impl Default for LayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerBuilder {
    pub fn new() -> Self {
        let mut ar = tar::Builder::new(Vec::new());
        ar.follow_symlinks(false);
        Self { ar }
    }

    fn header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(mode);
        header.set_size(size);
        header.set_cksum();
        header
    }

    pub fn dir(&mut self, rel_path: &str, mode: u32) -> Result<&mut Self, ImageError> {
        let mut header = Self::header(tar::EntryType::Directory, mode, 0);
        let path = if rel_path.ends_with('/') {
            rel_path.to_owned()
        } else {
            format!("{rel_path}/")
        };
        self.ar.append_data(&mut header, &path, &[] as &[u8])?;
        Ok(self)
    }

    pub fn file(&mut self, rel_path: &str, mode: u32, data: &[u8]) -> Result<&mut Self, ImageError> {
        let mut header = Self::header(tar::EntryType::Regular, mode, data.len() as u64);
        self.ar.append_data(&mut header, rel_path, data)?;
        Ok(self)
    }

    pub fn symlink(&mut self, rel_path: &str, target: &str) -> Result<&mut Self, ImageError> {
        let mut header = Self::header(tar::EntryType::Symlink, 0o777, 0);
        self.ar.append_link(&mut header, rel_path, target)?;
        Ok(self)
    }

    pub fn finish(self) -> Result<Vec<u8>, ImageError> {
        Ok(self.ar.into_inner()?)
    }
}
