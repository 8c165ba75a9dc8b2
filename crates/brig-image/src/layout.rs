use std::fs;
use std::path::{Path, PathBuf};

/// Directory layout of brig's state under a build root.
///
/// ```text
/// <build_root>/executor/oci/
///     layers/<digest>/      shared, read-only after unpack
///     images/<key>.json     image records
///     locks/<key>.lock      cross-process pull locks
///     bundles/<id>/         per-container bundle (config.json, hosts, exec specs)
/// ```
///
/// All subdirectories are created lazily on [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
}

impl OciLayout {
    pub fn new(build_root: impl AsRef<Path>) -> Self {
        Self {
            root: build_root.as_ref().join("executor").join("oci"),
        }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn layers_dir(&self) -> PathBuf {
        self.root.join("layers")
    }

    #[inline]
    pub fn layer_path(&self, dir_name: &str) -> PathBuf {
        self.layers_dir().join(dir_name)
    }

    /// Present next to a layer whose whiteouts were kept as `.wh.` marker
    /// files because overlay whiteouts could not be created.
    #[inline]
    pub fn layer_markers_flag(&self, dir_name: &str) -> PathBuf {
        self.layers_dir().join(format!("{dir_name}.markers"))
    }

    #[inline]
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    #[inline]
    pub fn image_record(&self, key: &str) -> PathBuf {
        self.images_dir().join(format!("{key}.json"))
    }

    #[inline]
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    #[inline]
    pub fn pull_lock(&self, key: &str) -> PathBuf {
        self.locks_dir().join(format!("{key}.lock"))
    }

    #[inline]
    pub fn bundles_dir(&self) -> PathBuf {
        self.root.join("bundles")
    }

    #[inline]
    pub fn bundle_path(&self, container_id: &str) -> PathBuf {
        self.bundles_dir().join(container_id)
    }

    pub fn initialize(&self) -> std::io::Result<()> {
        fs::create_dir_all(self.layers_dir())?;
        fs::create_dir_all(self.images_dir())?;
        fs::create_dir_all(self.locks_dir())?;
        fs::create_dir_all(self.bundles_dir())?;
        Ok(())
    }
}

/// Per-container overlay directory for a host working directory:
/// `<workdir>.overlay`.
pub fn overlay_dir_for(workdir: &Path) -> PathBuf {
    let mut name = workdir.as_os_str().to_owned();
    name.push(".overlay");
    PathBuf::from(name)
}
