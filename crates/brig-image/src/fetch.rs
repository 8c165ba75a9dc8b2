use crate::layers::LayerBuilder;
use crate::{FetchedImage, FetchedLayer, ImageConfig, ImageError, ImageFetcher};
use brig_schema::{Credentials, ImageRef, LayerDigest};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::debug;

/// Reference served from the host's own busybox binary.
pub const BUSYBOX_IMAGE_REF: &str = "brig.local/busybox";

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Search `$PATH` for an executable regular file.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| {
            candidate
                .metadata()
                .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        })
}

/// Builds a single-layer image from the host's busybox: `/bin/busybox` plus
/// one symlink per applet, and the usual empty top-level directories.
#[derive(Debug, Clone)]
pub struct HostBusyboxFetcher {
    binary: Option<PathBuf>,
}

impl Default for HostBusyboxFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBusyboxFetcher {
    pub fn new() -> Self {
        Self {
            binary: find_in_path("busybox"),
        }
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: Some(binary.into()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.binary.is_some()
    }

    fn applets(binary: &Path) -> Result<Vec<String>, std::io::Error> {
        let output = Command::new(binary).arg("--list").output()?;
        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "{} --list exited with {}",
                binary.display(),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|a| !a.is_empty() && *a != "busybox" && !a.contains('/'))
            .map(ToOwned::to_owned)
            .collect())
    }

    fn build_layer(binary: &Path) -> Result<Vec<u8>, ImageError> {
        let content = std::fs::read(binary)?;
        let applets = Self::applets(binary)?;

        let mut builder = LayerBuilder::new();
        for dir in ["bin", "dev", "etc", "proc", "root", "sys", "usr", "usr/bin"] {
            builder.dir(dir, 0o755)?;
        }
        builder.dir("tmp", 0o1777)?;
        builder.file("bin/busybox", 0o755, &content)?;
        builder.file("etc/passwd", 0o644, b"root:x:0:0:root:/root:/bin/sh\n")?;
        builder.file("etc/group", 0o644, b"root:x:0:\n")?;
        for applet in &applets {
            builder.symlink(&format!("bin/{applet}"), "busybox")?;
        }
        builder.finish()
    }
}

impl ImageFetcher for HostBusyboxFetcher {
    fn fetch(
        &self,
        image: &ImageRef,
        _credentials: Option<&Credentials>,
    ) -> Result<FetchedImage, ImageError> {
        let binary = self
            .binary
            .as_deref()
            .ok_or_else(|| ImageError::fetch(image, "busybox not found on the host PATH"))?;

        let data = Self::build_layer(binary).map_err(|e| ImageError::fetch(image, e.to_string()))?;
        let digest = LayerDigest::new(format!("blake3:{}", blake3::hash(&data).to_hex()));
        debug!("built busybox layer {digest} from {}", binary.display());

        Ok(FetchedImage {
            config: ImageConfig {
                env: vec![format!("PATH={DEFAULT_PATH}")],
            },
            layers: vec![FetchedLayer {
                digest,
                data: Box::new(std::io::Cursor::new(data)),
            }],
        })
    }
}

/// Routes [`BUSYBOX_IMAGE_REF`] to the host fetcher and everything else to an
/// optional remote fetcher.
#[derive(Default)]
pub struct DefaultFetcher {
    local: HostBusyboxFetcher,
    remote: Option<Arc<dyn ImageFetcher>>,
}

impl DefaultFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_local(mut self, local: HostBusyboxFetcher) -> Self {
        self.local = local;
        self
    }

    #[must_use]
    pub fn with_remote(mut self, remote: Arc<dyn ImageFetcher>) -> Self {
        self.remote = Some(remote);
        self
    }
}

impl ImageFetcher for DefaultFetcher {
    fn fetch(
        &self,
        image: &ImageRef,
        credentials: Option<&Credentials>,
    ) -> Result<FetchedImage, ImageError> {
        if image.as_str() == BUSYBOX_IMAGE_REF {
            return self.local.fetch(image, credentials);
        }
        match &self.remote {
            Some(remote) => remote.fetch(image, credentials),
            None => Err(ImageError::NoFetcher(image.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_ref_without_remote_is_an_error() {
        let fetcher = DefaultFetcher::new();
        let image = ImageRef::parse("docker.io/library/alpine:3").unwrap();
        let err = fetcher.fetch(&image, None).unwrap_err();
        assert!(matches!(err, ImageError::NoFetcher(_)));
    }

    #[test]
    fn missing_busybox_is_a_fetch_error() {
        let fetcher = DefaultFetcher::new().with_local(HostBusyboxFetcher {
            binary: None,
        });
        let image = ImageRef::parse(BUSYBOX_IMAGE_REF).unwrap();
        let err = fetcher.fetch(&image, None).unwrap_err();
        assert!(err.to_string().contains("busybox"));
    }

    #[test]
    fn find_in_path_locates_sh() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-binary-xyz").is_none());
    }

    #[test]
    fn busybox_layer_when_available() {
        let fetcher = HostBusyboxFetcher::new();
        if !fetcher.is_available() {
            return;
        }
        let image = ImageRef::parse(BUSYBOX_IMAGE_REF).unwrap();
        let fetched = fetcher.fetch(&image, None).unwrap();
        assert_eq!(fetched.layers.len(), 1);
        assert!(fetched.layers[0].digest.starts_with("blake3:"));
        assert!(fetched.config.env.iter().any(|e| e.starts_with("PATH=")));
    }
}
