use crate::layers::{unpack_layer, LayerSet, WhiteoutForm};
use crate::layout::OciLayout;
use crate::lock::{KeyedMutex, PullLock};
use crate::{image_key, CachedImage, ImageConfig, ImageError, ImageFetcher, ImageStore};
use brig_schema::{Credentials, ImageRef};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// On-disk record of a pulled image, `images/<key>.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct ImageRecord {
    reference: String,
    /// Layer directory names under `layers/`, lowest priority first.
    layers: Vec<String>,
    #[serde(default)]
    config: ImageConfig,
}

/// Content-addressed layer cache shared by every container of a provider.
///
/// Layer directories are written once, by renaming a fully unpacked temp dir
/// into place, and never modified afterwards.
pub struct LayerCache {
    layout: OciLayout,
    fetcher: Arc<dyn ImageFetcher>,
    pulls: KeyedMutex,
}

impl LayerCache {
    pub fn new(layout: OciLayout, fetcher: Arc<dyn ImageFetcher>) -> Result<Self, ImageError> {
        layout.initialize()?;
        Ok(Self {
            layout,
            fetcher,
            pulls: KeyedMutex::new(),
        })
    }

    pub fn layout(&self) -> &OciLayout {
        &self.layout
    }

    fn read_record(&self, key: &str) -> Result<Option<ImageRecord>, ImageError> {
        let path = self.layout.image_record(key);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn write_record(&self, key: &str, record: &ImageRecord) -> Result<(), ImageError> {
        let content = serde_json::to_string_pretty(record)?;
        let mut tmp = NamedTempFile::new_in(self.layout.images_dir())?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.layout.image_record(key))
            .map_err(|e| ImageError::Io(e.error))?;
        Ok(())
    }

    fn resolve(&self, image: &ImageRef, record: ImageRecord) -> Option<CachedImage> {
        let dirs: Vec<_> = record
            .layers
            .iter()
            .map(|name| self.layout.layer_path(name))
            .collect();
        if dirs.iter().any(|d| !d.is_dir()) {
            return None;
        }
        let whiteouts = if record
            .layers
            .iter()
            .any(|name| self.layout.layer_markers_flag(name).exists())
        {
            WhiteoutForm::Marker
        } else {
            WhiteoutForm::Overlay
        };
        Some(CachedImage {
            reference: image.clone(),
            layers: LayerSet::new(dirs).with_whiteouts(whiteouts),
            config: record.config,
        })
    }

    fn fetch_and_unpack(
        &self,
        image: &ImageRef,
        credentials: Option<&Credentials>,
    ) -> Result<ImageRecord, ImageError> {
        let fetched = self.fetcher.fetch(image, credentials)?;
        let mut names = Vec::with_capacity(fetched.layers.len());

        for layer in fetched.layers {
            let name = layer.digest.dir_name();
            if name.is_empty() {
                return Err(ImageError::InvalidLayer {
                    digest: layer.digest.to_string(),
                    reason: "empty digest".to_owned(),
                });
            }
            let dest = self.layout.layer_path(&name);
            if dest.is_dir() {
                debug!("layer {} already unpacked", layer.digest);
                names.push(name);
                continue;
            }

            let tmp = tempfile::Builder::new()
                .prefix(".unpack-")
                .tempdir_in(self.layout.layers_dir())?;
            let form =
                unpack_layer(layer.data, tmp.path()).map_err(|e| ImageError::InvalidLayer {
                    digest: layer.digest.to_string(),
                    reason: e.to_string(),
                })?;
            let flag = self.layout.layer_markers_flag(&name);
            match form {
                WhiteoutForm::Marker => {
                    debug!("layer {} keeps whiteout marker files", layer.digest);
                    fs::write(&flag, b"")?;
                }
                WhiteoutForm::Overlay => match fs::remove_file(&flag) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
            }
            fs::rename(tmp.path(), &dest)?;
            debug!("layer {} stored at {}", layer.digest, dest.display());
            names.push(name);
        }

        Ok(ImageRecord {
            reference: image.to_string(),
            layers: names,
            config: fetched.config,
        })
    }
}

impl ImageStore for LayerCache {
    fn pull(
        &self,
        image: &ImageRef,
        credentials: Option<&Credentials>,
    ) -> Result<CachedImage, ImageError> {
        let key = image_key(image);
        let slot = self.pulls.slot(&key)?;
        let _guard = slot
            .lock()
            .map_err(|e| ImageError::Lock(format!("pull mutex poisoned: {e}")))?;
        let lock_path = self.layout.pull_lock(&key);
        let _flock = match PullLock::try_acquire(&lock_path)? {
            Some(lock) => lock,
            None => {
                info!("waiting for another process pulling {image}");
                PullLock::acquire(&lock_path)?
            }
        };

        if let Some(cached) = self.lookup(image)? {
            debug!("image {image} already cached");
            return Ok(cached);
        }

        info!("pulling image {image}");
        let record = self.fetch_and_unpack(image, credentials)?;
        self.write_record(&key, &record)?;
        info!("pulled image {image} ({} layers)", record.layers.len());

        self.resolve(image, record).ok_or_else(|| {
            ImageError::fetch(image, "layer directory vanished right after unpacking")
        })
    }

    fn lookup(&self, image: &ImageRef) -> Result<Option<CachedImage>, ImageError> {
        let key = image_key(image);
        let Some(record) = self.read_record(&key)? else {
            return Ok(None);
        };
        if record.reference != image.as_str() {
            return Ok(None);
        }
        Ok(self.resolve(image, record))
    }
}
