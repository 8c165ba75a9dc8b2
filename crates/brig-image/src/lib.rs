//! Image layer cache for brig.
//!
//! `LayerCache` turns an image reference into an ordered set of unpacked,
//! read-only layer directories under `<build_root>/executor/oci/layers`. The
//! bytes themselves come from an `ImageFetcher`; the cache only unpacks them,
//! records the result in `images/<key>.json` and serializes concurrent pulls of
//! the same reference so that a layer is fetched once.

pub mod cache;
pub mod fetch;
pub mod layers;
pub mod layout;
pub mod lock;

pub use cache::LayerCache;
pub use fetch::{find_in_path, DefaultFetcher, HostBusyboxFetcher, BUSYBOX_IMAGE_REF};
pub use layers::{
    is_opaque_dir, is_whiteout, unpack_layer, LayerBuilder, LayerSet, WhiteoutForm, OPAQUE_WHITEOUT,
    WHITEOUT_PREFIX,
};
pub use layout::{overlay_dir_for, OciLayout};
pub use lock::{KeyedMutex, PullLock};

use brig_schema::{Credentials, ImageRef, LayerDigest};
use serde::{Deserialize, Serialize};
use std::io::Read;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to fetch '{reference}': {reason}")]
    Fetch { reference: String, reason: String },
    #[error("no fetcher available for '{0}'")]
    NoFetcher(String),
    #[error("lock acquisition failed: {0}")]
    Lock(String),
    #[error("invalid layer {digest}: {reason}")]
    InvalidLayer { digest: String, reason: String },
}

impl ImageError {
    pub fn fetch(reference: &ImageRef, reason: impl Into<String>) -> Self {
        Self::Fetch {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }
}

/// Runtime defaults recorded from the image at pull time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageConfig {
    /// `NAME=value` entries, in image order.
    #[serde(default)]
    pub env: Vec<String>,
}

/// A fully unpacked image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    pub reference: ImageRef,
    pub layers: LayerSet,
    pub config: ImageConfig,
}

/// One uncompressed layer tarball as delivered by a fetcher.
pub struct FetchedLayer {
    pub digest: LayerDigest,
    pub data: Box<dyn Read + Send>,
}

impl std::fmt::Debug for FetchedLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedLayer")
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

/// Image content as delivered by a fetcher, layers lowest priority first.
#[derive(Debug)]
pub struct FetchedImage {
    pub config: ImageConfig,
    pub layers: Vec<FetchedLayer>,
}

/// Source of image bytes: registry client, local tarball, host binaries.
pub trait ImageFetcher: Send + Sync {
    fn fetch(
        &self,
        image: &ImageRef,
        credentials: Option<&Credentials>,
    ) -> Result<FetchedImage, ImageError>;
}

/// Resolves image references to local layer sets.
pub trait ImageStore: Send + Sync {
    /// Make `image` available locally. A no-op for an already cached image.
    fn pull(
        &self,
        image: &ImageRef,
        credentials: Option<&Credentials>,
    ) -> Result<CachedImage, ImageError>;

    /// The cached image, if every one of its layers is present.
    fn lookup(&self, image: &ImageRef) -> Result<Option<CachedImage>, ImageError>;

    fn is_cached(&self, image: &ImageRef) -> bool {
        matches!(self.lookup(image), Ok(Some(_)))
    }
}

/// File-name key of an image record: first 32 hex chars of blake3(reference).
pub fn image_key(image: &ImageRef) -> String {
    let hash = blake3::hash(image.as_str().as_bytes()).to_hex();
    hash[..32].to_owned()
}
