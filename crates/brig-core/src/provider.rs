use crate::container::{OciContainer, Shared};
use crate::{Container, CoreError};
use brig_image::{DefaultFetcher, HostBusyboxFetcher, ImageFetcher, ImageStore, LayerCache, OciLayout};
use brig_runtime::{find_runtime, resolve_strategy, HostNetwork, NetworkSetup, OciRuntime};
use brig_schema::{ContainerId, ContainerInit, ProviderConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

static CONTAINER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Factory for containers sharing one build root, image cache, runtime and
/// network setup.
pub struct Provider {
    shared: Arc<Shared>,
}

impl Provider {
    /// Provider with the default image fetcher (host busybox provisioning) and
    /// host networking.
    pub fn new(config: ProviderConfig, build_root: &Path) -> Result<Self, CoreError> {
        let fetcher = DefaultFetcher::new().with_local(HostBusyboxFetcher::new());
        Self::with_fetcher(config, build_root, Arc::new(fetcher))
    }

    pub fn with_fetcher(
        config: ProviderConfig,
        build_root: &Path,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Result<Self, CoreError> {
        let images = LayerCache::new(OciLayout::new(build_root), fetcher)
            .map_err(|e| CoreError::Config(format!("build root {}: {e}", build_root.display())))?;
        Self::with_services(config, build_root, Arc::new(images), Arc::new(HostNetwork))
    }

    /// Bind `build_root` and the given services. Fails if the build root is not
    /// writable, no usable runtime binary exists, or the configured rootfs
    /// strategy cannot work on this host.
    pub fn with_services(
        config: ProviderConfig,
        build_root: &Path,
        images: Arc<dyn ImageStore>,
        network: Arc<dyn NetworkSetup>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        ensure_writable(build_root)?;

        let layout = OciLayout::new(build_root);
        layout
            .initialize()
            .map_err(|e| CoreError::Config(format!("{}: {e}", layout.root().display())))?;
        fs::create_dir_all(&config.runtime_root).map_err(|e| {
            CoreError::Config(format!(
                "runtime root {}: {e}",
                config.runtime_root.display()
            ))
        })?;

        let binary = find_runtime(config.runtime.as_deref())?;
        let mount_kind = resolve_strategy(config.rootfs)?;
        info!(
            "provider ready: runtime {}, rootfs {:?}, build root {}",
            binary.display(),
            mount_kind,
            build_root.display()
        );

        let runtime = OciRuntime::new(binary, config.runtime_root.clone());
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                layout,
                images,
                network,
                runtime,
                mount_kind,
            }),
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.shared.config
    }

    pub fn layout(&self) -> &OciLayout {
        &self.shared.layout
    }

    /// A new container for `init`. Nothing is mounted or started yet.
    pub fn new_container(&self, init: ContainerInit) -> Result<Box<dyn Container>, CoreError> {
        if init.image.trim().is_empty() {
            return Err(CoreError::Config("container image must not be empty".to_owned()));
        }
        let id = new_container_id();
        let network = init.network.unwrap_or(self.shared.config.network);
        debug!("new container {id} for {}", init.image);
        Ok(Box::new(OciContainer::new(
            id,
            init.image,
            network,
            Arc::clone(&self.shared),
        )))
    }
}

fn ensure_writable(build_root: &Path) -> Result<(), CoreError> {
    let unusable = |e: std::io::Error| {
        CoreError::Config(format!(
            "build root {} is not writable: {e}",
            build_root.display()
        ))
    };
    fs::create_dir_all(build_root).map_err(unusable)?;
    let marker: PathBuf = build_root.join(format!(".brig-write-check-{}", std::process::id()));
    fs::write(&marker, b"").map_err(unusable)?;
    fs::remove_file(&marker).map_err(unusable)?;
    Ok(())
}

/// 16 hex chars, unique per instantiation within and across processes.
fn new_container_id() -> ContainerId {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = CONTAINER_SEQ.fetch_add(1, Ordering::Relaxed);
    let seed = format!("{}:{nanos}:{seq}", std::process::id());
    let hash = blake3::hash(seed.as_bytes()).to_hex();
    ContainerId::new(&hash[..16])
}
