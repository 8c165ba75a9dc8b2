use crate::CoreError;
use async_trait::async_trait;
use brig_image::{overlay_dir_for, CachedImage, ImageStore, OciLayout};
use brig_runtime::bundle::{self, BundleOptions};
use brig_runtime::{
    CgroupReader, Context, ExecStdio, MountKind, NetworkSetup, OciRuntime, OverlayMount,
    RuntimeError, UsageSampler,
};
use brig_schema::{
    validate_transition, Command, CommandResult, ContainerId, ContainerState, Credentials,
    ImageRef, InvalidTransition, NetworkMode, ProviderConfig, UsageStats,
};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Upper bound for a whole teardown, independent of the caller's context.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_WAIT: Duration = Duration::from_secs(2);
const STOP_POLL: Duration = Duration::from_millis(50);

/// Services every container of one provider shares.
pub(crate) struct Shared {
    pub(crate) config: ProviderConfig,
    pub(crate) layout: OciLayout,
    pub(crate) images: Arc<dyn ImageStore>,
    pub(crate) network: Arc<dyn NetworkSetup>,
    pub(crate) runtime: OciRuntime,
    pub(crate) mount_kind: MountKind,
}

/// A container as clients see it.
///
/// Create, Pause, Unpause and Remove are serialized per container. Exec only
/// takes the lifecycle lock while it validates state, so several execs may run
/// at once and Stats never waits on one.
#[async_trait]
pub trait Container: Send + Sync {
    fn id(&self) -> &ContainerId;

    fn image(&self) -> &ImageRef;

    async fn state(&self) -> ContainerState;

    /// Host resources of the created container, if any.
    async fn handle(&self) -> Option<ContainerHandle>;

    async fn pull_image(
        &self,
        ctx: &Context,
        credentials: Option<&Credentials>,
    ) -> Result<(), CoreError>;

    async fn is_image_cached(&self, ctx: &Context) -> Result<bool, CoreError>;

    /// Build the rootfs over `workdir`, write the bundle and start the idle
    /// init process. Nothing survives a failure.
    async fn create(&self, ctx: &Context, workdir: &Path) -> Result<(), CoreError>;

    /// Pull if needed, create, then exec `command` once. The caller removes
    /// the container afterwards.
    async fn run(
        &self,
        ctx: &Context,
        command: &Command,
        workdir: &Path,
        credentials: Option<&Credentials>,
    ) -> Result<CommandResult, CoreError>;

    /// Run `command` inside the created container. A non-zero exit is `Ok`.
    async fn exec(
        &self,
        ctx: &Context,
        command: &Command,
        stdio: ExecStdio,
    ) -> Result<CommandResult, CoreError>;

    async fn pause(&self, ctx: &Context) -> Result<(), CoreError>;

    async fn unpause(&self, ctx: &Context) -> Result<(), CoreError>;

    /// Current usage, or the last known good snapshot when the accounting
    /// files are gone. `NotFound` once removed.
    async fn stats(&self, ctx: &Context) -> Result<UsageStats, CoreError>;

    /// Tear everything down. A second call returns `NotFound`.
    async fn remove(&self, ctx: &Context) -> Result<(), CoreError>;
}

/// What exists on the host for a created container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: ContainerId,
    pub bundle_path: PathBuf,
    pub overlay: OverlayMount,
    pub runtime_root: PathBuf,
    pub pid: Option<i32>,
}

struct Lifecycle {
    state: ContainerState,
    handle: Option<ContainerHandle>,
    options: Option<BundleOptions>,
    exec_seq: u64,
}

#[derive(Default)]
struct Telemetry {
    last: Option<UsageStats>,
    removed: bool,
}

#[derive(Default)]
struct TeardownErrors {
    first: Option<String>,
}

impl TeardownErrors {
    fn record(&mut self, id: &ContainerId, step: &str, err: impl Display) {
        warn!("teardown of {id}: {step}: {err}");
        if self.first.is_none() {
            self.first = Some(format!("{step}: {err}"));
        }
    }

    fn finish(self) -> Result<(), CoreError> {
        match self.first {
            Some(msg) => Err(CoreError::Teardown(msg)),
            None => Ok(()),
        }
    }
}

/// [`Container`] backed by an external OCI runtime.
pub struct OciContainer {
    id: ContainerId,
    image: ImageRef,
    network: NetworkMode,
    shared: Arc<Shared>,
    cgroup: CgroupReader,
    lifecycle: AsyncMutex<Lifecycle>,
    telemetry: Mutex<Telemetry>,
}

impl OciContainer {
    pub(crate) fn new(
        id: ContainerId,
        image: ImageRef,
        network: NetworkMode,
        shared: Arc<Shared>,
    ) -> Self {
        let cgroup = CgroupReader::new(
            &shared.config.cgroup_root,
            &shared.config.cgroup_parent,
            &id,
        );
        Self {
            id,
            image,
            network,
            shared,
            cgroup,
            lifecycle: AsyncMutex::new(Lifecycle {
                state: ContainerState::Uncreated,
                handle: None,
                options: None,
                exec_seq: 0,
            }),
            telemetry: Mutex::new(Telemetry::default()),
        }
    }

    fn telemetry(&self) -> MutexGuard<'_, Telemetry> {
        self.telemetry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_stats(&self, stats: UsageStats) -> UsageStats {
        let mut telemetry = self.telemetry();
        let merged = match telemetry.last {
            Some(prev) => prev.merge(stats),
            None => stats,
        };
        telemetry.last = Some(merged);
        merged
    }

    fn cgroup_path(&self) -> String {
        format!(
            "/{}/{}",
            self.shared.config.cgroup_parent.trim_matches('/'),
            self.id
        )
    }

    async fn lookup_image(&self, ctx: &Context) -> Result<Option<CachedImage>, CoreError> {
        let images = Arc::clone(&self.shared.images);
        let image = self.image.clone();
        let found = ctx
            .run(tokio::task::spawn_blocking(move || images.lookup(&image)))
            .await???;
        Ok(found)
    }

    async fn pull(
        &self,
        ctx: &Context,
        credentials: Option<&Credentials>,
    ) -> Result<CachedImage, CoreError> {
        info!("pulling {}", self.image);
        let images = Arc::clone(&self.shared.images);
        let image = self.image.clone();
        let credentials = credentials.cloned();
        let cached = ctx
            .run(tokio::task::spawn_blocking(move || {
                images.pull(&image, credentials.as_ref())
            }))
            .await???;
        info!("{} ready ({} layers)", self.image, cached.layers.len());
        Ok(cached)
    }

    async fn create_locked(
        &self,
        ctx: &Context,
        lifecycle: &mut Lifecycle,
        workdir: &Path,
    ) -> Result<(), CoreError> {
        validate_transition(lifecycle.state, ContainerState::Created)?;
        if !workdir.is_dir() {
            return Err(CoreError::Create(format!(
                "working directory {} does not exist",
                workdir.display()
            )));
        }
        let workdir = workdir.canonicalize().map_err(|e| {
            CoreError::Create(format!("working directory {}: {e}", workdir.display()))
        })?;

        let image = match self.lookup_image(ctx).await? {
            Some(image) => image,
            None => self.pull(ctx, None).await?,
        };

        // Not wrapped in the context: a build abandoned halfway would leak a
        // mount. Cancellation is observed right after.
        let layers = image.layers.clone();
        let overlay_dir = overlay_dir_for(&workdir);
        let kind = self.shared.mount_kind;
        let overlay = tokio::task::spawn_blocking(move || {
            OverlayMount::build(&layers, &overlay_dir, kind)
        })
        .await
        .map_err(CoreError::create)?
        .map_err(CoreError::create)?;

        let handle = ContainerHandle {
            id: self.id.clone(),
            bundle_path: self.shared.layout.bundle_path(&self.id),
            overlay,
            runtime_root: self.shared.runtime.root().to_path_buf(),
            pid: None,
        };

        match self.provision(ctx, &handle, &image, &workdir).await {
            Ok((options, pid)) => {
                lifecycle.state = ContainerState::Created;
                lifecycle.handle = Some(ContainerHandle { pid, ..handle });
                lifecycle.options = Some(options);
                info!("container {} created from {}", self.id, self.image);
                Ok(())
            }
            Err(e) => {
                warn!("create of {} failed, cleaning up: {e}", self.id);
                if let Err(cleanup) = self.teardown(&handle).await {
                    warn!("cleanup after failed create of {}: {cleanup}", self.id);
                }
                Err(e)
            }
        }
    }

    /// Network, bundle, runtime create and start. The caller tears down on
    /// failure.
    async fn provision(
        &self,
        ctx: &Context,
        handle: &ContainerHandle,
        image: &CachedImage,
        workdir: &Path,
    ) -> Result<(BundleOptions, Option<i32>), CoreError> {
        ctx.check()?;
        let config = &self.shared.config;
        let netns = self
            .shared
            .network
            .enable(&self.id, self.network)
            .await
            .map_err(CoreError::create)?;

        let options = BundleOptions {
            rootfs: handle.overlay.merged_dir.clone(),
            workdir: workdir.to_path_buf(),
            exec_root: config.exec_root.clone(),
            extra_path: config.extra_path.clone(),
            image_env: image.config.env.clone(),
            network: self.network,
            netns,
            cgroup_path: self.cgroup_path(),
            resources: config.resources.clone(),
        };
        let spec = options.spec(&handle.bundle_path, &config.init_command);
        bundle::write_bundle(&handle.bundle_path, &spec).map_err(CoreError::create)?;

        let runtime = &self.shared.runtime;
        runtime
            .create(ctx, &self.id, &handle.bundle_path)
            .await
            .map_err(CoreError::create)?;
        runtime
            .start(ctx, &self.id)
            .await
            .map_err(CoreError::create)?;

        let pid = match runtime.state(ctx, &self.id).await {
            Ok(state) => state.pid,
            Err(e) => {
                debug!("state of {} after start: {e}", self.id);
                None
            }
        };
        Ok((options, pid))
    }

    async fn wait_stopped(&self, ctx: &Context) {
        let deadline = tokio::time::Instant::now() + STOP_WAIT;
        loop {
            match self.shared.runtime.state(ctx, &self.id).await {
                Ok(state) if state.status != "stopped" && tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(STOP_POLL).await;
                }
                _ => return,
            }
        }
    }

    /// Best-effort teardown in reverse creation order. Every step runs; the
    /// first failure is reported.
    async fn teardown(&self, handle: &ContainerHandle) -> Result<(), CoreError> {
        let ctx = Context::background().with_timeout(TEARDOWN_TIMEOUT);
        let runtime = &self.shared.runtime;
        let mut errors = TeardownErrors::default();

        if let Err(e) = runtime.kill(&ctx, &self.id, "KILL", true).await {
            errors.record(&self.id, "kill", e);
        }
        self.wait_stopped(&ctx).await;
        match runtime.delete(&ctx, &self.id, true).await {
            Ok(()) | Err(RuntimeError::ContainerNotFound(_)) => {}
            Err(e) => errors.record(&self.id, "delete", e),
        }
        if let Err(e) = self.shared.network.disable(&self.id).await {
            errors.record(&self.id, "network", e);
        }

        let overlay = handle.overlay.clone();
        match tokio::task::spawn_blocking(move || overlay.unmount()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.record(&self.id, "rootfs", e),
            Err(e) => errors.record(&self.id, "rootfs", e),
        }

        match std::fs::remove_dir_all(&handle.bundle_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => errors.record(&self.id, "bundle", e),
        }

        errors.finish()
    }

    /// A cancelled Create/Exec leaves nothing running: tear down and go back
    /// to `Uncreated` so that the caller's own Remove still succeeds.
    async fn abort_after_cancel(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(handle) = lifecycle.handle.take() {
            warn!("container {} cancelled, tearing down", self.id);
            if let Err(e) = self.teardown(&handle).await {
                warn!("teardown after cancel of {}: {e}", self.id);
            }
            if validate_transition(lifecycle.state, ContainerState::Uncreated).is_ok() {
                lifecycle.state = ContainerState::Uncreated;
            }
            lifecycle.options = None;
        }
    }
}

#[async_trait]
impl Container for OciContainer {
    fn id(&self) -> &ContainerId {
        &self.id
    }

    fn image(&self) -> &ImageRef {
        &self.image
    }

    async fn state(&self) -> ContainerState {
        self.lifecycle.lock().await.state
    }

    async fn handle(&self) -> Option<ContainerHandle> {
        self.lifecycle.lock().await.handle.clone()
    }

    async fn pull_image(
        &self,
        ctx: &Context,
        credentials: Option<&Credentials>,
    ) -> Result<(), CoreError> {
        self.pull(ctx, credentials).await.map(|_| ())
    }

    async fn is_image_cached(&self, ctx: &Context) -> Result<bool, CoreError> {
        Ok(self.lookup_image(ctx).await?.is_some())
    }

    async fn create(&self, ctx: &Context, workdir: &Path) -> Result<(), CoreError> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.create_locked(ctx, &mut lifecycle, workdir).await
    }

    async fn run(
        &self,
        ctx: &Context,
        command: &Command,
        workdir: &Path,
        credentials: Option<&Credentials>,
    ) -> Result<CommandResult, CoreError> {
        if !self.is_image_cached(ctx).await? {
            self.pull_image(ctx, credentials).await?;
        }
        self.create(ctx, workdir).await?;
        self.exec(ctx, command, ExecStdio::default()).await
    }

    async fn exec(
        &self,
        ctx: &Context,
        command: &Command,
        stdio: ExecStdio,
    ) -> Result<CommandResult, CoreError> {
        if command.arguments.is_empty() {
            return Err(CoreError::Exec("command has no arguments".to_owned()));
        }

        let (process_path, process) = {
            let mut lifecycle = self.lifecycle.lock().await;
            if !lifecycle.state.accepts_exec() {
                return Err(InvalidTransition {
                    from: lifecycle.state,
                    to: ContainerState::Running,
                }
                .into());
            }
            validate_transition(lifecycle.state, ContainerState::Running)?;
            lifecycle.exec_seq += 1;
            let seq = lifecycle.exec_seq;
            let (Some(handle), Some(options)) = (&lifecycle.handle, &lifecycle.options) else {
                return Err(CoreError::Exec(format!("container {} has no bundle", self.id)));
            };
            let path = handle.bundle_path.join(format!("exec-{seq}.json"));
            let process = options.process(&command.arguments, &command.env);
            lifecycle.state = ContainerState::Running;
            (path, process)
        };

        bundle::write_process(&process_path, &process).map_err(CoreError::exec)?;
        debug!("exec in {}: {:?}", self.id, command.arguments);

        let seed = self.telemetry().last;
        let sampler = UsageSampler::spawn(
            self.cgroup.clone(),
            self.shared.config.stats_poll_interval(),
            seed,
        );
        let output = self
            .shared
            .runtime
            .exec(ctx, &self.id, &process_path, stdio)
            .await;
        let usage = sampler.stop().await.map(|u| self.record_stats(u));

        if let Err(e) = std::fs::remove_file(&process_path) {
            debug!("removing {}: {e}", process_path.display());
        }

        match output {
            Ok(out) => Ok(CommandResult {
                stdout: out.stdout,
                stderr: out.stderr,
                exit_code: out.exit_code,
                usage_stats: usage,
            }),
            Err(RuntimeError::Cancelled(_)) => {
                self.abort_after_cancel().await;
                Err(CoreError::Cancelled)
            }
            Err(e) => Err(CoreError::exec(e)),
        }
    }

    async fn pause(&self, ctx: &Context) -> Result<(), CoreError> {
        let mut lifecycle = self.lifecycle.lock().await;
        validate_transition(lifecycle.state, ContainerState::Paused)?;
        self.shared.runtime.pause(ctx, &self.id).await?;
        lifecycle.state = ContainerState::Paused;
        info!("container {} paused", self.id);
        Ok(())
    }

    async fn unpause(&self, ctx: &Context) -> Result<(), CoreError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state != ContainerState::Paused {
            return Err(InvalidTransition {
                from: lifecycle.state,
                to: ContainerState::Running,
            }
            .into());
        }
        self.shared.runtime.resume(ctx, &self.id).await?;
        lifecycle.state = ContainerState::Running;
        info!("container {} resumed", self.id);
        Ok(())
    }

    async fn stats(&self, _ctx: &Context) -> Result<UsageStats, CoreError> {
        if self.telemetry().removed {
            return Err(CoreError::NotFound(self.id.to_string()));
        }
        match self.cgroup.read() {
            Ok(stats) => Ok(self.record_stats(stats)),
            Err(e) => {
                let last = self.telemetry().last;
                last.ok_or(CoreError::Runtime(e))
            }
        }
    }

    /// Teardown runs under its own deadline, so a cancelled caller context
    /// cannot leave mounts or cgroups behind.
    async fn remove(&self, _ctx: &Context) -> Result<(), CoreError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == ContainerState::Removed {
            return Err(CoreError::NotFound(self.id.to_string()));
        }
        validate_transition(lifecycle.state, ContainerState::Removed)?;

        let result = match lifecycle.handle.take() {
            Some(handle) => self.teardown(&handle).await,
            None => Ok(()),
        };
        lifecycle.state = ContainerState::Removed;
        lifecycle.options = None;
        self.telemetry().removed = true;
        info!("container {} removed", self.id);
        result
    }
}
