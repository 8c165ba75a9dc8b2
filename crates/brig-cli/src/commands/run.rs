use super::{exit_status, parse_env};
use brig_core::{Context, CoreError, ExecStdio, Provider};
use brig_schema::{Command, ContainerInit, ImageRef, NetworkMode, ProviderConfig};
use std::path::Path;
use tracing::{info, warn};

pub struct RunArgs<'a> {
    pub image: &'a str,
    pub network: Option<NetworkMode>,
    pub env: &'a [String],
    pub workdir: Option<&'a Path>,
    pub command: &'a [String],
}

/// Pull if needed, create, exec with output streamed to the terminal, remove.
/// Returns the command's exit code.
pub async fn run(
    ctx: &Context,
    config: ProviderConfig,
    build_root: &Path,
    args: RunArgs<'_>,
) -> Result<u8, CoreError> {
    let image = ImageRef::parse(args.image)?;
    let mut init = ContainerInit::new(image);
    if let Some(mode) = args.network {
        init = init.with_network(mode);
    }
    let mut command = Command::new(args.command.iter().cloned());
    for arg in args.env {
        command.env.push(parse_env(arg)?);
    }

    let provider = Provider::new(config, build_root)?;

    // Held until the container is gone so the scratch directory outlives it.
    let scratch;
    let workdir = match args.workdir {
        Some(dir) => dir.to_path_buf(),
        None => {
            let work_root = build_root.join("work");
            std::fs::create_dir_all(&work_root)?;
            scratch = tempfile::Builder::new()
                .prefix("run-")
                .tempdir_in(&work_root)?;
            scratch.path().to_path_buf()
        }
    };

    let container = provider.new_container(init)?;
    if !container.is_image_cached(ctx).await? {
        container.pull_image(ctx, None).await?;
    }

    let outcome = match container.create(ctx, &workdir).await {
        Ok(()) => {
            let stdio = ExecStdio {
                stdin: None,
                stdout: Some(Box::new(tokio::io::stdout())),
                stderr: Some(Box::new(tokio::io::stderr())),
            };
            container.exec(ctx, &command, stdio).await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = container.remove(ctx).await {
        warn!("removing container {}: {e}", container.id());
    }

    let result = outcome?;
    if let Some(usage) = result.usage_stats {
        info!(
            "usage: peak memory {} bytes, cpu {} ns",
            usage.peak_memory_bytes, usage.cpu_nanos
        );
    }
    Ok(exit_status(result.exit_code))
}
