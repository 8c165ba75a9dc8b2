mod commands;

use brig_core::{install_signal_handler, shutdown_requested, Context, CoreError};
use brig_image::BUSYBOX_IMAGE_REF;
use brig_schema::NetworkMode;
use clap::{Parser, Subcommand, ValueEnum};
use commands::{EXIT_CANCELLED, EXIT_FAILURE};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "brig",
    version,
    about = "Run commands in throwaway OCI containers"
)]
struct Cli {
    /// Provider configuration file (TOML). Built-in defaults when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the image cache and container bundles.
    #[arg(long, default_value = "~/.cache/brig", global = true)]
    build_root: String,

    /// Enable info-level logging.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable debug-level logging (runtime invocations included).
    #[arg(long, default_value_t = false, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Network mode accepted by `--network`.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum NetworkArg {
    /// Namespace with external connectivity
    Enabled,
    /// Fresh namespace with loopback only
    Off,
}

impl From<NetworkArg> for NetworkMode {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Enabled => NetworkMode::Enabled,
            NetworkArg::Off => NetworkMode::Off,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one command in a fresh container, then remove it.
    Run {
        /// Image reference.
        #[arg(long, default_value = BUSYBOX_IMAGE_REF)]
        image: String,
        /// Network mode. Defaults to the configured mode.
        #[arg(long, value_enum)]
        network: Option<NetworkArg>,
        /// Extra environment variable, NAME=value. Repeatable.
        #[arg(long = "env", value_name = "NAME=VALUE")]
        env: Vec<String>,
        /// Host directory mounted as the working directory. A scratch
        /// directory under the build root is used when omitted.
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Command and arguments (after --).
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },
    /// Pull an image into the local cache.
    Pull {
        /// Image reference.
        #[arg(long, default_value = BUSYBOX_IMAGE_REF)]
        image: String,
    },
    /// Check host prerequisites: runtime binary, mount privilege, cgroup v2.
    Doctor,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("BRIG_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let ctx = Context::background();
    install_signal_handler(&ctx);

    let config = match commands::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    let build_root = expand_tilde(&cli.build_root);

    let result = match cli.command {
        Commands::Run {
            image,
            network,
            env,
            workdir,
            command,
        } => {
            commands::run::run(
                &ctx,
                config,
                &build_root,
                commands::run::RunArgs {
                    image: &image,
                    network: network.map(NetworkMode::from),
                    env: &env,
                    workdir: workdir.as_deref(),
                    command: &command,
                },
            )
            .await
        }
        Commands::Pull { image } => commands::pull::run(&ctx, config, &build_root, &image).await,
        Commands::Doctor => Ok(commands::doctor::run(&config, &build_root)),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e}");
            // An interrupt can also surface as a runtime failure of the
            // killed child.
            ExitCode::from(match e {
                CoreError::Cancelled => EXIT_CANCELLED,
                _ if shutdown_requested() => EXIT_CANCELLED,
                _ => EXIT_FAILURE,
            })
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
