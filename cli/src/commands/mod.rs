//! CLI command definitions and dispatch.

mod images;
mod inspect;
mod pull;
mod push;
mod rmi;
mod tag;
mod untag;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use stevedore_core::config::{LogLevel, RuntimeConfig};
use stevedore_runtime::{PlatformSpec, Runtime};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "stevedore", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Image store directory (default: ~/.stevedore/images)
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// YAML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level: debug, info, warn, error (overrides RUST_LOG)
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Pull an image into the local store
    Pull(pull::PullArgs),
    /// Push a stored image to a transport
    Push(push::PushArgs),
    /// List stored images
    Images(images::ImagesArgs),
    /// Remove stored images
    Rmi(rmi::RmiArgs),
    /// Add a name to a stored image
    Tag(tag::TagArgs),
    /// Remove a name from a stored image
    Untag(untag::UntagArgs),
    /// Show details of stored images
    Inspect(inspect::InspectArgs),
}

/// Platform selection flags for pull and push.
#[derive(Args, Debug, Clone, Default)]
pub struct PlatformArgs {
    /// Operating system to select (default: host)
    #[arg(long)]
    pub os: Option<String>,

    /// Architecture to select (default: host)
    #[arg(long)]
    pub arch: Option<String>,

    /// Architecture variant to select
    #[arg(long)]
    pub variant: Option<String>,
}

impl PlatformArgs {
    pub fn spec(&self) -> PlatformSpec {
        PlatformSpec::new(
            self.os.as_deref(),
            self.arch.as_deref(),
            self.variant.as_deref(),
        )
    }
}

/// Build the runtime from the config file and global flags.
pub(crate) fn open_runtime(global: &GlobalArgs) -> Result<Runtime, Box<dyn std::error::Error>> {
    let mut config = match global.config {
        Some(ref path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(ref store) = global.store {
        config.store_dir = store.clone();
    }
    if let Some(level) = global.log_level {
        config.log_level = level;
    }
    Ok(Runtime::new(config)?)
}

/// Tracing directive from `--log-level`, else the config file's `log_level`.
///
/// `main` prefers `RUST_LOG` over this when no flag is given.
pub fn log_directive(global: &GlobalArgs) -> String {
    let level = global.log_level.unwrap_or_else(|| {
        global
            .config
            .as_deref()
            .and_then(|path| RuntimeConfig::load(path).ok())
            .unwrap_or_default()
            .log_level
    });
    tracing::Level::from(level).to_string().to_lowercase()
}

/// Token canceled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, canceling");
            child.cancel();
        }
    });
    token
}

pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = open_runtime(&cli.global)?;
    let ctx = interrupt_token();
    match cli.command {
        Command::Pull(args) => pull::execute(&runtime, &ctx, args).await,
        Command::Push(args) => push::execute(&runtime, &ctx, args).await,
        Command::Images(args) => images::execute(&runtime, &ctx, args).await,
        Command::Rmi(args) => rmi::execute(&runtime, &ctx, args).await,
        Command::Tag(args) => tag::execute(&runtime, args).await,
        Command::Untag(args) => untag::execute(&runtime, args).await,
        Command::Inspect(args) => inspect::execute(&runtime, args).await,
    }
}
