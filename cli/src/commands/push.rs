//! `stevedore push` command.

use clap::Args;
use stevedore_runtime::{ProgressWriter, PushOptions, Runtime};
use tokio_util::sync::CancellationToken;

use super::PlatformArgs;

#[derive(Args)]
pub struct PushArgs {
    /// Stored image name or ID
    pub source: String,

    /// Destination location (e.g., "dir:/tmp/img", "docker-archive:/tmp/img.tar")
    pub destination: String,

    #[command(flatten)]
    pub platform: PlatformArgs,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(
    runtime: &Runtime,
    ctx: &CancellationToken,
    args: PushArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = PushOptions {
        platform: args.platform.spec(),
        progress: if args.quiet {
            ProgressWriter::sink()
        } else {
            ProgressWriter::stderr()
        },
    };

    let result = runtime
        .push(ctx, &args.source, &args.destination, &options)
        .await?;
    if args.quiet {
        println!("{}", result.manifest_digest);
    } else {
        println!(
            "Pushed {} to {} ({})",
            args.source, result.destination, result.manifest_digest
        );
    }
    Ok(())
}
