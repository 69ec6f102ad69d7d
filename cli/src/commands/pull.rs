//! `stevedore pull` command.

use clap::Args;
use stevedore_runtime::{ProgressWriter, PullOptions, PullPolicy, Runtime};
use tokio_util::sync::CancellationToken;

use super::PlatformArgs;

#[derive(Args)]
pub struct PullArgs {
    /// Image location (e.g., "alpine", "docker://alpine:3.19", "quay.io/org/image:tag",
    /// "oci:/path:tag"). A short name with a tag needs the "docker://" prefix:
    /// "alpine:3.19" reads as transport "alpine".
    pub location: String,

    /// When to contact the source: always, missing, never, newer
    #[arg(long, default_value = "missing")]
    pub policy: PullPolicy,

    #[command(flatten)]
    pub platform: PlatformArgs,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(
    runtime: &Runtime,
    ctx: &CancellationToken,
    args: PullArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = PullOptions {
        platform: args.platform.spec(),
        progress: if args.quiet {
            ProgressWriter::sink()
        } else {
            ProgressWriter::stderr()
        },
    };

    let images = runtime
        .pull(ctx, &args.location, args.policy, &options)
        .await?;
    for image in images {
        println!("{}", image.id);
    }
    Ok(())
}
