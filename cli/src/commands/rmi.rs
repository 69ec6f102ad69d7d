//! `stevedore rmi` command: remove one or more stored images.

use clap::Args;
use stevedore_runtime::{RemoveOptions, Runtime};
use tokio_util::sync::CancellationToken;

#[derive(Args)]
pub struct RmiArgs {
    /// Image names or IDs to remove
    pub images: Vec<String>,

    /// Remove every image matching the filters
    #[arg(short, long)]
    pub all: bool,

    /// Remove images other images depend on, and delete multi-named images outright
    #[arg(short, long)]
    pub force: bool,

    /// Filter images when used with --all
    #[arg(long = "filter")]
    pub filters: Vec<String>,

    /// Do not fail on unknown images
    #[arg(short, long)]
    pub ignore: bool,
}

pub async fn execute(
    runtime: &Runtime,
    ctx: &CancellationToken,
    args: RmiArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    if args.images.is_empty() && !args.all {
        return Err("rmi requires at least one image, or --all".into());
    }
    if !args.images.is_empty() && args.all {
        return Err("--all cannot be combined with image arguments".into());
    }

    let options = RemoveOptions {
        force: args.force,
        filters: args.filters,
        ignore_unknown: args.ignore,
    };
    let targets = (!args.all).then_some(args.images.as_slice());
    let (reports, batch_errors) = runtime.remove_images(ctx, targets, &options).await;

    let mut errors: Vec<String> = batch_errors.iter().map(|e| e.to_string()).collect();
    for report in &reports {
        for name in &report.untagged {
            println!("Untagged: {name}");
        }
        if report.removed {
            println!("Deleted: {}", report.id);
        }
        if let Some(ref e) = report.error {
            errors.push(format!("{}: {e}", report.id));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        let msg = errors.join("\n");
        Err(format!("Failed to remove image(s):\n{msg}").into())
    }
}
