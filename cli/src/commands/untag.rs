//! `stevedore untag` command.

use clap::Args;
use stevedore_runtime::Runtime;

#[derive(Args)]
pub struct UntagArgs {
    /// Stored image name or ID
    pub image: String,

    /// Name to remove
    pub name: String,
}

pub async fn execute(runtime: &Runtime, args: UntagArgs) -> Result<(), Box<dyn std::error::Error>> {
    let image = runtime.untag_image(&args.image, &args.name).await?;
    if image.names.is_empty() {
        tracing::info!(id = %image.id, "Image has no names left");
    }
    println!("{}", image.id);
    Ok(())
}
