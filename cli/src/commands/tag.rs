//! `stevedore tag` command: add a name to a stored image.

use clap::Args;
use stevedore_runtime::Runtime;

#[derive(Args)]
pub struct TagArgs {
    /// Stored image name or ID
    pub image: String,

    /// New name
    pub name: String,
}

pub async fn execute(runtime: &Runtime, args: TagArgs) -> Result<(), Box<dyn std::error::Error>> {
    let image = runtime.tag_image(&args.image, &args.name).await?;
    println!("{}", image.id);
    Ok(())
}
