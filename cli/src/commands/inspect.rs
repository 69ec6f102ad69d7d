//! `stevedore inspect` command: print stored image details as JSON.

use clap::Args;
use stevedore_runtime::Runtime;

#[derive(Args)]
pub struct InspectArgs {
    /// Image names or IDs
    #[arg(required = true)]
    pub images: Vec<String>,
}

pub async fn execute(
    runtime: &Runtime,
    args: InspectArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut details = Vec::with_capacity(args.images.len());
    for image in &args.images {
        details.push(runtime.inspect(image).await?);
    }
    println!("{}", serde_json::to_string_pretty(&details)?);
    Ok(())
}
