//! `stevedore images` command.

use clap::Args;
use stevedore_runtime::reference::NamedReference;
use stevedore_runtime::{ListEntry, ListOptions, Runtime};
use tokio_util::sync::CancellationToken;

use crate::output;

#[derive(Args)]
pub struct ImagesArgs {
    /// Restrict the listing to these names or IDs
    pub names: Vec<String>,

    /// Only show image IDs
    #[arg(short, long)]
    pub quiet: bool,

    /// Compute derived data (dangling status, children)
    #[arg(short = 'a', long)]
    pub all_data: bool,

    /// Filter output (dangling=, reference=, id=, label=, before=, since=)
    #[arg(short, long = "filter")]
    pub filters: Vec<String>,
}

pub async fn execute(
    runtime: &Runtime,
    ctx: &CancellationToken,
    args: ImagesArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = ListOptions {
        set_list_data: args.all_data,
        filters: args.filters,
    };
    let names = (!args.names.is_empty()).then_some(args.names.as_slice());
    let entries = runtime.list_images(ctx, names, &options).await?;

    if args.quiet {
        for entry in &entries {
            println!("{}", entry.image.id);
        }
        return Ok(());
    }

    let mut headers = vec!["REPOSITORY", "TAG", "IMAGE ID", "PLATFORM", "CREATED", "SIZE"];
    if args.all_data {
        headers.push("DANGLING");
    }
    let mut table = output::new_table(&headers);
    for entry in &entries {
        for row in rows(entry, args.all_data) {
            table.add_row(row);
        }
    }
    println!("{table}");
    Ok(())
}

/// One row per name; unnamed images get a single `<none>` row.
fn rows(entry: &ListEntry, all_data: bool) -> Vec<Vec<String>> {
    let image = &entry.image;
    let created = image
        .created_at
        .as_ref()
        .map(output::format_ago)
        .unwrap_or_else(|| "<unknown>".to_string());
    let common = [
        image.short_id().to_string(),
        image.platform.to_string(),
        created,
        output::format_bytes(image.size_bytes),
    ];

    let mut names: Vec<(String, String)> = image
        .names
        .iter()
        .map(|name| match NamedReference::parse(name) {
            Ok(r) => (
                r.repository_name(),
                r.tag.unwrap_or_else(|| "<none>".to_string()),
            ),
            Err(_) => (name.clone(), "<none>".to_string()),
        })
        .collect();
    if names.is_empty() {
        names.push(("<none>".to_string(), "<none>".to_string()));
    }

    names
        .into_iter()
        .map(|(repository, tag)| {
            let mut row = vec![repository, tag];
            row.extend(common.iter().cloned());
            if all_data {
                row.push(
                    entry
                        .list_data
                        .is_dangling
                        .map(|d| d.to_string())
                        .unwrap_or_default(),
                );
            }
            row
        })
        .collect()
}
