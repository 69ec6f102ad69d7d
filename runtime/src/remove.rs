//! Batch image removal.
//!
//! Each target is removed on its own: a failure is recorded in that target's
//! report and processing moves on. Errors that concern the batch as a whole
//! (bad filters, unresolvable names, cancellation) are returned separately.

use std::collections::HashSet;

use stevedore_core::error::{ImageError, Result};
use tokio_util::sync::CancellationToken;

use crate::catalog::{self, ListOptions};
use crate::reference;
use crate::store::{find_image, ImageStore, StoredImage};

/// Outcome for one targeted image.
#[derive(Debug)]
pub struct RemovalReport {
    /// Image ID
    pub id: String,
    /// Whether the image was deleted from the store
    pub removed: bool,
    /// Names detached from the image
    pub untagged: Vec<String>,
    /// Size of the deleted image
    pub size_bytes: u64,
    /// Why the removal failed
    pub error: Option<ImageError>,
}

impl RemovalReport {
    fn failed(id: &str, error: ImageError) -> Self {
        Self {
            id: id.to_string(),
            removed: false,
            untagged: Vec::new(),
            size_bytes: 0,
            error: Some(error),
        }
    }
}

/// Removal settings.
#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    /// Delete images other images use as parent, and delete multi-named images
    /// outright instead of untagging
    pub force: bool,
    /// List filters selecting the images when no explicit targets are given
    pub filters: Vec<String>,
    /// Do not report unresolvable target names
    pub ignore_unknown: bool,
}

/// Resolved target: the image and, when it was named, the name used.
#[derive(Clone)]
struct Target {
    image: StoredImage,
    by_name: Option<String>,
}

/// Remove `targets`, or every image matching `options.filters` when `None`.
///
/// Reports follow the order of the resolved targets; for `None` that is
/// image ID order. A target refused because a child is still present is
/// retried once every child it named has been removed by the same batch.
pub async fn remove_images(
    ctx: &CancellationToken,
    store: &ImageStore,
    targets: Option<&[String]>,
    options: &RemoveOptions,
) -> (Vec<RemovalReport>, Vec<ImageError>) {
    let mut reports = Vec::new();
    let mut errors = Vec::new();

    let resolved = match resolve_targets(ctx, store, targets, options, &mut errors).await {
        Ok(resolved) => resolved,
        Err(e) => {
            errors.push(e);
            return (reports, errors);
        }
    };

    for target in &resolved {
        if ctx.is_cancelled() {
            tracing::info!(completed = reports.len(), "Image removal canceled");
            errors.push(ImageError::Canceled);
            return (reports, errors);
        }
        reports.push(remove_one(store, target.clone(), options.force).await);
    }

    if let Err(e) = retry_referenced(ctx, store, &resolved, &mut reports, options.force).await {
        errors.push(e);
    }
    (reports, errors)
}

/// Re-run deletions that failed with `StillReferenced` once every referrer
/// they named was removed by this batch. Each target is retried at most once;
/// reports are replaced in place.
async fn retry_referenced(
    ctx: &CancellationToken,
    store: &ImageStore,
    resolved: &[Target],
    reports: &mut [RemovalReport],
    force: bool,
) -> Result<()> {
    let mut retried = HashSet::new();
    loop {
        let removed: HashSet<String> = reports
            .iter()
            .filter(|r| r.removed)
            .map(|r| r.id.clone())
            .collect();
        let ready: Vec<usize> = reports
            .iter()
            .enumerate()
            .filter(|(i, _)| !retried.contains(i))
            .filter_map(|(i, r)| match r.error {
                Some(ImageError::StillReferenced { ref by, .. })
                    if by.split(", ").all(|child| removed.contains(child)) =>
                {
                    Some(i)
                }
                _ => None,
            })
            .collect();
        if ready.is_empty() {
            return Ok(());
        }

        for i in ready {
            if ctx.is_cancelled() {
                tracing::info!("Image removal canceled during parent retry");
                return Err(ImageError::Canceled);
            }
            tracing::debug!(id = %reports[i].id, "Retrying removal after its children were removed");
            retried.insert(i);
            reports[i] = remove_one(store, resolved[i].clone(), force).await;
        }
    }
}

async fn resolve_targets(
    ctx: &CancellationToken,
    store: &ImageStore,
    targets: Option<&[String]>,
    options: &RemoveOptions,
    errors: &mut Vec<ImageError>,
) -> Result<Vec<Target>> {
    let Some(targets) = targets else {
        let list_options = ListOptions {
            set_list_data: false,
            filters: options.filters.clone(),
        };
        let entries = catalog::list_images(ctx, store, None, &list_options).await?;
        return Ok(entries
            .into_iter()
            .map(|entry| Target {
                image: entry.image,
                by_name: None,
            })
            .collect());
    };

    let snapshot = store.list().await;
    let mut resolved: Vec<Target> = Vec::with_capacity(targets.len());
    for name in targets {
        match find_image(&snapshot, name) {
            Some(image) if resolved.iter().any(|t| t.image.id == image.id) => {
                tracing::debug!(image = %name, id = %image.id, "Image already targeted");
            }
            Some(image) => {
                let candidates = reference::lookup_candidates(name);
                let by_name = image
                    .names
                    .iter()
                    .find(|n| candidates.contains(n))
                    .cloned();
                resolved.push(Target {
                    image: image.clone(),
                    by_name,
                });
            }
            None if options.ignore_unknown => {
                tracing::debug!(image = %name, "Ignoring unknown image");
            }
            None => errors.push(ImageError::ImageNotFound(name.clone())),
        }
    }
    Ok(resolved)
}

/// Untag or delete one image, re-reading its current state first.
async fn remove_one(store: &ImageStore, target: Target, force: bool) -> RemovalReport {
    let id = target.image.id;
    let Some(current) = store.get(&id).await else {
        return RemovalReport::failed(&id, ImageError::ImageNotFound(id.clone()));
    };

    if let Some(name) = target.by_name {
        if current.names.len() > 1 && !force {
            return match store.untag(&id, &name).await {
                Ok(_) => {
                    tracing::info!(id = %id, name = %name, "Image untagged");
                    RemovalReport {
                        id,
                        removed: false,
                        untagged: vec![name],
                        size_bytes: 0,
                        error: None,
                    }
                }
                Err(e) => RemovalReport::failed(&id, e),
            };
        }
    }

    match store.delete(&id, force).await {
        Ok(removed) => {
            tracing::info!(id = %id, names = ?removed.names, "Image removed");
            RemovalReport {
                id,
                removed: true,
                untagged: removed.names,
                size_bytes: removed.size_bytes,
                error: None,
            }
        }
        Err(e) => {
            tracing::warn!(id = %id, error = %e, "Failed to remove image");
            RemovalReport::failed(&id, e)
        }
    }
}
