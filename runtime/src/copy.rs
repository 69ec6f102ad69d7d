//! Image copy engine shared by pull and push.
//!
//! Reads the manifest from a source, selects a platform, verifies every blob
//! against its digest and writes config, layers and finally the manifest to
//! a destination, converting the manifest format when the destination asks
//! for one. Committing the destination is left to the caller.

use std::future::Future;

use stevedore_core::config::MismatchPolicy;
use stevedore_core::error::{ImageError, Result};
use tokio_util::sync::CancellationToken;

use crate::digest;
use crate::manifest::{self, ImageConfig, ManifestDocument, RawManifest};
use crate::platform::{negotiate, ManifestArtifact, Platform, PlatformSpec};
use crate::progress::ProgressWriter;
use crate::transport::{ImageDestination, ImageSource};

/// Run `fut` unless `ctx` is canceled first.
pub async fn cancellable<T>(
    ctx: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(ImageError::Canceled),
        result = fut => result,
    }
}

/// Fail with `Canceled` if `ctx` has been canceled.
pub fn check_canceled(ctx: &CancellationToken) -> Result<()> {
    if ctx.is_cancelled() {
        Err(ImageError::Canceled)
    } else {
        Ok(())
    }
}

/// Settings for one copy.
pub struct CopyOptions<'a> {
    pub platform: &'a PlatformSpec,
    pub mismatch: MismatchPolicy,
    pub progress: &'a ProgressWriter,
}

/// Single-platform manifest selected from a source.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub manifest: RawManifest,
    pub config: Vec<u8>,
    pub platform: Platform,
}

impl ResolvedManifest {
    pub fn digest(&self) -> String {
        self.manifest.digest()
    }
}

/// Fetch the source manifest and narrow it to one platform.
///
/// Manifest lists are negotiated against `spec`; a single-platform image
/// whose platform contradicts an explicit field of `spec` is accepted with
/// a warning or rejected with `PlatformMismatch`, depending on `mismatch`.
pub async fn resolve_manifest(
    ctx: &CancellationToken,
    source: &dyn ImageSource,
    spec: &PlatformSpec,
    mismatch: MismatchPolicy,
) -> Result<ResolvedManifest> {
    let top = cancellable(ctx, source.manifest(None)).await?;

    let (manifest, parsed) = match top.parse()? {
        ManifestDocument::Image(parsed) => (top, parsed),
        ManifestDocument::List(list) => {
            let selected = negotiate(ManifestArtifact::List(&list), spec)?;
            let manifest = cancellable(ctx, source.manifest(Some(&selected.digest))).await?;
            digest::verify(&selected.digest, &manifest.bytes)?;
            let parsed = manifest.parse_image()?;
            (manifest, parsed)
        }
    };

    let config = cancellable(ctx, source.blob(&parsed.config)).await?;
    digest::verify(&parsed.config.digest, &config)?;
    let platform = ImageConfig::parse(&config)?.platform();

    let digest = manifest.digest();
    let negotiated = negotiate(
        ManifestArtifact::Single {
            digest: &digest,
            platform: &platform,
        },
        spec,
    )?;
    if negotiated.mismatch {
        let wanted = spec.resolve().to_string();
        match mismatch {
            MismatchPolicy::Error => {
                return Err(ImageError::PlatformMismatch {
                    wanted,
                    actual: platform.to_string(),
                })
            }
            MismatchPolicy::Warn => tracing::warn!(
                wanted = %wanted,
                actual = %platform,
                "Image platform does not match the requested platform"
            ),
        }
    }

    Ok(ResolvedManifest {
        manifest,
        config,
        platform,
    })
}

/// Copy a resolved image from `source` into `dest`.
///
/// Returns the manifest as written, which differs from the source manifest
/// when the destination required a format conversion.
pub async fn copy_resolved(
    ctx: &CancellationToken,
    source: &dyn ImageSource,
    resolved: &ResolvedManifest,
    dest: &mut dyn ImageDestination,
    progress: &ProgressWriter,
) -> Result<RawManifest> {
    let source_manifest = resolved.manifest.parse_image()?;
    let source_format = source_manifest.format();
    let target = dest.preferred_format().unwrap_or(source_format);

    let (written, config) = if target == source_format {
        (source_manifest.clone(), resolved.config.clone())
    } else {
        tracing::debug!(from = %source_format, to = %target, "Converting manifest");
        manifest::convert(&source_manifest, &resolved.config, target)?
    };

    check_canceled(ctx)?;
    progress.line(format!("Copying config {}", digest::short(&written.config.digest)));
    cancellable(ctx, dest.put_blob(&written.config, &config)).await?;

    for (source_layer, layer) in source_manifest.layers.iter().zip(written.layers.iter()) {
        check_canceled(ctx)?;
        progress.line(format!("Copying blob {}", digest::short(&layer.digest)));
        let data = cancellable(ctx, source.blob(source_layer)).await?;
        digest::verify(&source_layer.digest, &data)?;
        tracing::debug!(digest = %layer.digest, size = data.len(), "Copied layer");
        cancellable(ctx, dest.put_blob(layer, &data)).await?;
    }

    let raw = if target == source_format {
        resolved.manifest.clone()
    } else {
        written.to_raw()?
    };
    check_canceled(ctx)?;
    progress.line("Writing manifest to image destination");
    cancellable(ctx, dest.put_manifest(&raw)).await?;
    Ok(raw)
}

/// Resolve and copy in one step.
pub async fn copy_image(
    ctx: &CancellationToken,
    source: &dyn ImageSource,
    dest: &mut dyn ImageDestination,
    options: &CopyOptions<'_>,
) -> Result<(ResolvedManifest, RawManifest)> {
    options.progress.line("Getting image source signatures");
    let resolved = resolve_manifest(ctx, source, options.platform, options.mismatch).await?;
    let written = copy_resolved(ctx, source, &resolved, dest, options.progress).await?;
    Ok((resolved, written))
}
