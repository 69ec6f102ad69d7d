//! Push pipeline.
//!
//! Copies a stored image to any writable transport, converting the manifest
//! format when the destination requires it. The local store is only read.

use std::sync::Arc;

use stevedore_core::config::MismatchPolicy;
use stevedore_core::error::{ImageError, Result};
use tokio_util::sync::CancellationToken;

use crate::copy::{cancellable, check_canceled, copy_image, CopyOptions};
use crate::platform::PlatformSpec;
use crate::progress::ProgressWriter;
use crate::store::{ImageStore, StoredImage};
use crate::transport::{DestinationOptions, Mode, StorageTransport, Transport, TransportResolver};

/// Per-push settings.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Platform the pushed content must match; unset fields are unconstrained
    pub platform: PlatformSpec,
    /// Receives human-readable progress
    pub progress: ProgressWriter,
}

/// Outcome of a push.
#[derive(Debug, Clone)]
pub struct PushResult {
    /// Stored image that was pushed
    pub source: StoredImage,
    /// Destination location as resolved
    pub destination: String,
    /// Digest of the manifest written to the destination
    pub manifest_digest: String,
}

/// Pushes stored images to transports.
pub struct ImagePusher {
    store: Arc<ImageStore>,
    resolver: TransportResolver,
}

impl ImagePusher {
    pub fn new(store: Arc<ImageStore>, resolver: TransportResolver) -> Self {
        Self { store, resolver }
    }

    /// Push the stored image `source` to `destination`.
    ///
    /// A platform contradicting an explicit field of `options.platform` is
    /// always fatal. Destination write failures are returned as-is.
    pub async fn push(
        &self,
        ctx: &CancellationToken,
        source: &str,
        destination: &str,
        options: &PushOptions,
    ) -> Result<PushResult> {
        check_canceled(ctx)?;
        let handle = self.resolver.resolve(destination, Mode::Write)?;
        let image = self
            .store
            .lookup(source)
            .await
            .ok_or_else(|| ImageError::SourceNotFound(source.to_string()))?;

        if options.platform.conflicts_with(&image.platform) {
            return Err(ImageError::PlatformMismatch {
                wanted: options.platform.resolve().to_string(),
                actual: image.platform.to_string(),
            });
        }

        tracing::info!(
            source = %source,
            id = %image.id,
            destination = %handle.reference,
            "Pushing image"
        );

        let reader = StorageTransport::new(Arc::clone(&self.store));
        let image_source = cancellable(ctx, reader.open_source(&image.id)).await?;
        let dest_options = DestinationOptions {
            default_name: image.names.first().cloned(),
        };
        let mut dest = cancellable(ctx, handle.open_destination(&dest_options)).await?;

        let copy_options = CopyOptions {
            platform: &options.platform,
            mismatch: MismatchPolicy::Error,
            progress: &options.progress,
        };
        let (_, written) =
            copy_image(ctx, image_source.as_ref(), dest.as_mut(), &copy_options).await?;
        check_canceled(ctx)?;
        dest.commit().await?;

        let manifest_digest = written.digest();
        tracing::info!(
            id = %image.id,
            destination = %handle.reference,
            digest = %manifest_digest,
            "Image pushed"
        );
        Ok(PushResult {
            source: image,
            destination: handle.reference.to_string(),
            manifest_digest,
        })
    }
}
