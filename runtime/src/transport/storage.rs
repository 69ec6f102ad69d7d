//! `containers-storage:` transport: the runtime's own image store.

use std::sync::Arc;

use async_trait::async_trait;
use stevedore_core::error::{ImageError, Result};

use super::{
    is_image_id, DestinationOptions, ImageDestination, ImageSource, Transport, TransportKind,
};
use crate::manifest::{Descriptor, ManifestFormat, RawManifest};
use crate::reference;
use crate::store::{ImageStore, StagedImage, StoredImage};

pub struct StorageTransport {
    store: Arc<ImageStore>,
}

impl StorageTransport {
    pub fn new(store: Arc<ImageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Transport for StorageTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ContainersStorage
    }

    async fn open_source(&self, locator: &str) -> Result<Box<dyn ImageSource>> {
        let image = self
            .store
            .lookup(locator)
            .await
            .ok_or_else(|| ImageError::ImageNotFound(locator.to_string()))?;
        let manifest = self.store.read_manifest(&image.id).await?;
        Ok(Box::new(StorageSource {
            store: Arc::clone(&self.store),
            image,
            manifest,
        }))
    }

    async fn open_destination(
        &self,
        locator: &str,
        _options: &DestinationOptions,
    ) -> Result<Box<dyn ImageDestination>> {
        if is_image_id(locator) {
            return Err(ImageError::InvalidReference(format!(
                "cannot write to image ID {}; use a name",
                locator
            )));
        }
        let name = reference::normalize_name(locator)?;
        let staged = self.store.stage().await?;
        Ok(Box::new(StorageDestination { staged, name }))
    }
}

struct StorageSource {
    store: Arc<ImageStore>,
    image: StoredImage,
    manifest: RawManifest,
}

#[async_trait]
impl ImageSource for StorageSource {
    async fn manifest(&self, digest: Option<&str>) -> Result<RawManifest> {
        match digest {
            Some(d) if d != self.image.digest => Err(ImageError::ImageNotFound(format!(
                "{}@{}",
                self.image.id, d
            ))),
            _ => Ok(self.manifest.clone()),
        }
    }

    async fn blob(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        self.store.read_blob(&self.image.id, &descriptor.digest).await
    }

    fn reference_names(&self) -> Vec<String> {
        self.image.names.clone()
    }
}

struct StorageDestination {
    staged: StagedImage,
    name: String,
}

#[async_trait]
impl ImageDestination for StorageDestination {
    fn preferred_format(&self) -> Option<ManifestFormat> {
        None
    }

    async fn put_blob(&mut self, descriptor: &Descriptor, data: &[u8]) -> Result<()> {
        self.staged.put_blob(descriptor, data).await
    }

    async fn put_manifest(&mut self, manifest: &RawManifest) -> Result<()> {
        self.staged.put_manifest(manifest).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let StorageDestination { staged, name } = *self;
        let image = staged.commit_named(&[name]).await?;
        tracing::debug!(id = %image.id, "Image written to local storage");
        Ok(())
    }
}
