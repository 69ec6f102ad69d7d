//! `dir:` transport: a plain directory of blobs plus `manifest.json`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use stevedore_core::error::{ImageError, Result};
use tempfile::TempDir;

use super::{DestinationOptions, ImageDestination, ImageSource, Transport, TransportKind};
use crate::digest;
use crate::manifest::{Descriptor, ManifestFormat, RawManifest};

const VERSION_FILE: &str = "version";
const VERSION_CONTENT: &str = "Directory Transport Version: 1.1\n";
const MANIFEST_FILE: &str = "manifest.json";

pub struct DirTransport;

#[async_trait]
impl Transport for DirTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Dir
    }

    async fn open_source(&self, locator: &str) -> Result<Box<dyn ImageSource>> {
        let path = PathBuf::from(locator);
        let bytes = tokio::fs::read(path.join(MANIFEST_FILE))
            .await
            .map_err(|e| ImageError::transport(locator, "read manifest", e))?;
        let manifest = RawManifest::from_bytes(bytes)?;
        Ok(Box::new(DirSource { path, manifest }))
    }

    async fn open_destination(
        &self,
        locator: &str,
        _options: &DestinationOptions,
    ) -> Result<Box<dyn ImageDestination>> {
        let target = PathBuf::from(locator);
        check_overwritable(&target)
            .await
            .map_err(|e| ImageError::transport(locator, "open destination", e))?;

        let parent = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ImageError::transport(locator, "open destination", e))?;
        let staging = tempfile::Builder::new()
            .prefix(".stevedore-dir-")
            .tempdir_in(parent)
            .map_err(|e| ImageError::transport(locator, "open destination", e))?;

        Ok(Box::new(DirDestination {
            target,
            staging,
            manifest_written: false,
        }))
    }
}

/// Refuse to replace a non-empty directory that is not a `dir:` image.
async fn check_overwritable(target: &Path) -> std::io::Result<()> {
    let mut entries = match tokio::fs::read_dir(target).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if entries.next_entry().await?.is_none() {
        return Ok(());
    }
    if tokio::fs::metadata(target.join(VERSION_FILE)).await.is_ok() {
        return Ok(());
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!(
            "{} is not empty and does not hold a directory image",
            target.display()
        ),
    ))
}

struct DirSource {
    path: PathBuf,
    manifest: RawManifest,
}

#[async_trait]
impl ImageSource for DirSource {
    async fn manifest(&self, digest: Option<&str>) -> Result<RawManifest> {
        match digest {
            Some(d) if d != self.manifest.digest() => Err(ImageError::transport(
                self.path.display().to_string(),
                "read manifest",
                format!("directory holds no manifest {}", d),
            )),
            _ => Ok(self.manifest.clone()),
        }
    }

    async fn blob(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let file = self.path.join(digest::digest_hex(&descriptor.digest));
        tokio::fs::read(&file).await.map_err(|e| {
            ImageError::transport(self.path.display().to_string(), "read blob", e)
        })
    }
}

struct DirDestination {
    target: PathBuf,
    staging: TempDir,
    manifest_written: bool,
}

impl DirDestination {
    fn location(&self) -> String {
        self.target.display().to_string()
    }
}

#[async_trait]
impl ImageDestination for DirDestination {
    fn preferred_format(&self) -> Option<ManifestFormat> {
        None
    }

    async fn put_blob(&mut self, descriptor: &Descriptor, data: &[u8]) -> Result<()> {
        let file = self
            .staging
            .path()
            .join(digest::digest_hex(&descriptor.digest));
        tokio::fs::write(&file, data)
            .await
            .map_err(|e| ImageError::transport(self.location(), "write blob", e))
    }

    async fn put_manifest(&mut self, manifest: &RawManifest) -> Result<()> {
        tokio::fs::write(self.staging.path().join(MANIFEST_FILE), &manifest.bytes)
            .await
            .map_err(|e| ImageError::transport(self.location(), "write manifest", e))?;
        self.manifest_written = true;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let location = self.location();
        if !self.manifest_written {
            return Err(ImageError::transport(location, "commit", "no manifest written"));
        }
        tokio::fs::write(self.staging.path().join(VERSION_FILE), VERSION_CONTENT)
            .await
            .map_err(|e| ImageError::transport(&location, "commit", e))?;

        if tokio::fs::metadata(&self.target).await.is_ok() {
            tokio::fs::remove_dir_all(&self.target)
                .await
                .map_err(|e| ImageError::transport(&location, "commit", e))?;
        }
        let staged = self.staging.into_path();
        tokio::fs::rename(&staged, &self.target)
            .await
            .map_err(|e| ImageError::transport(&location, "commit", e))?;

        tracing::debug!(target = %location, "Directory image committed");
        Ok(())
    }
}
