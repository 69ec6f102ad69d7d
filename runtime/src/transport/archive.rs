//! Tarball transports: `oci-archive:` and `docker-archive:`.
//!
//! Archives are unpacked into a scratch directory for reading and assembled
//! in one for writing; the finished tarball replaces the target file in a
//! single rename.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stevedore_core::error::{ImageError, Result};
use tempfile::TempDir;

use super::layout::{LayoutSource, LayoutWriter};
use super::{
    split_archive_reference, split_path_reference, DestinationOptions, ImageDestination,
    ImageSource, Transport, TransportKind,
};
use crate::digest;
use crate::manifest::{media_types, Descriptor, ImageManifest, ManifestFormat, RawManifest};
use crate::reference;

const DOCKER_MANIFEST_FILE: &str = "manifest.json";

/// Unpack `archive` into a fresh scratch directory.
async fn unpack(archive: PathBuf, location: String) -> Result<TempDir> {
    tokio::task::spawn_blocking(move || {
        let map = |e: std::io::Error| ImageError::transport(&location, "unpack archive", e);
        let scratch = tempfile::Builder::new()
            .prefix("stevedore-archive-")
            .tempdir()
            .map_err(map)?;
        let file = File::open(&archive).map_err(map)?;
        tar::Archive::new(file).unpack(scratch.path()).map_err(map)?;
        Ok(scratch)
    })
    .await
    .map_err(|e| ImageError::Other(format!("archive task failed: {}", e)))?
}

/// Tar `entries` (archive name → file) into `target`, replacing it atomically.
async fn pack(target: PathBuf, entries: Vec<(String, PathBuf)>, location: String) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let map = |e: std::io::Error| ImageError::transport(&location, "write archive", e);
        let parent = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent).map_err(map)?;
        let tmp = tempfile::NamedTempFile::new_in(&parent).map_err(map)?;

        let mut builder = tar::Builder::new(tmp.as_file());
        for (name, path) in &entries {
            builder.append_path_with_name(path, name).map_err(map)?;
        }
        builder.finish().map_err(map)?;
        drop(builder);

        tmp.persist(&target).map_err(|e| map(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| ImageError::Other(format!("archive task failed: {}", e)))?
}

/// Every regular file under `root`, named relative to it.
fn collect_files(root: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                files.push((relative.to_string_lossy().into_owned(), path.clone()));
            }
        }
    }
    files.sort();
    Ok(files)
}

// ============================================================================
// oci-archive
// ============================================================================

pub struct OciArchiveTransport;

#[async_trait]
impl Transport for OciArchiveTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::OciArchive
    }

    async fn open_source(&self, locator: &str) -> Result<Box<dyn ImageSource>> {
        let (path, name) = split_path_reference(locator);
        let scratch = unpack(PathBuf::from(path), locator.to_string()).await?;
        let inner = LayoutSource::open(scratch.path().to_path_buf(), name, locator).await?;
        Ok(Box::new(OciArchiveSource {
            inner,
            _scratch: scratch,
        }))
    }

    async fn open_destination(
        &self,
        locator: &str,
        _options: &DestinationOptions,
    ) -> Result<Box<dyn ImageDestination>> {
        let (path, name) = split_path_reference(locator);
        let scratch = tempfile::Builder::new()
            .prefix("stevedore-archive-")
            .tempdir()
            .map_err(|e| ImageError::transport(locator, "open destination", e))?;
        let writer = LayoutWriter::create(scratch.path().to_path_buf(), name, locator).await?;
        Ok(Box::new(OciArchiveDestination {
            target: PathBuf::from(path),
            location: locator.to_string(),
            writer,
            scratch,
        }))
    }
}

struct OciArchiveSource {
    inner: LayoutSource,
    _scratch: TempDir,
}

#[async_trait]
impl ImageSource for OciArchiveSource {
    async fn manifest(&self, digest: Option<&str>) -> Result<RawManifest> {
        self.inner.manifest(digest).await
    }

    async fn blob(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        self.inner.blob(descriptor).await
    }
}

struct OciArchiveDestination {
    target: PathBuf,
    location: String,
    writer: LayoutWriter,
    scratch: TempDir,
}

#[async_trait]
impl ImageDestination for OciArchiveDestination {
    fn preferred_format(&self) -> Option<ManifestFormat> {
        Some(ManifestFormat::Oci)
    }

    async fn put_blob(&mut self, descriptor: &Descriptor, data: &[u8]) -> Result<()> {
        self.writer.put_blob(descriptor, data).await
    }

    async fn put_manifest(&mut self, manifest: &RawManifest) -> Result<()> {
        self.writer.put_manifest(manifest).await
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.writer.finish().await?;
        let entries = collect_files(self.scratch.path())
            .map_err(|e| ImageError::transport(&self.location, "write archive", e))?;
        pack(self.target.clone(), entries, self.location.clone()).await?;
        tracing::debug!(target = %self.location, "OCI archive written");
        Ok(())
    }
}

// ============================================================================
// docker-archive
// ============================================================================

/// One entry of a `docker save` manifest.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ArchiveEntry {
    config: String,
    #[serde(default)]
    repo_tags: Vec<String>,
    #[serde(default)]
    layers: Vec<String>,
}

pub struct DockerArchiveTransport;

#[async_trait]
impl Transport for DockerArchiveTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::DockerArchive
    }

    async fn open_source(&self, locator: &str) -> Result<Box<dyn ImageSource>> {
        let (path, name) = split_archive_reference(locator);
        let scratch = unpack(PathBuf::from(path), locator.to_string()).await?;
        let source = DockerArchiveSource::load(scratch, name, locator).await?;
        Ok(Box::new(source))
    }

    async fn open_destination(
        &self,
        locator: &str,
        options: &DestinationOptions,
    ) -> Result<Box<dyn ImageDestination>> {
        let (path, name) = split_archive_reference(locator);
        let repo_tag = match name {
            Some(name) => Some(reference::normalize_name(name)?),
            None => options.default_name.clone(),
        };
        let scratch = tempfile::Builder::new()
            .prefix("stevedore-archive-")
            .tempdir()
            .map_err(|e| ImageError::transport(locator, "open destination", e))?;
        Ok(Box::new(DockerArchiveDestination {
            target: PathBuf::from(path),
            location: locator.to_string(),
            repo_tag,
            scratch,
            manifest: None,
        }))
    }
}

struct DockerArchiveSource {
    scratch: TempDir,
    location: String,
    manifest: RawManifest,
    /// Blob digest → file inside the unpacked archive
    files: HashMap<String, String>,
    repo_tags: Vec<String>,
}

impl DockerArchiveSource {
    /// Select the archive entry tagged `name`, or the only entry.
    async fn load(scratch: TempDir, name: Option<&str>, location: &str) -> Result<Self> {
        let map = |e: std::io::Error| ImageError::transport(location, "read archive", e);
        let bytes = tokio::fs::read(scratch.path().join(DOCKER_MANIFEST_FILE))
            .await
            .map_err(map)?;
        let entries: Vec<ArchiveEntry> = serde_json::from_slice(&bytes)?;

        let entry = match name {
            Some(name) => {
                let wanted = reference::normalize_name(name)?;
                entries
                    .iter()
                    .find(|e| {
                        e.repo_tags
                            .iter()
                            .any(|t| reference::normalize_name(t).map_or(false, |t| t == wanted))
                    })
                    .ok_or_else(|| {
                        ImageError::transport(location, "read archive", format!("no image tagged '{}'", name))
                    })?
            }
            None => match entries.as_slice() {
                [only] => only,
                other => {
                    return Err(ImageError::transport(
                        location,
                        "read archive",
                        format!("archive holds {} images; name one with path:reference", other.len()),
                    ))
                }
            },
        };

        let mut files = HashMap::new();
        let config_bytes = tokio::fs::read(scratch.path().join(&entry.config))
            .await
            .map_err(map)?;
        let config = Descriptor::for_blob(media_types::DOCKER_CONFIG, &config_bytes);
        files.insert(config.digest.clone(), entry.config.clone());

        let mut layers = Vec::with_capacity(entry.layers.len());
        for layer_file in &entry.layers {
            let data = tokio::fs::read(scratch.path().join(layer_file))
                .await
                .map_err(map)?;
            let media_type = if data.starts_with(&[0x1f, 0x8b]) {
                media_types::DOCKER_LAYER_GZIP
            } else {
                media_types::DOCKER_LAYER
            };
            let descriptor = Descriptor::for_blob(media_type, &data);
            files.insert(descriptor.digest.clone(), layer_file.clone());
            layers.push(descriptor);
        }

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(media_types::DOCKER_MANIFEST.to_string()),
            config,
            layers,
            annotations: None,
        }
        .to_raw()?;

        let repo_tags = entry
            .repo_tags
            .iter()
            .filter_map(|t| reference::normalize_name(t).ok())
            .collect();

        Ok(Self {
            scratch,
            location: location.to_string(),
            manifest,
            files,
            repo_tags,
        })
    }
}

#[async_trait]
impl ImageSource for DockerArchiveSource {
    async fn manifest(&self, digest: Option<&str>) -> Result<RawManifest> {
        match digest {
            Some(d) if d != self.manifest.digest() => Err(ImageError::transport(
                &self.location,
                "read manifest",
                format!("archive holds no manifest {}", d),
            )),
            _ => Ok(self.manifest.clone()),
        }
    }

    async fn blob(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let file = self.files.get(&descriptor.digest).ok_or_else(|| {
            ImageError::transport(
                &self.location,
                "read blob",
                format!("archive holds no blob {}", descriptor.digest),
            )
        })?;
        tokio::fs::read(self.scratch.path().join(file))
            .await
            .map_err(|e| ImageError::transport(&self.location, "read blob", e))
    }

    fn reference_names(&self) -> Vec<String> {
        self.repo_tags.clone()
    }
}

struct DockerArchiveDestination {
    target: PathBuf,
    location: String,
    repo_tag: Option<String>,
    scratch: TempDir,
    manifest: Option<ImageManifest>,
}

impl DockerArchiveDestination {
    fn blob_file(&self, digest: &str) -> PathBuf {
        self.scratch.path().join(digest::digest_hex(digest))
    }
}

#[async_trait]
impl ImageDestination for DockerArchiveDestination {
    fn preferred_format(&self) -> Option<ManifestFormat> {
        Some(ManifestFormat::Docker)
    }

    async fn put_blob(&mut self, descriptor: &Descriptor, data: &[u8]) -> Result<()> {
        tokio::fs::write(self.blob_file(&descriptor.digest), data)
            .await
            .map_err(|e| ImageError::transport(&self.location, "write blob", e))
    }

    async fn put_manifest(&mut self, manifest: &RawManifest) -> Result<()> {
        self.manifest = Some(manifest.parse_image()?);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let manifest = self.manifest.as_ref().ok_or_else(|| {
            ImageError::transport(&self.location, "commit", "no manifest written")
        })?;

        let config_name = format!("{}.json", digest::digest_hex(&manifest.config.digest));
        let mut files = vec![(config_name.clone(), self.blob_file(&manifest.config.digest))];
        let mut layer_names = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            let name = format!("{}.tar", digest::digest_hex(&layer.digest));
            if !layer_names.contains(&name) {
                files.push((name.clone(), self.blob_file(&layer.digest)));
            }
            layer_names.push(name);
        }

        let entries = vec![ArchiveEntry {
            config: config_name,
            repo_tags: self.repo_tag.iter().cloned().collect(),
            layers: layer_names,
        }];
        let manifest_path = self.scratch.path().join(DOCKER_MANIFEST_FILE);
        tokio::fs::write(&manifest_path, serde_json::to_vec(&entries)?)
            .await
            .map_err(|e| ImageError::transport(&self.location, "commit", e))?;
        files.push((DOCKER_MANIFEST_FILE.to_string(), manifest_path));

        pack(self.target.clone(), files, self.location.clone()).await?;
        tracing::debug!(target = %self.location, "Docker archive written");
        Ok(())
    }
}
