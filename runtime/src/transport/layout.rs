//! `oci:` transport: OCI image layout directories.
//!
//! ```text
//! <path>/
//! ├── oci-layout
//! ├── index.json
//! └── blobs/sha256/<hex>
//! ```
//!
//! Images in a layout are told apart by the `org.opencontainers.image.ref.name`
//! annotation on their `index.json` entry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use stevedore_core::error::{ImageError, Result};

use super::{
    split_path_reference, DestinationOptions, ImageDestination, ImageSource, Transport,
    TransportKind,
};
use crate::digest;
use crate::manifest::{
    media_types, Descriptor, ManifestFormat, ManifestList, RawManifest, REF_NAME_ANNOTATION,
};

const LAYOUT_FILE: &str = "oci-layout";
const LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_FILE: &str = "index.json";

pub struct OciLayoutTransport;

#[async_trait]
impl Transport for OciLayoutTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Oci
    }

    async fn open_source(&self, locator: &str) -> Result<Box<dyn ImageSource>> {
        let (path, reference) = split_path_reference(locator);
        let source = LayoutSource::open(PathBuf::from(path), reference, locator).await?;
        Ok(Box::new(source))
    }

    async fn open_destination(
        &self,
        locator: &str,
        _options: &DestinationOptions,
    ) -> Result<Box<dyn ImageDestination>> {
        let (path, reference) = split_path_reference(locator);
        let writer = LayoutWriter::create(PathBuf::from(path), reference, locator).await?;
        Ok(Box::new(LayoutDestination { writer }))
    }
}

fn blob_path(root: &Path, digest: &str) -> PathBuf {
    root.join("blobs")
        .join("sha256")
        .join(digest::digest_hex(digest))
}

async fn read_index(root: &Path, location: &str) -> Result<ManifestList> {
    let bytes = tokio::fs::read(root.join(INDEX_FILE))
        .await
        .map_err(|e| ImageError::transport(location, "read index", e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Readable image inside an OCI layout.
pub(super) struct LayoutSource {
    root: PathBuf,
    location: String,
    top: RawManifest,
}

impl LayoutSource {
    /// Select the image named `reference`, or the layout's only image.
    ///
    /// Without a reference, several unnamed entries that all carry a platform
    /// are read together as a manifest list.
    pub(super) async fn open(root: PathBuf, reference: Option<&str>, location: &str) -> Result<Self> {
        let index = read_index(&root, location).await?;

        let selected = match reference {
            Some(name) => index
                .manifests
                .iter()
                .find(|d| d.ref_name() == Some(name))
                .ok_or_else(|| {
                    ImageError::transport(location, "read index", format!("no image named '{}'", name))
                })?,
            None => match index.manifests.as_slice() {
                [] => {
                    return Err(ImageError::transport(location, "read index", "layout holds no images"))
                }
                [only] => only,
                many if many.iter().all(|d| d.platform.is_some() && d.ref_name().is_none()) => {
                    let list = ManifestList {
                        schema_version: 2,
                        media_type: Some(media_types::OCI_INDEX.to_string()),
                        manifests: many.to_vec(),
                        annotations: None,
                    };
                    return Ok(Self {
                        top: list.to_raw()?,
                        root,
                        location: location.to_string(),
                    });
                }
                many => {
                    return Err(ImageError::transport(
                        location,
                        "read index",
                        format!("layout holds {} images; name one with path:reference", many.len()),
                    ))
                }
            },
        };

        let bytes = tokio::fs::read(blob_path(&root, &selected.digest))
            .await
            .map_err(|e| ImageError::transport(location, "read manifest", e))?;
        Ok(Self {
            top: RawManifest::new(bytes, selected.media_type.clone()),
            root,
            location: location.to_string(),
        })
    }
}

#[async_trait]
impl ImageSource for LayoutSource {
    async fn manifest(&self, digest: Option<&str>) -> Result<RawManifest> {
        match digest {
            None => Ok(self.top.clone()),
            Some(d) if d == self.top.digest() => Ok(self.top.clone()),
            Some(d) => {
                let bytes = tokio::fs::read(blob_path(&self.root, d))
                    .await
                    .map_err(|e| ImageError::transport(&self.location, "read manifest", e))?;
                RawManifest::from_bytes(bytes)
            }
        }
    }

    async fn blob(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        tokio::fs::read(blob_path(&self.root, &descriptor.digest))
            .await
            .map_err(|e| ImageError::transport(&self.location, "read blob", e))
    }
}

/// Writes one image into an OCI layout, creating the layout if needed.
pub(super) struct LayoutWriter {
    root: PathBuf,
    reference: Option<String>,
    location: String,
    manifest: Option<Descriptor>,
}

impl LayoutWriter {
    pub(super) async fn create(root: PathBuf, reference: Option<&str>, location: &str) -> Result<Self> {
        let map = |e: std::io::Error| ImageError::transport(location, "open destination", e);
        if tokio::fs::metadata(&root).await.map(|m| !m.is_dir()).unwrap_or(false) {
            return Err(ImageError::transport(
                location,
                "open destination",
                "path exists and is not a directory",
            ));
        }
        tokio::fs::create_dir_all(root.join("blobs").join("sha256"))
            .await
            .map_err(map)?;
        Ok(Self {
            root,
            reference: reference.map(str::to_string),
            location: location.to_string(),
            manifest: None,
        })
    }

    pub(super) async fn put_blob(&mut self, descriptor: &Descriptor, data: &[u8]) -> Result<()> {
        tokio::fs::write(blob_path(&self.root, &descriptor.digest), data)
            .await
            .map_err(|e| ImageError::transport(&self.location, "write blob", e))
    }

    pub(super) async fn put_manifest(&mut self, manifest: &RawManifest) -> Result<()> {
        let mut descriptor = Descriptor::for_blob(&manifest.media_type, &manifest.bytes);
        self.put_blob(&descriptor, &manifest.bytes).await?;
        if let Some(ref name) = self.reference {
            let mut annotations = BTreeMap::new();
            annotations.insert(REF_NAME_ANNOTATION.to_string(), name.clone());
            descriptor.annotations = Some(annotations);
        }
        self.manifest = Some(descriptor);
        Ok(())
    }

    /// Record the manifest in `index.json`, replacing an entry of the same name.
    pub(super) async fn finish(&mut self) -> Result<()> {
        let descriptor = self.manifest.take().ok_or_else(|| {
            ImageError::transport(&self.location, "commit", "no manifest written")
        })?;
        let map = |e: std::io::Error| ImageError::transport(&self.location, "commit", e);

        let mut index = if tokio::fs::metadata(self.root.join(INDEX_FILE)).await.is_ok() {
            read_index(&self.root, &self.location).await?
        } else {
            ManifestList::empty_index()
        };
        let name = self.reference.as_deref();
        index.manifests.retain(|d| d.ref_name() != name);
        index.manifests.push(descriptor);

        tokio::fs::write(self.root.join(LAYOUT_FILE), LAYOUT_CONTENT)
            .await
            .map_err(map)?;
        let tmp = self.root.join(format!("{}.tmp", INDEX_FILE));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&index)?)
            .await
            .map_err(map)?;
        tokio::fs::rename(&tmp, self.root.join(INDEX_FILE))
            .await
            .map_err(map)?;
        Ok(())
    }
}

struct LayoutDestination {
    writer: LayoutWriter,
}

#[async_trait]
impl ImageDestination for LayoutDestination {
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
        tracing::debug!(target = %self.writer.location, "OCI layout entry committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ImageManifest;
    use crate::platform::Platform;
    use tempfile::TempDir;

    fn oci_image(arch: &str) -> (Vec<u8>, Vec<u8>, RawManifest) {
        let config = format!(r#"{{"architecture":"{}","os":"linux"}}"#, arch).into_bytes();
        let layer = format!("layer-{}", arch).into_bytes();
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(media_types::OCI_MANIFEST.to_string()),
            config: Descriptor::for_blob(media_types::OCI_CONFIG, &config),
            layers: vec![Descriptor::for_blob(media_types::OCI_LAYER_GZIP, &layer)],
            annotations: None,
        };
        (config, layer, manifest.to_raw().unwrap())
    }

    async fn write(locator: &str, image: &(Vec<u8>, Vec<u8>, RawManifest)) {
        let (config, layer, raw) = image;
        let parsed = raw.parse_image().unwrap();
        let mut dest = OciLayoutTransport
            .open_destination(locator, &DestinationOptions::default())
            .await
            .unwrap();
        assert_eq!(dest.preferred_format(), Some(ManifestFormat::Oci));
        dest.put_blob(&parsed.config, config).await.unwrap();
        dest.put_blob(&parsed.layers[0], layer).await.unwrap();
        dest.put_manifest(raw).await.unwrap();
        dest.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_then_read_unnamed() {
        let tmp = TempDir::new().unwrap();
        let locator = tmp.path().join("layout").to_str().unwrap().to_string();
        let image = oci_image("amd64");
        write(&locator, &image).await;

        assert!(tmp.path().join("layout").join(LAYOUT_FILE).exists());
        let source = OciLayoutTransport.open_source(&locator).await.unwrap();
        assert_eq!(source.manifest(None).await.unwrap().bytes, image.2.bytes);
        let parsed = image.2.parse_image().unwrap();
        assert_eq!(source.blob(&parsed.config).await.unwrap(), image.0);
    }

    #[tokio::test]
    async fn test_named_entries_replace_same_name() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("layout").to_str().unwrap().to_string();
        write(&format!("{}:one", base), &oci_image("amd64")).await;
        write(&format!("{}:two", base), &oci_image("arm64")).await;
        write(&format!("{}:one", base), &oci_image("s390x")).await;

        let index = read_index(Path::new(&base), &base).await.unwrap();
        assert_eq!(index.manifests.len(), 2);

        let source = OciLayoutTransport
            .open_source(&format!("{}:one", base))
            .await
            .unwrap();
        let raw = source.manifest(None).await.unwrap();
        assert_eq!(raw.bytes, oci_image("s390x").2.bytes);

        let err = OciLayoutTransport.open_source(&base).await.err().unwrap();
        assert!(matches!(err, ImageError::Transport { .. }));
        assert!(OciLayoutTransport
            .open_source(&format!("{}:three", base))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_platform_entries_read_as_list() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let locator = root.to_str().unwrap().to_string();
        let mut index = ManifestList::empty_index();
        std::fs::create_dir_all(root.join("blobs").join("sha256")).unwrap();
        for arch in ["amd64", "arm64"] {
            let (_, _, raw) = oci_image(arch);
            std::fs::write(blob_path(&root, &raw.digest()), &raw.bytes).unwrap();
            let mut desc = Descriptor::for_blob(&raw.media_type, &raw.bytes);
            desc.platform = Some(Platform::new("linux", arch, None));
            index.manifests.push(desc);
        }
        std::fs::write(root.join(INDEX_FILE), serde_json::to_vec(&index).unwrap()).unwrap();

        let source = OciLayoutTransport.open_source(&locator).await.unwrap();
        let top = source.manifest(None).await.unwrap();
        assert!(top.is_list());

        let arm_digest = index.manifests[1].digest.clone();
        let arm = source.manifest(Some(&arm_digest)).await.unwrap();
        assert_eq!(arm.digest(), arm_digest);
    }

    #[tokio::test]
    async fn test_destination_over_file_fails() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        assert!(OciLayoutTransport
            .open_destination(file.to_str().unwrap(), &DestinationOptions::default())
            .await
            .is_err());
    }
}
