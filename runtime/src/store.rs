//! Disk-based content-addressable image store.
//!
//! Images live under `images/<id>/` (manifest plus `blobs/sha256/<hex>`),
//! where the ID is the hex digest of the image config. An in-memory index
//! backed by a persistent `index.json` file holds names, parents and the
//! rest of the per-image metadata.
//!
//! Writers stage content under `tmp/<uuid>/` and commit by renaming the
//! staging directory into place and then publishing the index entry, so a
//! reader never observes an image whose blobs are incomplete.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stevedore_core::error::{ImageError, Result};
use tokio::sync::RwLock;

use crate::digest;
use crate::manifest::{Descriptor, ImageConfig, ImageManifest, ManifestFormat, RawManifest};
use crate::platform::Platform;
use crate::reference;
use crate::transport::ImageDestination;

const INDEX_FILE: &str = "index.json";
const IMAGES_DIR: &str = "images";
const TMP_DIR: &str = "tmp";
const MANIFEST_FILE: &str = "manifest.json";

/// Shortest ID prefix accepted for lookups.
const MIN_ID_PREFIX: usize = 3;

/// Metadata for a stored image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredImage {
    /// Hex sha256 of the image config
    pub id: String,
    /// Names, in the order they were attached
    pub names: Vec<String>,
    /// Manifest digest (e.g., "sha256:abc123...")
    pub digest: String,
    /// Media type of the stored manifest
    pub manifest_media_type: String,
    /// Platform recorded in the image config
    pub platform: Platform,
    /// Creation time recorded in the image config
    pub created_at: Option<DateTime<Utc>>,
    /// When the image was committed to the store
    pub pulled_at: DateTime<Utc>,
    /// Image whose layers are the longest strict prefix of this one's
    pub parent_id: Option<String>,
    /// Layer digests, in manifest order
    pub layers: Vec<String>,
    /// Labels from the image config
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Total size of config and layers in bytes
    pub size_bytes: u64,
    /// Path to the image directory on disk
    #[serde(skip)]
    pub path: PathBuf,
}

impl StoredImage {
    /// Manifest format of the stored image.
    pub fn format(&self) -> ManifestFormat {
        if self.manifest_media_type == ManifestFormat::Docker.manifest_media_type() {
            ManifestFormat::Docker
        } else {
            ManifestFormat::Oci
        }
    }

    /// First 12 characters of the ID.
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }
}

/// Persistent index stored as JSON on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<StoredImage>,
}

/// Disk-based image store with an in-memory index.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct ImageStore {
    /// Root directory for image storage
    store_dir: PathBuf,
    /// In-memory index: id → StoredImage
    index: Arc<RwLock<BTreeMap<String, StoredImage>>>,
}

impl ImageStore {
    /// Open (or create) the store at `store_dir`.
    ///
    /// Loads any existing index from disk and discards staging directories
    /// left behind by interrupted writers.
    pub fn new(store_dir: &Path) -> Result<Self> {
        let create = |dir: PathBuf| {
            std::fs::create_dir_all(&dir).map_err(|e| {
                ImageError::Storage(format!(
                    "Failed to create image store directory {}: {}",
                    dir.display(),
                    e
                ))
            })
        };
        create(store_dir.join(IMAGES_DIR))?;

        let tmp = store_dir.join(TMP_DIR);
        if tmp.exists() {
            if let Err(e) = std::fs::remove_dir_all(&tmp) {
                tracing::warn!(path = %tmp.display(), error = %e, "Failed to sweep staging directory");
            }
        }
        create(tmp)?;

        let index = load_index(store_dir)?;
        Ok(Self {
            store_dir: store_dir.to_path_buf(),
            index: Arc::new(RwLock::new(index)),
        })
    }

    /// Get the store directory path.
    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    fn image_dir(&self, id: &str) -> PathBuf {
        self.store_dir.join(IMAGES_DIR).join(id)
    }

    /// Get a stored image by full ID.
    pub async fn get(&self, id: &str) -> Option<StoredImage> {
        self.index.read().await.get(id).cloned()
    }

    /// Resolve a name, full ID or unique ID prefix to a stored image.
    pub async fn lookup(&self, name_or_id: &str) -> Option<StoredImage> {
        let index = self.index.read().await;
        find_image(index.values(), name_or_id).cloned()
    }

    /// Point-in-time snapshot of every stored image, ordered by ID.
    pub async fn list(&self) -> Vec<StoredImage> {
        self.index.read().await.values().cloned().collect()
    }

    /// Start writing a new image.
    pub async fn stage(&self) -> Result<StagedImage> {
        let dir = self
            .store_dir
            .join(TMP_DIR)
            .join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(dir.join("blobs").join("sha256"))
            .await
            .map_err(|e| ImageError::Storage(format!("Failed to create staging directory: {}", e)))?;
        Ok(StagedImage {
            store: self.clone(),
            dir,
            manifest: None,
        })
    }

    /// Remove an image.
    ///
    /// Fails with `StillReferenced` while other images name it as parent,
    /// unless `force` is set. The check runs under the index write lock, so
    /// it reflects the store at the moment of deletion.
    pub async fn delete(&self, id: &str, force: bool) -> Result<StoredImage> {
        let mut index = self.index.write().await;
        if !index.contains_key(id) {
            return Err(ImageError::ImageNotFound(id.to_string()));
        }

        let children: Vec<String> = index
            .values()
            .filter(|img| img.parent_id.as_deref() == Some(id))
            .map(|img| img.id.clone())
            .collect();
        if !children.is_empty() && !force {
            return Err(ImageError::StillReferenced {
                id: id.to_string(),
                by: children.join(", "),
            });
        }

        let removed = index
            .remove(id)
            .ok_or_else(|| ImageError::ImageNotFound(id.to_string()))?;
        for child in &children {
            if let Some(image) = index.get_mut(child) {
                image.parent_id = None;
            }
        }
        if let Err(e) = save_index(&self.store_dir, &index).await {
            for child in &children {
                if let Some(image) = index.get_mut(child) {
                    image.parent_id = Some(id.to_string());
                }
            }
            index.insert(id.to_string(), removed);
            return Err(e);
        }
        drop(index);

        if let Err(e) = tokio::fs::remove_dir_all(&removed.path).await {
            tracing::warn!(id = %id, error = %e, "Failed to remove image directory");
        }
        tracing::debug!(id = %id, "Image deleted from store");
        Ok(removed)
    }

    /// Attach `name` to an image, detaching it from any other image.
    pub async fn tag(&self, id: &str, name: &str) -> Result<StoredImage> {
        let name = reference::normalize_name(name)?;
        let mut index = self.index.write().await;
        if !index.contains_key(id) {
            return Err(ImageError::ImageNotFound(id.to_string()));
        }
        attach_names(&mut index, id, std::slice::from_ref(&name));
        save_index(&self.store_dir, &index).await?;
        index
            .get(id)
            .cloned()
            .ok_or_else(|| ImageError::ImageNotFound(id.to_string()))
    }

    /// Detach `name` from an image.
    pub async fn untag(&self, id: &str, name: &str) -> Result<StoredImage> {
        let mut index = self.index.write().await;
        let image = index
            .get_mut(id)
            .ok_or_else(|| ImageError::ImageNotFound(id.to_string()))?;
        let candidates = reference::lookup_candidates(name);
        let position = image
            .names
            .iter()
            .position(|n| candidates.contains(n))
            .ok_or_else(|| {
                ImageError::ImageNotFound(format!("{}: not a name of image {}", name, id))
            })?;
        image.names.remove(position);
        let updated = image.clone();
        save_index(&self.store_dir, &index).await?;
        Ok(updated)
    }

    /// Read the stored manifest.
    pub async fn read_manifest(&self, id: &str) -> Result<RawManifest> {
        let image = self
            .get(id)
            .await
            .ok_or_else(|| ImageError::ImageNotFound(id.to_string()))?;
        let bytes = tokio::fs::read(image.path.join(MANIFEST_FILE))
            .await
            .map_err(|e| ImageError::Storage(format!("Failed to read manifest of {}: {}", id, e)))?;
        Ok(RawManifest::new(bytes, image.manifest_media_type))
    }

    /// Read a blob of a stored image.
    pub async fn read_blob(&self, id: &str, digest: &str) -> Result<Vec<u8>> {
        let path = self.image_dir(id).join(blob_rel_path(digest));
        tokio::fs::read(&path)
            .await
            .map_err(|e| ImageError::Storage(format!("Failed to read blob {}: {}", digest, e)))
    }

    /// Parsed image config of a stored image.
    pub async fn image_config(&self, id: &str) -> Result<ImageConfig> {
        let manifest = self.read_manifest(id).await?.parse_image()?;
        ImageConfig::parse(&self.read_blob(id, &manifest.config.digest).await?)
    }

    /// Re-hash manifest, config and layers of a stored image.
    pub async fn verify(&self, id: &str) -> Result<()> {
        let image = self
            .get(id)
            .await
            .ok_or_else(|| ImageError::ImageNotFound(id.to_string()))?;
        let corrupt = |digest: &str, message: String| ImageError::CorruptImage {
            digest: digest.to_string(),
            message,
        };

        let raw = tokio::fs::read(image.path.join(MANIFEST_FILE))
            .await
            .map_err(|e| corrupt(&image.digest, format!("manifest unreadable: {}", e)))?;
        digest::verify(&image.digest, &raw)?;
        let manifest: ImageManifest = serde_json::from_slice(&raw)?;

        for descriptor in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            let data = self
                .read_blob(id, &descriptor.digest)
                .await
                .map_err(|e| corrupt(&descriptor.digest, e.to_string()))?;
            digest::verify(&descriptor.digest, &data)?;
        }
        Ok(())
    }
}

fn blob_rel_path(digest: &str) -> PathBuf {
    Path::new("blobs")
        .join("sha256")
        .join(digest::digest_hex(digest))
}

/// Give `names` to image `id`, removing them from every other image.
fn attach_names(index: &mut BTreeMap<String, StoredImage>, id: &str, names: &[String]) {
    for image in index.values_mut() {
        if image.id != id {
            image.names.retain(|n| !names.contains(n));
        }
    }
    if let Some(image) = index.get_mut(id) {
        for name in names {
            if !image.names.contains(name) {
                image.names.push(name.clone());
            }
        }
    }
}

/// Stored image whose non-empty layer list is the longest strict prefix of `layers`.
fn find_parent(index: &BTreeMap<String, StoredImage>, layers: &[String]) -> Option<String> {
    index
        .values()
        .filter(|img| {
            !img.layers.is_empty()
                && img.layers.len() < layers.len()
                && layers.starts_with(&img.layers)
        })
        .max_by(|a, b| {
            a.layers
                .len()
                .cmp(&b.layers.len())
                .then_with(|| b.id.cmp(&a.id))
        })
        .map(|img| img.id.clone())
}

/// Load index from disk, keeping only images whose directories still exist.
fn load_index(store_dir: &Path) -> Result<BTreeMap<String, StoredImage>> {
    let index_path = store_dir.join(INDEX_FILE);
    let mut index = BTreeMap::new();
    if !index_path.exists() {
        return Ok(index);
    }

    let data = std::fs::read_to_string(&index_path).map_err(|e| {
        ImageError::Storage(format!(
            "Failed to read image store index {}: {}",
            index_path.display(),
            e
        ))
    })?;
    let store_index: StoreIndex = serde_json::from_str(&data)
        .map_err(|e| ImageError::Storage(format!("Failed to parse image store index: {}", e)))?;

    for mut image in store_index.images {
        image.path = store_dir.join(IMAGES_DIR).join(&image.id);
        if image.path.exists() {
            index.insert(image.id.clone(), image);
        }
    }
    Ok(index)
}

/// Persist the index via temp file + rename.
async fn save_index(store_dir: &Path, index: &BTreeMap<String, StoredImage>) -> Result<()> {
    let store_index = StoreIndex {
        images: index.values().cloned().collect(),
    };
    let data = serde_json::to_string_pretty(&store_index)?;
    let index_path = store_dir.join(INDEX_FILE);
    let tmp_path = store_dir.join(format!("{}.tmp", INDEX_FILE));

    tokio::fs::write(&tmp_path, data).await.map_err(|e| {
        ImageError::Storage(format!(
            "Failed to write image store index {}: {}",
            tmp_path.display(),
            e
        ))
    })?;
    tokio::fs::rename(&tmp_path, &index_path).await.map_err(|e| {
        ImageError::Storage(format!(
            "Failed to replace image store index {}: {}",
            index_path.display(),
            e
        ))
    })?;
    Ok(())
}

/// Image being written into the store.
///
/// Dropped without a successful commit, its staging directory is removed.
pub struct StagedImage {
    store: ImageStore,
    dir: PathBuf,
    manifest: Option<RawManifest>,
}

impl StagedImage {
    /// Publish the staged image under `names`.
    ///
    /// Committing an image whose ID is already stored only merges names.
    pub async fn commit_named(mut self, names: &[String]) -> Result<StoredImage> {
        let raw = self
            .manifest
            .take()
            .ok_or_else(|| ImageError::Storage("no manifest staged".to_string()))?;
        let manifest = raw.parse_image()?;
        let names = names
            .iter()
            .map(|n| reference::normalize_name(n))
            .collect::<Result<Vec<_>>>()?;

        let config_bytes = tokio::fs::read(self.dir.join(blob_rel_path(&manifest.config.digest)))
            .await
            .map_err(|e| ImageError::Storage(format!("config blob not staged: {}", e)))?;
        for layer in &manifest.layers {
            if tokio::fs::metadata(self.dir.join(blob_rel_path(&layer.digest)))
                .await
                .is_err()
            {
                return Err(ImageError::Storage(format!(
                    "layer {} not staged",
                    layer.digest
                )));
            }
        }
        let config = ImageConfig::parse(&config_bytes)?;
        let id = digest::digest_hex(&digest::sha256_digest(&config_bytes)).to_string();
        let layers: Vec<String> = manifest.layers.iter().map(|l| l.digest.clone()).collect();
        let size_bytes = std::iter::once(&manifest.config)
            .chain(manifest.layers.iter())
            .map(|d: &Descriptor| d.size.max(0) as u64)
            .sum();

        let store = self.store.clone();
        let mut index = store.index.write().await;

        if index.contains_key(&id) {
            attach_names(&mut index, &id, &names);
            save_index(&store.store_dir, &index).await?;
            tracing::debug!(id = %id, "Image already stored, names merged");
            return index
                .get(&id)
                .cloned()
                .ok_or_else(|| ImageError::ImageNotFound(id.clone()));
        }

        let target = store.image_dir(&id);
        if tokio::fs::metadata(&target).await.is_ok() {
            // Leftover of an image that never made it into the index
            tokio::fs::remove_dir_all(&target).await?;
        }
        tokio::fs::rename(&self.dir, &target)
            .await
            .map_err(|e| ImageError::Storage(format!("Failed to commit image {}: {}", id, e)))?;

        let image = StoredImage {
            id: id.clone(),
            names: Vec::new(),
            digest: raw.digest(),
            manifest_media_type: raw.media_type.clone(),
            platform: config.platform(),
            created_at: config.created_at(),
            pulled_at: Utc::now(),
            parent_id: find_parent(&index, &layers),
            layers,
            labels: config.labels().into_iter().collect(),
            size_bytes,
            path: target.clone(),
        };
        let previous_owners: Vec<(String, Vec<String>)> = index
            .values()
            .filter(|img| img.names.iter().any(|n| names.contains(n)))
            .map(|img| (img.id.clone(), img.names.clone()))
            .collect();
        index.insert(id.clone(), image);
        attach_names(&mut index, &id, &names);

        if let Err(e) = save_index(&store.store_dir, &index).await {
            index.remove(&id);
            for (owner, owner_names) in previous_owners {
                if let Some(img) = index.get_mut(&owner) {
                    img.names = owner_names;
                }
            }
            drop(index);
            let _ = tokio::fs::remove_dir_all(&target).await;
            return Err(e);
        }

        tracing::info!(id = %id, names = ?names, "Image committed to store");
        index
            .get(&id)
            .cloned()
            .ok_or_else(|| ImageError::ImageNotFound(id.clone()))
    }
}

impl Drop for StagedImage {
    fn drop(&mut self) {
        if self.dir.exists() {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }
}

#[async_trait]
impl ImageDestination for StagedImage {
    fn preferred_format(&self) -> Option<ManifestFormat> {
        None
    }

    async fn put_blob(&mut self, descriptor: &Descriptor, data: &[u8]) -> Result<()> {
        tokio::fs::write(self.dir.join(blob_rel_path(&descriptor.digest)), data)
            .await
            .map_err(|e| ImageError::Storage(format!("Failed to stage blob {}: {}", descriptor.digest, e)))
    }

    async fn put_manifest(&mut self, manifest: &RawManifest) -> Result<()> {
        tokio::fs::write(self.dir.join(MANIFEST_FILE), &manifest.bytes)
            .await
            .map_err(|e| ImageError::Storage(format!("Failed to stage manifest: {}", e)))?;
        self.manifest = Some(manifest.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        (*self).commit_named(&[]).await.map(|_| ())
    }
}

/// Resolve a name, full ID or unique ID prefix among `images`.
///
/// Full IDs win over names, names over prefixes.
pub fn find_image<'a, I>(images: I, name_or_id: &str) -> Option<&'a StoredImage>
where
    I: IntoIterator<Item = &'a StoredImage>,
    I::IntoIter: Clone,
{
    let images = images.into_iter();
    let needle = name_or_id.strip_prefix("sha256:").unwrap_or(name_or_id);
    if let Some(image) = images.clone().find(|img| img.id == needle) {
        return Some(image);
    }

    for candidate in reference::lookup_candidates(name_or_id) {
        if let Some(image) = images.clone().find(|img| img.names.contains(&candidate)) {
            return Some(image);
        }
    }

    if needle.len() >= MIN_ID_PREFIX && needle.chars().all(|c| c.is_ascii_hexdigit()) {
        let mut matches = images.filter(|img| img.id.starts_with(needle));
        if let (Some(image), None) = (matches.next(), matches.next()) {
            return Some(image);
        }
    }
    None
}

/// IDs of images that name each image as parent.
pub fn children_index(images: &[StoredImage]) -> BTreeMap<String, Vec<String>> {
    let known: HashSet<&str> = images.iter().map(|img| img.id.as_str()).collect();
    let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for image in images {
        if let Some(parent) = image.parent_id.as_deref().filter(|p| known.contains(p)) {
            children
                .entry(parent.to_string())
                .or_default()
                .push(image.id.clone());
        }
    }
    children
}
