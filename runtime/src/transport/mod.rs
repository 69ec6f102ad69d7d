//! Image transports.
//!
//! A location string `scheme:locator` names a transport and a place within
//! it. Each transport opens image sources (read) and image destinations
//! (write) that the copy engine moves manifests and blobs between.

mod archive;
mod dir;
mod layout;
mod registry;
mod resolver;
mod storage;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use stevedore_core::error::{ImageError, Result};

use crate::manifest::{Descriptor, ManifestFormat, RawManifest};
use crate::reference;

pub use archive::{DockerArchiveTransport, OciArchiveTransport};
pub use dir::DirTransport;
pub use layout::OciLayoutTransport;
pub use registry::{RegistryAuth, RegistryTransport};
pub use resolver::{TransportHandle, TransportResolver};
pub use storage::StorageTransport;

/// Known transport schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    Dir,
    Oci,
    OciArchive,
    DockerArchive,
    Docker,
    ContainersStorage,
}

impl TransportKind {
    pub const ALL: [TransportKind; 6] = [
        TransportKind::Dir,
        TransportKind::Oci,
        TransportKind::OciArchive,
        TransportKind::DockerArchive,
        TransportKind::Docker,
        TransportKind::ContainersStorage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Dir => "dir",
            TransportKind::Oci => "oci",
            TransportKind::OciArchive => "oci-archive",
            TransportKind::DockerArchive => "docker-archive",
            TransportKind::Docker => "docker",
            TransportKind::ContainersStorage => "containers-storage",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ImageError::UnknownTransport {
                scheme: s.to_string(),
            })
    }
}

/// Direction a transport is used in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Pull from the transport
    Read,
    /// Push to the transport
    Write,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Read => write!(f, "read"),
            Mode::Write => write!(f, "write"),
        }
    }
}

/// Parsed location: transport plus transport-specific locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub transport: TransportKind,
    pub locator: String,
}

impl ImageReference {
    /// Parse a location string.
    ///
    /// `docker://` locators have the `//` stripped. A location without a
    /// scheme (no colon, or a registry host before the first colon) is a
    /// registry reference.
    pub fn parse(location: &str) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() {
            return Err(ImageError::InvalidReference("empty location".to_string()));
        }

        let Some((scheme, rest)) = location.split_once(':') else {
            return Ok(Self::docker(location));
        };

        if is_bare_reference(scheme, rest) {
            return Ok(Self::docker(location));
        }

        let transport: TransportKind = scheme.parse()?;
        let locator = match transport {
            TransportKind::Docker => rest.trim_start_matches("//"),
            _ => rest,
        };
        if locator.is_empty() {
            return Err(ImageError::InvalidReference(format!(
                "empty locator in '{}'",
                location
            )));
        }
        Ok(Self {
            transport,
            locator: locator.to_string(),
        })
    }

    fn docker(locator: &str) -> Self {
        Self {
            transport: TransportKind::Docker,
            locator: locator.to_string(),
        }
    }

    /// Name the image is stored under locally, if derivable without I/O.
    pub fn local_name(&self) -> Result<Option<String>> {
        match self.transport {
            TransportKind::Docker => reference::normalize_name(&self.locator).map(Some),
            TransportKind::Dir => reference::local_name_for_path(&self.locator, None).map(Some),
            TransportKind::Oci | TransportKind::OciArchive => {
                let (path, tag) = split_path_reference(&self.locator);
                reference::local_name_for_path(path, tag).map(Some)
            }
            TransportKind::DockerArchive => match split_archive_reference(&self.locator).1 {
                Some(name) => reference::normalize_name(name).map(Some),
                None => Ok(None),
            },
            TransportKind::ContainersStorage => {
                if is_image_id(&self.locator) {
                    Ok(None)
                } else {
                    reference::normalize_name(&self.locator).map(Some)
                }
            }
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transport {
            TransportKind::Docker => write!(f, "docker://{}", self.locator),
            other => write!(f, "{}:{}", other, self.locator),
        }
    }
}

/// Whether `scheme:rest` is really a scheme-less registry reference.
fn is_bare_reference(scheme: &str, rest: &str) -> bool {
    if scheme.contains('/') || scheme.contains('.') {
        return true;
    }
    if TransportKind::from_str(scheme).is_ok() {
        return false;
    }
    // host:port/repository
    match rest.split_once('/') {
        Some((port, _)) => !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

/// Split `path[:reference]`; a colon followed by a slash belongs to the path.
pub fn split_path_reference(locator: &str) -> (&str, Option<&str>) {
    match locator.rfind(':') {
        Some(colon) if !locator[colon + 1..].contains('/') && colon > 0 => {
            let reference = &locator[colon + 1..];
            if reference.is_empty() {
                (&locator[..colon], None)
            } else {
                (&locator[..colon], Some(reference))
            }
        }
        _ => (locator, None),
    }
}

/// Split `path[:name]` for docker archives, whose names may contain slashes.
pub fn split_archive_reference(locator: &str) -> (&str, Option<&str>) {
    match locator.split_once(':') {
        Some((path, name)) if !path.is_empty() && !name.is_empty() => (path, Some(name)),
        Some((path, _)) if !path.is_empty() => (path, None),
        _ => (locator, None),
    }
}

/// Whether `s` is a full 64-character hex image ID.
pub fn is_image_id(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Options for opening a destination.
#[derive(Debug, Clone, Default)]
pub struct DestinationOptions {
    /// Name recorded when the locator carries none (e.g. docker-archive RepoTags)
    pub default_name: Option<String>,
}

/// A place images can be read from and written to.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether the transport can be used in `mode`.
    fn supports(&self, _mode: Mode) -> bool {
        true
    }

    async fn open_source(&self, locator: &str) -> Result<Box<dyn ImageSource>>;

    async fn open_destination(
        &self,
        locator: &str,
        options: &DestinationOptions,
    ) -> Result<Box<dyn ImageDestination>>;
}

/// Readable image.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Top-level manifest (`None`) or the manifest with the given digest.
    async fn manifest(&self, digest: Option<&str>) -> Result<RawManifest>;

    /// Blob content for a descriptor.
    async fn blob(&self, descriptor: &Descriptor) -> Result<Vec<u8>>;

    /// Names the image carries in the source, used to name it locally.
    fn reference_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Writable image.
///
/// Blobs are written before the manifest that references them; nothing is
/// visible at the destination until `commit` succeeds.
#[async_trait]
pub trait ImageDestination: Send {
    /// Manifest format the destination stores; `None` keeps the source's.
    fn preferred_format(&self) -> Option<ManifestFormat>;

    async fn put_blob(&mut self, descriptor: &Descriptor, data: &[u8]) -> Result<()>;

    async fn put_manifest(&mut self, manifest: &RawManifest) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
