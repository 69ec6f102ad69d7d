//! `docker:` transport: container registries.
//!
//! Uses the `oci-distribution` crate to interact with container registries
//! (Docker Hub, GHCR, etc.). Manifests are fetched raw so manifest lists
//! reach the platform negotiator untouched.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer, PushResponse};
use oci_distribution::manifest::{OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use stevedore_core::config::RegistryConfig;
use stevedore_core::error::{ImageError, Result};

use super::{DestinationOptions, ImageDestination, ImageSource, Transport, TransportKind};
use crate::manifest::{media_types, Descriptor, ManifestFormat, RawManifest};
use crate::reference::NamedReference;

/// Manifest media types requested from registries.
const ACCEPTED_MANIFESTS: &[&str] = &[
    media_types::OCI_MANIFEST,
    media_types::OCI_INDEX,
    media_types::DOCKER_MANIFEST,
    media_types::DOCKER_MANIFEST_LIST,
];

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if not set.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();

        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    /// Credentials from the runtime config, falling back to env vars,
    /// then anonymous.
    pub fn from_config(config: &RegistryConfig) -> Self {
        match (&config.username, &config.password) {
            (Some(u), Some(p)) => Self::basic(u.clone(), p.clone()),
            _ => Self::from_env(),
        }
    }

    /// Convert to oci-distribution auth type.
    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Registry transport backed by a shared `oci-distribution` client.
pub struct RegistryTransport {
    client: Arc<Client>,
    auth: RegistryAuth,
}

impl RegistryTransport {
    pub fn new(config: &RegistryConfig) -> Self {
        let protocol = if config.insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let client_config = ClientConfig {
            protocol,
            ..Default::default()
        };
        Self {
            client: Arc::new(Client::new(client_config)),
            auth: RegistryAuth::from_config(config),
        }
    }
}

/// Convert a named reference to an oci-distribution Reference.
fn to_oci_reference(reference: &NamedReference) -> Result<Reference> {
    let ref_str = reference.full_reference();
    ref_str.parse::<Reference>().map_err(|e| {
        ImageError::InvalidReference(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}

/// Convert between our descriptor and the client's, which share a JSON shape.
fn to_oci_descriptor(descriptor: &Descriptor) -> Result<OciDescriptor> {
    Ok(serde_json::from_value(serde_json::to_value(descriptor)?)?)
}

#[async_trait]
impl Transport for RegistryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Docker
    }

    async fn open_source(&self, locator: &str) -> Result<Box<dyn ImageSource>> {
        let named = NamedReference::parse(locator)?;
        let reference = to_oci_reference(&named)?;
        tracing::info!(reference = %named, "Opening registry image");
        Ok(Box::new(RegistrySource {
            client: Arc::clone(&self.client),
            auth: self.auth.to_oci_auth(),
            location: named.to_string(),
            reference,
        }))
    }

    async fn open_destination(
        &self,
        locator: &str,
        _options: &DestinationOptions,
    ) -> Result<Box<dyn ImageDestination>> {
        let named = NamedReference::parse(locator)?;
        if named.tag.is_none() {
            return Err(ImageError::InvalidReference(format!(
                "cannot push to digest reference '{}'",
                named
            )));
        }
        let reference = to_oci_reference(&named)?;
        Ok(Box::new(RegistryDestination {
            client: Arc::clone(&self.client),
            auth: self.auth.to_oci_auth(),
            location: named.to_string(),
            reference,
            blobs: HashMap::new(),
            manifest: None,
        }))
    }
}

struct RegistrySource {
    client: Arc<Client>,
    auth: OciRegistryAuth,
    location: String,
    reference: Reference,
}

#[async_trait]
impl ImageSource for RegistrySource {
    async fn manifest(&self, digest: Option<&str>) -> Result<RawManifest> {
        let reference = match digest {
            None => self.reference.clone(),
            Some(d) => Reference::with_digest(
                self.reference.registry().to_string(),
                self.reference.repository().to_string(),
                d.to_string(),
            ),
        };
        let (bytes, digest) = self
            .client
            .pull_manifest_raw(&reference, &self.auth, ACCEPTED_MANIFESTS)
            .await
            .map_err(|e| ImageError::transport(&self.location, "pull manifest", e))?;
        tracing::debug!(reference = %reference, digest = %digest, "Fetched manifest");
        RawManifest::from_bytes(bytes.to_vec())
    }

    async fn blob(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let oci_descriptor = to_oci_descriptor(descriptor)?;
        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&self.reference, &oci_descriptor, &mut data)
            .await
            .map_err(|e| {
                ImageError::transport(
                    &self.location,
                    "pull blob",
                    format!("{}: {}", descriptor.digest, e),
                )
            })?;
        Ok(data)
    }

    fn reference_names(&self) -> Vec<String> {
        vec![self.location.clone()]
    }
}

/// Buffers the image and pushes it in one go on commit.
struct RegistryDestination {
    client: Arc<Client>,
    auth: OciRegistryAuth,
    location: String,
    reference: Reference,
    blobs: HashMap<String, Vec<u8>>,
    manifest: Option<RawManifest>,
}

#[async_trait]
impl ImageDestination for RegistryDestination {
    fn preferred_format(&self) -> Option<ManifestFormat> {
        None
    }

    async fn put_blob(&mut self, descriptor: &Descriptor, data: &[u8]) -> Result<()> {
        self.blobs.insert(descriptor.digest.clone(), data.to_vec());
        Ok(())
    }

    async fn put_manifest(&mut self, manifest: &RawManifest) -> Result<()> {
        self.manifest = Some(manifest.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let RegistryDestination {
            client,
            auth,
            location,
            reference,
            mut blobs,
            manifest,
        } = *self;
        let raw = manifest
            .ok_or_else(|| ImageError::transport(&location, "commit", "no manifest written"))?;
        let parsed = raw.parse_image()?;
        let oci_manifest: OciImageManifest = serde_json::from_slice(&raw.bytes)?;

        let mut take = |digest: &str| {
            blobs.remove(digest).ok_or_else(|| {
                ImageError::transport(&location, "commit", format!("blob {} not written", digest))
            })
        };
        let config = Config::new(
            take(&parsed.config.digest)?,
            parsed.config.media_type.clone(),
            None,
        );
        let mut layers = Vec::with_capacity(parsed.layers.len());
        for layer in &parsed.layers {
            layers.push(ImageLayer::new(
                take(&layer.digest)?,
                layer.media_type.clone(),
                None,
            ));
        }

        let response: PushResponse = client
            .push(&reference, &layers, config, &auth, Some(oci_manifest))
            .await
            .map_err(|e| ImageError::transport(&location, "push", e))?;

        tracing::info!(
            reference = %location,
            manifest_url = %response.manifest_url,
            "Image pushed successfully"
        );
        Ok(())
    }
}
