//! Shared fixtures for the runtime integration tests.
//!
//! `FixtureRegistry` stands in for the `docker` transport: it serves
//! manifest lists and blobs from memory and counts how often it is used, so
//! tests run offline and can assert on network access.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use stevedore_core::config::RuntimeConfig;
use stevedore_core::error::{ImageError, Result};
use stevedore_runtime::manifest::{media_types, Descriptor, ImageManifest, ManifestList, RawManifest};
use stevedore_runtime::platform::{Platform, PlatformSpec};
use stevedore_runtime::reference::normalize_name;
use stevedore_runtime::transport::{
    DestinationOptions, ImageDestination, ImageSource, Mode, Transport, TransportKind,
};
use stevedore_runtime::{PullOptions, Runtime};
use tempfile::TempDir;

pub const ALPINE: &str = "docker.io/library/alpine:latest";

#[derive(Clone, Default)]
struct Repository {
    top: Option<RawManifest>,
    manifests: HashMap<String, RawManifest>,
    blobs: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
struct RegistryState {
    repositories: Mutex<HashMap<String, Repository>>,
    opens: AtomicUsize,
    layer_fetches: AtomicUsize,
    corrupt_serves: AtomicUsize,
    stall: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

/// In-memory registry bound to the `docker` scheme.
#[derive(Clone, Default)]
pub struct FixtureRegistry {
    state: Arc<RegistryState>,
}

impl FixtureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a Docker manifest list with one image per architecture.
    ///
    /// `revision` changes every config, and thus every image ID.
    pub fn publish(&self, name: &str, arches: &[&str], revision: u32) {
        let mut repo = Repository::default();
        let mut list = ManifestList {
            schema_version: 2,
            media_type: Some(media_types::DOCKER_MANIFEST_LIST.to_string()),
            manifests: Vec::new(),
            annotations: None,
        };
        for arch in arches {
            let config = serde_json::to_vec(&serde_json::json!({
                "architecture": arch,
                "os": "linux",
                "created": "2024-01-01T00:00:00Z",
                "docker_version": "24.0.0",
                "config": {
                    "Cmd": ["/bin/sh"],
                    "Labels": {"revision": revision.to_string()}
                }
            }))
            .unwrap();
            let mut layer = vec![0x1f, 0x8b];
            layer.extend_from_slice(format!("{}-{}-layer", name, arch).as_bytes());

            let manifest = ImageManifest {
                schema_version: 2,
                media_type: Some(media_types::DOCKER_MANIFEST.to_string()),
                config: Descriptor::for_blob(media_types::DOCKER_CONFIG, &config),
                layers: vec![Descriptor::for_blob(media_types::DOCKER_LAYER_GZIP, &layer)],
                annotations: None,
            };
            repo.blobs.insert(manifest.config.digest.clone(), config);
            repo.blobs.insert(manifest.layers[0].digest.clone(), layer);
            let raw = manifest.to_raw().unwrap();
            let mut entry = Descriptor::for_blob(&raw.media_type, &raw.bytes);
            entry.platform = Some(Platform::new("linux", arch, None));
            list.manifests.push(entry);
            repo.manifests.insert(raw.digest(), raw);
        }
        repo.top = Some(list.to_raw().unwrap());
        self.state
            .repositories
            .lock()
            .insert(normalize_name(name).unwrap(), repo);
    }

    /// Publish a single-platform amd64 image built from `layers`.
    pub fn publish_layered(&self, name: &str, layers: &[&str]) {
        let config = serde_json::to_vec(&serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "created": "2024-01-01T00:00:00Z",
            "config": {"Labels": {"image": name}}
        }))
        .unwrap();
        let blobs: Vec<Vec<u8>> = layers
            .iter()
            .map(|l| {
                let mut layer = vec![0x1f, 0x8b];
                layer.extend_from_slice(l.as_bytes());
                layer
            })
            .collect();
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(media_types::DOCKER_MANIFEST.to_string()),
            config: Descriptor::for_blob(media_types::DOCKER_CONFIG, &config),
            layers: blobs
                .iter()
                .map(|b| Descriptor::for_blob(media_types::DOCKER_LAYER_GZIP, b))
                .collect(),
            annotations: None,
        };

        let mut repo = Repository::default();
        repo.blobs.insert(manifest.config.digest.clone(), config);
        for (desc, blob) in manifest.layers.iter().zip(blobs) {
            repo.blobs.insert(desc.digest.clone(), blob);
        }
        let raw = manifest.to_raw().unwrap();
        repo.manifests.insert(raw.digest(), raw.clone());
        repo.top = Some(raw);
        self.state
            .repositories
            .lock()
            .insert(normalize_name(name).unwrap(), repo);
    }

    /// Times a source was opened.
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Layer blobs served.
    pub fn layer_fetches(&self) -> usize {
        self.state.layer_fetches.load(Ordering::SeqCst)
    }

    /// Serve tampered content for the next `count` layer fetches.
    pub fn corrupt_next(&self, count: usize) {
        self.state.corrupt_serves.store(count, Ordering::SeqCst);
    }

    /// Make layer fetches hang until the caller gives up.
    pub fn stall(&self, stall: bool) {
        self.state.stall.store(stall, Ordering::SeqCst);
    }

    /// Delay every layer fetch.
    pub fn delay(&self, delay: Duration) {
        *self.state.delay.lock() = Some(delay);
    }
}

#[async_trait]
impl Transport for FixtureRegistry {
    fn kind(&self) -> TransportKind {
        TransportKind::Docker
    }

    fn supports(&self, mode: Mode) -> bool {
        mode == Mode::Read
    }

    async fn open_source(&self, locator: &str) -> Result<Box<dyn ImageSource>> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        let name = normalize_name(locator)?;
        let repo = self
            .state
            .repositories
            .lock()
            .get(&name)
            .cloned()
            .ok_or_else(|| ImageError::transport(locator, "open source", "manifest unknown"))?;
        Ok(Box::new(FixtureSource {
            repo,
            state: Arc::clone(&self.state),
        }))
    }

    async fn open_destination(
        &self,
        locator: &str,
        _options: &DestinationOptions,
    ) -> Result<Box<dyn ImageDestination>> {
        Err(ImageError::UnsupportedMode {
            transport: format!("docker ({})", locator),
            mode: Mode::Write.to_string(),
        })
    }
}

struct FixtureSource {
    repo: Repository,
    state: Arc<RegistryState>,
}

#[async_trait]
impl ImageSource for FixtureSource {
    async fn manifest(&self, digest: Option<&str>) -> Result<RawManifest> {
        let found = match digest {
            None => self.repo.top.clone(),
            Some(d) => self.repo.manifests.get(d).cloned(),
        };
        found.ok_or_else(|| ImageError::transport("fixture", "fetch manifest", "manifest unknown"))
    }

    async fn blob(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let data = self
            .repo
            .blobs
            .get(&descriptor.digest)
            .cloned()
            .ok_or_else(|| ImageError::transport("fixture", "fetch blob", "blob unknown"))?;
        if descriptor.media_type == media_types::DOCKER_CONFIG {
            return Ok(data);
        }

        self.state.layer_fetches.fetch_add(1, Ordering::SeqCst);
        if self.state.stall.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        let delay = *self.state.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let corrupt = self
            .state
            .corrupt_serves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if corrupt {
            return Ok(b"tampered".to_vec());
        }
        Ok(data)
    }
}

/// Runtime over a fresh store, with the fixture registry as `docker`.
pub fn runtime(tmp: &TempDir, registry: &FixtureRegistry) -> Runtime {
    Runtime::new(RuntimeConfig::with_store_dir(tmp.path().join("store")))
        .unwrap()
        .with_transport(Arc::new(registry.clone()))
}

/// Pull options selecting `arch` on linux.
pub fn arch(arch: &str) -> PullOptions {
    PullOptions {
        platform: PlatformSpec::new(Some("linux"), Some(arch), None),
        ..Default::default()
    }
}
