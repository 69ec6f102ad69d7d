//! Runtime facade.
//!
//! Owns the store, the transport registry and the per-identity pull locks,
//! and emits an `ImageEvent` for every completed image mutation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use stevedore_core::config::RuntimeConfig;
use stevedore_core::error::{ImageError, Result};
use stevedore_core::event::{events, EventEmitter, ImageEvent};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::catalog::{self, ListEntry, ListOptions};
use crate::locks::KeyedLocks;
use crate::pull::{ImagePuller, PullOptions, PullPolicy};
use crate::push::{ImagePusher, PushOptions, PushResult};
use crate::remove::{self, RemovalReport, RemoveOptions};
use crate::store::{ImageStore, StoredImage};
use crate::transport::{Transport, TransportResolver};

/// Detailed view of a stored image.
#[derive(Debug, Clone, Serialize)]
pub struct ImageInspect {
    pub id: String,
    pub names: Vec<String>,
    pub digest: String,
    pub manifest_media_type: String,
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    pub pulled: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
    pub layers: Vec<String>,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

/// Image lifecycle runtime.
pub struct Runtime {
    config: RuntimeConfig,
    store: Arc<ImageStore>,
    resolver: TransportResolver,
    locks: Arc<KeyedLocks>,
    events: EventEmitter,
}

impl Runtime {
    /// Open the store at `config.store_dir` with every built-in transport.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let store = Arc::new(ImageStore::new(&config.store_dir)?);
        let resolver = TransportResolver::standard(Arc::clone(&store), &config.registry);
        let events = EventEmitter::new(config.event_capacity);
        tracing::debug!(store = %config.store_dir.display(), "Runtime initialized");
        Ok(Self {
            config,
            store,
            resolver,
            locks: Arc::new(KeyedLocks::new()),
            events,
        })
    }

    /// Replace the transport registry.
    pub fn with_resolver(mut self, resolver: TransportResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Register `transport`, replacing the built-in one for its scheme.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.resolver = self.resolver.with_transport(transport);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ImageStore> {
        &self.store
    }

    /// Subscribe to image events.
    pub fn subscribe(&self) -> broadcast::Receiver<ImageEvent> {
        self.events.subscribe()
    }

    pub async fn pull(
        &self,
        ctx: &CancellationToken,
        location: &str,
        policy: PullPolicy,
        options: &PullOptions,
    ) -> Result<Vec<StoredImage>> {
        let puller = ImagePuller::new(
            Arc::clone(&self.store),
            self.resolver.clone(),
            Arc::clone(&self.locks),
            self.config.platform_mismatch,
        );
        let images = puller.pull(ctx, location, policy, options).await?;
        for image in &images {
            self.events.emit(ImageEvent::for_image(
                events::IMAGE_PULL,
                &image.id,
                Some(location),
            ));
        }
        Ok(images)
    }

    pub async fn push(
        &self,
        ctx: &CancellationToken,
        source: &str,
        destination: &str,
        options: &PushOptions,
    ) -> Result<PushResult> {
        let pusher = ImagePusher::new(Arc::clone(&self.store), self.resolver.clone());
        let result = pusher.push(ctx, source, destination, options).await?;
        self.events.emit(ImageEvent::for_image(
            events::IMAGE_PUSH,
            &result.source.id,
            Some(&result.destination),
        ));
        Ok(result)
    }

    pub async fn list_images(
        &self,
        ctx: &CancellationToken,
        names: Option<&[String]>,
        options: &ListOptions,
    ) -> Result<Vec<ListEntry>> {
        catalog::list_images(ctx, &self.store, names, options).await
    }

    pub async fn remove_images(
        &self,
        ctx: &CancellationToken,
        targets: Option<&[String]>,
        options: &RemoveOptions,
    ) -> (Vec<RemovalReport>, Vec<ImageError>) {
        let (reports, errors) = remove::remove_images(ctx, &self.store, targets, options).await;
        for report in reports.iter().filter(|r| r.error.is_none()) {
            if report.removed {
                self.events
                    .emit(ImageEvent::for_image(events::IMAGE_REMOVE, &report.id, None));
            } else {
                for name in &report.untagged {
                    self.events.emit(ImageEvent::for_image(
                        events::IMAGE_UNTAG,
                        &report.id,
                        Some(name),
                    ));
                }
            }
        }
        (reports, errors)
    }

    /// Resolve a name, ID or ID prefix.
    pub async fn lookup_image(&self, name_or_id: &str) -> Result<StoredImage> {
        self.store
            .lookup(name_or_id)
            .await
            .ok_or_else(|| ImageError::ImageNotFound(name_or_id.to_string()))
    }

    pub async fn inspect(&self, name_or_id: &str) -> Result<ImageInspect> {
        let image = self.lookup_image(name_or_id).await?;
        let config = self.store.image_config(&image.id).await?;
        Ok(ImageInspect {
            id: image.id,
            names: image.names,
            digest: image.digest,
            manifest_media_type: image.manifest_media_type,
            architecture: config.architecture.clone(),
            os: config.os.clone(),
            variant: config.variant.clone(),
            created: config.created_at(),
            pulled: image.pulled_at,
            labels: image.labels,
            layers: image.layers,
            size_bytes: image.size_bytes,
            parent_id: image.parent_id,
        })
    }

    /// Add `name` to an image; the name moves if another image holds it.
    pub async fn tag_image(&self, name_or_id: &str, name: &str) -> Result<StoredImage> {
        let image = self.lookup_image(name_or_id).await?;
        let tagged = self.store.tag(&image.id, name).await?;
        self.events
            .emit(ImageEvent::for_image(events::IMAGE_TAG, &tagged.id, Some(name)));
        Ok(tagged)
    }

    pub async fn untag_image(&self, name_or_id: &str, name: &str) -> Result<StoredImage> {
        let image = self.lookup_image(name_or_id).await?;
        let untagged = self.store.untag(&image.id, name).await?;
        self.events.emit(ImageEvent::for_image(
            events::IMAGE_UNTAG,
            &untagged.id,
            Some(name),
        ));
        Ok(untagged)
    }
}
