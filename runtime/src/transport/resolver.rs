//! Location → transport binding.

use std::collections::HashMap;
use std::sync::Arc;

use stevedore_core::config::RegistryConfig;
use stevedore_core::error::{ImageError, Result};

use super::{
    DestinationOptions, DirTransport, DockerArchiveTransport, ImageDestination, ImageReference,
    ImageSource, Mode, OciArchiveTransport, OciLayoutTransport, RegistryTransport,
    StorageTransport, Transport, TransportKind,
};
use crate::store::ImageStore;

/// Registered transports, keyed by scheme.
#[derive(Clone, Default)]
pub struct TransportResolver {
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
}

impl TransportResolver {
    /// Resolver with no transports registered.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Resolver with every built-in transport.
    pub fn standard(store: Arc<ImageStore>, registry: &RegistryConfig) -> Self {
        Self::empty()
            .with_transport(Arc::new(DirTransport))
            .with_transport(Arc::new(OciLayoutTransport))
            .with_transport(Arc::new(OciArchiveTransport))
            .with_transport(Arc::new(DockerArchiveTransport))
            .with_transport(Arc::new(RegistryTransport::new(registry)))
            .with_transport(Arc::new(StorageTransport::new(store)))
    }

    /// Register `transport`, replacing any previous binding for its scheme.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(transport.kind(), transport);
        self
    }

    /// Parse `location` and bind it to a transport usable in `mode`.
    ///
    /// Performs no I/O.
    pub fn resolve(&self, location: &str, mode: Mode) -> Result<TransportHandle> {
        let reference = ImageReference::parse(location)?;
        let transport = self
            .transports
            .get(&reference.transport)
            .cloned()
            .ok_or_else(|| ImageError::UnknownTransport {
                scheme: reference.transport.to_string(),
            })?;

        if !transport.supports(mode) {
            return Err(ImageError::UnsupportedMode {
                transport: reference.transport.to_string(),
                mode: mode.to_string(),
            });
        }

        tracing::debug!(location, transport = %reference.transport, %mode, "Resolved transport");
        Ok(TransportHandle {
            reference,
            transport,
        })
    }
}

/// Location bound to its transport.
#[derive(Clone)]
pub struct TransportHandle {
    pub reference: ImageReference,
    transport: Arc<dyn Transport>,
}

impl TransportHandle {
    pub fn kind(&self) -> TransportKind {
        self.reference.transport
    }

    pub async fn open_source(&self) -> Result<Box<dyn ImageSource>> {
        self.transport.open_source(&self.reference.locator).await
    }

    pub async fn open_destination(
        &self,
        options: &DestinationOptions,
    ) -> Result<Box<dyn ImageDestination>> {
        self.transport
            .open_destination(&self.reference.locator, options)
            .await
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("reference", &self.reference)
            .finish()
    }
}
