//! Stevedore Runtime - image lifecycle engine.
//!
//! Moves container images between transports (registries, directories, OCI
//! layouts, OCI and Docker archives) and a local content-addressable store,
//! and answers list and batch-removal queries over that store.

#![allow(clippy::result_large_err)]

pub mod catalog;
pub mod copy;
pub mod digest;
pub mod locks;
pub mod manifest;
pub mod platform;
pub mod progress;
pub mod pull;
pub mod push;
pub mod reference;
pub mod remove;
pub mod runtime;
pub mod store;
pub mod transport;

// Re-export common types
pub use catalog::{Filter, ListData, ListEntry, ListOptions};
pub use manifest::{Descriptor, ManifestFormat, RawManifest};
pub use platform::{Platform, PlatformSpec};
pub use progress::ProgressWriter;
pub use pull::{ImagePuller, PullOptions, PullPolicy};
pub use push::{ImagePusher, PushOptions, PushResult};
pub use reference::NamedReference;
pub use remove::{RemovalReport, RemoveOptions};
pub use runtime::{ImageInspect, Runtime};
pub use store::{ImageStore, StoredImage};
pub use transport::{
    DestinationOptions, ImageDestination, ImageReference, ImageSource, Mode, Transport,
    TransportHandle, TransportKind, TransportResolver,
};

/// Stevedore runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
