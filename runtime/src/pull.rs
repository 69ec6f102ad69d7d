//! Pull pipeline.
//!
//! Resolves the location's transport, consults the local store according to
//! the pull policy and, when a fetch is needed, copies the image into a
//! staged store entry that is committed only once every blob has been
//! verified. Pulls of the same image identity are serialized.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use stevedore_core::config::MismatchPolicy;
use stevedore_core::error::{ImageError, Result};
use tokio_util::sync::CancellationToken;

use crate::copy::{cancellable, check_canceled, copy_resolved, resolve_manifest, ResolvedManifest};
use crate::locks::KeyedLocks;
use crate::platform::PlatformSpec;
use crate::progress::ProgressWriter;
use crate::store::{ImageStore, StoredImage};
use crate::transport::{ImageSource, Mode, TransportHandle, TransportKind, TransportResolver};

/// When a pull contacts the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    /// Always fetch, replacing or supplementing the local copy
    Always,
    /// Fetch only if the image is not stored locally
    #[default]
    Missing,
    /// Never fetch; fail if the image is not stored locally
    Never,
    /// Fetch if absent or if the source's digest differs from the local one
    NewerOrMissing,
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PullPolicy::Always => "always",
            PullPolicy::Missing => "missing",
            PullPolicy::Never => "never",
            PullPolicy::NewerOrMissing => "newer",
        };
        f.write_str(s)
    }
}

impl FromStr for PullPolicy {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(PullPolicy::Always),
            "missing" | "ifmissing" => Ok(PullPolicy::Missing),
            "never" => Ok(PullPolicy::Never),
            "newer" | "ifnewer" => Ok(PullPolicy::NewerOrMissing),
            other => Err(ImageError::ConfigError(format!(
                "unknown pull policy '{}': expected always, missing, never or newer",
                other
            ))),
        }
    }
}

/// Per-pull settings.
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// Requested platform; unset fields default to the host
    pub platform: PlatformSpec,
    /// Receives human-readable progress
    pub progress: ProgressWriter,
}

/// Pulls images into the local store.
pub struct ImagePuller {
    store: Arc<ImageStore>,
    resolver: TransportResolver,
    locks: Arc<KeyedLocks>,
    mismatch: MismatchPolicy,
}

impl ImagePuller {
    pub fn new(
        store: Arc<ImageStore>,
        resolver: TransportResolver,
        locks: Arc<KeyedLocks>,
        mismatch: MismatchPolicy,
    ) -> Self {
        Self {
            store,
            resolver,
            locks,
            mismatch,
        }
    }

    /// Pull `location` according to `policy`.
    ///
    /// Returns the stored image the location resolved to.
    pub async fn pull(
        &self,
        ctx: &CancellationToken,
        location: &str,
        policy: PullPolicy,
        options: &PullOptions,
    ) -> Result<Vec<StoredImage>> {
        check_canceled(ctx)?;
        let handle = self.resolver.resolve(location, Mode::Read)?;
        let local_name = handle.reference.local_name()?;

        let key = local_name
            .clone()
            .unwrap_or_else(|| handle.reference.to_string());
        let _guard = cancellable(ctx, async { Ok(self.locks.lock(&key).await) }).await?;

        let local = self.find_local(&handle, local_name.as_deref(), options).await;
        let local = match local {
            Some(image) => match self.store.verify(&image.id).await {
                Ok(()) => Some(image),
                Err(e) if e.is_corrupt() => {
                    if policy == PullPolicy::Never {
                        return Err(e);
                    }
                    tracing::warn!(id = %image.id, error = %e, "Discarding corrupt local image");
                    self.store.delete(&image.id, true).await?;
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        let mut prepared = None;
        match (policy, local) {
            (PullPolicy::Never, Some(image)) | (PullPolicy::Missing, Some(image)) => {
                tracing::info!(location, id = %image.id, policy = %policy, "Using local image");
                return Ok(vec![image]);
            }
            (PullPolicy::Never, None) => {
                return Err(ImageError::NotFoundLocally(location.to_string()));
            }
            (PullPolicy::NewerOrMissing, Some(image)) => {
                let source = cancellable(ctx, handle.open_source()).await?;
                options.progress.line("Getting image source signatures");
                let resolved =
                    resolve_manifest(ctx, source.as_ref(), &options.platform, self.mismatch)
                        .await?;
                if resolved.digest() == image.digest {
                    tracing::info!(location, id = %image.id, "Local image is up to date");
                    return Ok(vec![image]);
                }
                tracing::info!(
                    location,
                    local = %image.digest,
                    remote = %resolved.digest(),
                    "Source has a newer image"
                );
                prepared = Some((source, resolved));
            }
            _ => {}
        }

        let image = self
            .fetch(ctx, &handle, local_name, options, prepared)
            .await?;
        Ok(vec![image])
    }

    /// Stored image for the location's identity, ignoring one whose platform
    /// contradicts an explicitly requested field.
    async fn find_local(
        &self,
        handle: &TransportHandle,
        local_name: Option<&str>,
        options: &PullOptions,
    ) -> Option<StoredImage> {
        let image = match (local_name, handle.kind()) {
            (Some(name), _) => self.store.lookup(name).await,
            (None, TransportKind::ContainersStorage) => {
                self.store.lookup(&handle.reference.locator).await
            }
            (None, _) => None,
        }?;
        if options.platform.conflicts_with(&image.platform) {
            tracing::debug!(
                id = %image.id,
                platform = %image.platform,
                "Local image has a different platform"
            );
            return None;
        }
        Some(image)
    }

    /// Copy from the source into the store, retrying once on corrupt content.
    async fn fetch(
        &self,
        ctx: &CancellationToken,
        handle: &TransportHandle,
        local_name: Option<String>,
        options: &PullOptions,
        mut prepared: Option<(Box<dyn ImageSource>, ResolvedManifest)>,
    ) -> Result<StoredImage> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .fetch_once(ctx, handle, local_name.as_deref(), options, prepared.take())
                .await;
            match result {
                Err(e) if e.is_corrupt() && attempt == 1 => {
                    tracing::warn!(
                        location = %handle.reference,
                        error = %e,
                        "Corrupt image content, retrying pull"
                    );
                }
                other => return other,
            }
        }
    }

    async fn fetch_once(
        &self,
        ctx: &CancellationToken,
        handle: &TransportHandle,
        local_name: Option<&str>,
        options: &PullOptions,
        prepared: Option<(Box<dyn ImageSource>, ResolvedManifest)>,
    ) -> Result<StoredImage> {
        let (source, resolved) = match prepared {
            Some(prepared) => prepared,
            None => {
                let source = cancellable(ctx, handle.open_source()).await?;
                options.progress.line("Getting image source signatures");
                let resolved =
                    resolve_manifest(ctx, source.as_ref(), &options.platform, self.mismatch)
                        .await?;
                (source, resolved)
            }
        };

        tracing::info!(
            location = %handle.reference,
            digest = %resolved.digest(),
            platform = %resolved.platform,
            "Pulling image"
        );

        let mut staged = self.store.stage().await?;
        copy_resolved(ctx, source.as_ref(), &resolved, &mut staged, &options.progress).await?;
        check_canceled(ctx)?;

        let names: Vec<String> = match local_name {
            Some(name) => vec![name.to_string()],
            None if handle.kind() == TransportKind::ContainersStorage => Vec::new(),
            None => source.reference_names(),
        };
        let image = staged.commit_named(&names).await?;

        tracing::info!(location = %handle.reference, id = %image.id, "Image pulled");
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DirTransport;
    use tempfile::TempDir;

    #[test]
    fn test_pull_policy_parse_and_display() {
        for (text, policy) in [
            ("always", PullPolicy::Always),
            ("missing", PullPolicy::Missing),
            ("never", PullPolicy::Never),
            ("newer", PullPolicy::NewerOrMissing),
        ] {
            assert_eq!(text.parse::<PullPolicy>().unwrap(), policy);
            assert_eq!(policy.to_string(), text);
        }
        assert_eq!("Always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert!("sometimes".parse::<PullPolicy>().is_err());
        assert_eq!(PullPolicy::default(), PullPolicy::Missing);
    }

    fn puller(tmp: &TempDir) -> ImagePuller {
        let store = Arc::new(ImageStore::new(&tmp.path().join("store")).unwrap());
        let resolver = TransportResolver::empty().with_transport(Arc::new(DirTransport));
        ImagePuller::new(store, resolver, Arc::new(KeyedLocks::new()), MismatchPolicy::Warn)
    }

    #[tokio::test]
    async fn test_never_without_local_image() {
        let tmp = TempDir::new().unwrap();
        let puller = puller(&tmp);
        let location = format!("dir:{}", tmp.path().join("img").display());
        let err = puller
            .pull(&CancellationToken::new(), &location, PullPolicy::Never, &PullOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::NotFoundLocally(ref l) if l == &location));
    }

    #[tokio::test]
    async fn test_unknown_transport_rejected() {
        let tmp = TempDir::new().unwrap();
        let puller = puller(&tmp);
        let err = puller
            .pull(
                &CancellationToken::new(),
                "bogus:whatever",
                PullPolicy::Always,
                &PullOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::UnknownTransport { .. }));
    }

    #[tokio::test]
    async fn test_missing_source_is_transport_error() {
        let tmp = TempDir::new().unwrap();
        let puller = puller(&tmp);
        let location = format!("dir:{}", tmp.path().join("none").display());
        let err = puller
            .pull(&CancellationToken::new(), &location, PullPolicy::Missing, &PullOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::Transport { .. }));
        assert!(puller.store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_canceled_pull() {
        let tmp = TempDir::new().unwrap();
        let puller = puller(&tmp);
        let ctx = CancellationToken::new();
        ctx.cancel();
        let location = format!("dir:{}", tmp.path().join("img").display());
        let err = puller
            .pull(&ctx, &location, PullPolicy::Always, &PullOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_canceled());
    }
}
