//! Platform selection.
//!
//! Resolves a requested OS/architecture/variant (explicit or defaulted to
//! the host) against a manifest list, or checks it against the platform of a
//! single-platform image.

use serde::{Deserialize, Serialize};
use stevedore_core::error::{ImageError, Result};

use crate::manifest::ManifestList;

/// Platform of a concrete image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str, variant: Option<&str>) -> Self {
        Self {
            architecture: architecture.to_string(),
            os: os.to_string(),
            variant: variant.map(str::to_string),
        }
    }

    /// Platform of the executing host, in OCI vocabulary.
    pub fn host() -> Self {
        Self {
            architecture: normalize_arch(std::env::consts::ARCH).to_string(),
            os: normalize_os(std::env::consts::OS).to_string(),
            variant: None,
        }
    }

    /// Canonical (os, architecture, variant) triple used for comparisons.
    fn canonical(&self) -> (String, String, Option<String>) {
        let os = normalize_os(&self.os).to_string();
        let arch = normalize_arch(&self.architecture).to_string();
        let variant = normalize_variant(&arch, self.variant.as_deref());
        (os, arch, variant)
    }

    /// Whether two platforms denote the same target.
    pub fn matches(&self, other: &Platform) -> bool {
        self.canonical() == other.canonical()
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(ref variant) = self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

fn normalize_os(os: &str) -> &str {
    match os {
        "macos" => "darwin",
        other => other,
    }
}

fn normalize_arch(arch: &str) -> &str {
    match arch {
        "x86_64" | "x86-64" => "amd64",
        "aarch64" => "arm64",
        "i386" | "x86" => "386",
        other => other,
    }
}

fn normalize_variant(arch: &str, variant: Option<&str>) -> Option<String> {
    match (arch, variant) {
        ("arm64", Some("v8")) | ("arm64", Some("8")) => None,
        ("arm", None) => Some("v7".to_string()),
        (_, Some("")) | (_, None) => None,
        (_, Some(v)) => Some(v.to_string()),
    }
}

/// Requested platform; unset fields default to the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformSpec {
    pub os: Option<String>,
    pub architecture: Option<String>,
    pub variant: Option<String>,
}

impl PlatformSpec {
    pub fn new(os: Option<&str>, architecture: Option<&str>, variant: Option<&str>) -> Self {
        let set = |v: Option<&str>| v.filter(|s| !s.is_empty()).map(str::to_string);
        Self {
            os: set(os),
            architecture: set(architecture),
            variant: set(variant),
        }
    }

    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        self.os.is_none() && self.architecture.is_none() && self.variant.is_none()
    }

    /// Fill unset fields from the host platform.
    ///
    /// The host variant is only inherited when the architecture is the host's.
    pub fn resolve(&self) -> Platform {
        let host = Platform::host();
        let variant = match (&self.variant, &self.architecture) {
            (Some(v), _) => Some(v.clone()),
            (None, Some(_)) => None,
            (None, None) => host.variant.clone(),
        };
        Platform {
            architecture: self
                .architecture
                .clone()
                .unwrap_or(host.architecture),
            os: self.os.clone().unwrap_or(host.os),
            variant,
        }
    }

    /// Whether an explicitly set field contradicts `platform`.
    ///
    /// Unset fields never conflict.
    pub fn conflicts_with(&self, platform: &Platform) -> bool {
        let (os, arch, variant) = platform.canonical();
        if let Some(ref want) = self.os {
            if normalize_os(want) != os {
                return true;
            }
        }
        if let Some(ref want) = self.architecture {
            if normalize_arch(want) != arch {
                return true;
            }
            if self.variant.is_none() {
                return false;
            }
        }
        if let Some(ref want) = self.variant {
            let want_arch = self
                .architecture
                .as_deref()
                .map(normalize_arch)
                .unwrap_or(arch.as_str());
            if normalize_variant(want_arch, Some(want)) != variant {
                return true;
            }
        }
        false
    }
}

impl std::str::FromStr for PlatformSpec {
    type Err = ImageError;

    /// Parse `os[/arch[/variant]]`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(ImageError::InvalidReference(format!(
                "invalid platform '{}': expected os[/arch[/variant]]",
                s
            )));
        }
        Ok(Self::new(
            parts.first().copied(),
            parts.get(1).copied(),
            parts.get(2).copied(),
        ))
    }
}

/// Fetched artifact to negotiate against.
#[derive(Debug, Clone, Copy)]
pub enum ManifestArtifact<'a> {
    /// Single-platform manifest with the platform from its config
    Single {
        digest: &'a str,
        platform: &'a Platform,
    },
    /// Manifest list / image index
    List(&'a ManifestList),
}

/// Outcome of platform negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Digest of the selected single-platform manifest
    pub digest: String,
    /// Platform of the selected manifest
    pub platform: Platform,
    /// Single-platform image whose platform contradicts the request
    pub mismatch: bool,
}

/// Select the per-platform manifest matching `spec`.
///
/// List entries are checked in order and the first exact match wins, so the
/// result is deterministic for a given list. A single-platform manifest is
/// always selected; a conflict with an explicit request is flagged as a
/// mismatch for the caller to accept or reject.
pub fn negotiate(artifact: ManifestArtifact<'_>, spec: &PlatformSpec) -> Result<Negotiated> {
    match artifact {
        ManifestArtifact::Single { digest, platform } => Ok(Negotiated {
            digest: digest.to_string(),
            platform: platform.clone(),
            mismatch: spec.conflicts_with(platform),
        }),
        ManifestArtifact::List(list) => {
            let wanted = spec.resolve();
            let selected = list.manifests.iter().find(|entry| {
                entry
                    .platform
                    .as_ref()
                    .map_or(false, |p| p.matches(&wanted))
            });

            match selected {
                Some(entry) => {
                    tracing::debug!(
                        platform = %wanted,
                        digest = %entry.digest,
                        "Selected manifest list entry"
                    );
                    Ok(Negotiated {
                        digest: entry.digest.clone(),
                        platform: entry.platform.clone().unwrap_or(wanted),
                        mismatch: false,
                    })
                }
                None => {
                    let available: Vec<String> = list
                        .manifests
                        .iter()
                        .filter_map(|e| e.platform.as_ref().map(|p| p.to_string()))
                        .collect();
                    Err(ImageError::NoMatchingPlatform {
                        wanted: wanted.to_string(),
                        available: available.join(", "),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{media_types, Descriptor};

    fn entry(digest_byte: u8, platform: Option<Platform>) -> Descriptor {
        let mut desc = Descriptor::for_blob(media_types::OCI_MANIFEST, &[digest_byte]);
        desc.platform = platform;
        desc
    }

    fn list() -> ManifestList {
        ManifestList {
            schema_version: 2,
            media_type: Some(media_types::OCI_INDEX.to_string()),
            manifests: vec![
                entry(1, Some(Platform::new("linux", "amd64", None))),
                entry(2, Some(Platform::new("linux", "arm", Some("v6")))),
                entry(3, Some(Platform::new("linux", "arm", Some("v7")))),
                entry(4, Some(Platform::new("linux", "arm64", Some("v8")))),
                entry(5, None),
            ],
            annotations: None,
        }
    }

    #[test]
    fn test_host_platform_is_normalized() {
        let host = Platform::host();
        assert_ne!(host.architecture, "x86_64");
        assert_ne!(host.architecture, "aarch64");
    }

    #[test]
    fn test_arm64_variant_equivalence() {
        let a = Platform::new("linux", "arm64", None);
        let b = Platform::new("linux", "arm64", Some("v8"));
        let c = Platform::new("linux", "aarch64", None);
        assert!(a.matches(&b));
        assert!(a.matches(&c));
    }

    #[test]
    fn test_display() {
        assert_eq!(Platform::new("linux", "arm", Some("v7")).to_string(), "linux/arm/v7");
        assert_eq!(Platform::new("linux", "amd64", None).to_string(), "linux/amd64");
    }

    #[test]
    fn test_negotiate_explicit_arm64() {
        let list = list();
        let spec = PlatformSpec::new(Some("linux"), Some("arm64"), None);
        let result = negotiate(ManifestArtifact::List(&list), &spec).unwrap();
        assert_eq!(result.digest, list.manifests[3].digest);
        assert_eq!(result.platform.architecture, "arm64");
        assert!(!result.mismatch);
    }

    #[test]
    fn test_negotiate_arm_defaults_to_v7() {
        let list = list();
        let spec = PlatformSpec::new(Some("linux"), Some("arm"), None);
        let result = negotiate(ManifestArtifact::List(&list), &spec).unwrap();
        assert_eq!(result.digest, list.manifests[2].digest);
    }

    #[test]
    fn test_negotiate_explicit_variant() {
        let list = list();
        let spec = PlatformSpec::new(Some("linux"), Some("arm"), Some("v6"));
        let result = negotiate(ManifestArtifact::List(&list), &spec).unwrap();
        assert_eq!(result.digest, list.manifests[1].digest);
    }

    #[test]
    fn test_negotiate_is_deterministic() {
        let list = list();
        let spec = PlatformSpec::new(Some("linux"), Some("amd64"), None);
        let first = negotiate(ManifestArtifact::List(&list), &spec).unwrap();
        for _ in 0..5 {
            assert_eq!(negotiate(ManifestArtifact::List(&list), &spec).unwrap(), first);
        }
    }

    #[test]
    fn test_negotiate_no_match() {
        let list = list();
        let spec = PlatformSpec::new(Some("linux"), Some("s390x"), None);
        let err = negotiate(ManifestArtifact::List(&list), &spec).unwrap_err();
        match err {
            ImageError::NoMatchingPlatform { wanted, available } => {
                assert_eq!(wanted, "linux/s390x");
                assert!(available.contains("linux/arm64/v8"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_negotiate_single_soft_mismatch() {
        let platform = Platform::new("linux", "amd64", None);
        let spec = PlatformSpec::new(None, Some("arm64"), None);
        let result = negotiate(
            ManifestArtifact::Single {
                digest: "sha256:abc",
                platform: &platform,
            },
            &spec,
        )
        .unwrap();
        assert!(result.mismatch);
        assert_eq!(result.digest, "sha256:abc");
        assert_eq!(result.platform, platform);
    }

    #[test]
    fn test_negotiate_single_unset_fields_never_conflict() {
        let platform = Platform::new("linux", "s390x", None);
        let result = negotiate(
            ManifestArtifact::Single {
                digest: "sha256:abc",
                platform: &platform,
            },
            &PlatformSpec::default(),
        )
        .unwrap();
        assert!(!result.mismatch);
    }

    #[test]
    fn test_conflicts_with() {
        let arm64 = Platform::new("linux", "arm64", Some("v8"));
        assert!(!PlatformSpec::new(Some("linux"), None, None).conflicts_with(&arm64));
        assert!(!PlatformSpec::new(None, Some("aarch64"), None).conflicts_with(&arm64));
        assert!(PlatformSpec::new(Some("windows"), None, None).conflicts_with(&arm64));
        assert!(PlatformSpec::new(None, Some("amd64"), None).conflicts_with(&arm64));
        assert!(!PlatformSpec::new(None, Some("arm64"), Some("v8")).conflicts_with(&arm64));
    }

    #[test]
    fn test_resolve_fills_host() {
        let resolved = PlatformSpec::new(None, Some("arm64"), None).resolve();
        assert_eq!(resolved.architecture, "arm64");
        assert_eq!(resolved.os, Platform::host().os);
        assert_eq!(resolved.variant, None);
    }

    #[test]
    fn test_parse_spec() {
        let spec: PlatformSpec = "linux/arm/v7".parse().unwrap();
        assert_eq!(spec.os.as_deref(), Some("linux"));
        assert_eq!(spec.architecture.as_deref(), Some("arm"));
        assert_eq!(spec.variant.as_deref(), Some("v7"));

        let spec: PlatformSpec = "linux".parse().unwrap();
        assert!(spec.architecture.is_none());

        assert!("linux//v7".parse::<PlatformSpec>().is_err());
        assert!("a/b/c/d".parse::<PlatformSpec>().is_err());
    }

    #[test]
    fn test_empty_strings_are_unset() {
        let spec = PlatformSpec::new(Some(""), Some(""), None);
        assert!(spec.is_empty());
    }
}
