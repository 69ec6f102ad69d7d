//! Named image references.
//!
//! Parses references like `docker.io/library/alpine:latest` into structured
//! components and derives the local names images are stored under.

use stevedore_core::error::{ImageError, Result};

/// Default registry when none is specified.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Registry used for names of images that did not come from a registry.
pub const LOCAL_REGISTRY: &str = "localhost";

/// Default tag when none is specified.
pub const DEFAULT_TAG: &str = "latest";

/// Parsed named image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedReference {
    /// Registry hostname (e.g., "quay.io", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "library/alpine")
    pub repository: String,
    /// Tag (e.g., "latest", "3.19")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl NamedReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `alpine` → docker.io/library/alpine:latest
    /// - `alpine:3.19` → docker.io/library/alpine:3.19
    /// - `myuser/myimage` → docker.io/myuser/myimage:latest
    /// - `quay.io/org/image:tag` → quay.io/org/image:tag
    /// - `quay.io/org/image@sha256:abc...` → quay.io/org/image@sha256:abc...
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ImageError::InvalidReference(
                "Empty image reference".to_string(),
            ));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = if let Some(at_pos) = reference.rfind('@') {
            let digest_part = &reference[at_pos + 1..];
            if !digest_part.contains(':') {
                return Err(ImageError::InvalidReference(format!(
                    "Invalid digest format in reference '{}': expected algorithm:hex",
                    reference
                )));
            }
            (&reference[..at_pos], Some(digest_part.to_string()))
        } else {
            (reference, None)
        };

        // Split tag on the last colon after the last slash
        let (name, tag) = if let Some(slash_pos) = name_tag.rfind('/') {
            let after_slash = &name_tag[slash_pos + 1..];
            if let Some(colon_pos) = after_slash.rfind(':') {
                let tag = &after_slash[colon_pos + 1..];
                let name = &name_tag[..slash_pos + 1 + colon_pos];
                (name.to_string(), Some(tag.to_string()))
            } else {
                (name_tag.to_string(), None)
            }
        } else if let Some(colon_pos) = name_tag.rfind(':') {
            let after_colon = &name_tag[colon_pos + 1..];
            if digest.is_none() && after_colon.chars().all(|c| c.is_ascii_digit()) {
                // Looks like registry:port with no repository
                (name_tag.to_string(), None)
            } else {
                (
                    name_tag[..colon_pos].to_string(),
                    Some(after_colon.to_string()),
                )
            }
        } else {
            (name_tag.to_string(), None)
        };

        if let Some(ref tag) = tag {
            if tag.is_empty() || !tag.chars().all(is_tag_char) {
                return Err(ImageError::InvalidReference(format!(
                    "Invalid tag '{}' in reference '{}'",
                    tag, reference
                )));
            }
        }
        if name.is_empty() || name.chars().any(|c| c.is_ascii_uppercase() || c.is_whitespace())
        {
            return Err(ImageError::InvalidReference(format!(
                "Invalid repository name in reference '{}'",
                reference
            )));
        }

        let (registry, repository) = Self::split_registry_repository(&name)?;

        // Apply default tag if no tag and no digest
        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(NamedReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        // The first component is a registry if it looks like a hostname
        if let Some(slash_pos) = name.find('/') {
            let first = &name[..slash_pos];
            if first.contains('.') || first.contains(':') || first == LOCAL_REGISTRY {
                let registry = first.to_string();
                let repo = name[slash_pos + 1..].to_string();
                if repo.is_empty() {
                    return Err(ImageError::InvalidReference(format!(
                        "Empty repository in reference '{}'",
                        name
                    )));
                }
                return Ok((registry, repo));
            }
        }

        // Single name like "alpine" → "library/alpine" on Docker Hub
        let repository = if name.contains('/') {
            name.to_string()
        } else {
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// `registry/repository` without tag or digest.
    pub fn repository_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.repository_name();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// Whether the reference lives in the local pseudo-registry.
    pub fn is_local(&self) -> bool {
        self.registry == LOCAL_REGISTRY
    }
}

impl std::fmt::Display for NamedReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

/// Canonical stored form of a name (`alpine` → `docker.io/library/alpine:latest`).
pub fn normalize_name(name: &str) -> Result<String> {
    Ok(NamedReference::parse(name)?.full_reference())
}

/// Names a store lookup for `name` should try, most specific first.
///
/// A short name also matches the same repository under `localhost/`.
pub fn lookup_candidates(name: &str) -> Vec<String> {
    let mut candidates = vec![name.to_string()];
    if let Ok(parsed) = NamedReference::parse(name) {
        let full = parsed.full_reference();
        if !candidates.contains(&full) {
            candidates.push(full);
        }
        let has_registry = name
            .split('/')
            .next()
            .map_or(false, |first| name.contains('/') && (first.contains('.') || first.contains(':') || first == LOCAL_REGISTRY));
        if !has_registry {
            let local = NamedReference {
                registry: LOCAL_REGISTRY.to_string(),
                repository: name_without_tag(name).to_string(),
                tag: parsed.tag.clone(),
                digest: parsed.digest.clone(),
            }
            .full_reference();
            if !candidates.contains(&local) {
                candidates.push(local);
            }
        }
    }
    candidates
}

/// Strip tag and digest from a short name.
fn name_without_tag(name: &str) -> &str {
    let name = name.split('@').next().unwrap_or(name);
    match name.rfind(':') {
        Some(colon) if !name[colon..].contains('/') => &name[..colon],
        _ => name,
    }
}

/// Local name for an image read from a filesystem path (`localhost/<path>:<tag>`).
pub fn local_name_for_path(path: &str, tag: Option<&str>) -> Result<String> {
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    let repository: String = trimmed
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if repository.is_empty() {
        return Err(ImageError::InvalidReference(format!(
            "cannot derive an image name from path '{}'",
            path
        )));
    }
    let tag = tag.unwrap_or(DEFAULT_TAG);
    if tag.is_empty() || !tag.chars().all(is_tag_char) {
        return Err(ImageError::InvalidReference(format!("Invalid tag '{}'", tag)));
    }
    Ok(format!("{}/{}:{}", LOCAL_REGISTRY, repository, tag))
}
