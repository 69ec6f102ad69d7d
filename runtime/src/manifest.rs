//! Manifest, manifest-list and image-config documents.
//!
//! Docker schema 2 and OCI documents share one JSON shape and differ only in
//! media types, so a single set of types covers both. Converting between the
//! two formats rewrites media types; Docker to OCI additionally re-encodes the
//! image config into the OCI subset, which changes its digest.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};
use stevedore_core::error::{ImageError, Result};

use crate::digest;
use crate::platform::Platform;

/// Media type strings.
pub mod media_types {
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
    pub const OCI_LAYER_NONDISTRIBUTABLE_GZIP: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
    pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const DOCKER_FOREIGN_LAYER_GZIP: &str =
        "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
}

/// Annotation holding the reference name of an OCI layout entry.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    /// Always a well-formed `sha256:<hex>`; transports build file paths from it
    #[serde(deserialize_with = "deserialize_digest")]
    pub digest: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

fn deserialize_digest<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    digest::validate(&value).map_err(serde::de::Error::custom)?;
    Ok(value)
}

impl Descriptor {
    /// Descriptor for a blob held in memory.
    pub fn for_blob(media_type: &str, data: &[u8]) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest: digest::sha256_digest(data),
            size: data.len() as i64,
            urls: None,
            annotations: None,
            platform: None,
        }
    }

    /// Value of the OCI ref-name annotation.
    pub fn ref_name(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(REF_NAME_ANNOTATION))
            .map(String::as_str)
    }
}

/// Single-platform image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ImageManifest {
    /// Format implied by the manifest's media types.
    pub fn format(&self) -> ManifestFormat {
        match self.media_type.as_deref() {
            Some(media_types::DOCKER_MANIFEST) => ManifestFormat::Docker,
            Some(_) => ManifestFormat::Oci,
            None if self.config.media_type == media_types::DOCKER_CONFIG => {
                ManifestFormat::Docker
            }
            None => ManifestFormat::Oci,
        }
    }

    /// Serialize into a raw manifest.
    pub fn to_raw(&self) -> Result<RawManifest> {
        let media_type = self
            .media_type
            .clone()
            .unwrap_or_else(|| self.format().manifest_media_type().to_string());
        Ok(RawManifest::new(serde_json::to_vec(self)?, media_type))
    }
}

/// Manifest list (Docker) or image index (OCI, including layout `index.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ManifestList {
    /// Empty OCI index.
    pub fn empty_index() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(media_types::OCI_INDEX.to_string()),
            manifests: Vec::new(),
            annotations: None,
        }
    }

    /// Serialize into a raw manifest.
    pub fn to_raw(&self) -> Result<RawManifest> {
        let media_type = self
            .media_type
            .clone()
            .unwrap_or_else(|| media_types::OCI_INDEX.to_string());
        Ok(RawManifest::new(serde_json::to_vec(self)?, media_type))
    }
}

/// Parsed manifest document.
#[derive(Debug, Clone)]
pub enum ManifestDocument {
    Image(ImageManifest),
    List(ManifestList),
}

/// Manifest bytes exactly as read from or written to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawManifest {
    pub bytes: Vec<u8>,
    pub media_type: String,
}

impl RawManifest {
    pub fn new(bytes: Vec<u8>, media_type: impl Into<String>) -> Self {
        Self {
            bytes,
            media_type: media_type.into(),
        }
    }

    /// Build from bytes, taking the media type from the document itself.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let media_type = sniff_media_type(&bytes)?;
        Ok(Self { bytes, media_type })
    }

    /// Digest of the raw bytes.
    pub fn digest(&self) -> String {
        digest::sha256_digest(&self.bytes)
    }

    /// Whether the media type denotes a manifest list / index.
    pub fn is_list(&self) -> bool {
        self.media_type == media_types::OCI_INDEX
            || self.media_type == media_types::DOCKER_MANIFEST_LIST
    }

    /// Parse the document.
    pub fn parse(&self) -> Result<ManifestDocument> {
        if self.is_list() {
            Ok(ManifestDocument::List(serde_json::from_slice(&self.bytes)?))
        } else {
            Ok(ManifestDocument::Image(serde_json::from_slice(&self.bytes)?))
        }
    }

    /// Parse as a single-platform manifest, rejecting lists.
    pub fn parse_image(&self) -> Result<ImageManifest> {
        match self.parse()? {
            ManifestDocument::Image(m) => Ok(m),
            ManifestDocument::List(_) => Err(ImageError::Other(format!(
                "expected an image manifest, got {}",
                self.media_type
            ))),
        }
    }
}

/// Determine a manifest's media type from its JSON body.
fn sniff_media_type(bytes: &[u8]) -> Result<String> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Probe {
        media_type: Option<String>,
        manifests: Option<serde_json::Value>,
        config: Option<Descriptor>,
    }

    let probe: Probe = serde_json::from_slice(bytes)?;
    if let Some(media_type) = probe.media_type {
        return Ok(media_type);
    }
    if probe.manifests.is_some() {
        return Ok(media_types::OCI_INDEX.to_string());
    }
    match probe.config {
        Some(config) if config.media_type == media_types::DOCKER_CONFIG => {
            Ok(media_types::DOCKER_MANIFEST.to_string())
        }
        Some(_) => Ok(media_types::OCI_MANIFEST.to_string()),
        None => Err(ImageError::Other(
            "document is neither a manifest nor a manifest list".to_string(),
        )),
    }
}

/// Manifest encoding family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Docker,
    Oci,
}

impl ManifestFormat {
    pub fn manifest_media_type(self) -> &'static str {
        match self {
            Self::Docker => media_types::DOCKER_MANIFEST,
            Self::Oci => media_types::OCI_MANIFEST,
        }
    }

    pub fn config_media_type(self) -> &'static str {
        match self {
            Self::Docker => media_types::DOCKER_CONFIG,
            Self::Oci => media_types::OCI_CONFIG,
        }
    }

    fn layer_media_type(self, source: &str) -> Result<String> {
        use media_types::*;
        let converted = match (self, source) {
            (Self::Oci, DOCKER_LAYER) => OCI_LAYER,
            (Self::Oci, DOCKER_LAYER_GZIP) => OCI_LAYER_GZIP,
            (Self::Oci, DOCKER_FOREIGN_LAYER_GZIP) => OCI_LAYER_NONDISTRIBUTABLE_GZIP,
            (Self::Docker, OCI_LAYER) => DOCKER_LAYER,
            (Self::Docker, OCI_LAYER_GZIP) => DOCKER_LAYER_GZIP,
            (Self::Docker, OCI_LAYER_NONDISTRIBUTABLE_GZIP) => DOCKER_FOREIGN_LAYER_GZIP,
            (Self::Docker, OCI_LAYER_ZSTD) => {
                return Err(ImageError::Other(
                    "zstd-compressed layers cannot be stored in Docker format".to_string(),
                ))
            }
            (_, other) => other,
        };
        Ok(converted.to_string())
    }
}

impl std::fmt::Display for ManifestFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker schema 2"),
            Self::Oci => write!(f, "oci"),
        }
    }
}

/// Keys of the OCI image configuration.
const OCI_CONFIG_KEYS: &[&str] = &[
    "created",
    "author",
    "architecture",
    "os",
    "os.version",
    "os.features",
    "variant",
    "config",
    "rootfs",
    "history",
];

/// Keys of the OCI execution parameters (`config.config`).
const OCI_EXEC_KEYS: &[&str] = &[
    "User",
    "ExposedPorts",
    "Env",
    "Entrypoint",
    "Cmd",
    "Volumes",
    "WorkingDir",
    "Labels",
    "StopSignal",
    "ArgsEscaped",
];

/// Re-encode a Docker image config as an OCI image config.
fn to_oci_config(config: &[u8]) -> Result<Vec<u8>> {
    let value: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(config)?;
    let mut out = serde_json::Map::new();
    for (key, val) in value {
        if !OCI_CONFIG_KEYS.contains(&key.as_str()) || val.is_null() {
            continue;
        }
        if key == "config" {
            if let serde_json::Value::Object(exec) = val {
                let exec: serde_json::Map<_, _> = exec
                    .into_iter()
                    .filter(|(k, v)| OCI_EXEC_KEYS.contains(&k.as_str()) && !v.is_null())
                    .collect();
                out.insert(key, serde_json::Value::Object(exec));
            }
            continue;
        }
        out.insert(key, val);
    }
    Ok(serde_json::to_vec(&out)?)
}

/// Convert a manifest (and its config) to the target format.
///
/// Returns the converted manifest and the config bytes it references.
pub fn convert(
    manifest: &ImageManifest,
    config: &[u8],
    target: ManifestFormat,
) -> Result<(ImageManifest, Vec<u8>)> {
    if manifest.format() == target {
        return Ok((manifest.clone(), config.to_vec()));
    }

    let config_bytes = match target {
        ManifestFormat::Oci => to_oci_config(config)?,
        ManifestFormat::Docker => config.to_vec(),
    };

    let mut config_desc = Descriptor::for_blob(target.config_media_type(), &config_bytes);
    config_desc.annotations = manifest.config.annotations.clone();

    let layers = manifest
        .layers
        .iter()
        .map(|layer| {
            Ok(Descriptor {
                media_type: target.layer_media_type(&layer.media_type)?,
                ..layer.clone()
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let converted = ImageManifest {
        schema_version: 2,
        media_type: Some(target.manifest_media_type().to_string()),
        config: config_desc,
        layers,
        annotations: match target {
            ManifestFormat::Oci => manifest.annotations.clone(),
            ManifestFormat::Docker => None,
        },
    };
    Ok((converted, config_bytes))
}

/// Subset of the image configuration the runtime reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub config: Option<ExecConfig>,
}

/// Execution parameters of an image config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecConfig {
    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
}

impl ImageConfig {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Platform recorded in the config.
    pub fn platform(&self) -> Platform {
        Platform {
            architecture: self.architecture.clone(),
            os: self.os.clone(),
            variant: self.variant.clone(),
        }
    }

    /// Creation time, if present and well-formed.
    pub fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.created
            .as_deref()
            .and_then(|c| chrono::DateTime::parse_from_rfc3339(c).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
    }

    pub fn labels(&self) -> HashMap<String, String> {
        self.config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docker_config() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "created": "2024-01-27T00:30:56.150769546Z",
            "docker_version": "20.10.23",
            "container_config": {"Hostname": "abc"},
            "config": {"Env": ["PATH=/bin"], "Cmd": ["/bin/sh"], "Hostname": "", "Labels": {"a": "b"}},
            "rootfs": {"type": "layers", "diff_ids": ["sha256:1111"]}
        }))
        .unwrap()
    }

    fn docker_manifest(config: &[u8]) -> ImageManifest {
        ImageManifest {
            schema_version: 2,
            media_type: Some(media_types::DOCKER_MANIFEST.to_string()),
            config: Descriptor::for_blob(media_types::DOCKER_CONFIG, config),
            layers: vec![Descriptor::for_blob(media_types::DOCKER_LAYER_GZIP, b"layer")],
            annotations: None,
        }
    }

    #[test]
    fn test_format_detection() {
        let config = docker_config();
        let manifest = docker_manifest(&config);
        assert_eq!(manifest.format(), ManifestFormat::Docker);

        let mut oci = manifest.clone();
        oci.media_type = None;
        oci.config.media_type = media_types::OCI_CONFIG.to_string();
        assert_eq!(oci.format(), ManifestFormat::Oci);
    }

    #[test]
    fn test_docker_to_oci_changes_config_digest() {
        let config = docker_config();
        let manifest = docker_manifest(&config);
        let (converted, new_config) = convert(&manifest, &config, ManifestFormat::Oci).unwrap();

        assert_eq!(converted.media_type.as_deref(), Some(media_types::OCI_MANIFEST));
        assert_eq!(converted.config.media_type, media_types::OCI_CONFIG);
        assert_eq!(converted.layers[0].media_type, media_types::OCI_LAYER_GZIP);
        assert_eq!(converted.layers[0].digest, manifest.layers[0].digest);
        assert_ne!(converted.config.digest, manifest.config.digest);
        assert_eq!(converted.config.digest, digest::sha256_digest(&new_config));

        let value: serde_json::Value = serde_json::from_slice(&new_config).unwrap();
        assert!(value.get("docker_version").is_none());
        assert!(value.get("container_config").is_none());
        assert!(value["config"].get("Hostname").is_none());
        assert_eq!(value["config"]["Labels"]["a"], "b");
        assert_eq!(value["architecture"], "amd64");
    }

    #[test]
    fn test_oci_to_docker_keeps_config() {
        let config = docker_config();
        let (oci, oci_config) =
            convert(&docker_manifest(&config), &config, ManifestFormat::Oci).unwrap();
        let (docker, docker_config) = convert(&oci, &oci_config, ManifestFormat::Docker).unwrap();

        assert_eq!(docker.media_type.as_deref(), Some(media_types::DOCKER_MANIFEST));
        assert_eq!(docker.config.media_type, media_types::DOCKER_CONFIG);
        assert_eq!(docker.config.digest, oci.config.digest);
        assert_eq!(docker_config, oci_config);
        assert_eq!(docker.layers[0].media_type, media_types::DOCKER_LAYER_GZIP);
    }

    #[test]
    fn test_convert_same_format_is_identity() {
        let config = docker_config();
        let manifest = docker_manifest(&config);
        let (same, same_config) = convert(&manifest, &config, ManifestFormat::Docker).unwrap();
        assert_eq!(same, manifest);
        assert_eq!(same_config, config);
    }

    #[test]
    fn test_zstd_layer_cannot_become_docker() {
        let config = br#"{"architecture":"amd64","os":"linux"}"#;
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(media_types::OCI_MANIFEST.to_string()),
            config: Descriptor::for_blob(media_types::OCI_CONFIG, config),
            layers: vec![Descriptor::for_blob(media_types::OCI_LAYER_ZSTD, b"z")],
            annotations: None,
        };
        assert!(convert(&manifest, config, ManifestFormat::Docker).is_err());
    }

    #[test]
    fn test_raw_manifest_sniffing() {
        let config = docker_config();
        let mut manifest = docker_manifest(&config);
        manifest.media_type = None;
        let raw = RawManifest::from_bytes(serde_json::to_vec(&manifest).unwrap()).unwrap();
        assert_eq!(raw.media_type, media_types::DOCKER_MANIFEST);
        assert!(!raw.is_list());

        let index = br#"{"schemaVersion":2,"manifests":[]}"#.to_vec();
        let raw = RawManifest::from_bytes(index).unwrap();
        assert!(raw.is_list());
        assert!(matches!(raw.parse().unwrap(), ManifestDocument::List(_)));

        assert!(RawManifest::from_bytes(br#"{"foo":1}"#.to_vec()).is_err());
    }

    #[test]
    fn test_malformed_descriptor_digest_rejected() {
        let config = docker_config();
        let manifest = docker_manifest(&config);
        let good = serde_json::to_string(&manifest).unwrap();
        let bad = good.replace(&manifest.layers[0].digest, "sha256:../../etc/passwd");
        assert_ne!(good, bad);
        let raw = RawManifest::new(bad.into_bytes(), media_types::DOCKER_MANIFEST);
        assert!(raw.parse_image().is_err());

        let index = format!(
            r#"{{"schemaVersion":2,"manifests":[{{"mediaType":"{}","digest":"sha256:x/../y","size":1}}]}}"#,
            media_types::OCI_MANIFEST
        );
        let raw = RawManifest::new(index.into_bytes(), media_types::OCI_INDEX);
        assert!(raw.parse().is_err());
        assert!(RawManifest::new(good.into_bytes(), media_types::DOCKER_MANIFEST)
            .parse_image()
            .is_ok());
    }

    #[test]
    fn test_parse_image_rejects_list() {
        let raw = ManifestList::empty_index().to_raw().unwrap();
        assert!(raw.parse_image().is_err());
    }

    #[test]
    fn test_image_config_fields() {
        let config = ImageConfig::parse(&docker_config()).unwrap();
        assert_eq!(config.platform().architecture, "amd64");
        assert_eq!(config.labels().get("a").map(String::as_str), Some("b"));
        assert!(config.created_at().is_some());
    }

    #[test]
    fn test_image_config_null_labels() {
        let config =
            ImageConfig::parse(br#"{"architecture":"arm64","os":"linux","config":{"Labels":null}}"#)
                .unwrap();
        assert!(config.labels().is_empty());
        assert!(config.created_at().is_none());
    }

    #[test]
    fn test_ref_name_annotation() {
        let mut desc = Descriptor::for_blob(media_types::OCI_MANIFEST, b"{}");
        assert_eq!(desc.ref_name(), None);
        let mut annotations = BTreeMap::new();
        annotations.insert(REF_NAME_ANNOTATION.to_string(), "v1".to_string());
        desc.annotations = Some(annotations);
        assert_eq!(desc.ref_name(), Some("v1"));
    }
}
