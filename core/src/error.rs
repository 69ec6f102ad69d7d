use thiserror::Error;

/// Stevedore error types
#[derive(Error, Debug)]
pub enum ImageError {
    /// Location string names a transport that is not registered
    #[error("Unknown transport: \"{scheme}\"")]
    UnknownTransport { scheme: String },

    /// Transport exists but cannot be used in the requested direction
    #[error("Transport {transport} does not support {mode}")]
    UnsupportedMode { transport: String, mode: String },

    /// Location or image reference could not be parsed
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// No manifest-list entry matches the requested platform
    #[error("No image found in manifest list for platform {wanted} (available: {available})")]
    NoMatchingPlatform { wanted: String, available: String },

    /// Image platform conflicts with an explicitly requested one
    #[error("Platform mismatch: requested {wanted}, image is {actual}")]
    PlatformMismatch { wanted: String, actual: String },

    /// `never` pull policy and the image is not in the local store
    #[error("{0}: image not known locally and pull policy is \"never\"")]
    NotFoundLocally(String),

    /// Push source does not resolve to a stored image
    #[error("Source image not found: {0}")]
    SourceNotFound(String),

    /// Name or ID does not resolve to a stored image
    #[error("Image not known: {0}")]
    ImageNotFound(String),

    /// Blob or manifest content does not match its digest
    #[error("Corrupt image: {digest}: {message}")]
    CorruptImage { digest: String, message: String },

    /// Removal blocked by images that depend on this one
    #[error("Image {id} is still referenced by {by}")]
    StillReferenced { id: String, by: String },

    /// Failure reported by a transport, wrapped with operation context
    #[error("Transport error: {location} ({stage}): {message}")]
    Transport {
        location: String,
        stage: String,
        message: String,
    },

    /// Local image store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// List/remove filter could not be parsed
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Operation aborted through its cancellation token
    #[error("Operation canceled")]
    Canceled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ImageError {
    /// Wrap a collaborator failure with the location and stage it occurred in.
    pub fn transport(
        location: impl Into<String>,
        stage: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        ImageError::Transport {
            location: location.into(),
            stage: stage.into(),
            message: message.to_string(),
        }
    }

    /// Whether the error is the cancellation outcome rather than a failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ImageError::Canceled)
    }

    /// Whether the error reports content that failed digest verification.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, ImageError::CorruptImage { .. })
    }
}

impl From<serde_json::Error> for ImageError {
    fn from(err: serde_json::Error) -> Self {
        ImageError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ImageError {
    fn from(err: serde_yaml::Error) -> Self {
        ImageError::SerializationError(err.to_string())
    }
}

/// Result type alias for stevedore operations
pub type Result<T> = std::result::Result<T, ImageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_transport_display() {
        let error = ImageError::UnknownTransport {
            scheme: "bogus".to_string(),
        };
        assert_eq!(error.to_string(), "Unknown transport: \"bogus\"");
    }

    #[test]
    fn test_unsupported_mode_display() {
        let error = ImageError::UnsupportedMode {
            transport: "docker-archive".to_string(),
            mode: "write".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Transport docker-archive does not support write"
        );
    }

    #[test]
    fn test_no_matching_platform_display() {
        let error = ImageError::NoMatchingPlatform {
            wanted: "linux/s390x".to_string(),
            available: "linux/amd64, linux/arm64/v8".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "No image found in manifest list for platform linux/s390x (available: linux/amd64, linux/arm64/v8)"
        );
    }

    #[test]
    fn test_not_found_locally_display() {
        let error = ImageError::NotFoundLocally("docker.io/library/alpine:latest".to_string());
        assert_eq!(
            error.to_string(),
            "docker.io/library/alpine:latest: image not known locally and pull policy is \"never\""
        );
    }

    #[test]
    fn test_still_referenced_display() {
        let error = ImageError::StillReferenced {
            id: "abc".to_string(),
            by: "def".to_string(),
        };
        assert_eq!(error.to_string(), "Image abc is still referenced by def");
    }

    #[test]
    fn test_transport_helper() {
        let error = ImageError::transport("dir:/tmp/x", "open", "permission denied");
        assert_eq!(
            error.to_string(),
            "Transport error: dir:/tmp/x (open): permission denied"
        );
    }

    #[test]
    fn test_canceled_is_distinct() {
        assert!(ImageError::Canceled.is_canceled());
        assert!(!ImageError::Other("x".to_string()).is_canceled());
        let io: ImageError =
            std::io::Error::new(std::io::ErrorKind::Interrupted, "interrupted").into();
        assert!(!io.is_canceled());
    }

    #[test]
    fn test_is_corrupt() {
        let error = ImageError::CorruptImage {
            digest: "sha256:abc".to_string(),
            message: "digest mismatch".to_string(),
        };
        assert!(error.is_corrupt());
        assert!(!ImageError::Canceled.is_corrupt());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let image_error: ImageError = io_error.into();
        assert!(matches!(image_error, ImageError::Io(_)));
        assert!(image_error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ invalid");
        let image_error: ImageError = result.unwrap_err().into();
        assert!(matches!(image_error, ImageError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let image_error: ImageError = result.unwrap_err().into();
        assert!(matches!(image_error, ImageError::SerializationError(_)));
    }

    #[test]
    fn test_other_error_display() {
        let error = ImageError::Other("Unknown error occurred".to_string());
        assert_eq!(error.to_string(), "Unknown error occurred");
    }
}
