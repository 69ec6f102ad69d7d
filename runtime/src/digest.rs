//! Content digests (`sha256:<hex>`).

use sha2::{Digest, Sha256};
use stevedore_core::error::{ImageError, Result};

const SHA256_PREFIX: &str = "sha256:";

/// Compute the `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{}{}", SHA256_PREFIX, hex::encode(hasher.finalize()))
}

/// Hex part of a digest, with or without the algorithm prefix.
pub fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix(SHA256_PREFIX).unwrap_or(digest)
}

/// Check that a string is a well-formed sha256 digest.
pub fn validate(digest: &str) -> Result<()> {
    let hex_part = digest.strip_prefix(SHA256_PREFIX).ok_or_else(|| {
        ImageError::InvalidReference(format!("unsupported digest algorithm in '{}'", digest))
    })?;
    if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ImageError::InvalidReference(format!(
            "invalid sha256 digest '{}'",
            digest
        )));
    }
    Ok(())
}

/// Verify that `data` hashes to `expected`.
///
/// A mismatch is reported as `CorruptImage` so the pull pipeline can retry it.
pub fn verify(expected: &str, data: &[u8]) -> Result<()> {
    let actual = sha256_digest(data);
    if actual != expected {
        return Err(ImageError::CorruptImage {
            digest: expected.to_string(),
            message: format!("content hashes to {}", actual),
        });
    }
    Ok(())
}

/// Shortened digest for progress output (first 12 hex chars).
pub fn short(digest: &str) -> &str {
    let hex_part = digest_hex(digest);
    if hex_part.len() > 12 {
        &hex_part[..12]
    } else {
        hex_part
    }
}
