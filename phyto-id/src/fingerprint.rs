//! Request fingerprinting
//!
//! Derives the deterministic key shared by the result cache and the
//! distributed lock:
//! 1. SHA-256 of the raw image bytes
//! 2. SHA-256 of the normalized options (canonical JSON)
//!
//! Differing options never collide on the same cache or lock key.

use crate::types::IdentifyOptions;
use sha2::{Digest, Sha256};
use std::fmt;

/// Deterministic digest of image content plus request options
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    image_digest: String,
    options_digest: String,
}

impl Fingerprint {
    /// Compute the fingerprint of an image and its options
    ///
    /// Pure function: no I/O, same input always yields the same value.
    pub fn compute(image: &[u8], options: &IdentifyOptions) -> Self {
        let image_digest = format!("{:x}", Sha256::digest(image));

        let normalized = options.normalized();
        let mut hasher = Sha256::new();
        // Fixed field order keeps the encoding canonical
        hasher.update(if normalized.include_diseases { b"d1" } else { b"d0" });
        hasher.update(b"|organs=");
        for organ in &normalized.organs {
            hasher.update(organ.as_str().as_bytes());
            hasher.update(b",");
        }
        hasher.update(b"|lang=");
        hasher.update(normalized.language.as_bytes());
        hasher.update(b"|max=");
        if let Some(max) = normalized.max_results {
            hasher.update(max.to_string().as_bytes());
        }
        let options_digest = format!("{:x}", hasher.finalize());

        Self {
            image_digest,
            options_digest,
        }
    }

    /// Hex SHA-256 of the image content
    pub fn image_digest(&self) -> &str {
        &self.image_digest
    }

    /// Hex SHA-256 of the normalized options
    pub fn options_digest(&self) -> &str {
        &self.options_digest
    }

    /// Cache key for the merged result
    pub fn cache_key(&self, prefix: &str) -> String {
        format!("{}:result:{}", prefix, self)
    }

    /// Lock key guarding computation of the merged result
    pub fn lock_key(&self, prefix: &str) -> String {
        format!("{}:lock:{}", prefix, self)
    }
}

impl fmt::Display for Fingerprint {
    /// Full image digest plus the first 16 hex chars of the options digest
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.image_digest, &self.options_digest[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Organ;

    #[test]
    fn test_deterministic() {
        let options = IdentifyOptions::default();
        let a = Fingerprint::compute(b"image-bytes", &options);
        let b = Fingerprint::compute(b"image-bytes", &options);
        assert_eq!(a, b);
        assert_eq!(a.image_digest().len(), 64);
    }

    #[test]
    fn test_known_sha256() {
        let fp = Fingerprint::compute(b"", &IdentifyOptions::default());
        assert_eq!(
            fp.image_digest(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_options_change_key() {
        let plain = Fingerprint::compute(b"image", &IdentifyOptions::default());
        let diseases = Fingerprint::compute(
            b"image",
            &IdentifyOptions {
                include_diseases: true,
                ..Default::default()
            },
        );

        assert_eq!(plain.image_digest(), diseases.image_digest());
        assert_ne!(plain.cache_key("phyto"), diseases.cache_key("phyto"));
        assert_ne!(plain.lock_key("phyto"), diseases.lock_key("phyto"));
    }

    #[test]
    fn test_equivalent_options_share_key() {
        let a = Fingerprint::compute(
            b"image",
            &IdentifyOptions {
                organs: vec![Organ::Flower, Organ::Leaf],
                language: "EN".to_string(),
                ..Default::default()
            },
        );
        let b = Fingerprint::compute(
            b"image",
            &IdentifyOptions {
                organs: vec![Organ::Leaf, Organ::Flower, Organ::Leaf],
                language: "en".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_cache_and_lock_keys_differ() {
        let fp = Fingerprint::compute(b"image", &IdentifyOptions::default());
        let cache_key = fp.cache_key("phyto");
        let lock_key = fp.lock_key("phyto");
        assert!(cache_key.starts_with("phyto:result:"));
        assert!(lock_key.starts_with("phyto:lock:"));
        assert_ne!(cache_key, lock_key);
    }
}
