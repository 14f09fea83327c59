//! Request validation
//!
//! Runs before any cache, lock or provider access. A rejected request has no
//! side effects.

use crate::error::ValidationError;
use crate::types::IdentifyOptions;

/// Default upload limit (10 MiB)
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Upper bound for `IdentifyOptions::max_results`
pub const MAX_RESULTS_LIMIT: usize = 50;

const SUPPORTED_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/webp",
    "image/heif",
    "image/avif",
];

/// Check an image and its options
pub fn validate_request(
    image: &[u8],
    options: &IdentifyOptions,
    max_image_bytes: usize,
) -> Result<(), ValidationError> {
    if image.is_empty() {
        return Err(ValidationError::EmptyImage);
    }

    if image.len() > max_image_bytes {
        return Err(ValidationError::ImageTooLarge {
            size: image.len(),
            max: max_image_bytes,
        });
    }

    match infer::get(image) {
        Some(kind) if SUPPORTED_MIME_TYPES.contains(&kind.mime_type()) => {}
        Some(kind) => {
            return Err(ValidationError::UnsupportedImageType(
                kind.mime_type().to_string(),
            ))
        }
        None => {
            return Err(ValidationError::UnsupportedImageType(
                "unrecognized content".to_string(),
            ))
        }
    }

    if let Some(max) = options.max_results {
        if max == 0 || max > MAX_RESULTS_LIMIT {
            return Err(ValidationError::InvalidOption(format!(
                "max_results must be between 1 and {}, got {}",
                MAX_RESULTS_LIMIT, max
            )));
        }
    }

    let language = options.language.trim();
    if !language.is_empty()
        && (!(2..=3).contains(&language.len())
            || !language.chars().all(|c| c.is_ascii_alphabetic()))
    {
        return Err(ValidationError::InvalidOption(format!(
            "language must be an ISO 639 code, got '{}'",
            language
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];
    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

    fn validate(image: &[u8], options: &IdentifyOptions) -> Result<(), ValidationError> {
        validate_request(image, options, DEFAULT_MAX_IMAGE_BYTES)
    }

    #[test]
    fn test_accepts_jpeg_and_png() {
        assert!(validate(JPEG, &IdentifyOptions::default()).is_ok());
        assert!(validate(PNG, &IdentifyOptions::default()).is_ok());
    }

    #[test]
    fn test_rejects_empty() {
        assert_eq!(
            validate(&[], &IdentifyOptions::default()),
            Err(ValidationError::EmptyImage)
        );
    }

    #[test]
    fn test_rejects_oversized() {
        let err = validate_request(JPEG, &IdentifyOptions::default(), 4).unwrap_err();
        assert_eq!(err, ValidationError::ImageTooLarge { size: JPEG.len(), max: 4 });
    }

    #[test]
    fn test_rejects_non_image() {
        let err = validate(b"%PDF-1.7 not a plant", &IdentifyOptions::default()).unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedImageType(_)));

        let err = validate(b"plain text", &IdentifyOptions::default()).unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedImageType(_)));
    }

    #[test]
    fn test_max_results_bounds() {
        for bad in [0, MAX_RESULTS_LIMIT + 1] {
            let options = IdentifyOptions {
                max_results: Some(bad),
                ..Default::default()
            };
            assert!(matches!(
                validate(JPEG, &options),
                Err(ValidationError::InvalidOption(_))
            ));
        }

        let options = IdentifyOptions {
            max_results: Some(MAX_RESULTS_LIMIT),
            ..Default::default()
        };
        assert!(validate(JPEG, &options).is_ok());
    }

    #[test]
    fn test_language_code() {
        let options = IdentifyOptions {
            language: "english-please".to_string(),
            ..Default::default()
        };
        assert!(validate(JPEG, &options).is_err());

        let options = IdentifyOptions {
            language: "DE".to_string(),
            ..Default::default()
        };
        assert!(validate(JPEG, &options).is_ok());
    }
}
