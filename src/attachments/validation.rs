//! Attachment validation logic
//!
//! Checks incoming files against the MIME allow-list and size policy before
//! they enter the bucket, and coerces missing or generic MIME types from the
//! file extension.

use thiserror::Error;

/// Default size ceiling for non-media attachments.
pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024; // 10MB

/// Extensions coerced to a concrete text type when the host reports no MIME
/// type or a generic `application/octet-stream`.
const TEXT_EXTENSIONS: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("csv", "text/csv"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("html", "text/html"),
    ("rs", "text/plain"),
    ("py", "text/plain"),
    ("js", "text/plain"),
    ("ts", "text/plain"),
    ("toml", "text/plain"),
    ("yaml", "text/plain"),
    ("yml", "text/plain"),
    ("log", "text/plain"),
];

const BINARY_EXTENSIONS: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
    ("mp4", "video/mp4"),
    ("mov", "video/quicktime"),
    ("webm", "video/webm"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("pdf", "application/pdf"),
    (
        "xlsx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    ),
    ("xls", "application/vnd.ms-excel"),
    ("ods", "application/vnd.oasis.opendocument.spreadsheet"),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("file too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    #[error("empty file")]
    EmptyFile,

    #[error("no upload route for provider: {0}")]
    UploadUnavailable(String),
}

/// Resolve the effective MIME type for a file. The reported type wins when it
/// is concrete; missing or generic types fall back to the extension.
pub fn normalize_mime(name: &str, reported: Option<&str>) -> String {
    match reported {
        Some(mime) if !mime.is_empty() && mime != "application/octet-stream" => mime.to_string(),
        _ => {
            let ext = name
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_ascii_lowercase())
                .unwrap_or_default();
            TEXT_EXTENSIONS
                .iter()
                .chain(BINARY_EXTENSIONS)
                .find(|(e, _)| *e == ext)
                .map(|(_, mime)| mime.to_string())
                .unwrap_or_else(|| "application/octet-stream".to_string())
        }
    }
}

/// Media attachments are exempt from the default size ceiling; they are
/// routed to remote storage instead of being inlined.
pub fn is_media(mime: &str) -> bool {
    mime.starts_with("image/") || mime.starts_with("video/") || mime.starts_with("audio/")
}

pub fn is_supported(mime: &str) -> bool {
    is_media(mime)
        || mime.starts_with("text/")
        || mime == "application/json"
        || mime == "application/xml"
        || mime == "application/pdf"
        || super::convert::is_spreadsheet(mime)
}

/// Validate a file for attachment.
pub fn validate(mime: &str, size: u64, max_size: u64) -> Result<(), ValidationError> {
    if size == 0 {
        return Err(ValidationError::EmptyFile);
    }
    if !is_supported(mime) {
        return Err(ValidationError::UnsupportedType(mime.to_string()));
    }
    if !is_media(mime) && size > max_size {
        return Err(ValidationError::FileTooLarge {
            size,
            max: max_size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reported_concrete_mime_wins() {
        assert_eq!(normalize_mime("data.bin", Some("image/png")), "image/png");
    }

    #[test]
    fn test_generic_mime_coerced_from_extension() {
        assert_eq!(
            normalize_mime("notes.md", Some("application/octet-stream")),
            "text/markdown"
        );
        assert_eq!(normalize_mime("main.rs", None), "text/plain");
        assert_eq!(normalize_mime("clip.MP4", Some("")), "video/mp4");
    }

    #[test]
    fn test_unknown_extension_falls_back_to_octet_stream() {
        assert_eq!(normalize_mime("mystery.zzz", None), "application/octet-stream");
        assert_eq!(normalize_mime("no_extension", None), "application/octet-stream");
    }

    #[test]
    fn test_validate_size_ceiling() {
        assert!(validate("text/plain", MAX_FILE_SIZE, MAX_FILE_SIZE).is_ok());
        assert_eq!(
            validate("text/plain", MAX_FILE_SIZE + 1, MAX_FILE_SIZE),
            Err(ValidationError::FileTooLarge {
                size: MAX_FILE_SIZE + 1,
                max: MAX_FILE_SIZE,
            })
        );
    }

    #[test]
    fn test_media_exempt_from_size_ceiling() {
        assert!(validate("video/mp4", 500 * 1024 * 1024, MAX_FILE_SIZE).is_ok());
        assert!(validate("image/png", MAX_FILE_SIZE * 3, MAX_FILE_SIZE).is_ok());
    }

    #[test]
    fn test_validate_rejects_unsupported_and_empty() {
        assert_eq!(
            validate("application/x-msdownload", 10, MAX_FILE_SIZE),
            Err(ValidationError::UnsupportedType(
                "application/x-msdownload".to_string()
            ))
        );
        assert_eq!(validate("text/plain", 0, MAX_FILE_SIZE), Err(ValidationError::EmptyFile));
    }

    #[test]
    fn test_spreadsheets_are_supported() {
        assert!(is_supported(
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        ));
    }
}
