//! MIME type normalization and named groups

/// Type reported when a response carries no usable Content-Type
pub const DEFAULT_MIMETYPE: &str = "application/octet-stream";

/// Named groups of MIME types usable in `mime_group` rules
///
/// A group also matches any type whose top-level part equals the group
/// name, so `image` matches `image/png` without being listed here.
pub const GROUPS: &[(&str, &[&str])] = &[
    ("web", &["text/html", "application/xhtml+xml", "text/css"]),
    (
        "documents",
        &[
            "application/pdf",
            "application/msword",
            "application/rtf",
            "application/vnd.oasis.opendocument.text",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            "application/vnd.ms-excel",
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            "application/vnd.ms-powerpoint",
            "application/vnd.openxmlformats-officedocument.presentationml.presentation",
            "text/plain",
            "text/csv",
        ],
    ),
    (
        "archives",
        &[
            "application/zip",
            "application/gzip",
            "application/x-gzip",
            "application/x-tar",
            "application/x-7z-compressed",
            "application/x-rar-compressed",
            "application/x-bzip2",
        ],
    ),
    (
        "images",
        &[
            "image/png",
            "image/jpeg",
            "image/gif",
            "image/webp",
            "image/svg+xml",
            "image/tiff",
            "image/bmp",
        ],
    ),
    (
        "media",
        &[
            "audio/mpeg",
            "audio/ogg",
            "video/mp4",
            "video/mpeg",
            "video/webm",
            "video/quicktime",
        ],
    ),
    ("assets", &["text/css", "application/javascript", "text/javascript"]),
    ("data", &["application/json", "application/xml", "text/xml"]),
];

/// Normalizes a Content-Type header value to a bare, lowercase MIME type
///
/// Parameters such as `charset` are dropped. Missing or malformed values
/// become [`DEFAULT_MIMETYPE`].
///
/// ```
/// use sumi_pipeline::rules::normalize_mimetype;
///
/// assert_eq!(normalize_mimetype(Some("Text/HTML; charset=utf-8")), "text/html");
/// assert_eq!(normalize_mimetype(None), "application/octet-stream");
/// ```
pub fn normalize_mimetype(value: Option<&str>) -> String {
    let Some(value) = value else {
        return DEFAULT_MIMETYPE.to_string();
    };
    let mime = value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();

    match mime.split_once('/') {
        Some((major, minor)) if !major.is_empty() && !minor.is_empty() => mime,
        _ => DEFAULT_MIMETYPE.to_string(),
    }
}

/// Checks whether a normalized MIME type belongs to a named group
pub fn in_group(group: &str, mime: &str) -> bool {
    if mime.starts_with(&format!("{}/", group)) {
        return true;
    }
    GROUPS
        .iter()
        .find(|(name, _)| *name == group)
        .map_or(false, |(_, members)| members.contains(&mime))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_parameters() {
        assert_eq!(
            normalize_mimetype(Some("application/PDF ; name=x.pdf")),
            "application/pdf"
        );
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert_eq!(normalize_mimetype(Some("")), DEFAULT_MIMETYPE);
        assert_eq!(normalize_mimetype(Some("html")), DEFAULT_MIMETYPE);
    }

    #[test]
    fn test_group_membership() {
        assert!(in_group("documents", "application/pdf"));
        assert!(in_group("image", "image/png"));
        assert!(in_group("images", "image/png"));
        assert!(!in_group("documents", "text/html"));
        assert!(!in_group("unknown", "text/html"));
    }
}
