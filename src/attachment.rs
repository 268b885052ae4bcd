/// Placeholder content type that triggers a guess from the filename.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Types sent with `sendPhoto`. GIF would lose its animation and BMP renders
/// as a document, so both go through the generic document path.
const PHOTO_TYPES: [&str; 2] = ["image/jpeg", "image/png"];

const EXTENSION_TYPES: &[(&str, &str)] = &[
    ("avif", "image/avif"),
    ("bmp", "image/bmp"),
    ("css", "text/css; charset=utf-8"),
    ("csv", "text/csv; charset=utf-8"),
    ("doc", "application/msword"),
    ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ("eml", "message/rfc822"),
    ("gif", "image/gif"),
    ("gz", "application/gzip"),
    ("htm", "text/html; charset=utf-8"),
    ("html", "text/html; charset=utf-8"),
    ("ics", "text/calendar; charset=utf-8"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("js", "text/javascript; charset=utf-8"),
    ("json", "application/json"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
    ("ods", "application/vnd.oasis.opendocument.spreadsheet"),
    ("odt", "application/vnd.oasis.opendocument.text"),
    ("pdf", "application/pdf"),
    ("png", "image/png"),
    ("svg", "image/svg+xml"),
    ("tar", "application/x-tar"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("txt", "text/plain; charset=utf-8"),
    ("wasm", "application/wasm"),
    ("webp", "image/webp"),
    ("xls", "application/vnd.ms-excel"),
    ("xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
    ("xml", "text/xml; charset=utf-8"),
    ("zip", "application/zip"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Document,
    Photo,
}

/// Outcome of classifying one MIME part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Send(AttachmentKind),
    Discard,
}

impl Classification {
    pub fn action(&self) -> &'static str {
        match self {
            Classification::Send(_) => "sending...",
            Classification::Discard => "discarded",
        }
    }
}

/// Resolve the type used for classification and reporting.
///
/// A declared type is trusted verbatim; only the octet-stream placeholder is
/// replaced by a guess from the filename extension.
pub fn effective_content_type(declared: &str, filename: &str) -> String {
    if declared != OCTET_STREAM {
        return declared.to_string();
    }
    guess_from_extension(filename)
        .unwrap_or(OCTET_STREAM)
        .to_string()
}

fn guess_from_extension(filename: &str) -> Option<&'static str> {
    let (_, ext) = filename.rsplit_once('.')?;
    if ext.is_empty() || ext.contains('/') {
        return None;
    }
    let ext = ext.to_ascii_lowercase();
    EXTENSION_TYPES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
}

pub fn is_photo_type(content_type: &str) -> bool {
    PHOTO_TYPES.contains(&content_type)
}

/// Decide how a part is forwarded. Sizes are raw byte counts; a ceiling of
/// zero only admits empty content.
pub fn classify(
    content_type: &str,
    content_length: usize,
    max_photo_size: usize,
    max_document_size: usize,
) -> Classification {
    if is_photo_type(content_type) && content_length <= max_photo_size {
        Classification::Send(AttachmentKind::Photo)
    } else if content_length <= max_document_size {
        Classification::Send(AttachmentKind::Document)
    } else {
        Classification::Discard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_content_type() {
        assert_eq!(effective_content_type("image/png", "x.jpg"), "image/png");
        assert_eq!(effective_content_type(OCTET_STREAM, "photo.JPG"), "image/jpeg");
        assert_eq!(effective_content_type(OCTET_STREAM, "report.pdf"), "application/pdf");
        assert_eq!(effective_content_type(OCTET_STREAM, "blob"), OCTET_STREAM);
        assert_eq!(effective_content_type(OCTET_STREAM, "file.unknownext"), OCTET_STREAM);
    }

    #[test]
    fn test_photo_classification() {
        assert_eq!(
            classify("image/jpeg", 3, 1024, 1024),
            Classification::Send(AttachmentKind::Photo)
        );
        assert_eq!(
            classify("image/png", 1024, 1024, 0),
            Classification::Send(AttachmentKind::Photo)
        );
    }

    #[test]
    fn test_oversized_photo_falls_back_to_document() {
        assert_eq!(
            classify("image/jpeg", 2048, 1024, 4096),
            Classification::Send(AttachmentKind::Document)
        );
    }

    #[test]
    fn test_gif_and_bmp_are_documents() {
        assert_eq!(
            classify("image/gif", 10, 1024, 1024),
            Classification::Send(AttachmentKind::Document)
        );
        assert_eq!(
            classify("image/bmp", 10, 1024, 1024),
            Classification::Send(AttachmentKind::Document)
        );
    }

    #[test]
    fn test_zero_limits_discard() {
        assert_eq!(classify("image/jpeg", 3, 0, 0), Classification::Discard);
        assert_eq!(classify("text/plain", 2, 0, 0), Classification::Discard);
        assert_eq!(classify("text/plain", 2, 0, 1), Classification::Discard);
        assert_eq!(classify("text/plain", 0, 0, 0), Classification::Send(AttachmentKind::Document));
        assert_eq!(Classification::Discard.action(), "discarded");
    }
}
