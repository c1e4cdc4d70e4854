use std::path::Path;

// MIME lookup via enum indices into a static table instead of a map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MimeType {
    Html = 0,
    Jpeg = 1,
    Css = 2,
    Javascript = 3,
    Json = 4,
    Pdf = 5,
    PlainText = 6,
    Gif = 7,
    Png = 8,
    Icon = 9,
    OctetStream = 10, // Default for unknown files
}

impl MimeType {
    const MIME_STRINGS: [&'static str; 11] = [
        "text/html",                 // Html
        "image/jpg",                 // Jpeg
        "text/css",                  // Css
        "application/javascript",    // Javascript
        "application/json",          // Json
        "application/pdf",           // Pdf
        "text/plain",                // PlainText
        "image/gif",                 // Gif
        "image/png",                 // Png
        "image/vnd.microsoft.icon",  // Icon
        "application/octet-stream",  // OctetStream
    ];

    pub fn as_str(self) -> &'static str {
        Self::MIME_STRINGS[self as usize]
    }
}

/// Map a file path to its MIME type by lowercased extension.
pub fn get_mime_type_enum(file_path: &Path) -> MimeType {
    if let Some(extension) = file_path.extension().and_then(|s| s.to_str()) {
        match extension.to_ascii_lowercase().as_str() {
            "html" | "htm" => MimeType::Html,
            "jpg" | "jpeg" => MimeType::Jpeg,
            "css" => MimeType::Css,
            "js" => MimeType::Javascript,
            "json" => MimeType::Json,
            "pdf" => MimeType::Pdf,
            "txt" => MimeType::PlainText,
            "gif" => MimeType::Gif,
            "png" => MimeType::Png,
            "ico" => MimeType::Icon,
            _ => MimeType::OctetStream,
        }
    } else {
        MimeType::OctetStream
    }
}

// String-based convenience wrapper.
pub fn get_mime_type(file_path: &str) -> &'static str {
    get_mime_type_enum(Path::new(file_path)).as_str()
}
