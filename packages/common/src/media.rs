//! Media type classification shared by the upload policy and the export engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Coarse file-type classes used by export filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TypeClass {
    Image,
    Video,
    Audio,
    Document,
}

const IMAGE_PATTERNS: &[&str] = &["image/%"];
const VIDEO_PATTERNS: &[&str] = &["video/%"];
const AUDIO_PATTERNS: &[&str] = &["audio/%"];
const DOCUMENT_PATTERNS: &[&str] = &[
    "application/pdf",
    "application/msword%",
    "application/vnd.openxmlformats%",
    "application/vnd.ms-excel%",
    "application/vnd.ms-powerpoint%",
    "application/vnd.oasis.opendocument%",
    "application/rtf",
    "text/plain",
];

impl TypeClass {
    pub const ALL: [TypeClass; 4] = [Self::Image, Self::Video, Self::Audio, Self::Document];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
        }
    }

    /// SQL `LIKE` patterns (with `%` as the only wildcard) whose disjunction defines the class.
    pub fn like_patterns(&self) -> &'static [&'static str] {
        match self {
            Self::Image => IMAGE_PATTERNS,
            Self::Video => VIDEO_PATTERNS,
            Self::Audio => AUDIO_PATTERNS,
            Self::Document => DOCUMENT_PATTERNS,
        }
    }

    /// In-memory equivalent of [`like_patterns`](Self::like_patterns).
    pub fn matches(&self, mime: &str) -> bool {
        let mime = mime.to_ascii_lowercase();
        self.like_patterns().iter().any(|pattern| {
            match pattern.strip_suffix('%') {
                Some(prefix) => mime.starts_with(prefix),
                None => mime == *pattern,
            }
        })
    }
}

impl fmt::Display for TypeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TypeClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" | "images" | "photo" | "photos" => Ok(Self::Image),
            "video" | "videos" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "document" | "documents" => Ok(Self::Document),
            other => Err(format!("unknown file type class '{other}'")),
        }
    }
}

/// Lower-cased extension of a file name, without the dot.
pub fn extension(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Best-effort media type guessed from the file name.
pub fn guess_mime(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

const PRECOMPRESSED_EXTENSIONS: &[&str] = &[
    "zip", "rar", "7z", "gz", "tgz", "bz2", "xz", "docx", "xlsx", "pptx", "odt", "ods", "odp",
];

/// Whether content is already compressed, so archiving should store it as-is.
pub fn is_precompressed(mime: &str, name: &str) -> bool {
    let mime = mime.to_ascii_lowercase();
    if mime.starts_with("image/") && mime != "image/bmp" && mime != "image/svg+xml" {
        return true;
    }
    if mime.starts_with("video/") || mime.starts_with("audio/") {
        return mime != "audio/wav" && mime != "audio/x-wav";
    }
    extension(name).is_some_and(|ext| PRECOMPRESSED_EXTENSIONS.contains(&ext.as_str()))
}
