/// Maximum length of a single entry name, in characters.
pub const MAX_NAME_LEN: usize = 255;

/// Result of validating an entry name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilenameError {
    /// Name is empty or whitespace-only.
    Empty,
    /// Name contains path separators (`/` or `\`).
    ContainsPathSeparator,
    /// Name is `.` or `..`.
    PathTraversal,
    /// Name contains null bytes.
    NullByte,
    /// Name contains control characters (CR, LF, etc.).
    ControlCharacter,
    /// Name is longer than [`MAX_NAME_LEN`].
    TooLong,
}

impl FilenameError {
    /// Returns a human-readable error message.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Empty => "Name cannot be empty",
            Self::ContainsPathSeparator => "Invalid name: path separators are not allowed",
            Self::PathTraversal => "Invalid name: '.' and '..' are not allowed",
            Self::NullByte => "Invalid name: null bytes are not allowed",
            Self::ControlCharacter => "Invalid name: control characters are not allowed",
            Self::TooLong => "Invalid name: longer than 255 characters",
        }
    }
}

/// Validates a single file or folder name (no directory components allowed).
pub fn validate_entry_name(name: &str) -> Result<&str, FilenameError> {
    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err(FilenameError::Empty);
    }

    if trimmed.contains('\0') {
        return Err(FilenameError::NullByte);
    }

    // Reject ASCII control characters to prevent
    // HTTP header injection (e.g. CRLF in Content-Disposition).
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(FilenameError::ControlCharacter);
    }

    if trimmed.contains('/') || trimmed.contains('\\') {
        return Err(FilenameError::ContainsPathSeparator);
    }

    if trimmed == "." || trimmed == ".." {
        return Err(FilenameError::PathTraversal);
    }

    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(FilenameError::TooLong);
    }

    Ok(trimmed)
}

/// OS metadata and editor lock files that should never enter the archive.
pub fn is_system_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    matches!(lower.as_str(), "thumbs.db" | ".ds_store" | "desktop.ini")
        || lower.starts_with('~')
        || lower.ends_with(".tmp")
}

/// `photo.jpg` -> `photo (2).jpg` for `n = 2`; names without an extension get the suffix at the end.
pub fn with_suffix(name: &str, n: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            format!("{stem} ({n}).{ext}")
        }
        _ => format!("{name} ({n})"),
    }
}

/// First of `name`, `name (1)`, `name (2)`, ... for which `taken` returns false.
pub fn first_free_name(name: &str, mut taken: impl FnMut(&str) -> bool) -> String {
    if !taken(name) {
        return name.to_string();
    }
    let mut n = 1;
    loop {
        let candidate = with_suffix(name, n);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// `Content-Disposition` value with an ASCII fallback and an RFC 5987 `filename*`.
pub fn content_disposition(disposition: &str, filename: &str) -> String {
    let ascii_safe: String = filename
        .chars()
        .filter(|c| c.is_ascii_graphic() && !matches!(c, '"' | ';' | '\\'))
        .collect();
    let ascii_name = if ascii_safe.is_empty() {
        "download".to_string()
    } else {
        ascii_safe
    };

    let encoded: String = filename
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'!'
            | b'#'
            | b'$'
            | b'&'
            | b'+'
            | b'-'
            | b'.'
            | b'^'
            | b'_'
            | b'`'
            | b'|'
            | b'~' => (b as char).to_string(),
            _ => format!("%{b:02X}"),
        })
        .collect();

    format!("{disposition}; filename=\"{ascii_name}\"; filename*=UTF-8''{encoded}")
}
