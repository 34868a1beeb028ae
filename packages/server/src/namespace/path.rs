//! Virtual path normalisation.

use crate::error::AppError;

/// Split a virtual path into components.
///
/// Consecutive separators collapse; `.`, `..` and control characters are rejected.
/// Lookup stays case-sensitive.
pub fn components(path: &str) -> Result<Vec<&str>, AppError> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        if part.is_empty() {
            continue;
        }
        if part == "." || part == ".." {
            return Err(AppError::InvalidPath(format!(
                "Path component '{part}' is not allowed"
            )));
        }
        if part.chars().any(char::is_control) || part.contains('\\') {
            return Err(AppError::InvalidPath(
                "Path contains invalid characters".into(),
            ));
        }
        parts.push(part);
    }
    Ok(parts)
}

/// Canonical `/a/b/c` form of a path.
pub fn normalize(path: &str) -> Result<String, AppError> {
    let parts = components(path)?;
    Ok(format!("/{}", parts.join("/")))
}

/// Path of a child named `name` under a folder at `parent` (`None` for the root).
pub fn child_path(parent: Option<&str>, name: &str) -> String {
    match parent {
        Some(parent) if parent != "/" => format!("{}/{name}", parent.trim_end_matches('/')),
        _ => format!("/{name}"),
    }
}

/// Folder components of an upload's `relative_path`, e.g. `Album/Day 1`.
///
/// The path names folders only; batch uploads split the file name off beforehand.
pub fn relative_folders(relative_path: &str) -> Result<Vec<String>, AppError> {
    let unified = relative_path.replace('\\', "/");
    Ok(components(&unified)?
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect())
}
