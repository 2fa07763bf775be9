// src/path.rs
//
// Canonical form of user-supplied paths. Every key that reaches a store has been through here.
//
// Root is the empty string; "/" and "" normalize to it. Keys never carry a leading or trailing
// slash and never contain empty segments.

use crate::constants::MAX_SEGMENT_LEN;
use crate::error::{Result, StorageError};

/// Characters the upload boundary refuses in file names (besides control characters).
const FORBIDDEN_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Canonicalize `path`: strip leading/trailing slashes, collapse slash runs.
///
/// Fails with `InvalidPath` for segments containing control characters, segments longer than
/// 200 characters, and `.`/`..` segments. Idempotent.
pub fn normalize(path: &str) -> Result<String> {
    let mut out = String::with_capacity(path.len());
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        validate_segment(path, segment)?;
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(segment);
    }
    Ok(out)
}

fn validate_segment(path: &str, segment: &str) -> Result<()> {
    if segment.chars().any(char::is_control) {
        return Err(StorageError::invalid_path(
            path,
            "segment contains control characters",
        ));
    }
    if segment.chars().count() > MAX_SEGMENT_LEN {
        return Err(StorageError::invalid_path(
            path,
            format!("segment exceeds {MAX_SEGMENT_LEN} characters"),
        ));
    }
    if segment == "." || segment == ".." {
        return Err(StorageError::invalid_path(
            path,
            "relative segments are not allowed",
        ));
    }
    Ok(())
}

/// `join("a", "b") == "a/b"`, `join("", "b") == "b"`.
pub fn join(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of a normalized path. The root is its own parent.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Last segment of a normalized path (empty for the root).
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Listing prefix for a normalized directory path: "" for the root, "dir/" otherwise.
pub fn dir_prefix(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!("{path}/")
    }
}

/// True when `path` equals `ancestor` or lies below it. Both must be normalized.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor.is_empty() {
        return true;
    }
    path == ancestor
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'/')
}

/// Check an uploaded file name before it becomes the last segment of a key.
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StorageError::invalid_path(name, "file name is empty"));
    }
    if name.chars().count() > MAX_SEGMENT_LEN {
        return Err(StorageError::invalid_path(
            name,
            format!("file name exceeds {MAX_SEGMENT_LEN} characters"),
        ));
    }
    if name
        .chars()
        .any(|c| c.is_control() || FORBIDDEN_NAME_CHARS.contains(&c))
    {
        return Err(StorageError::invalid_path(
            name,
            "file name contains invalid characters",
        ));
    }
    if name == "." || name == ".." {
        return Err(StorageError::invalid_path(name, "file name is reserved"));
    }
    Ok(())
}
