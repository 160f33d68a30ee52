//! Helpers for `/`-separated store paths

use crate::Result;
use crate::SourceError;

pub const ROOT: &str = "/";

/// Check that `path` is absolute, has no empty segments and no trailing `/`
/// (except for the root itself).
pub fn validate_path(path: &str) -> Result<()> {
    if path == ROOT {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return Err(SourceError::InvalidPath(path.to_string()).into());
    }
    if path[1..].split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        return Err(SourceError::InvalidPath(path.to_string()).into());
    }
    Ok(())
}

/// Parent of `path`, `None` for the root
pub fn parent_path(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

pub fn join_path(
    parent: &str,
    name: &str,
) -> String {
    if parent == ROOT {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// `path` with the `root` prefix stripped
///
/// `/a/b/c` relative to `/a` is `/b/c`. The prefix is removed as written, so
/// below the store root `/a/b` becomes `a/b`. A path outside `root` is
/// returned unchanged.
pub fn relative_path<'a>(
    root: &str,
    path: &'a str,
) -> &'a str {
    if root == ROOT {
        return path.strip_prefix(ROOT).unwrap_or(path);
    }
    match path.strip_prefix(root) {
        Some(rest) if rest.starts_with('/') => rest,
        _ => path,
    }
}

/// Whether `path` is `root` or lives below it
pub fn is_within(
    root: &str,
    path: &str,
) -> bool {
    root == ROOT
        || path == root
        || path.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}
