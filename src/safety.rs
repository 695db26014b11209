//! Path-safety helpers.
//!
//! Consulted before any file is opened, moved, or written:
//! - `is_safe_path` keeps file access inside the configured storage roots
//! - `sanitize_filename` strips path components and reserved characters
//!   from names that came from the outside (email attachments, uploads)

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use tracing::warn;

/// Characters replaced by `_` in sanitized filenames.
const RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Normalize a path by resolving `.` and `..` components lexically (no filesystem access).
///
/// `canonicalize` only works on paths that exist, so destinations that are
/// about to be created have to be normalized without touching the disk.
pub fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Resolve a path to the form used for containment checks.
///
/// Existing paths are canonicalized. For paths that don't exist yet we walk up
/// to the nearest existing ancestor, canonicalize it, then re-append the tail,
/// so symlinked roots (e.g. `/var` → `/private/var`) compare correctly.
fn resolve_for_check(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        normalize_lexical(path)
    } else {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        normalize_lexical(&cwd.join(path))
    };

    if let Ok(canonical) = absolute.canonicalize() {
        return canonical;
    }

    let mut ancestor = absolute.as_path();
    let mut tail_parts: Vec<&OsStr> = Vec::new();
    loop {
        if ancestor.exists() {
            let mut result = ancestor
                .canonicalize()
                .unwrap_or_else(|_| ancestor.to_path_buf());
            for part in tail_parts.into_iter().rev() {
                result = result.join(part);
            }
            return result;
        }
        if let Some(name) = ancestor.file_name() {
            tail_parts.push(name);
        }
        match ancestor.parent() {
            Some(parent) if parent != ancestor => ancestor = parent,
            _ => return absolute,
        }
    }
}

/// Check that `path` lives inside one of `allowed_roots`.
pub fn is_safe_path<P: AsRef<Path>>(path: &Path, allowed_roots: &[P]) -> bool {
    if path.as_os_str().is_empty() {
        return false;
    }

    let resolved = resolve_for_check(path);
    let inside = allowed_roots
        .iter()
        .map(|root| resolve_for_check(root.as_ref()))
        .any(|root| resolved.starts_with(&root));

    if !inside {
        warn!(path = %path.display(), "Path is outside the allowed storage roots");
    }
    inside
}

/// Sanitize an externally supplied filename.
///
/// Keeps only the final path component and replaces reserved and control
/// characters with `_`. The result may still be empty or `.`/`..`; callers
/// that create files must reject those.
pub fn sanitize_filename(name: &str) -> String {
    let last = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();

    last.chars()
        .map(|c| {
            if RESERVED_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect::<String>()
        .trim()
        .to_string()
}
