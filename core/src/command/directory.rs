use std::path::Path;
use std::path::PathBuf;

/// Picks the working directory: the first candidate that exists and is a
/// directory, in priority order. Relative candidates are resolved
/// against `parent`. Non-existent candidates are silently skipped.
pub(crate) fn resolve_dir(parent: Option<&Path>, candidates: &[PathBuf]) -> Option<PathBuf> {
    for candidate in candidates {
        let resolved = resolve_against_parent(parent, candidate);
        if resolved.is_dir() {
            return Some(resolved);
        }
    }
    None
}

fn resolve_against_parent(parent: Option<&Path>, child: &Path) -> PathBuf {
    if child.is_absolute() {
        return child.to_path_buf();
    }
    match parent {
        Some(parent) => parent.join(child),
        None => child.to_path_buf(),
    }
}
