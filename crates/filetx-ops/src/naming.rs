//! Child-name validation, existence checks and collision-free naming.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use filetx_core::{OpsError, OpsResult};

/// Validate a single path component for cross-platform compatibility.
pub fn validate_child_name(name: &str) -> OpsResult<()> {
    let invalid = |reason: &str| {
        Err(OpsError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };

    if name.is_empty() {
        return invalid("name cannot be empty");
    }

    if name.len() > 255 {
        return invalid("name is too long (max 255 bytes)");
    }

    if name.contains('/') || name.contains('\0') {
        return invalid("name cannot contain '/' or NUL");
    }

    #[cfg(target_os = "windows")]
    {
        if name.contains(['\\', ':', '*', '?', '"', '<', '>', '|']) {
            return invalid("name contains a reserved character");
        }

        let reserved = [
            "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
            "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
        ];
        let upper_name = name.to_uppercase();
        let base_name = upper_name.split('.').next().unwrap_or("");
        if reserved.contains(&base_name) {
            return invalid("reserved device name");
        }
    }

    if name == "." || name == ".." {
        return invalid("'.' and '..' are reserved names");
    }

    if name.starts_with(' ') || name.ends_with(' ') {
        return invalid("name cannot start or end with spaces");
    }

    if name.ends_with('.') {
        return invalid("name cannot end with a dot");
    }

    Ok(())
}

/// Whether anything (including a dangling symlink) exists at `path`.
pub fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Key used to compare destination names for collisions.
///
/// Case-insensitive platforms fold case so that `A.txt` and `a.txt` collide.
pub fn collision_key(name: &str) -> String {
    if cfg!(any(target_os = "macos", target_os = "windows")) {
        name.to_lowercase()
    } else {
        name.to_string()
    }
}

/// Whether `to` differs from `from` only by letter case on a case-folding platform.
pub fn is_case_change(from: &Path, to: &Path) -> bool {
    match (from.file_name(), to.file_name()) {
        (Some(a), Some(b)) => {
            from.parent() == to.parent()
                && a != b
                && collision_key(&a.to_string_lossy()) == collision_key(&b.to_string_lossy())
        }
        _ => false,
    }
}

/// Whether moving `from` to `to` would land on an item other than `from` itself.
///
/// A case-only rename on a case-folding volume finds its own source at `to`.
pub fn occupied_by_other(from: &Path, to: &Path) -> bool {
    path_exists(to) && !(is_case_change(from, to) && same_entry(from, to))
}

#[cfg(unix)]
fn same_entry(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::symlink_metadata(a), fs::symlink_metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_entry(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => collision_key(&a.to_string_lossy()) == collision_key(&b.to_string_lossy()),
        _ => false,
    }
}

/// Split a name into stem and extension (extension keeps its dot).
///
/// Directories and dotfiles without a further dot keep the whole name as stem.
fn split_name(name: &str, is_directory: bool) -> (&str, &str) {
    if is_directory {
        return (name, "");
    }
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(idx) => name.split_at(idx),
    }
}

/// Lowest unused `"stem (n).ext"` under `dir`, starting at n = 1.
///
/// Names whose collision key is in `reserved` count as taken even if nothing
/// exists on disk yet.
pub fn unique_child_name(
    dir: &Path,
    name: &str,
    is_directory: bool,
    reserved: &HashSet<String>,
) -> String {
    let (stem, ext) = split_name(name, is_directory);
    let taken = |candidate: &str| {
        reserved.contains(&collision_key(candidate)) || path_exists(&dir.join(candidate))
    };

    for i in 1..10_000 {
        let candidate = format!("{stem} ({i}){ext}");
        if !taken(&candidate) {
            return candidate;
        }
    }

    // Fallback: use timestamp
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{stem} ({timestamp}){ext}")
}
