//! Move, copy and remove primitives shared by every component.
//!
//! These are blocking calls; async callers go through [`run_blocking`].

use std::fs;
use std::io;
use std::path::Path;

use filetx_core::{OpsError, OpsResult};

use crate::naming::path_exists;

/// Move `source` to `dest`, falling back to copy + delete across volumes.
///
/// `dest` must not exist. When the fallback copy fails part-way, whatever it
/// produced at `dest` is removed before the error is returned and the source
/// is left untouched.
pub fn move_path(source: &Path, dest: &Path) -> OpsResult<()> {
    match fs::rename(source, dest) {
        Ok(()) => return Ok(()),
        Err(e) if is_cross_device(&e) => {
            tracing::debug!(
                source = %source.display(),
                dest = %dest.display(),
                "rename crossed devices, copying instead"
            );
        }
        Err(e) => return Err(OpsError::io(source, e)),
    }

    copy_new(source, dest)?;
    remove_path(source)
}

/// Copy `source` to `dest`, which must not exist yet.
///
/// The top-level item is created exclusively, so an item that appears at
/// `dest` concurrently is reported as [`OpsError::TargetExists`] and left
/// alone. When the copy fails after that point, only what this call created
/// is removed.
pub fn copy_new(source: &Path, dest: &Path) -> OpsResult<u64> {
    let metadata = fs::symlink_metadata(source).map_err(|e| OpsError::io(source, e))?;
    let file_type = metadata.file_type();

    if file_type.is_symlink() {
        if path_exists(dest) {
            return Err(OpsError::TargetExists {
                path: dest.to_path_buf(),
            });
        }
        copy_symlink(source, dest)?;
        return Ok(0);
    }

    claim(dest, file_type.is_dir())?;
    let copied = if file_type.is_dir() {
        copy_dir_contents(source, dest)
    } else {
        fs::copy(source, dest).map_err(|e| OpsError::io(source, e))
    };
    copied.inspect_err(|_| {
        if let Err(cleanup) = remove_path(dest) {
            tracing::warn!(path = %dest.display(), error = %cleanup, "failed to remove partial copy");
        }
    })
}

/// Copy a file, symlink or directory tree. Returns the bytes copied.
pub fn copy_path(source: &Path, dest: &Path) -> OpsResult<u64> {
    let metadata = fs::symlink_metadata(source).map_err(|e| OpsError::io(source, e))?;
    let file_type = metadata.file_type();

    if file_type.is_symlink() {
        copy_symlink(source, dest)?;
        Ok(0)
    } else if file_type.is_dir() {
        copy_dir_recursive(source, dest)
    } else {
        fs::copy(source, dest).map_err(|e| OpsError::io(source, e))
    }
}

/// Remove a file, symlink or directory tree.
pub fn remove_path(path: &Path) -> OpsResult<()> {
    let metadata = fs::symlink_metadata(path).map_err(|e| OpsError::io(path, e))?;
    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| OpsError::io(path, e))
}

/// Run a blocking filesystem closure on the blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> OpsResult<T>
where
    F: FnOnce() -> OpsResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| OpsError::TaskFailed {
            message: e.to_string(),
        })?
}

/// Create an empty file or directory at `dest`, failing if anything is there.
fn claim(dest: &Path, is_directory: bool) -> OpsResult<()> {
    let created = if is_directory {
        fs::create_dir(dest)
    } else {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dest)
            .map(drop)
    };
    created.map_err(|e| match e.kind() {
        io::ErrorKind::AlreadyExists => OpsError::TargetExists {
            path: dest.to_path_buf(),
        },
        _ => OpsError::io(dest, e),
    })
}

fn copy_dir_recursive(source: &Path, dest: &Path) -> OpsResult<u64> {
    fs::create_dir(dest).map_err(|e| OpsError::io(dest, e))?;
    copy_dir_contents(source, dest)
}

fn copy_dir_contents(source: &Path, dest: &Path) -> OpsResult<u64> {
    let mut total_bytes = 0u64;
    let entries = fs::read_dir(source).map_err(|e| OpsError::io(source, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| OpsError::io(source, e))?;
        total_bytes += copy_path(&entry.path(), &dest.join(entry.file_name()))?;
    }

    Ok(total_bytes)
}

#[cfg(unix)]
fn copy_symlink(source: &Path, dest: &Path) -> OpsResult<()> {
    let target = fs::read_link(source).map_err(|e| OpsError::io(source, e))?;
    std::os::unix::fs::symlink(&target, dest).map_err(|e| OpsError::io(dest, e))
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, dest: &Path) -> OpsResult<()> {
    // Without portable symlink creation, copy what the link points at.
    if source.is_dir() {
        copy_dir_recursive(source, dest).map(|_| ())
    } else {
        fs::copy(source, dest).map(|_| ()).map_err(|e| OpsError::io(source, e))
    }
}

fn is_cross_device(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::CrossesDevices
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_move_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.txt");
        let dst = dir.path().join("b.txt");
        fs::write(&src, "hello").unwrap();

        move_path(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read_to_string(&dst).unwrap(), "hello");
    }

    #[test]
    fn test_move_missing_source() {
        let dir = TempDir::new().unwrap();
        let err = move_path(&dir.path().join("nope"), &dir.path().join("dst")).unwrap_err();
        assert!(matches!(err, OpsError::NotFound { .. }));
    }

    #[test]
    fn test_copy_dir_tree() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("tree");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("one.txt"), "1").unwrap();
        fs::write(src.join("nested/two.txt"), "22").unwrap();

        let dst = dir.path().join("copy");
        let bytes = copy_path(&src, &dst).unwrap();

        assert_eq!(bytes, 3);
        assert_eq!(fs::read_to_string(dst.join("nested/two.txt")).unwrap(), "22");
        assert!(src.join("one.txt").exists());
    }

    #[test]
    fn test_remove_path_handles_dirs_and_files() {
        let dir = TempDir::new().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("inner")).unwrap();
        fs::write(tree.join("inner/f"), "x").unwrap();
        let file = dir.path().join("file");
        fs::write(&file, "x").unwrap();

        remove_path(&tree).unwrap();
        remove_path(&file).unwrap();
        assert!(!path_exists(&tree));
        assert!(!path_exists(&file));
    }

    #[test]
    fn test_cross_device_detection() {
        assert!(!is_cross_device(&io::Error::new(io::ErrorKind::Other, "x")));
        assert!(is_cross_device(&io::Error::from(io::ErrorKind::CrossesDevices)));
    }

    #[test]
    fn test_copy_new_leaves_existing_file_alone() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.txt");
        let dst = dir.path().join("b.txt");
        fs::write(&src, "ours").unwrap();
        fs::write(&dst, "theirs").unwrap();

        let err = copy_new(&src, &dst).unwrap_err();
        assert!(matches!(err, OpsError::TargetExists { .. }));
        assert_eq!(fs::read_to_string(&dst).unwrap(), "theirs");
    }

    #[test]
    fn test_copy_new_leaves_existing_dir_alone() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("tree");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("one.txt"), "1").unwrap();
        let dst = dir.path().join("occupied");
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("keep.txt"), "keep").unwrap();

        let err = copy_new(&src, &dst).unwrap_err();
        assert!(matches!(err, OpsError::TargetExists { .. }));
        assert_eq!(fs::read_to_string(dst.join("keep.txt")).unwrap(), "keep");
        assert!(!dst.join("one.txt").exists());
    }

    #[test]
    fn test_copy_new_missing_source_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("dst");
        assert!(copy_new(&dir.path().join("nope"), &dst).is_err());
        assert!(!path_exists(&dst));
    }
}
