//! Precondition-checked replay of undo/redo records.
//!
//! Every replay re-checks the filesystem before mutating it. A replay that
//! fails before changing anything leaves its entry retryable on the stack it
//! came from; multi-item replays that fail part-way either roll back what
//! they did (redo, batch rename) or keep only the unfinished remainder
//! (move and copy undo).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use filetx_core::{OpsError, OpsResult};

use crate::fs_move::{copy_new, move_path, remove_path, run_blocking};
use crate::naming::{occupied_by_other, path_exists};
use crate::undo::{MoveOrigin, UndoAction, UndoEntry, UndoHistory};

/// Allowed drift between a recorded creation time and the file's birth time.
const CREATION_TOLERANCE: Duration = Duration::from_secs(2);

/// Result of replaying one record.
enum Replay {
    /// Fully applied; carries the record for the opposite stack.
    Done(UndoAction),
    /// Some items were reverted; `remainder` covers the rest.
    Partial {
        remainder: UndoAction,
        reverted: usize,
        remaining: usize,
        message: String,
    },
}

/// Owned undo/redo history with replay.
///
/// Replays and new records are serialized, so a record pushed while an undo
/// is running lands after it and clears the redo stack as usual.
#[derive(Debug, Default)]
pub struct UndoManager {
    history: Mutex<UndoHistory>,
    replaying: tokio::sync::Mutex<()>,
}

impl UndoManager {
    /// Create an empty manager with `capacity` entries per stack.
    pub fn new(capacity: usize) -> Self {
        Self::from_history(UndoHistory::new(capacity))
    }

    /// Resume from a previously saved history.
    pub fn from_history(history: UndoHistory) -> Self {
        Self {
            history: Mutex::new(history),
            replaying: tokio::sync::Mutex::new(()),
        }
    }

    fn history(&self) -> MutexGuard<'_, UndoHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a completed operation. Clears the redo stack.
    pub async fn push(&self, action: UndoAction) -> u64 {
        let _replaying = self.replaying.lock().await;
        let id = self.history().push(action);
        tracing::debug!(id, "undo entry recorded");
        id
    }

    /// Undo entries, oldest first.
    pub fn undo_stack(&self) -> Vec<UndoEntry> {
        self.history().undo_stack().cloned().collect()
    }

    /// Redo entries, oldest first.
    pub fn redo_stack(&self) -> Vec<UndoEntry> {
        self.history().redo_stack().cloned().collect()
    }

    /// Prune entries referring to a permanently deleted path.
    pub fn clear_for_path(&self, path: &Path) -> usize {
        self.history().clear_for_path(path)
    }

    /// Copy of both stacks, for persistence.
    pub fn snapshot(&self) -> UndoHistory {
        self.history().clone()
    }

    /// Consume the manager and return its history.
    pub fn into_history(self) -> UndoHistory {
        self.history
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reverse the most recent operation.
    ///
    /// On success the entry moves to the redo stack and is returned.
    pub async fn undo(&self) -> OpsResult<UndoEntry> {
        let _replaying = self.replaying.lock().await;
        let entry = self.history().pop_undo().ok_or(OpsError::NothingToUndo)?;
        let action = entry.action.clone();
        let outcome = run_blocking(move || revert(action)).await;

        match outcome {
            Ok(Replay::Done(action)) => {
                let entry = UndoEntry { action, ..entry };
                tracing::info!(id = entry.id, description = %entry.description, "undone");
                self.history().push_redo(entry.clone());
                Ok(entry)
            }
            Ok(Replay::Partial {
                remainder,
                reverted,
                remaining,
                message,
            }) => {
                let id = self.history().push_remainder(remainder);
                tracing::warn!(
                    original = entry.id,
                    remainder = id,
                    reverted,
                    remaining,
                    "undo partially failed"
                );
                Err(OpsError::PartialUndo {
                    reverted,
                    remaining,
                    message,
                })
            }
            Err(e) => {
                tracing::warn!(id = entry.id, error = %e, "undo refused");
                self.history().push_back_undo(entry);
                Err(e)
            }
        }
    }

    /// Re-apply the most recently undone operation.
    ///
    /// On success the entry, updated with any new paths, moves back to the
    /// undo stack without clearing the rest of the redo stack.
    pub async fn redo(&self) -> OpsResult<UndoEntry> {
        let _replaying = self.replaying.lock().await;
        let entry = self.history().pop_redo().ok_or(OpsError::NothingToRedo)?;
        let action = entry.action.clone();
        let outcome = run_blocking(move || reapply(action)).await;

        match outcome {
            Ok(action) => {
                let entry = UndoEntry { action, ..entry };
                tracing::info!(id = entry.id, description = %entry.description, "redone");
                self.history().push_back_undo(entry.clone());
                Ok(entry)
            }
            Err(e) => {
                tracing::warn!(id = entry.id, error = %e, "redo refused");
                self.history().push_redo(entry);
                Err(e)
            }
        }
    }
}

/// Best available birth time: `created()`, else the inode change time.
pub(crate) fn birth_time(metadata: &fs::Metadata) -> Option<SystemTime> {
    metadata.created().ok().or_else(|| change_time(metadata))
}

#[cfg(unix)]
fn change_time(metadata: &fs::Metadata) -> Option<SystemTime> {
    use std::os::unix::fs::MetadataExt;
    let secs = u64::try_from(metadata.ctime()).ok()?;
    let nanos = u32::try_from(metadata.ctime_nsec()).unwrap_or(0);
    Some(SystemTime::UNIX_EPOCH + Duration::new(secs, nanos))
}

#[cfg(not(unix))]
fn change_time(_metadata: &fs::Metadata) -> Option<SystemTime> {
    None
}

fn require_source(path: &Path) -> OpsResult<()> {
    if path_exists(path) {
        Ok(())
    } else {
        Err(OpsError::SourceMissing {
            path: path.to_path_buf(),
        })
    }
}

fn require_free(path: &Path) -> OpsResult<()> {
    if path_exists(path) {
        Err(OpsError::TargetExists {
            path: path.to_path_buf(),
        })
    } else {
        Ok(())
    }
}

/// Move that refuses to replace an existing target.
///
/// On a case-folding volume a case-only rename finds its own source at
/// `dest`; that does not count as occupied.
fn move_no_clobber(source: &Path, dest: &Path) -> OpsResult<()> {
    if occupied_by_other(source, dest) {
        return Err(OpsError::TargetExists {
            path: dest.to_path_buf(),
        });
    }
    move_path(source, dest)
}

fn revert(action: UndoAction) -> OpsResult<Replay> {
    match action {
        UndoAction::Create {
            path,
            is_directory,
            created_at,
        } => {
            revert_create(&path, is_directory, created_at)?;
            Ok(Replay::Done(UndoAction::Create {
                path,
                is_directory,
                created_at,
            }))
        }
        UndoAction::Rename { old_path, new_path } => {
            require_source(&new_path)?;
            move_no_clobber(&new_path, &old_path)?;
            Ok(Replay::Done(UndoAction::Rename { old_path, new_path }))
        }
        UndoAction::Move {
            moved,
            origin,
            destination_dir,
        } => revert_move(moved, origin, destination_dir),
        UndoAction::BatchRename { renames } => {
            let steps: Vec<(PathBuf, PathBuf)> = renames
                .iter()
                .rev()
                .map(|pair| (pair.new_path.clone(), pair.old_path.clone()))
                .collect();
            apply_renames(&steps)?;
            Ok(Replay::Done(UndoAction::BatchRename { renames }))
        }
        UndoAction::Copy { sources, created } => revert_copy(sources, created),
    }
}

fn reapply(action: UndoAction) -> OpsResult<UndoAction> {
    match action {
        UndoAction::Create {
            path, is_directory, ..
        } => {
            require_free(&path)?;
            if is_directory {
                fs::create_dir(&path).map_err(|e| OpsError::io(&path, e))?;
            } else {
                fs::File::create_new(&path).map_err(|e| OpsError::io(&path, e))?;
            }
            let created_at = fs::symlink_metadata(&path)
                .ok()
                .and_then(|meta| birth_time(&meta));
            Ok(UndoAction::Create {
                path,
                is_directory,
                created_at,
            })
        }
        UndoAction::Rename { old_path, new_path } => {
            require_source(&old_path)?;
            move_no_clobber(&old_path, &new_path)?;
            Ok(UndoAction::Rename { old_path, new_path })
        }
        UndoAction::Move {
            moved,
            origin,
            destination_dir,
        } => {
            let sources = origin.targets(&moved);
            let dests: Vec<PathBuf> = moved
                .iter()
                .map(|path| match path.file_name() {
                    Some(name) => destination_dir.join(name),
                    None => path.clone(),
                })
                .collect();
            for (source, dest) in sources.iter().zip(&dests) {
                require_source(source)?;
                require_free(dest)?;
            }
            let steps: Vec<(PathBuf, PathBuf)> = sources.into_iter().zip(dests.clone()).collect();
            apply_renames(&steps)?;
            Ok(UndoAction::Move {
                moved: dests,
                origin,
                destination_dir,
            })
        }
        UndoAction::BatchRename { renames } => {
            let steps: Vec<(PathBuf, PathBuf)> = renames
                .iter()
                .map(|pair| (pair.old_path.clone(), pair.new_path.clone()))
                .collect();
            apply_renames(&steps)?;
            Ok(UndoAction::BatchRename { renames })
        }
        UndoAction::Copy { sources, created } => {
            for (source, dest) in sources.iter().zip(&created) {
                require_source(source)?;
                require_free(dest)?;
            }
            for (index, (source, dest)) in sources.iter().zip(&created).enumerate() {
                if let Err(e) = copy_new(source, dest) {
                    for done in created[..index].iter().rev() {
                        discard(done);
                    }
                    return Err(e);
                }
            }
            Ok(UndoAction::Copy { sources, created })
        }
    }
}

fn revert_create(path: &Path, is_directory: bool, created_at: Option<SystemTime>) -> OpsResult<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(OpsError::SourceMissing {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(OpsError::io(path, e)),
    };

    let stale = |reason: &str| {
        Err(OpsError::Stale {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        })
    };

    if metadata.is_dir() != is_directory {
        return stale("it was replaced by a different kind of item");
    }

    if let (Some(recorded), Some(observed)) = (created_at, birth_time(&metadata)) {
        let drift = observed
            .duration_since(recorded)
            .or_else(|_| recorded.duration_since(observed))
            .unwrap_or(Duration::ZERO);
        if drift > CREATION_TOLERANCE {
            return stale("it was replaced after creation");
        }
    }

    if is_directory {
        let mut entries = fs::read_dir(path).map_err(|e| OpsError::io(path, e))?;
        if entries.next().is_some() {
            return stale("directory is not empty");
        }
        fs::remove_dir(path).map_err(|e| OpsError::io(path, e))
    } else {
        if metadata.len() > 0 {
            return stale("file is not empty");
        }
        fs::remove_file(path).map_err(|e| OpsError::io(path, e))
    }
}

fn revert_move(
    moved: Vec<PathBuf>,
    origin: MoveOrigin,
    destination_dir: PathBuf,
) -> OpsResult<Replay> {
    let targets = origin.targets(&moved);
    if targets.len() != moved.len() {
        return Err(OpsError::Stale {
            path: destination_dir,
            reason: "recorded original paths do not match the moved items".to_string(),
        });
    }

    for (current, target) in moved.iter().zip(&targets) {
        require_source(current)?;
        require_free(target)?;
    }

    for (index, (current, target)) in moved.iter().zip(&targets).enumerate() {
        if let Err(e) = move_path(current, target) {
            if index == 0 {
                return Err(e);
            }
            let remaining: Vec<usize> = (index..moved.len()).collect();
            let remainder = UndoAction::Move {
                moved: moved[index..].to_vec(),
                origin: origin.subset(&remaining),
                destination_dir,
            };
            return Ok(Replay::Partial {
                remainder,
                reverted: index,
                remaining: remaining.len(),
                message: e.to_string(),
            });
        }
    }

    Ok(Replay::Done(UndoAction::Move {
        moved,
        origin,
        destination_dir,
    }))
}

fn revert_copy(sources: Vec<PathBuf>, created: Vec<PathBuf>) -> OpsResult<Replay> {
    for path in &created {
        require_source(path)?;
    }

    let mut failed = Vec::new();
    let mut first_error = None;
    for (index, path) in created.iter().enumerate() {
        if let Err(e) = remove_path(path) {
            tracing::warn!(path = %path.display(), error = %e, "could not delete copied item");
            failed.push(index);
            first_error.get_or_insert(e);
        }
    }

    let Some(error) = first_error else {
        return Ok(Replay::Done(UndoAction::Copy { sources, created }));
    };
    if failed.len() == created.len() {
        return Err(error);
    }

    let remainder = UndoAction::Copy {
        sources: failed.iter().filter_map(|&i| sources.get(i).cloned()).collect(),
        created: failed.iter().filter_map(|&i| created.get(i).cloned()).collect(),
    };
    Ok(Replay::Partial {
        remainder,
        reverted: created.len() - failed.len(),
        remaining: failed.len(),
        message: error.to_string(),
    })
}

/// Apply `(from, to)` moves in order; on failure undo the applied ones in reverse.
fn apply_renames(steps: &[(PathBuf, PathBuf)]) -> OpsResult<()> {
    for (index, (from, to)) in steps.iter().enumerate() {
        if let Err(e) = move_no_clobber(from, to) {
            for (done_from, done_to) in steps[..index].iter().rev() {
                if let Err(rollback) = move_path(done_to, done_from) {
                    tracing::warn!(
                        from = %done_to.display(),
                        to = %done_from.display(),
                        error = %rollback,
                        "could not roll back rename"
                    );
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

fn discard(path: &Path) {
    if let Err(e) = remove_path(path) {
        tracing::warn!(path = %path.display(), error = %e, "could not remove copied item");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn created_file(dir: &Path, name: &str) -> UndoAction {
        let path = dir.join(name);
        fs::File::create_new(&path).unwrap();
        let created_at = birth_time(&fs::metadata(&path).unwrap());
        UndoAction::Create {
            path,
            is_directory: false,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_rename_round_trip() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "content").unwrap();
        fs::rename(&a, &b).unwrap();

        let manager = UndoManager::new(10);
        manager
            .push(UndoAction::Rename {
                old_path: a.clone(),
                new_path: b.clone(),
            })
            .await;

        manager.undo().await.unwrap();
        assert!(a.exists() && !b.exists());
        assert_eq!(manager.redo_stack().len(), 1);

        manager.redo().await.unwrap();
        assert!(!a.exists());
        assert_eq!(fs::read_to_string(&b).unwrap(), "content");
        assert_eq!(manager.undo_stack().len(), 1);
        assert!(manager.redo_stack().is_empty());
    }

    #[tokio::test]
    async fn test_rename_undo_refuses_occupied_target() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "squatter").unwrap();
        fs::write(&b, "renamed").unwrap();

        let manager = UndoManager::new(10);
        manager
            .push(UndoAction::Rename {
                old_path: a.clone(),
                new_path: b.clone(),
            })
            .await;

        let err = manager.undo().await.unwrap_err();
        assert!(matches!(err, OpsError::TargetExists { .. }));
        assert_eq!(manager.undo_stack().len(), 1);
        assert_eq!(fs::read_to_string(&a).unwrap(), "squatter");
    }

    #[tokio::test]
    async fn test_create_undo_and_redo() {
        let dir = TempDir::new().unwrap();
        let manager = UndoManager::new(10);
        let action = created_file(dir.path(), "empty.txt");
        let path = dir.path().join("empty.txt");
        manager.push(action).await;

        manager.undo().await.unwrap();
        assert!(!path.exists());

        let entry = manager.redo().await.unwrap();
        assert!(path.exists());
        assert!(matches!(entry.action, UndoAction::Create { .. }));
    }

    #[tokio::test]
    async fn test_create_undo_refuses_non_empty() {
        let dir = TempDir::new().unwrap();
        let manager = UndoManager::new(10);
        manager.push(created_file(dir.path(), "notes.txt")).await;
        fs::write(dir.path().join("notes.txt"), "user data").unwrap();

        let err = manager.undo().await.unwrap_err();
        assert!(matches!(err, OpsError::Stale { .. }));
        assert!(dir.path().join("notes.txt").exists());
        assert_eq!(manager.undo_stack().len(), 1);

        let folder = dir.path().join("folder");
        fs::create_dir(&folder).unwrap();
        fs::write(folder.join("inside"), "x").unwrap();
        manager
            .push(UndoAction::Create {
                path: folder.clone(),
                is_directory: true,
                created_at: None,
            })
            .await;
        let err = manager.undo().await.unwrap_err();
        assert!(matches!(err, OpsError::Stale { .. }));
        assert!(folder.join("inside").exists());
    }

    #[tokio::test]
    async fn test_create_undo_refuses_replaced_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replaced.txt");
        fs::File::create_new(&path).unwrap();

        let manager = UndoManager::new(10);
        manager
            .push(UndoAction::Create {
                path: path.clone(),
                is_directory: false,
                created_at: Some(SystemTime::now() - Duration::from_secs(3600)),
            })
            .await;

        let err = manager.undo().await.unwrap_err();
        assert!(matches!(err, OpsError::Stale { .. }));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_create_undo_missing_path() {
        let dir = TempDir::new().unwrap();
        let manager = UndoManager::new(10);
        manager
            .push(UndoAction::Create {
                path: dir.path().join("gone"),
                is_directory: false,
                created_at: None,
            })
            .await;
        let err = manager.undo().await.unwrap_err();
        assert!(matches!(err, OpsError::SourceMissing { .. }));
    }

    #[tokio::test]
    async fn test_move_undo_and_redo_with_parent_origin() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("a"), "a").unwrap();
        fs::write(dst.join("b"), "b").unwrap();

        let manager = UndoManager::new(10);
        manager
            .push(UndoAction::Move {
                moved: vec![dst.join("a"), dst.join("b")],
                origin: MoveOrigin::Parent(src.clone()),
                destination_dir: dst.clone(),
            })
            .await;

        manager.undo().await.unwrap();
        assert!(src.join("a").exists() && src.join("b").exists());
        assert!(!dst.join("a").exists());

        let entry = manager.redo().await.unwrap();
        assert!(dst.join("a").exists() && dst.join("b").exists());
        match entry.action {
            UndoAction::Move { moved, .. } => assert_eq!(moved, vec![dst.join("a"), dst.join("b")]),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_move_undo_refuses_when_any_target_occupied() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("a"), "a").unwrap();
        fs::write(dst.join("b"), "b").unwrap();
        fs::write(src.join("b"), "new b").unwrap();

        let manager = UndoManager::new(10);
        manager
            .push(UndoAction::Move {
                moved: vec![dst.join("a"), dst.join("b")],
                origin: MoveOrigin::Paths(vec![src.join("a"), src.join("b")]),
                destination_dir: dst.clone(),
            })
            .await;

        let err = manager.undo().await.unwrap_err();
        assert!(matches!(err, OpsError::TargetExists { .. }));
        assert!(dst.join("a").exists());
        assert!(!src.join("a").exists());
        assert_eq!(manager.undo_stack().len(), 1);
    }

    #[test]
    fn test_move_partial_failure_keeps_remainder() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("a"), "a").unwrap();
        fs::write(dst.join("b"), "b").unwrap();
        fs::write(dst.join("c"), "c").unwrap();

        // The second target's parent disappears, so only the first item moves.
        let outcome = revert_move(
            vec![dst.join("a"), dst.join("b"), dst.join("c")],
            MoveOrigin::Paths(vec![
                src.join("a"),
                dir.path().join("missing/b"),
                src.join("c"),
            ]),
            dst.clone(),
        )
        .unwrap();

        match outcome {
            Replay::Partial {
                remainder,
                reverted,
                remaining,
                ..
            } => {
                assert_eq!(reverted, 1);
                assert_eq!(remaining, 2);
                assert_eq!(
                    remainder,
                    UndoAction::Move {
                        moved: vec![dst.join("b"), dst.join("c")],
                        origin: MoveOrigin::Paths(vec![
                            dir.path().join("missing/b"),
                            src.join("c")
                        ]),
                        destination_dir: dst.clone(),
                    }
                );
            }
            Replay::Done(_) => panic!("expected a partial undo"),
        }
        assert!(src.join("a").exists());
        assert!(dst.join("b").exists());
    }

    #[tokio::test]
    async fn test_partial_move_undo_pushes_new_entry() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("a"), "a").unwrap();
        fs::write(dst.join("b"), "b").unwrap();

        let manager = UndoManager::new(10);
        let original = manager
            .push(UndoAction::Move {
                moved: vec![dst.join("a"), dst.join("b")],
                origin: MoveOrigin::Paths(vec![src.join("a"), dir.path().join("missing/b")]),
                destination_dir: dst.clone(),
            })
            .await;

        let err = manager.undo().await.unwrap_err();
        assert!(matches!(
            err,
            OpsError::PartialUndo {
                reverted: 1,
                remaining: 1,
                ..
            }
        ));
        let stack = manager.undo_stack();
        assert_eq!(stack.len(), 1);
        assert_ne!(stack[0].id, original);
        assert!(manager.redo_stack().is_empty());

        fs::create_dir_all(dir.path().join("missing")).unwrap();
        manager.undo().await.unwrap();
        assert!(dir.path().join("missing/b").exists());
    }

    #[tokio::test]
    async fn test_batch_rename_round_trip() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        fs::write(&b, "was a").unwrap();
        fs::write(&c, "was b").unwrap();

        // a → b was applied after b → c.
        let manager = UndoManager::new(10);
        manager
            .push(UndoAction::batch_rename([(b.clone(), c.clone()), (a.clone(), b.clone())]))
            .await;

        manager.undo().await.unwrap();
        assert_eq!(fs::read_to_string(&a).unwrap(), "was a");
        assert_eq!(fs::read_to_string(&b).unwrap(), "was b");
        assert!(!c.exists());

        manager.redo().await.unwrap();
        assert_eq!(fs::read_to_string(&b).unwrap(), "was a");
        assert_eq!(fs::read_to_string(&c).unwrap(), "was b");
    }

    #[tokio::test]
    async fn test_batch_rename_failure_rolls_back_and_retries() {
        let dir = TempDir::new().unwrap();
        let pairs = vec![
            (dir.path().join("x"), dir.path().join("x2")),
            (dir.path().join("y"), dir.path().join("y2")),
        ];
        fs::write(dir.path().join("x2"), "x").unwrap();
        fs::write(dir.path().join("y2"), "y").unwrap();
        // y2 → y succeeds first, then x2 → x hits the squatter.
        fs::write(dir.path().join("x"), "squatter").unwrap();

        let manager = UndoManager::new(10);
        manager.push(UndoAction::batch_rename(pairs)).await;

        assert!(manager.undo().await.is_err());
        assert!(dir.path().join("y2").exists());
        assert!(!dir.path().join("y").exists());
        assert_eq!(manager.undo_stack().len(), 1);
    }

    #[tokio::test]
    async fn test_copy_undo_and_redo() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.txt");
        let copy = dir.path().join("copy.txt");
        fs::write(&source, "data").unwrap();
        fs::write(&copy, "data").unwrap();

        let manager = UndoManager::new(10);
        manager
            .push(UndoAction::Copy {
                sources: vec![source.clone()],
                created: vec![copy.clone()],
            })
            .await;

        manager.undo().await.unwrap();
        assert!(!copy.exists());
        assert!(source.exists());

        manager.redo().await.unwrap();
        assert_eq!(fs::read_to_string(&copy).unwrap(), "data");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_record_during_undo_clears_redo() {
        for round in 0..20 {
            let dir = TempDir::new().unwrap();
            let a = dir.path().join("a.txt");
            let b = dir.path().join("b.txt");
            fs::write(&b, "renamed").unwrap();

            let manager = UndoManager::new(10);
            manager
                .push(UndoAction::Rename {
                    old_path: a.clone(),
                    new_path: b.clone(),
                })
                .await;

            let (undone, _) = tokio::join!(
                manager.undo(),
                manager.push(created_file(dir.path(), &format!("new-{round}.txt")))
            );
            undone.unwrap();

            // Whichever ran first, the newest record is never followed by a
            // redo entry that predates it.
            let undo = manager.undo_stack();
            let redo = manager.redo_stack();
            let newest_is_create = matches!(
                undo.last().map(|e| &e.action),
                Some(UndoAction::Create { .. })
            );
            if newest_is_create {
                assert!(redo.is_empty());
                assert!(a.exists());
            } else {
                assert_eq!(redo.len(), 1);
                assert!(matches!(redo[0].action, UndoAction::Create { .. }));
            }
        }
    }

    #[cfg(any(target_os = "macos", target_os = "windows"))]
    #[tokio::test]
    async fn test_case_only_rename_round_trip() {
        let dir = TempDir::new().unwrap();
        let lower = dir.path().join("readme.txt");
        let upper = dir.path().join("README.txt");
        fs::write(&upper, "content").unwrap();

        let manager = UndoManager::new(10);
        manager
            .push(UndoAction::Rename {
                old_path: lower.clone(),
                new_path: upper.clone(),
            })
            .await;

        manager.undo().await.unwrap();
        let listed = |dir: &Path| -> Vec<String> {
            fs::read_dir(dir)
                .unwrap()
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        };
        assert_eq!(listed(dir.path()), vec!["readme.txt".to_string()]);

        manager.redo().await.unwrap();
        assert_eq!(listed(dir.path()), vec!["README.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_stacks() {
        let manager = UndoManager::new(10);
        assert!(matches!(manager.undo().await, Err(OpsError::NothingToUndo)));
        assert!(matches!(manager.redo().await, Err(OpsError::NothingToRedo)));
    }
}
