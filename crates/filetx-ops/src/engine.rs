//! The owned engine context.
//!
//! One [`FileOpsEngine`] holds everything a host needs to run batches and
//! replay history: configuration, the path-safety predicate, the executor
//! with its stash store, and the undo/redo manager. Hosts create it at
//! startup and call [`FileOpsEngine::shutdown`] to get the history back for
//! persistence.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use filetx_core::{EngineConfig, OpsError, OpsResult};

use crate::backup::{PruneReport, StashedBackup};
use crate::conflict::{ConflictPolicy, ConflictResolver};
use crate::executor::{BatchExecutor, BatchReport};
use crate::fs_move::{move_path, run_blocking};
use crate::naming::{is_case_change, occupied_by_other, path_exists, validate_child_name};
use crate::plan::{allow_absolute_paths, PathSafety, Planner};
use crate::progress::{OperationProgress, OperationType};
use crate::replay::{birth_time, UndoManager};
use crate::undo::{UndoAction, UndoEntry, UndoHistory};

/// Transactional file operations with undo/redo.
pub struct FileOpsEngine {
    config: EngineConfig,
    safety: PathSafety,
    executor: BatchExecutor,
    history: UndoManager,
}

impl std::fmt::Debug for FileOpsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileOpsEngine")
            .field("config", &self.config)
            .field("executor", &self.executor)
            .field("history", &self.history)
            .finish_non_exhaustive()
    }
}

impl FileOpsEngine {
    /// Create an engine with an empty history and the default path predicate.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            executor: BatchExecutor::from_config(&config),
            history: UndoManager::new(config.undo_capacity),
            safety: allow_absolute_paths(),
            config,
        }
    }

    /// Replace the path-safety predicate.
    pub fn with_path_safety(mut self, safety: PathSafety) -> Self {
        self.safety = safety;
        self
    }

    /// Resume from a saved history, re-capped to the configured capacity.
    pub fn with_history(mut self, mut history: UndoHistory) -> Self {
        history.set_capacity(self.config.undo_capacity);
        self.history = UndoManager::from_history(history);
        self
    }

    /// Report batch progress on `tx`.
    pub fn with_progress(mut self, tx: mpsc::Sender<OperationProgress>) -> Self {
        self.executor = self.executor.with_progress(tx);
        self
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Copy `sources` into the directory `destination`.
    pub async fn copy(
        &self,
        sources: &[PathBuf],
        destination: &Path,
        policy: ConflictPolicy,
        resolver: Option<&dyn ConflictResolver>,
    ) -> OpsResult<BatchReport> {
        self.transfer(OperationType::Copy, sources, destination, policy, resolver)
            .await
    }

    /// Move `sources` into the directory `destination`.
    pub async fn move_items(
        &self,
        sources: &[PathBuf],
        destination: &Path,
        policy: ConflictPolicy,
        resolver: Option<&dyn ConflictResolver>,
    ) -> OpsResult<BatchReport> {
        self.transfer(OperationType::Move, sources, destination, policy, resolver)
            .await
    }

    async fn transfer(
        &self,
        kind: OperationType,
        sources: &[PathBuf],
        destination: &Path,
        policy: ConflictPolicy,
        resolver: Option<&dyn ConflictResolver>,
    ) -> OpsResult<BatchReport> {
        let mut planner = Planner::new(&self.safety);
        if let Some(resolver) = resolver {
            planner = planner.with_resolver(resolver);
        }
        let plan = planner.plan(kind, sources, destination, policy).await?;
        let report = self.executor.execute(kind, &plan).await?;
        if let Some(action) = &report.undo {
            self.history.push(action.clone()).await;
        }
        Ok(report)
    }

    /// Rename `path` in place to `new_name`. Returns the new path.
    pub async fn rename(&self, path: &Path, new_name: &str) -> OpsResult<PathBuf> {
        let target = self.rename_target(path, new_name)?;
        if target == path {
            return Ok(target);
        }
        if occupied_by_other(path, &target) {
            return Err(OpsError::TargetExists { path: target });
        }

        let source = path.to_path_buf();
        let dest = target.clone();
        run_blocking(move || move_path(&source, &dest)).await?;

        tracing::info!(from = %path.display(), to = %target.display(), "renamed");
        self.history
            .push(UndoAction::Rename {
                old_path: path.to_path_buf(),
                new_path: target.clone(),
            })
            .await;
        Ok(target)
    }

    /// Rename several items in place as one undoable step.
    ///
    /// A target may be the current name of another item in the batch; such
    /// chains are ordered so every rename lands on a free name. If a rename
    /// fails, the ones already applied are reverted and nothing is recorded.
    /// Each item may appear only once. The new paths come back in input order.
    pub async fn batch_rename(&self, renames: &[(PathBuf, String)]) -> OpsResult<Vec<PathBuf>> {
        if renames.is_empty() {
            return Err(OpsError::EmptyBatch);
        }

        let mut steps = Vec::with_capacity(renames.len());
        let mut new_paths = Vec::with_capacity(renames.len());
        let mut seen = HashSet::new();
        let mut targets = HashSet::new();
        for (path, new_name) in renames {
            if !seen.insert(path.clone()) {
                return Err(OpsError::InvalidName {
                    name: path.display().to_string(),
                    reason: "item is renamed more than once in the batch".to_string(),
                });
            }
            let target = self.rename_target(path, new_name)?;
            if !targets.insert(target.clone()) {
                return Err(OpsError::NameCollision {
                    name: new_name.clone(),
                });
            }
            if target != *path {
                steps.push((path.clone(), target.clone()));
            }
            new_paths.push(target);
        }

        for (from, to) in &steps {
            if !seen.contains(to) && occupied_by_other(from, to) {
                return Err(OpsError::TargetExists { path: to.clone() });
            }
        }

        let applied = run_blocking(move || apply_in_dependency_order(steps)).await?;
        if !applied.is_empty() {
            tracing::info!(items = applied.len(), "batch renamed");
            self.history.push(UndoAction::batch_rename(applied)).await;
        }
        Ok(new_paths)
    }

    /// Create an empty file at `path`.
    pub async fn create_file(&self, path: &Path) -> OpsResult<PathBuf> {
        self.create(path, false).await
    }

    /// Create an empty directory at `path`.
    pub async fn create_directory(&self, path: &Path) -> OpsResult<PathBuf> {
        self.create(path, true).await
    }

    async fn create(&self, path: &Path, is_directory: bool) -> OpsResult<PathBuf> {
        self.check_safe(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        validate_child_name(&name)?;

        let target = path.to_path_buf();
        let created_at = run_blocking(move || {
            if path_exists(&target) {
                return Err(OpsError::TargetExists { path: target });
            }
            if is_directory {
                fs::create_dir(&target).map_err(|e| OpsError::io(&target, e))?;
            } else {
                fs::File::create_new(&target).map_err(|e| OpsError::io(&target, e))?;
            }
            Ok(fs::symlink_metadata(&target)
                .ok()
                .and_then(|meta| birth_time(&meta)))
        })
        .await?;

        tracing::info!(path = %path.display(), is_directory, "created");
        self.history
            .push(UndoAction::Create {
                path: path.to_path_buf(),
                is_directory,
                created_at,
            })
            .await;
        Ok(path.to_path_buf())
    }

    /// Reverse the most recent operation.
    pub async fn undo(&self) -> OpsResult<UndoEntry> {
        self.history.undo().await
    }

    /// Re-apply the most recently undone operation.
    pub async fn redo(&self) -> OpsResult<UndoEntry> {
        self.history.redo().await
    }

    /// Snapshot of both stacks.
    pub fn history(&self) -> UndoHistory {
        self.history.snapshot()
    }

    /// Forget history that refers to a permanently deleted path.
    pub fn clear_history_for_path(&self, path: &Path) -> usize {
        self.history.clear_for_path(path)
    }

    /// Enforce stash retention now.
    pub async fn prune_stash(&self) -> OpsResult<PruneReport> {
        let store = self.executor.store().clone();
        run_blocking(move || store.prune()).await
    }

    /// Backups currently held in the stash, newest first.
    pub async fn stashed_backups(&self) -> OpsResult<Vec<StashedBackup>> {
        let store = self.executor.store().clone();
        run_blocking(move || store.list()).await
    }

    /// Tear the engine down and hand back its history.
    pub fn shutdown(self) -> UndoHistory {
        tracing::debug!("engine shut down");
        self.history.into_history()
    }

    fn rename_target(&self, path: &Path, new_name: &str) -> OpsResult<PathBuf> {
        validate_child_name(new_name)?;
        self.check_safe(path)?;
        if !path_exists(path) {
            return Err(OpsError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let parent = path.parent().ok_or_else(|| OpsError::InvalidName {
            name: path.display().to_string(),
            reason: "cannot rename a root path".to_string(),
        })?;
        let target = parent.join(new_name);
        self.check_safe(&target)?;
        Ok(target)
    }

    fn check_safe(&self, path: &Path) -> OpsResult<()> {
        if (self.safety)(path) {
            Ok(())
        } else {
            Err(OpsError::UnsafePath {
                path: path.to_path_buf(),
            })
        }
    }
}

/// Apply renames so that each lands on a name already vacated.
///
/// Returns the steps in the order applied. On failure, including a cycle
/// with no free name, the applied steps are reverted in reverse order.
fn apply_in_dependency_order(steps: Vec<(PathBuf, PathBuf)>) -> OpsResult<Vec<(PathBuf, PathBuf)>> {
    let mut pending: HashMap<PathBuf, PathBuf> = steps.iter().cloned().collect();
    let mut applied: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(steps.len());

    while !pending.is_empty() {
        let ready = steps.iter().find(|(from, to)| {
            pending.contains_key(from) && (!pending.contains_key(to) || is_case_change(from, to))
        });

        let result = match ready {
            Some((from, to)) => move_path(from, to).map(|()| (from.clone(), to.clone())),
            None => Err(OpsError::NameCollision {
                name: "circular rename".to_string(),
            }),
        };

        match result {
            Ok((from, to)) => {
                pending.remove(&from);
                applied.push((from, to));
            }
            Err(e) => {
                for (from, to) in applied.iter().rev() {
                    if let Err(rollback) = move_path(to, from) {
                        tracing::warn!(
                            from = %to.display(),
                            to = %from.display(),
                            error = %rollback,
                            "could not roll back rename"
                        );
                    }
                }
                return Err(e);
            }
        }
    }

    Ok(applied)
}
