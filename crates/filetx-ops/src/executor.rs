//! Chunked, compensating execution of copy and move plans.

use std::path::{Path, PathBuf};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;

use filetx_core::{EngineConfig, OpsError, OpsResult};

use crate::backup::{BackupStore, OverwriteBackups};
use crate::fs_move::{copy_new, move_path, remove_path, run_blocking};
use crate::plan::{Plan, PlannedOperation};
use crate::progress::{OperationProgress, OperationType};
use crate::undo::{MoveOrigin, UndoAction};

/// Outcome of a fully successful batch.
#[derive(Debug, Clone)]
pub struct BatchReport {
    /// The type of operation.
    pub operation_type: OperationType,
    /// Destination paths produced, in plan order.
    pub created: Vec<PathBuf>,
    /// Sources the plan dropped.
    pub skipped: Vec<PathBuf>,
    /// Bytes copied or moved.
    pub bytes_processed: u64,
    /// Inverse record for the whole batch, `None` when nothing ran.
    pub undo: Option<UndoAction>,
}

impl BatchReport {
    /// One-line summary for display.
    pub fn summary(&self) -> String {
        let mut summary = format!("{}: {} items", self.operation_type, self.created.len());
        if !self.skipped.is_empty() {
            summary.push_str(&format!(", {} skipped", self.skipped.len()));
        }
        summary
    }
}

/// Runs plans in bounded parallel chunks and unwinds partial failures.
///
/// Within a chunk all items run concurrently and every outcome is gathered.
/// If any item failed, no further chunk starts; completed items are undone
/// in reverse completion order, backups are restored, and whatever could not
/// be restored is stashed.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    store: BackupStore,
    chunk_width: usize,
    backup_retries: u32,
    progress: Option<mpsc::Sender<OperationProgress>>,
}

impl BatchExecutor {
    /// Create an executor stashing into `store`, running `chunk_width` items at once.
    pub fn new(store: BackupStore, chunk_width: usize) -> Self {
        Self {
            store,
            chunk_width: chunk_width.max(1),
            backup_retries: 10,
            progress: None,
        }
    }

    /// Create an executor from engine configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(BackupStore::from_config(config), config.effective_chunk_width())
            .with_backup_retries(config.backup_retries)
    }

    /// Number of sibling names tried per overwrite backup.
    pub fn with_backup_retries(mut self, retries: u32) -> Self {
        self.backup_retries = retries.max(1);
        self
    }

    /// Report per-item progress on `tx`.
    pub fn with_progress(mut self, tx: mpsc::Sender<OperationProgress>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// The stash store used for unrecoverable backups.
    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    /// Execute a copy or move plan.
    pub async fn execute(&self, kind: OperationType, plan: &Plan) -> OpsResult<BatchReport> {
        if !matches!(kind, OperationType::Copy | OperationType::Move) {
            return Err(OpsError::TaskFailed {
                message: format!("{kind} is not a batch transfer"),
            });
        }

        if plan.is_empty() {
            return Ok(BatchReport {
                operation_type: kind,
                created: Vec::new(),
                skipped: plan.skipped.clone(),
                bytes_processed: 0,
                undo: None,
            });
        }

        let backups = OverwriteBackups::new(self.backup_retries);
        let mut completed: Vec<&PlannedOperation> = Vec::with_capacity(plan.len());
        let mut progress = OperationProgress::new(kind, plan.len());
        let mut failure: Option<(PathBuf, OpsError)> = None;

        tracing::debug!(
            kind = %kind,
            items = plan.len(),
            chunk_width = self.chunk_width,
            "executing batch"
        );

        for chunk in plan.operations.chunks(self.chunk_width) {
            let backups = &backups;
            let mut pending: FuturesUnordered<_> = chunk
                .iter()
                .map(|op| async move { (op, self.run_item(kind, op, backups).await) })
                .collect();

            while let Some((op, result)) = pending.next().await {
                match result {
                    Ok(bytes) => {
                        completed.push(op);
                        progress.complete_file(op.destination.clone(), bytes);
                        self.report(&progress);
                    }
                    Err(e) => {
                        tracing::warn!(
                            source = %op.source.display(),
                            destination = %op.destination.display(),
                            error = %e,
                            "batch item failed"
                        );
                        if failure.is_none() {
                            failure = Some((op.source.clone(), e));
                        }
                    }
                }
            }

            if failure.is_some() {
                break;
            }
        }

        if let Some((path, error)) = failure {
            return Err(self.abort(kind, &completed, &backups, path, error).await);
        }

        backups.commit().await;

        let created: Vec<PathBuf> = plan
            .operations
            .iter()
            .map(|op| op.destination.clone())
            .collect();
        tracing::info!(
            kind = %kind,
            items = created.len(),
            skipped = plan.skipped.len(),
            bytes = progress.bytes_processed,
            "batch complete"
        );

        Ok(BatchReport {
            operation_type: kind,
            undo: Some(inverse_action(kind, plan)),
            created,
            skipped: plan.skipped.clone(),
            bytes_processed: progress.bytes_processed,
        })
    }

    /// Back up, then copy or move one item. Returns the bytes processed.
    async fn run_item(
        &self,
        kind: OperationType,
        op: &PlannedOperation,
        backups: &OverwriteBackups,
    ) -> OpsResult<u64> {
        backups.ensure(op).await?;

        let source = op.source.clone();
        let destination = op.destination.clone();
        run_blocking(move || match kind {
            OperationType::Move => {
                let bytes = file_size(&source);
                move_path(&source, &destination).map(|()| bytes)
            }
            _ => copy_new(&source, &destination),
        })
        .await
    }

    /// Roll the batch back and describe the failure at `path`.
    async fn abort(
        &self,
        kind: OperationType,
        completed: &[&PlannedOperation],
        backups: &OverwriteBackups,
        path: PathBuf,
        error: OpsError,
    ) -> OpsError {
        let recovery = self.compensate(kind, completed, backups).await;
        OpsError::batch_failed(kind.to_string(), path, error.to_string(), recovery)
    }

    /// Undo completed items in reverse, restore backups, stash the rest.
    async fn compensate(
        &self,
        kind: OperationType,
        completed: &[&PlannedOperation],
        backups: &OverwriteBackups,
    ) -> Vec<PathBuf> {
        let steps: Vec<(PathBuf, PathBuf)> = completed
            .iter()
            .rev()
            .map(|op| (op.source.clone(), op.destination.clone()))
            .collect();
        let undone = steps.len();

        let result = run_blocking(move || {
            for (source, destination) in steps {
                let outcome = match kind {
                    OperationType::Move => move_path(&destination, &source),
                    _ => remove_path(&destination),
                };
                if let Err(e) = outcome {
                    tracing::warn!(
                        destination = %destination.display(),
                        error = %e,
                        "compensation step failed"
                    );
                }
            }
            Ok(())
        })
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "compensation task failed");
        }

        // A moved item that could not go back still occupies its destination.
        let restored = backups.restore(kind == OperationType::Move).await;
        let recovery = backups.stash_remaining(&self.store).await;

        tracing::info!(
            kind = %kind,
            undone,
            restored,
            stashed = recovery.len(),
            "batch rolled back"
        );
        recovery
    }

    fn report(&self, progress: &OperationProgress) {
        if let Some(tx) = &self.progress {
            // Never stall the batch on a slow consumer.
            let _ = tx.try_send(progress.clone());
        }
    }
}

fn file_size(path: &Path) -> u64 {
    std::fs::symlink_metadata(path)
        .map(|meta| if meta.is_file() { meta.len() } else { 0 })
        .unwrap_or(0)
}

/// The undo record describing a whole successful batch.
fn inverse_action(kind: OperationType, plan: &Plan) -> UndoAction {
    let sources: Vec<PathBuf> = plan.operations.iter().map(|op| op.source.clone()).collect();
    let created: Vec<PathBuf> = plan
        .operations
        .iter()
        .map(|op| op.destination.clone())
        .collect();

    match kind {
        OperationType::Move => {
            let origin = match shared_parent(&sources) {
                Some(parent) if !plan.has_renames() => MoveOrigin::Parent(parent),
                _ => MoveOrigin::Paths(sources),
            };
            UndoAction::Move {
                moved: created,
                origin,
                destination_dir: plan.destination_dir.clone(),
            }
        }
        _ => UndoAction::Copy { sources, created },
    }
}

fn shared_parent(paths: &[PathBuf]) -> Option<PathBuf> {
    let first = paths.first()?.parent()?;
    paths
        .iter()
        .all(|path| path.parent() == Some(first))
        .then(|| first.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn op(source: PathBuf, destination: PathBuf, overwrite: bool) -> PlannedOperation {
        PlannedOperation {
            item_name: destination
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned(),
            source,
            destination,
            is_directory: false,
            overwrite,
        }
    }

    fn executor(dir: &TempDir, width: usize) -> BatchExecutor {
        let store = BackupStore::new(dir.path().join("stash"), Duration::from_secs(3600), 10);
        BatchExecutor::new(store, width)
    }

    #[test]
    fn test_shared_parent() {
        let same = vec![PathBuf::from("/a/x"), PathBuf::from("/a/y")];
        assert_eq!(shared_parent(&same), Some(PathBuf::from("/a")));
        let mixed = vec![PathBuf::from("/a/x"), PathBuf::from("/b/y")];
        assert_eq!(shared_parent(&mixed), None);
    }

    #[tokio::test]
    async fn test_copy_with_overwrite_commits_backup() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();
        fs::write(src.join("b.txt"), "new b").unwrap();
        fs::write(dst.join("b.txt"), "old b").unwrap();

        let plan = Plan {
            operations: vec![
                op(src.join("a.txt"), dst.join("a.txt"), false),
                op(src.join("b.txt"), dst.join("b.txt"), true),
            ],
            skipped: Vec::new(),
            destination_dir: dst.clone(),
        };
        let (tx, mut rx) = mpsc::channel(8);
        let report = executor(&dir, 4)
            .with_progress(tx)
            .execute(OperationType::Copy, &plan)
            .await
            .unwrap();

        assert_eq!(report.created.len(), 2);
        assert_eq!(fs::read_to_string(dst.join("b.txt")).unwrap(), "new b");
        assert!(src.join("a.txt").exists());
        assert_eq!(fs::read_dir(&dst).unwrap().count(), 2);
        assert!(matches!(report.undo, Some(UndoAction::Copy { .. })));
        assert_eq!(rx.recv().await.map(|p| p.files_total), Some(2));
    }

    #[tokio::test]
    async fn test_failed_copy_is_compensated() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();
        fs::write(src.join("b.txt"), "new b").unwrap();
        fs::write(dst.join("b.txt"), "old b").unwrap();

        // Width 1 keeps completion order deterministic; the third item's source is missing.
        let plan = Plan {
            operations: vec![
                op(src.join("a.txt"), dst.join("a.txt"), false),
                op(src.join("b.txt"), dst.join("b.txt"), true),
                op(src.join("gone.txt"), dst.join("gone.txt"), false),
                op(src.join("a.txt"), dst.join("never.txt"), false),
            ],
            skipped: Vec::new(),
            destination_dir: dst.clone(),
        };
        let err = executor(&dir, 1)
            .execute(OperationType::Copy, &plan)
            .await
            .unwrap_err();

        assert!(matches!(err, OpsError::BatchFailed { .. }));
        assert!(err.recovery_paths().is_empty());
        let names: Vec<String> = fs::read_dir(&dst)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b.txt".to_string()]);
        assert_eq!(fs::read_to_string(dst.join("b.txt")).unwrap(), "old b");
    }

    #[tokio::test]
    async fn test_failed_move_puts_items_back() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();
        fs::write(src.join("b.txt"), "b").unwrap();

        let plan = Plan {
            operations: vec![
                op(src.join("a.txt"), dst.join("a.txt"), false),
                op(src.join("b.txt"), dst.join("b.txt"), false),
                op(src.join("gone.txt"), dst.join("gone.txt"), false),
            ],
            skipped: Vec::new(),
            destination_dir: dst.clone(),
        };
        let err = executor(&dir, 2)
            .execute(OperationType::Move, &plan)
            .await
            .unwrap_err();

        assert!(matches!(err, OpsError::BatchFailed { .. }));
        assert_eq!(fs::read_to_string(src.join("a.txt")).unwrap(), "a");
        assert_eq!(fs::read_to_string(src.join("b.txt")).unwrap(), "b");
        assert_eq!(fs::read_dir(&dst).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_copy_leaves_item_that_appeared_after_planning() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("a.txt"), "ours").unwrap();

        let plan = Plan {
            operations: vec![op(src.join("a.txt"), dst.join("a.txt"), false)],
            skipped: Vec::new(),
            destination_dir: dst.clone(),
        };
        // Someone else created the name after the plan was made.
        fs::write(dst.join("a.txt"), "theirs").unwrap();

        let err = executor(&dir, 1)
            .execute(OperationType::Copy, &plan)
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::BatchFailed { .. }));
        assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "theirs");
    }

    #[tokio::test]
    async fn test_failed_move_restores_overwritten_destination() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("a.txt"), "new a").unwrap();
        fs::write(dst.join("a.txt"), "old a").unwrap();

        let plan = Plan {
            operations: vec![
                op(src.join("a.txt"), dst.join("a.txt"), true),
                op(src.join("gone.txt"), dst.join("gone.txt"), false),
            ],
            skipped: Vec::new(),
            destination_dir: dst.clone(),
        };
        let err = executor(&dir, 1)
            .execute(OperationType::Move, &plan)
            .await
            .unwrap_err();

        assert!(matches!(err, OpsError::BatchFailed { .. }));
        assert!(err.recovery_paths().is_empty());
        assert_eq!(fs::read_to_string(src.join("a.txt")).unwrap(), "new a");
        assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "old a");
        assert_eq!(fs::read_dir(&dst).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_unrestorable_backup_is_stashed_and_reported() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("a.txt"), "new a").unwrap();
        fs::write(dst.join("a.txt"), "old a").unwrap();

        let item = op(src.join("a.txt"), dst.join("a.txt"), true);
        let executor = executor(&dir, 1);
        let backups = OverwriteBackups::new(10);
        backups.ensure(&item).await.unwrap();
        fs::rename(src.join("a.txt"), dst.join("a.txt")).unwrap();
        // The source folder disappears before the move can be put back.
        fs::remove_dir(&src).unwrap();

        let err = executor
            .abort(
                OperationType::Move,
                &[&item],
                &backups,
                src.join("b.txt"),
                OpsError::NotFound {
                    path: src.join("b.txt"),
                },
            )
            .await;

        let recovery = err.recovery_paths().to_vec();
        assert_eq!(recovery.len(), 1);
        assert!(recovery[0].starts_with(dir.path().join("stash")));
        assert_eq!(fs::read_to_string(&recovery[0]).unwrap(), "old a");
        assert!(err.to_string().contains(&recovery[0].display().to_string()));
        // The moved item still occupies the destination and was not clobbered.
        assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "new a");
        assert_eq!(fs::read_dir(&dst).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_move_records_parent_origin() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();

        let plan = Plan {
            operations: vec![op(src.join("a.txt"), dst.join("a.txt"), false)],
            skipped: Vec::new(),
            destination_dir: dst.clone(),
        };
        let report = executor(&dir, 4)
            .execute(OperationType::Move, &plan)
            .await
            .unwrap();

        assert!(!src.join("a.txt").exists());
        assert_eq!(
            report.undo,
            Some(UndoAction::Move {
                moved: vec![dst.join("a.txt")],
                origin: MoveOrigin::Parent(src.clone()),
                destination_dir: dst.clone(),
            })
        );
    }

    #[tokio::test]
    async fn test_rejects_non_transfer_kind() {
        let dir = TempDir::new().unwrap();
        let err = executor(&dir, 4)
            .execute(OperationType::Rename, &Plan::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::TaskFailed { .. }));
    }
}
