//! Overwrite backups, rollback, and the bounded stash store.
//!
//! Before an item overwrites an existing destination, the destination is
//! renamed to a hidden sibling. Renaming within one directory stays on one
//! volume, so the relocation is a single atomic call. The batch then either
//! deletes the backups (commit), moves them back (rollback), or, when a
//! backup cannot be moved back, stashes it under the application data
//! directory for manual recovery.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use filetime::FileTime;
use indexmap::IndexMap;
use uuid::Uuid;

use filetx_core::{EngineConfig, OpsError, OpsResult};

use crate::fs_move::{move_path, remove_path, run_blocking};
use crate::naming::path_exists;
use crate::plan::PlannedOperation;

/// Backups taken during one batch: destination → relocated original.
///
/// Holds at most one backup per destination no matter how often
/// [`ensure`](Self::ensure) is called for it.
#[derive(Debug)]
pub struct OverwriteBackups {
    entries: Mutex<IndexMap<PathBuf, PathBuf>>,
    /// Held from the lookup until the relocation is recorded.
    relocating: tokio::sync::Mutex<()>,
    retries: u32,
}

impl OverwriteBackups {
    /// Create an empty backup set trying `retries` sibling names per backup.
    pub fn new(retries: u32) -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            relocating: tokio::sync::Mutex::new(()),
            retries: retries.max(1),
        }
    }

    fn entries(&self) -> MutexGuard<'_, IndexMap<PathBuf, PathBuf>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of backups recorded.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether no backup has been taken.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Snapshot of all recorded (destination, backup) pairs.
    pub fn pairs(&self) -> Vec<(PathBuf, PathBuf)> {
        self.entries()
            .iter()
            .map(|(dest, backup)| (dest.clone(), backup.clone()))
            .collect()
    }

    /// Back up `op.destination` if `op` overwrites and no backup exists yet.
    ///
    /// Returns the backup path when one was taken by this call. A failed
    /// relocation is returned to the caller; it is the only error in this
    /// module that is not swallowed.
    pub async fn ensure(&self, op: &PlannedOperation) -> OpsResult<Option<PathBuf>> {
        if !op.overwrite {
            return Ok(None);
        }
        let _relocating = self.relocating.lock().await;
        if self.entries().contains_key(&op.destination) {
            return Ok(None);
        }

        let destination = op.destination.clone();
        let retries = self.retries;
        let backup = run_blocking(move || relocate_to_sibling(&destination, retries)).await?;

        self.entries()
            .entry(op.destination.clone())
            .or_insert_with(|| backup.clone());
        tracing::debug!(
            destination = %op.destination.display(),
            backup = %backup.display(),
            "destination backed up before overwrite"
        );
        Ok(Some(backup))
    }

    /// Move every backup back over its destination.
    ///
    /// With `skip_if_destination_exists`, a destination that is currently
    /// occupied is left alone and its backup stays where it is. Each failure
    /// is logged and does not stop the remaining restores. Returns how many
    /// backups were restored.
    pub async fn restore(&self, skip_if_destination_exists: bool) -> usize {
        let pairs = self.pairs();
        let result = run_blocking(move || {
            let mut restored = 0;
            for (destination, backup) in pairs {
                if !path_exists(&backup) {
                    continue;
                }
                if skip_if_destination_exists && path_exists(&destination) {
                    continue;
                }
                if path_exists(&destination) {
                    if let Err(e) = remove_path(&destination) {
                        tracing::warn!(destination = %destination.display(), error = %e, "could not clear destination for restore");
                        continue;
                    }
                }
                match fs::rename(&backup, &destination) {
                    Ok(()) => restored += 1,
                    Err(e) => {
                        tracing::warn!(backup = %backup.display(), error = %e, "could not restore backup");
                    }
                }
            }
            Ok(restored)
        })
        .await;

        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "backup restore task failed");
            0
        })
    }

    /// Stash every backup that still exists and prune the store.
    ///
    /// Returns the stash paths so the caller can tell the user where the
    /// overwritten data went.
    pub async fn stash_remaining(&self, store: &BackupStore) -> Vec<PathBuf> {
        let pairs = self.pairs();
        let store = store.clone();
        let result = run_blocking(move || {
            let mut stashed = Vec::new();
            for (destination, backup) in pairs {
                if !path_exists(&backup) {
                    continue;
                }
                match store.stash(&destination, &backup) {
                    Ok(path) => {
                        tracing::warn!(
                            destination = %destination.display(),
                            stash = %path.display(),
                            "overwritten data could not be restored and was stashed"
                        );
                        stashed.push(path);
                    }
                    Err(e) => {
                        tracing::warn!(backup = %backup.display(), error = %e, "could not stash backup");
                    }
                }
            }
            if let Err(e) = store.prune() {
                tracing::warn!(error = %e, "stash prune failed");
            }
            Ok(stashed)
        })
        .await;

        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "backup stash task failed");
            Vec::new()
        })
    }

    /// Delete all backups after a successful batch.
    pub async fn commit(&self) {
        let pairs = std::mem::take(&mut *self.entries());
        if pairs.is_empty() {
            return;
        }
        let result = run_blocking(move || {
            for backup in pairs.values() {
                if path_exists(backup) {
                    if let Err(e) = remove_path(backup) {
                        tracing::warn!(backup = %backup.display(), error = %e, "could not delete backup");
                    }
                }
            }
            Ok(())
        })
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "backup cleanup task failed");
        }
    }
}

/// Rename `destination` to a free hidden sibling and return the new path.
fn relocate_to_sibling(destination: &Path, retries: u32) -> OpsResult<PathBuf> {
    let parent = destination.parent().unwrap_or(Path::new(""));
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    for _ in 0..retries {
        let suffix = &Uuid::new_v4().simple().to_string()[..8];
        let candidate = parent.join(format!(".{name}.filetx-backup-{suffix}"));
        if path_exists(&candidate) {
            continue;
        }
        match fs::rename(destination, &candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(OpsError::io(destination, e)),
        }
    }

    Err(OpsError::io(
        destination,
        std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "no free backup name after retries",
        ),
    ))
}

/// A backup kept in the stash store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashedBackup {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// What a prune pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Files removed for exceeding the age ceiling.
    pub expired: usize,
    /// Oldest files removed to get under the count ceiling.
    pub evicted: usize,
    /// Files left in the store.
    pub remaining: usize,
}

/// Bounded long-term storage for backups that could not be restored.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
    max_age: Duration,
    max_files: usize,
}

impl BackupStore {
    /// Create a store in `dir` with the given retention limits.
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration, max_files: usize) -> Self {
        Self {
            dir: dir.into(),
            max_age,
            max_files,
        }
    }

    /// Create a store from engine configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.backup_dir(),
            config.stash_max_age,
            config.stash_max_files,
        )
    }

    /// Directory holding stashed files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stash file name for a backup of `destination`.
    ///
    /// `<stem>.<hash8>-<epochMs>-<rand4><ext>.bak`, where the hash is over
    /// the full destination path.
    pub fn stash_name(destination: &Path) -> String {
        let name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "backup".to_string());
        let (stem, ext) = match name.rfind('.') {
            Some(0) | None => (name.as_str(), ""),
            Some(idx) => name.split_at(idx),
        };
        let hash = blake3::hash(destination.as_os_str().as_encoded_bytes()).to_hex();
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let rand = &Uuid::new_v4().simple().to_string()[..4];
        format!("{stem}.{}-{epoch_ms}-{rand}{ext}.bak", &hash[..8])
    }

    /// Move `backup` into the store and return its new path.
    pub fn stash(&self, destination: &Path, backup: &Path) -> OpsResult<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| OpsError::io(&self.dir, e))?;
        let target = self.dir.join(Self::stash_name(destination));
        move_path(backup, &target)?;
        // Retention is by stash time, not by the original's age.
        let now = FileTime::now();
        if let Err(e) = filetime::set_symlink_file_times(&target, now, now) {
            tracing::warn!(path = %target.display(), error = %e, "could not stamp stashed backup");
        }
        Ok(target)
    }

    /// All stashed backups, newest first.
    pub fn list(&self) -> OpsResult<Vec<StashedBackup>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(OpsError::io(&self.dir, e)),
        };

        let mut stashed: Vec<StashedBackup> = entries
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".bak"))
            .filter_map(|entry| {
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some(StashedBackup {
                    path: entry.path(),
                    modified,
                })
            })
            .collect();
        stashed.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(stashed)
    }

    /// Enforce retention: age ceiling first, then the count ceiling.
    pub fn prune(&self) -> OpsResult<PruneReport> {
        let now = SystemTime::now();
        let mut report = PruneReport::default();
        let mut kept = Vec::new();

        for stashed in self.list()? {
            let age = now.duration_since(stashed.modified).unwrap_or(Duration::ZERO);
            if age > self.max_age {
                if self.discard(&stashed.path) {
                    report.expired += 1;
                }
            } else {
                kept.push(stashed);
            }
        }

        // `kept` is newest first; everything past max_files is the oldest excess.
        if kept.len() > self.max_files {
            for stashed in kept.split_off(self.max_files) {
                if self.discard(&stashed.path) {
                    report.evicted += 1;
                }
            }
        }

        report.remaining = kept.len();
        if report.expired + report.evicted > 0 {
            tracing::info!(
                expired = report.expired,
                evicted = report.evicted,
                remaining = report.remaining,
                "pruned stashed backups"
            );
        }
        Ok(report)
    }

    fn discard(&self, path: &Path) -> bool {
        match remove_path(path) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not delete stashed backup");
                false
            }
        }
    }
}
