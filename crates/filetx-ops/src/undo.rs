//! Undo/redo records and the bounded two-stack history.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Where the items of a move came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MoveOrigin {
    /// One original path per moved item, index-aligned with `moved`.
    Paths(Vec<PathBuf>),
    /// All items came from this directory under their current names.
    Parent(PathBuf),
}

impl MoveOrigin {
    /// Original location of every item in `moved`.
    pub fn targets(&self, moved: &[PathBuf]) -> Vec<PathBuf> {
        match self {
            Self::Paths(paths) => paths.clone(),
            Self::Parent(parent) => moved
                .iter()
                .map(|path| match path.file_name() {
                    Some(name) => parent.join(name),
                    None => parent.clone(),
                })
                .collect(),
        }
    }

    /// The origin restricted to the items at `indices`.
    pub fn subset(&self, indices: &[usize]) -> Self {
        match self {
            Self::Paths(paths) => Self::Paths(
                indices
                    .iter()
                    .filter_map(|&i| paths.get(i).cloned())
                    .collect(),
            ),
            Self::Parent(parent) => Self::Parent(parent.clone()),
        }
    }
}

/// One step of a batch rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamePair {
    pub old_path: PathBuf,
    pub new_path: PathBuf,
}

/// A completed mutation plus what is needed to reverse it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UndoAction {
    /// A file or directory was created empty.
    Create {
        path: PathBuf,
        is_directory: bool,
        /// Birth time observed right after creation, when available.
        created_at: Option<SystemTime>,
    },
    /// One item was renamed in place.
    Rename { old_path: PathBuf, new_path: PathBuf },
    /// Items were moved into `destination_dir`; `moved` holds their current paths.
    Move {
        moved: Vec<PathBuf>,
        origin: MoveOrigin,
        destination_dir: PathBuf,
    },
    /// Several renames applied in order.
    BatchRename { renames: Vec<RenamePair> },
    /// `sources[i]` was copied to `created[i]`.
    Copy {
        sources: Vec<PathBuf>,
        created: Vec<PathBuf>,
    },
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl UndoAction {
    /// Record for renames applied in the given `(old, new)` order.
    pub fn batch_rename(pairs: impl IntoIterator<Item = (PathBuf, PathBuf)>) -> Self {
        Self::BatchRename {
            renames: pairs
                .into_iter()
                .map(|(old_path, new_path)| RenamePair { old_path, new_path })
                .collect(),
        }
    }

    /// What the original operation did.
    pub fn description(&self) -> String {
        match self {
            Self::Create {
                path, is_directory, ..
            } => {
                let kind = if *is_directory { "directory" } else { "file" };
                format!("Created {kind} '{}'", display_name(path))
            }
            Self::Rename { old_path, new_path } => format!(
                "Renamed '{}' to '{}'",
                display_name(old_path),
                display_name(new_path)
            ),
            Self::Move {
                moved,
                destination_dir,
                ..
            } => format!(
                "Moved {} items to '{}'",
                moved.len(),
                destination_dir.display()
            ),
            Self::BatchRename { renames } => format!("Renamed {} items", renames.len()),
            Self::Copy { created, .. } => format!("Copied {} items", created.len()),
        }
    }

    /// What undoing the operation will do.
    pub fn undo_description(&self) -> String {
        match self {
            Self::Create { is_directory, .. } => {
                if *is_directory {
                    "Delete the created directory".to_string()
                } else {
                    "Delete the created file".to_string()
                }
            }
            Self::Rename { old_path, .. } => {
                format!("Rename back to '{}'", display_name(old_path))
            }
            Self::Move { moved, .. } => {
                format!("Move {} items back to original location", moved.len())
            }
            Self::BatchRename { renames } => format!("Restore {} original names", renames.len()),
            Self::Copy { created, .. } => format!("Delete {} copied items", created.len()),
        }
    }

    /// Every path the record mentions.
    pub fn referenced_paths(&self) -> Vec<PathBuf> {
        match self {
            Self::Create { path, .. } => vec![path.clone()],
            Self::Rename { old_path, new_path } => vec![old_path.clone(), new_path.clone()],
            Self::Move {
                moved,
                origin,
                destination_dir,
            } => {
                let mut paths = moved.clone();
                paths.extend(origin.targets(moved));
                paths.push(destination_dir.clone());
                paths
            }
            Self::BatchRename { renames } => renames
                .iter()
                .flat_map(|pair| [pair.old_path.clone(), pair.new_path.clone()])
                .collect(),
            Self::Copy { sources, created } => {
                sources.iter().chain(created.iter()).cloned().collect()
            }
        }
    }

    /// (before, after) path pairs that denote the same item.
    pub fn identity_links(&self) -> Vec<(PathBuf, PathBuf)> {
        match self {
            Self::Rename { old_path, new_path } => vec![(old_path.clone(), new_path.clone())],
            Self::Move { moved, origin, .. } => {
                origin.targets(moved).into_iter().zip(moved.iter().cloned()).collect()
            }
            Self::BatchRename { renames } => renames
                .iter()
                .map(|pair| (pair.old_path.clone(), pair.new_path.clone()))
                .collect(),
            Self::Create { .. } | Self::Copy { .. } => Vec::new(),
        }
    }
}

/// An entry on either stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoEntry {
    /// Unique ID for this entry.
    pub id: u64,
    /// When the operation was performed.
    pub timestamp: SystemTime,
    /// The reversible record.
    pub action: UndoAction,
    /// Human-readable description.
    pub description: String,
}

impl UndoEntry {
    /// Create a new entry stamped now.
    pub fn new(id: u64, action: UndoAction) -> Self {
        Self {
            id,
            timestamp: SystemTime::now(),
            description: action.description(),
            action,
        }
    }
}

/// Both stacks of the history, capped at `capacity` entries each.
///
/// The back of each deque is the top of the stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoHistory {
    undo: VecDeque<UndoEntry>,
    redo: VecDeque<UndoEntry>,
    capacity: usize,
    next_id: u64,
}

impl Default for UndoHistory {
    fn default() -> Self {
        Self::new(50)
    }
}

impl UndoHistory {
    /// Create an empty history holding at most `capacity` entries per stack.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            undo: VecDeque::with_capacity(capacity.min(1000)),
            redo: VecDeque::with_capacity(capacity.min(1000)),
            capacity,
            next_id: 0,
        }
    }

    /// Per-stack entry limit.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the per-stack limit, evicting the oldest entries if needed.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        Self::trim(&mut self.undo, self.capacity);
        Self::trim(&mut self.redo, self.capacity);
    }

    fn trim(stack: &mut VecDeque<UndoEntry>, capacity: usize) {
        while stack.len() > capacity {
            stack.pop_front();
        }
    }

    fn allocate(&mut self, action: UndoAction) -> UndoEntry {
        let id = self.next_id;
        self.next_id += 1;
        UndoEntry::new(id, action)
    }

    /// Record a new operation. Clears the redo stack.
    ///
    /// Returns the ID assigned to this entry.
    pub fn push(&mut self, action: UndoAction) -> u64 {
        let entry = self.allocate(action);
        let id = entry.id;
        self.redo.clear();
        self.undo.push_back(entry);
        Self::trim(&mut self.undo, self.capacity);
        id
    }

    /// Put an entry back on the undo stack without touching redo.
    pub fn push_back_undo(&mut self, entry: UndoEntry) {
        self.undo.push_back(entry);
        Self::trim(&mut self.undo, self.capacity);
    }

    /// Push a fresh entry for `action` onto the undo stack without touching redo.
    ///
    /// Used when an undo only partly succeeded and the rest must stay retryable.
    pub fn push_remainder(&mut self, action: UndoAction) -> u64 {
        let entry = self.allocate(action);
        let id = entry.id;
        self.push_back_undo(entry);
        id
    }

    /// Put an entry on the redo stack.
    pub fn push_redo(&mut self, entry: UndoEntry) {
        self.redo.push_back(entry);
        Self::trim(&mut self.redo, self.capacity);
    }

    /// Take the most recent undo entry.
    pub fn pop_undo(&mut self) -> Option<UndoEntry> {
        self.undo.pop_back()
    }

    /// Take the most recent redo entry.
    pub fn pop_redo(&mut self) -> Option<UndoEntry> {
        self.redo.pop_back()
    }

    /// Undo entries, oldest first.
    pub fn undo_stack(&self) -> impl DoubleEndedIterator<Item = &UndoEntry> {
        self.undo.iter()
    }

    /// Redo entries, oldest first.
    pub fn redo_stack(&self) -> impl DoubleEndedIterator<Item = &UndoEntry> {
        self.redo.iter()
    }

    /// Number of undoable entries.
    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    /// Number of redoable entries.
    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    /// Whether there is anything to undo.
    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    /// Whether there is anything to redo.
    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Drop every entry that refers to `path` after it was permanently deleted.
    ///
    /// The deleted path is first expanded through the renames and moves on
    /// both stacks, so older names of the same item are pruned too. Returns
    /// the number of entries removed.
    pub fn clear_for_path(&mut self, path: &Path) -> usize {
        // (current name, earlier name). Redo entries are currently reverted,
        // so their links point the other way.
        let links: Vec<(PathBuf, PathBuf)> = self
            .undo
            .iter()
            .flat_map(|entry| {
                entry
                    .action
                    .identity_links()
                    .into_iter()
                    .map(|(before, after)| (after, before))
            })
            .chain(
                self.redo
                    .iter()
                    .flat_map(|entry| entry.action.identity_links()),
            )
            .collect();

        let mut doomed = vec![path.to_path_buf()];
        let mut cursor = 0;
        // Bounded in case a link chain keeps producing deeper paths.
        while cursor < doomed.len() && doomed.len() < 4096 {
            let current = doomed[cursor].clone();
            cursor += 1;
            for (now, earlier) in &links {
                if let Some(next) = counterpart(now, earlier, &current) {
                    if !doomed.contains(&next) {
                        doomed.push(next);
                    }
                }
            }
        }

        let touches = |entry: &UndoEntry| {
            entry
                .action
                .referenced_paths()
                .iter()
                .any(|p| doomed.iter().any(|d| p.starts_with(d)))
        };

        let before = self.undo.len() + self.redo.len();
        self.undo.retain(|entry| !touches(entry));
        self.redo.retain(|entry| !touches(entry));
        let removed = before - self.undo.len() - self.redo.len();
        if removed > 0 {
            tracing::debug!(
                path = %path.display(),
                aliases = doomed.len(),
                removed,
                "pruned history for deleted path"
            );
        }
        removed
    }
}

/// The path `doomed` corresponds to under the item's other name.
///
/// `from` and `to` are two names of one item. A doomed path inside `from`
/// maps to the same relative path inside `to`; when the whole item lies
/// inside the doomed path, all of `to` is doomed.
fn counterpart(from: &Path, to: &Path, doomed: &Path) -> Option<PathBuf> {
    if let Ok(rel) = doomed.strip_prefix(from) {
        if rel.as_os_str().is_empty() {
            Some(to.to_path_buf())
        } else {
            Some(to.join(rel))
        }
    } else if from.starts_with(doomed) {
        Some(to.to_path_buf())
    } else {
        None
    }
}
