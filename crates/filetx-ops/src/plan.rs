//! Turning a batch request into a validated, ordered plan.
//!
//! Planning only inspects the filesystem (stat, canonicalize); it never
//! mutates anything. Every validation error is reported before execution
//! starts, so a rejected batch leaves the disk exactly as it was.

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use filetx_core::{OpsError, OpsResult};

use crate::conflict::{ConflictChoice, ConflictPolicy, ConflictResolver};
use crate::naming::{collision_key, path_exists, unique_child_name};
use crate::progress::OperationType;

/// Predicate deciding whether a path may be touched at all.
pub type PathSafety = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Default predicate: absolute paths without `..` components.
pub fn allow_absolute_paths() -> PathSafety {
    Arc::new(|path: &Path| {
        path.is_absolute() && !path.components().any(|c| matches!(c, Component::ParentDir))
    })
}

/// One resolved, collision-free mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedOperation {
    /// Item being copied or moved.
    pub source: PathBuf,
    /// Final location of the item.
    pub destination: PathBuf,
    /// File name at the destination (differs from the source when renamed).
    pub item_name: String,
    /// Whether the source is a directory.
    pub is_directory: bool,
    /// Whether an existing destination must be replaced.
    pub overwrite: bool,
}

/// The ordered output of planning.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Operations to execute, in source order.
    pub operations: Vec<PlannedOperation>,
    /// Sources dropped by a `skip` decision.
    pub skipped: Vec<PathBuf>,
    /// Directory the batch targets.
    pub destination_dir: PathBuf,
}

impl Plan {
    /// Number of operations to execute.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether nothing is left to execute.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Whether any item lands under a different name than its source.
    pub fn has_renames(&self) -> bool {
        self.operations
            .iter()
            .any(|op| op.source.file_name() != Some(OsStr::new(&op.item_name)))
    }
}

struct Candidate {
    source: PathBuf,
    name: String,
    is_directory: bool,
    in_destination: bool,
}

/// Builds plans for copy and move batches.
pub struct Planner<'a> {
    safety: &'a PathSafety,
    resolver: Option<&'a dyn ConflictResolver>,
}

impl<'a> Planner<'a> {
    /// Create a planner using `safety` to vet every path.
    pub fn new(safety: &'a PathSafety) -> Self {
        Self {
            safety,
            resolver: None,
        }
    }

    /// Use `resolver` for the `ask` policy.
    pub fn with_resolver(mut self, resolver: &'a dyn ConflictResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Validate `sources` against `destination` and resolve name conflicts.
    ///
    /// A `cancel` decision (from the policy or the resolver) fails the whole
    /// batch with [`OpsError::Cancelled`]; no partial plan is returned. With
    /// `ask` and no resolver installed, the batch is cancelled as well.
    pub async fn plan(
        &self,
        kind: OperationType,
        sources: &[PathBuf],
        destination: &Path,
        policy: ConflictPolicy,
    ) -> OpsResult<Plan> {
        if sources.is_empty() {
            return Err(OpsError::EmptyBatch);
        }

        self.check_safe(destination)?;
        let dest_meta = fs::metadata(destination).map_err(|e| OpsError::io(destination, e))?;
        if !dest_meta.is_dir() {
            return Err(OpsError::NotADirectory {
                path: destination.to_path_buf(),
            });
        }
        let real_destination = resolve_real(destination);

        let candidates = self.validate(sources, destination, &real_destination)?;

        let mut plan = Plan {
            destination_dir: destination.to_path_buf(),
            ..Plan::default()
        };
        let mut reserved: HashSet<String> = HashSet::new();
        let mut answers: HashMap<String, ConflictChoice> = HashMap::new();

        for candidate in candidates {
            let key = collision_key(&candidate.name);
            let target = destination.join(&candidate.name);
            let reserved_by_plan = reserved.contains(&key);

            let choice = if candidate.in_destination {
                match kind {
                    // Moving an item onto itself is a no-op.
                    OperationType::Move => Some(ConflictChoice::Skip),
                    _ => Some(ConflictChoice::Rename),
                }
            } else if reserved_by_plan {
                Some(ConflictChoice::Rename)
            } else if path_exists(&target) {
                Some(self.choose(policy, &candidate.name, &key, &mut answers).await)
            } else {
                None
            };

            let (name, overwrite) = match choice {
                None => (candidate.name, false),
                Some(ConflictChoice::Rename) => (
                    unique_child_name(
                        destination,
                        &candidate.name,
                        candidate.is_directory,
                        &reserved,
                    ),
                    false,
                ),
                Some(ConflictChoice::Overwrite) => (candidate.name, true),
                Some(ConflictChoice::Skip) => {
                    tracing::debug!(source = %candidate.source.display(), "skipping conflicting item");
                    plan.skipped.push(candidate.source);
                    continue;
                }
                Some(ConflictChoice::Cancel) => {
                    tracing::info!(name = %candidate.name, "batch cancelled at conflict");
                    return Err(OpsError::Cancelled);
                }
            };

            reserved.insert(collision_key(&name));
            plan.operations.push(PlannedOperation {
                destination: destination.join(&name),
                source: candidate.source,
                item_name: name,
                is_directory: candidate.is_directory,
                overwrite,
            });
        }

        tracing::debug!(
            kind = %kind,
            planned = plan.operations.len(),
            skipped = plan.skipped.len(),
            "batch planned"
        );
        Ok(plan)
    }

    /// Safety, batch-wide name collisions and self-containment, in that order.
    fn validate(
        &self,
        sources: &[PathBuf],
        destination: &Path,
        real_destination: &Path,
    ) -> OpsResult<Vec<Candidate>> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut candidates = Vec::with_capacity(sources.len());

        for source in sources {
            self.check_safe(source)?;

            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| OpsError::InvalidName {
                    name: source.display().to_string(),
                    reason: "path has no final component".to_string(),
                })?;

            if !seen.insert(collision_key(&name)) {
                return Err(OpsError::NameCollision { name });
            }

            let metadata = fs::symlink_metadata(source).map_err(|e| OpsError::io(source, e))?;
            let is_directory = metadata.is_dir();
            let real_source = resolve_real(source);

            if is_directory && real_destination.starts_with(&real_source) {
                return Err(OpsError::SelfContainment {
                    item: source.clone(),
                    destination: destination.to_path_buf(),
                });
            }

            let in_destination = source
                .parent()
                .map(|parent| resolve_real(parent) == real_destination)
                .unwrap_or(false);

            candidates.push(Candidate {
                source: source.clone(),
                name,
                is_directory,
                in_destination,
            });
        }

        Ok(candidates)
    }

    async fn choose(
        &self,
        policy: ConflictPolicy,
        name: &str,
        key: &str,
        answers: &mut HashMap<String, ConflictChoice>,
    ) -> ConflictChoice {
        if let Some(choice) = policy.fixed_choice() {
            return choice;
        }
        if let Some(choice) = answers.get(key) {
            return *choice;
        }
        let choice = match self.resolver {
            Some(resolver) => resolver.resolve(name).await,
            None => {
                tracing::warn!(name, "conflict policy is 'ask' but no resolver is installed");
                ConflictChoice::Cancel
            }
        };
        answers.insert(key.to_string(), choice);
        choice
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

/// Symlink-resolved path, falling back to the path as given.
fn resolve_real(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
