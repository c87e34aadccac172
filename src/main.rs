//! filetx - transactional copy, move and rename with undo.
//!
//! Usage:
//!   filetx copy SRC... DEST        Copy items into a directory
//!   filetx move SRC... DEST        Move items into a directory
//!   filetx rename PATH NAME        Rename in place
//!   filetx undo | redo             Replay the history
//!   filetx history                 Show the undo and redo stacks
//!   filetx stash list | prune      Inspect stashed overwrite backups
//!   filetx size PATH...            Folder sizes on the task pool
//!   filetx checksum FILE...        BLAKE3 digests on the task pool

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{eyre, Context, Result};
use serde_json::json;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use filetx_core::{EngineConfig, SchedulerConfig};
use filetx_ops::{
    BatchReport, ConflictChoice, ConflictPolicy, ConflictResolver, FileOpsEngine,
    OperationProgress, UndoEntry, UndoHistory, OPERATION_CHANNEL_SIZE,
};
use filetx_tasks::TaskScheduler;

#[derive(Parser)]
#[command(
    name = "filetx",
    version,
    about = "Transactional file operations with undo",
    long_about = "filetx copies, moves and renames files as all-or-nothing batches.\n\n\
                  Anything an overwrite would destroy is backed up first, and every \
                  completed operation can be undone and redone."
)]
struct Cli {
    /// Data directory for history and stashed backups
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy items into a directory
    Copy {
        /// Items to copy followed by the destination directory
        #[arg(required = true, num_args = 2..)]
        paths: Vec<PathBuf>,

        /// What to do when a name already exists
        #[arg(short = 'c', long, default_value = "ask")]
        on_conflict: Policy,
    },

    /// Move items into a directory
    Move {
        /// Items to move followed by the destination directory
        #[arg(required = true, num_args = 2..)]
        paths: Vec<PathBuf>,

        /// What to do when a name already exists
        #[arg(short = 'c', long, default_value = "ask")]
        on_conflict: Policy,
    },

    #[command(flatten)]
    Edit(EditCommand),

    /// Show the undo and redo stacks
    History {
        /// Print the raw history as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect or prune stashed overwrite backups
    Stash {
        #[command(subcommand)]
        action: StashAction,
    },

    /// Compute folder sizes on the task pool
    Size {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Number of workers (defaults to a CPU and memory based size)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Compute BLAKE3 checksums on the task pool
    Checksum {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Number of workers (defaults to a CPU and memory based size)
        #[arg(short, long)]
        workers: Option<usize>,
    },
}

/// Commands that change the filesystem and the persisted history.
#[derive(Subcommand)]
enum EditCommand {
    /// Rename an item in place
    Rename { path: PathBuf, new_name: String },

    /// Rename several items at once (PATH=NEW_NAME pairs)
    BatchRename {
        #[arg(required = true)]
        pairs: Vec<String>,
    },

    /// Create an empty file
    Touch { path: PathBuf },

    /// Create a directory
    Mkdir { path: PathBuf },

    /// Undo the most recent operation
    Undo,

    /// Redo the most recently undone operation
    Redo,
}

#[derive(Subcommand)]
enum StashAction {
    /// List stashed backups, newest first
    List,
    /// Apply the age and count limits
    Prune,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Policy {
    Ask,
    Rename,
    Skip,
    Overwrite,
    Cancel,
}

impl From<Policy> for ConflictPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Ask => ConflictPolicy::Ask,
            Policy::Rename => ConflictPolicy::Rename,
            Policy::Skip => ConflictPolicy::Skip,
            Policy::Overwrite => ConflictPolicy::Overwrite,
            Policy::Cancel => ConflictPolicy::Cancel,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_logging();

    let cli = Cli::parse();
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .map(|dir| dir.join("filetx"))
            .ok_or_else(|| eyre!("No data directory available; pass --data-dir"))?,
    };
    let config = EngineConfig::new(data_dir);
    tracing::debug!(data_dir = %config.data_dir.display(), "using data directory");

    match cli.command {
        Command::Copy { paths, on_conflict } => {
            run_transfer(&config, false, paths, on_conflict.into()).await?
        }
        Command::Move { paths, on_conflict } => {
            run_transfer(&config, true, paths, on_conflict.into()).await?
        }
        Command::Edit(edit) => run_edit(&config, edit).await?,
        Command::History { json } => run_history(&config, json)?,
        Command::Stash { action } => run_stash(&config, action).await?,
        Command::Size { paths, workers } => run_pool("folder-size", paths, workers).await?,
        Command::Checksum { files, workers } => run_pool("checksum", files, workers).await?,
    }

    Ok(())
}

/// Log to stderr, filtered by `FILETX_LOG` (default `warn`).
fn init_logging() {
    let filter = EnvFilter::try_from_env("FILETX_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Apply one edit and persist the history, even when the edit fails
/// (a failed undo may still have changed the stacks).
async fn run_edit(config: &EngineConfig, command: EditCommand) -> Result<()> {
    let engine = open_engine(config)?;
    let outcome = apply_edit(&engine, command).await;
    save_history(config, &engine.history())?;
    println!("{}", outcome?);
    Ok(())
}

async fn apply_edit(engine: &FileOpsEngine, command: EditCommand) -> Result<String> {
    let message = match command {
        EditCommand::Rename { path, new_name } => {
            let path = resolve(&path)?;
            let renamed = engine.rename(&path, &new_name).await?;
            format!("{} -> {}", path.display(), renamed.display())
        }
        EditCommand::BatchRename { pairs } => {
            let renames = pairs
                .iter()
                .map(|pair| {
                    let (path, name) = parse_rename_pair(pair)?;
                    Ok((resolve(&path)?, name))
                })
                .collect::<Result<Vec<_>>>()?;
            let renamed = engine.batch_rename(&renames).await?;
            format!("Renamed {} item(s)", renamed.len())
        }
        EditCommand::Touch { path } => {
            let created = engine.create_file(&resolve(&path)?).await?;
            format!("Created {}", created.display())
        }
        EditCommand::Mkdir { path } => {
            let created = engine.create_directory(&resolve(&path)?).await?;
            format!("Created {}", created.display())
        }
        EditCommand::Undo => format!("Undid: {}", engine.undo().await?.description),
        EditCommand::Redo => format!("Redid: {}", engine.redo().await?.description),
    };
    Ok(message)
}

fn open_engine(config: &EngineConfig) -> Result<FileOpsEngine> {
    let history = load_history(config)?;
    Ok(FileOpsEngine::new(config.clone()).with_history(history))
}

fn load_history(config: &EngineConfig) -> Result<UndoHistory> {
    let path = config.history_path();
    match std::fs::read_to_string(&path) {
        Ok(json) => serde_json::from_str(&json)
            .with_context(|| format!("Corrupt history file {}", path.display())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Ok(UndoHistory::new(config.undo_capacity))
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

fn save_history(config: &EngineConfig, history: &UndoHistory) -> Result<()> {
    let path = config.history_path();
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(history)?)?;
    std::fs::rename(&tmp, &path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Run a copy or move, showing progress on stderr.
async fn run_transfer(
    config: &EngineConfig,
    is_move: bool,
    paths: Vec<PathBuf>,
    policy: ConflictPolicy,
) -> Result<()> {
    let (sources, destination) = split_transfer_paths(paths)?;

    let (tx, mut rx) = mpsc::channel::<OperationProgress>(OPERATION_CHANNEL_SIZE);
    let printer = tokio::spawn(async move {
        let mut shown = false;
        while let Some(progress) = rx.recv().await {
            shown = true;
            eprint!(
                "\r{} {:>5.1}% ({}/{}) {}",
                progress.operation_type,
                progress.percentage(),
                progress.files_completed,
                progress.files_total,
                format_size(progress.bytes_processed)
            );
        }
        if shown {
            eprintln!();
        }
    });

    let engine = open_engine(config)?.with_progress(tx);
    let prompt = prompt_resolver;
    let resolver: Option<&dyn ConflictResolver> = match policy {
        ConflictPolicy::Ask => Some(&prompt),
        _ => None,
    };

    let result = if is_move {
        engine
            .move_items(&sources, &destination, policy, resolver)
            .await
    } else {
        engine.copy(&sources, &destination, policy, resolver).await
    };

    let history = engine.shutdown();
    let _ = printer.await;
    save_history(config, &history)?;

    match result {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(e) => {
            for path in e.recovery_paths() {
                eprintln!("  backup kept at {}", path.display());
            }
            Err(e.into())
        }
    }
}

/// Split `SRC... DEST` and resolve every path against the working directory.
fn split_transfer_paths(mut paths: Vec<PathBuf>) -> Result<(Vec<PathBuf>, PathBuf)> {
    let destination = paths
        .pop()
        .ok_or_else(|| eyre!("Missing destination directory"))?;
    let sources = paths
        .iter()
        .map(|path| resolve(path))
        .collect::<Result<Vec<_>>>()?;
    Ok((sources, resolve(&destination)?))
}

/// Ask on the terminal what to do with a colliding name.
fn prompt_resolver(name: &str) -> ConflictChoice {
    let stdin = io::stdin();
    loop {
        eprint!("'{name}' already exists. [r]ename, [s]kip, [o]verwrite, [c]ancel? ");
        let _ = io::stderr().flush();
        let mut answer = String::new();
        if stdin.lock().read_line(&mut answer).unwrap_or(0) == 0 {
            return ConflictChoice::Cancel;
        }
        match answer.trim().to_lowercase().as_str() {
            "r" | "rename" => return ConflictChoice::Rename,
            "s" | "skip" => return ConflictChoice::Skip,
            "o" | "overwrite" => return ConflictChoice::Overwrite,
            "c" | "cancel" => return ConflictChoice::Cancel,
            _ => continue,
        }
    }
}

fn print_report(report: &BatchReport) {
    println!("{}", report.summary());
    for path in &report.created {
        println!("  {}", path.display());
    }
    for path in &report.skipped {
        println!("  skipped {}", path.display());
    }
}

fn parse_rename_pair(pair: &str) -> Result<(PathBuf, String)> {
    let (path, name) = pair
        .rsplit_once('=')
        .ok_or_else(|| eyre!("Expected PATH=NEW_NAME, got '{pair}'"))?;
    Ok((PathBuf::from(path), name.to_string()))
}

fn run_history(config: &EngineConfig, json: bool) -> Result<()> {
    let history = load_history(config)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    println!("{}", "─".repeat(60));
    println!(" Undo ({} of {})", history.undo_len(), history.capacity());
    println!("{}", "─".repeat(60));
    if history.can_undo() {
        print_entries(history.undo_stack().rev(), |e| e.action.undo_description());
    } else {
        println!(" (nothing to undo)");
    }
    println!();
    println!("{}", "─".repeat(60));
    println!(" Redo ({})", history.redo_len());
    println!("{}", "─".repeat(60));
    if history.can_redo() {
        print_entries(history.redo_stack().rev(), |e| e.description.clone());
    } else {
        println!(" (nothing to redo)");
    }
    Ok(())
}

fn print_entries<'a>(
    entries: impl Iterator<Item = &'a UndoEntry>,
    describe: impl Fn(&UndoEntry) -> String,
) {
    for entry in entries {
        let when: DateTime<Local> = entry.timestamp.into();
        println!(
            " #{:<4} {}  {}",
            entry.id,
            when.format("%Y-%m-%d %H:%M:%S"),
            describe(entry)
        );
    }
}

async fn run_stash(config: &EngineConfig, action: StashAction) -> Result<()> {
    let engine = FileOpsEngine::new(config.clone());
    match action {
        StashAction::List => {
            let backups = engine.stashed_backups().await?;
            if backups.is_empty() {
                println!("No stashed backups in {}", config.backup_dir().display());
            }
            for backup in backups {
                let when: DateTime<Local> = backup.modified.into();
                let size = std::fs::symlink_metadata(&backup.path)
                    .map(|m| m.len())
                    .unwrap_or(0);
                println!(
                    "{}  {:>10}  {}",
                    when.format("%Y-%m-%d %H:%M"),
                    format_size(size),
                    backup.path.display()
                );
            }
        }
        StashAction::Prune => {
            let report = engine.prune_stash().await?;
            println!(
                "Removed {} expired and {} excess backup(s), {} remaining",
                report.expired, report.evicted, report.remaining
            );
        }
    }
    Ok(())
}

/// Run one task per path on the task pool and print the results.
async fn run_pool(task_type: &str, paths: Vec<PathBuf>, workers: Option<usize>) -> Result<()> {
    let config = SchedulerConfig {
        workers,
        ..SchedulerConfig::default()
    };
    let scheduler = TaskScheduler::with_builtins(&config);

    let handles = paths
        .iter()
        .map(|path| -> Result<_> {
            let path = resolve(path)?;
            let handle = scheduler.submit(task_type, json!({ "path": path }), None)?;
            Ok((path, handle))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut failures = 0usize;
    for (path, handle) in handles {
        match handle.await {
            Ok(value) if task_type == "checksum" => {
                println!("{}  {}", value["blake3"].as_str().unwrap_or("?"), path.display());
            }
            Ok(value) => {
                println!(
                    "{:>10}  {:>8} files  {}",
                    format_size(value["bytes"].as_u64().unwrap_or(0)),
                    value["files"].as_u64().unwrap_or(0),
                    path.display()
                );
            }
            Err(e) => {
                failures += 1;
                eprintln!("{}: {e}", path.display());
            }
        }
    }

    scheduler.shutdown();
    if failures > 0 {
        return Err(eyre!("{failures} task(s) failed"));
    }
    Ok(())
}

/// Make a command-line path absolute.
///
/// The parent directory is canonicalized and the final component kept as
/// typed, so a symlink named on the command line is not followed and a
/// not-yet-existing name (for `touch` and `mkdir`) still resolves.
fn resolve(path: &Path) -> Result<PathBuf> {
    let invalid = || format!("Invalid path {}", path.display());
    let absolute = std::path::absolute(path).with_context(invalid)?;
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => Ok(parent.canonicalize().with_context(invalid)?.join(name)),
        _ => absolute.canonicalize().with_context(invalid),
    }
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Component;
    use tempfile::TempDir;

    /// A scratch directory named relative to the working directory.
    fn relative_dir() -> TempDir {
        let dir = TempDir::new_in(".").unwrap();
        assert!(dir.path().is_relative());
        dir
    }

    fn engine(data: &TempDir) -> FileOpsEngine {
        FileOpsEngine::new(EngineConfig::new(data.path().join("data")))
    }

    #[test]
    fn test_resolve_makes_relative_paths_absolute() {
        let dir = relative_dir();
        fs::write(dir.path().join("a.txt"), "a").unwrap();

        let existing = resolve(&dir.path().join("a.txt")).unwrap();
        assert!(existing.is_absolute());
        assert!(existing.ends_with("a.txt"));

        fs::create_dir(dir.path().join("sub")).unwrap();
        let upward = resolve(&dir.path().join("sub/../not-yet")).unwrap();
        assert!(!upward.components().any(|c| c == Component::ParentDir));
        assert_eq!(upward, resolve(&dir.path().join("not-yet")).unwrap());
        assert!(upward.is_absolute());

        let parent_only = resolve(&dir.path().join("..")).unwrap();
        assert_eq!(parent_only, std::env::current_dir().unwrap().canonicalize().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_keeps_symlink_name() {
        let dir = relative_dir();
        fs::write(dir.path().join("target.txt"), "t").unwrap();
        std::os::unix::fs::symlink("target.txt", dir.path().join("link")).unwrap();

        let resolved = resolve(&dir.path().join("link")).unwrap();
        assert_eq!(resolved.file_name().unwrap(), "link");
    }

    #[test]
    fn test_split_transfer_paths() {
        let dir = relative_dir();
        fs::create_dir(dir.path().join("dst")).unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();

        let (sources, destination) =
            split_transfer_paths(vec![dir.path().join("a.txt"), dir.path().join("dst")]).unwrap();
        assert_eq!(sources.len(), 1);
        assert!(sources[0].is_absolute());
        assert!(destination.is_absolute());
        assert!(destination.ends_with("dst"));

        assert!(split_transfer_paths(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_relative_transfer_is_accepted_by_the_engine() {
        let dir = relative_dir();
        let data = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("dst")).unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();

        let (sources, destination) =
            split_transfer_paths(vec![dir.path().join("a.txt"), dir.path().join("dst")]).unwrap();
        let report = engine(&data)
            .copy(&sources, &destination, ConflictPolicy::Skip, None)
            .await
            .unwrap();
        assert_eq!(report.created.len(), 1);
        assert_eq!(fs::read_to_string(dir.path().join("dst/a.txt")).unwrap(), "a");
    }

    #[tokio::test]
    async fn test_relative_edits_are_accepted_by_the_engine() {
        let dir = relative_dir();
        let data = TempDir::new().unwrap();
        let engine = engine(&data);
        fs::write(dir.path().join("a.txt"), "a").unwrap();

        let rename = EditCommand::Rename {
            path: dir.path().join("a.txt"),
            new_name: "b.txt".to_string(),
        };
        apply_edit(&engine, rename).await.unwrap();
        assert!(dir.path().join("b.txt").exists());

        let pair = format!("{}=c.txt", dir.path().join("b.txt").display());
        apply_edit(&engine, EditCommand::BatchRename { pairs: vec![pair] })
            .await
            .unwrap();
        assert!(dir.path().join("c.txt").exists());

        apply_edit(&engine, EditCommand::Touch { path: dir.path().join("new.txt") })
            .await
            .unwrap();
        apply_edit(&engine, EditCommand::Mkdir { path: dir.path().join("folder") })
            .await
            .unwrap();
        assert!(dir.path().join("new.txt").is_file());
        assert!(dir.path().join("folder").is_dir());
        assert_eq!(engine.history().undo_len(), 4);
    }

    #[test]
    fn test_parse_rename_pair() {
        let (path, name) = parse_rename_pair("dir/a=b.txt").unwrap();
        assert_eq!(path, PathBuf::from("dir/a"));
        assert_eq!(name, "b.txt");
        assert!(parse_rename_pair("no-separator").is_err());
    }
}
