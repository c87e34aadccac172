//! Built-in handlers: folder sizing, checksums and directory listing.
//!
//! Payloads are `{"path": "<absolute path>"}`.

use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;

use jwalk::{Parallelism, WalkDir};
use serde_json::{json, Value};

use crate::error::{TaskError, TaskResult};
use crate::handler::{TaskContext, TaskHandler};

/// Entries walked between progress reports.
const PROGRESS_INTERVAL: u64 = 1000;

/// Read size for streaming digests.
const CHECKSUM_BLOCK: usize = 64 * 1024;

fn payload_path(payload: &Value) -> TaskResult<PathBuf> {
    payload
        .get("path")
        .and_then(Value::as_str)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| TaskError::invalid_payload("expected {\"path\": string}"))
}

/// Recursive size of a directory tree (`folder-size`).
#[derive(Debug, Clone, Copy, Default)]
pub struct FolderSize;

impl TaskHandler for FolderSize {
    fn run(&self, payload: &Value, ctx: &TaskContext) -> TaskResult<Value> {
        let root = payload_path(payload)?;
        let metadata = fs::metadata(&root).map_err(TaskError::failed)?;
        if !metadata.is_dir() {
            return Ok(json!({
                "path": root,
                "bytes": metadata.len(),
                "files": 1,
                "directories": 0,
            }));
        }

        let walker = WalkDir::new(&root)
            .parallelism(Parallelism::Serial)
            .skip_hidden(false)
            .follow_links(false)
            .min_depth(1);

        let mut bytes = 0u64;
        let mut files = 0u64;
        let mut directories = 0u64;
        let mut errors = 0u64;

        for (seen, entry) in walker.into_iter().enumerate() {
            ctx.check_cancelled()?;
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => {
                    errors += 1;
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                directories += 1;
            } else {
                files += 1;
                if let Ok(metadata) = entry.metadata() {
                    bytes += metadata.len();
                }
            }

            if (seen as u64 + 1) % PROGRESS_INTERVAL == 0 {
                ctx.report(json!({ "files": files, "bytes": bytes }));
            }
        }

        Ok(json!({
            "path": root,
            "bytes": bytes,
            "files": files,
            "directories": directories,
            "errors": errors,
        }))
    }
}

/// BLAKE3 digest of a file (`checksum`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Checksum;

impl TaskHandler for Checksum {
    fn run(&self, payload: &Value, ctx: &TaskContext) -> TaskResult<Value> {
        let path = payload_path(payload)?;
        let mut file = File::open(&path).map_err(TaskError::failed)?;
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0u8; CHECKSUM_BLOCK];
        let mut total = 0u64;

        loop {
            ctx.check_cancelled()?;
            let read = file.read(&mut buffer).map_err(TaskError::failed)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            total += read as u64;
        }

        Ok(json!({
            "path": path,
            "blake3": hasher.finalize().to_hex().to_string(),
            "bytes": total,
        }))
    }
}

/// One-level listing with kind and size (`list-directory`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ListDirectory;

impl TaskHandler for ListDirectory {
    fn run(&self, payload: &Value, ctx: &TaskContext) -> TaskResult<Value> {
        let path = payload_path(payload)?;
        let mut entries = Vec::new();

        for entry in fs::read_dir(&path).map_err(TaskError::failed)? {
            ctx.check_cancelled()?;
            let Ok(entry) = entry else { continue };
            let Ok(metadata) = entry.path().symlink_metadata() else {
                continue;
            };
            let kind = if metadata.is_symlink() {
                "symlink"
            } else if metadata.is_dir() {
                "directory"
            } else {
                "file"
            };
            entries.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "kind": kind,
                "size": if metadata.is_file() { metadata.len() } else { 0 },
            }));
        }

        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        Ok(json!({ "path": path, "entries": entries }))
    }
}
