//! File-based IPC with sandboxed agents. Agents drop one JSON request per
//! file into their mounted queue directories; each poll cycle drains every
//! tenant's `messages/` and `tasks/` queues. A file either processes and is
//! deleted, or fails and moves to quarantine — it is never left in place, so
//! a poison file cannot wedge the loop.

pub mod handler;
pub mod request;

pub use handler::{handle_request, IpcContext};
pub use request::IpcRequest;

use crate::channel::ChannelError;
use crate::runtime::{append_runtime_log, StatePaths};
use crate::sandbox::SandboxError;
use crate::shared::ids::MAIN_GROUP_FOLDER;
use std::fs;
use std::path::{Path, PathBuf};

pub const MAX_IPC_FILE_SIZE: u64 = 1024 * 1024;

const ERRORS_DIR_NAME: &str = "errors";

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("request file is {size} bytes; the cap is {max}")]
    Oversize { size: u64, max: u64 },
    #[error("failed to read request file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse request file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("outbound delivery failed: {0}")]
    Delivery(#[source] ChannelError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("request processing failed: {0}")]
    Processing(String),
    #[error("failed to scan IPC directory {path}: {source}")]
    Scan {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to quarantine {path}: {source}")]
    Quarantine {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpcReport {
    pub processed: usize,
    pub quarantined: usize,
}

/// One poll cycle over the whole IPC root. Per-file failures quarantine that
/// file and continue; only a broken IPC root itself is an error.
pub fn run_ipc_cycle(ctx: &IpcContext<'_>) -> Result<IpcReport, IpcError> {
    let ipc_dir = ctx.paths.ipc_dir();
    let entries = fs::read_dir(&ipc_dir).map_err(|source| IpcError::Scan {
        path: ipc_dir.display().to_string(),
        source,
    })?;

    let mut folders: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name != ERRORS_DIR_NAME)
        .collect();
    folders.sort();

    let mut report = IpcReport::default();
    for source_group in folders {
        let is_main = source_group == MAIN_GROUP_FOLDER;
        drain_queue(
            ctx,
            &ctx.paths.ipc_messages_dir(&source_group),
            &source_group,
            is_main,
            &mut report,
        )?;
        drain_queue(
            ctx,
            &ctx.paths.ipc_tasks_dir(&source_group),
            &source_group,
            is_main,
            &mut report,
        )?;
    }
    Ok(report)
}

fn drain_queue(
    ctx: &IpcContext<'_>,
    queue_dir: &Path,
    source_group: &str,
    is_main: bool,
    report: &mut IpcReport,
) -> Result<(), IpcError> {
    if !queue_dir.is_dir() {
        return Ok(());
    }
    let entries = fs::read_dir(queue_dir).map_err(|source| IpcError::Scan {
        path: queue_dir.display().to_string(),
        source,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    for file in files {
        match process_file(ctx, &file, source_group, is_main) {
            Ok(()) => {
                if let Err(err) = fs::remove_file(&file) {
                    append_runtime_log(
                        ctx.paths,
                        "error",
                        "ipc_cleanup_failed",
                        &format!("failed to delete {}: {err}", file.display()),
                    );
                } else {
                    report.processed += 1;
                }
            }
            Err(err) => {
                append_runtime_log(
                    ctx.paths,
                    "error",
                    "ipc_quarantined",
                    &format!("{} from `{source_group}`: {err}", file.display()),
                );
                quarantine_file(ctx.paths, &file, source_group)?;
                report.quarantined += 1;
            }
        }
    }
    Ok(())
}

fn process_file(
    ctx: &IpcContext<'_>,
    file: &Path,
    source_group: &str,
    is_main: bool,
) -> Result<(), IpcError> {
    let metadata = fs::metadata(file).map_err(|source| IpcError::Read {
        path: file.display().to_string(),
        source,
    })?;
    if metadata.len() > MAX_IPC_FILE_SIZE {
        return Err(IpcError::Oversize {
            size: metadata.len(),
            max: MAX_IPC_FILE_SIZE,
        });
    }

    let raw = fs::read_to_string(file).map_err(|source| IpcError::Read {
        path: file.display().to_string(),
        source,
    })?;
    let request: IpcRequest = serde_json::from_str(&raw).map_err(|source| IpcError::Parse {
        path: file.display().to_string(),
        source,
    })?;
    handle_request(ctx, request, source_group, is_main)
}

/// Move a failed file into the quarantine directory, renamed with its source
/// folder so the origin stays visible after the move.
fn quarantine_file(
    paths: &StatePaths,
    file: &Path,
    source_group: &str,
) -> Result<(), IpcError> {
    let errors_dir = paths.ipc_errors_dir();
    fs::create_dir_all(&errors_dir).map_err(|source| IpcError::Quarantine {
        path: errors_dir.display().to_string(),
        source,
    })?;
    let file_name = file
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("request.json");
    let mut target = errors_dir.join(format!("{source_group}-{file_name}"));
    if target.exists() {
        // An agent can reuse file names across cycles; keep every
        // quarantined copy distinct.
        target = errors_dir.join(format!(
            "{source_group}-{}-{file_name}",
            crate::shared::time::now_millis()
        ));
    }
    fs::rename(file, &target).map_err(|source| IpcError::Quarantine {
        path: file.display().to_string(),
        source,
    })
}
