use super::RuntimeError;
use std::fs;
use std::path::PathBuf;

/// Filesystem layout of the orchestrator's state root:
///
/// ```text
/// <root>/
///   config.yaml               settings
///   messages.sqlite           message/chat/task store
///   registered_groups.json    tenant registration table
///   sessions.json             folder -> session handle
///   router_state.json         router cursors
///   groups/<folder>/          per-group sandbox (with logs/ and context/)
///   ipc/<folder>/messages/    outbound-message requests from agents
///   ipc/<folder>/tasks/       task-mutation requests from agents
///   ipc/errors/               quarantined request files
///   logs/runtime.log          JSON-line runtime log
///   daemon/                   supervisor state, lock and stop files
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![
            self.groups_dir(),
            self.ipc_dir(),
            self.ipc_errors_dir(),
            self.root.join("logs"),
            self.daemon_dir(),
        ]
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn store_db_path(&self) -> PathBuf {
        self.root.join("messages.sqlite")
    }

    pub fn registered_groups_path(&self) -> PathBuf {
        self.root.join("registered_groups.json")
    }

    pub fn sessions_path(&self) -> PathBuf {
        self.root.join("sessions.json")
    }

    pub fn router_state_path(&self) -> PathBuf {
        self.root.join("router_state.json")
    }

    pub fn groups_dir(&self) -> PathBuf {
        self.root.join("groups")
    }

    pub fn group_dir(&self, folder: &str) -> PathBuf {
        self.groups_dir().join(folder)
    }

    pub fn group_logs_dir(&self, folder: &str) -> PathBuf {
        self.group_dir(folder).join("logs")
    }

    /// Snapshot artifacts read by the agent inside the container.
    pub fn group_context_dir(&self, folder: &str) -> PathBuf {
        self.group_dir(folder).join("context")
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.root.join("ipc")
    }

    pub fn ipc_group_dir(&self, folder: &str) -> PathBuf {
        self.ipc_dir().join(folder)
    }

    pub fn ipc_messages_dir(&self, folder: &str) -> PathBuf {
        self.ipc_group_dir(folder).join("messages")
    }

    pub fn ipc_tasks_dir(&self, folder: &str) -> PathBuf {
        self.ipc_group_dir(folder).join("tasks")
    }

    pub fn ipc_errors_dir(&self) -> PathBuf {
        self.ipc_dir().join("errors")
    }

    pub fn telegram_offset_path(&self) -> PathBuf {
        self.root.join("channels/telegram_offset.json")
    }

    pub fn daemon_dir(&self) -> PathBuf {
        self.root.join("daemon")
    }

    pub fn supervisor_state_path(&self) -> PathBuf {
        self.daemon_dir().join("runtime.json")
    }

    pub fn supervisor_lock_path(&self) -> PathBuf {
        self.daemon_dir().join("supervisor.lock")
    }

    pub fn stop_signal_path(&self) -> PathBuf {
        self.daemon_dir().join("stop")
    }

    pub fn runtime_log_path(&self) -> PathBuf {
        self.root.join("logs/runtime.log")
    }
}

pub fn bootstrap_state_root(paths: &StatePaths) -> Result<(), RuntimeError> {
    for path in paths.required_directories() {
        fs::create_dir_all(&path).map_err(|source| RuntimeError::CreateDir {
            path: path.display().to_string(),
            source,
        })?;
    }
    Ok(())
}
