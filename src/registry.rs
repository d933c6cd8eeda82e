use crate::runtime::StatePaths;
use crate::shared::fs_atomic::write_json_atomic;
use crate::shared::ids::GroupFolder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read registry state {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse registry state {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write registry state {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create group directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("group registration rejected: {0}")]
    Rejected(String),
}

/// Per-group container overrides carried on a registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerOverrides {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// One registered tenant. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredGroup {
    pub name: String,
    pub folder: GroupFolder,
    /// Token a message must contain for this group's backlog to reach the
    /// agent. Ignored for the main group, which always responds.
    pub trigger: String,
    /// Unix milliseconds of registration.
    pub added_at: i64,
    #[serde(default)]
    pub container_config: Option<ContainerOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RouterCursorState {
    #[serde(default)]
    last_timestamp: i64,
    #[serde(default)]
    last_agent_timestamp: BTreeMap<String, i64>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    groups: BTreeMap<String, RegisteredGroup>,
    sessions: BTreeMap<String, String>,
    cursors: RouterCursorState,
    in_flight: BTreeSet<String>,
}

/// Single owner of the mutable tenant/session/cursor state shared by the
/// router, IPC and scheduler loops. Every read-modify-persist sequence runs
/// under one mutex acquisition so durable writes never interleave.
pub struct GroupRegistry {
    paths: StatePaths,
    inner: Mutex<RegistryInner>,
}

fn load_json_or_default<T: Default + for<'de> Deserialize<'de>>(
    path: &Path,
) -> Result<T, RegistryError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = fs::read_to_string(path).map_err(|source| RegistryError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| RegistryError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn write_state<T: Serialize>(path: &Path, value: &T) -> Result<(), RegistryError> {
    write_json_atomic(path, value).map_err(|source| RegistryError::Write {
        path: path.display().to_string(),
        source,
    })
}

impl GroupRegistry {
    pub fn open(paths: StatePaths) -> Result<Self, RegistryError> {
        let inner = RegistryInner {
            groups: load_json_or_default(&paths.registered_groups_path())?,
            sessions: load_json_or_default(&paths.sessions_path())?,
            cursors: load_json_or_default(&paths.router_state_path())?,
            in_flight: BTreeSet::new(),
        };
        Ok(Self {
            paths,
            inner: Mutex::new(inner),
        })
    }

    fn guard(&self) -> MutexGuard<'_, RegistryInner> {
        // A panicked holder cannot leave partial state behind: mutations
        // persist before the guard drops. Recover instead of propagating.
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn registered_jids(&self) -> Vec<String> {
        self.guard().groups.keys().cloned().collect()
    }

    pub fn groups_snapshot(&self) -> BTreeMap<String, RegisteredGroup> {
        self.guard().groups.clone()
    }

    pub fn group_for_jid(&self, jid: &str) -> Option<RegisteredGroup> {
        self.guard().groups.get(jid).cloned()
    }

    pub fn jid_for_folder(&self, folder: &str) -> Option<String> {
        self.guard()
            .groups
            .iter()
            .find(|(_, group)| group.folder.as_str() == folder)
            .map(|(jid, _)| jid.clone())
    }

    pub fn is_folder_registered(&self, folder: &str) -> bool {
        self.guard()
            .groups
            .values()
            .any(|group| group.folder.as_str() == folder)
    }

    pub fn main_group_jid(&self) -> Option<String> {
        self.guard()
            .groups
            .iter()
            .find(|(_, group)| group.folder.is_main())
            .map(|(jid, _)| jid.clone())
    }

    /// Create a registration, its sandbox directory tree and persist the
    /// table. Folder uniqueness and the single-main invariant are enforced
    /// here, under the same lock as the durable write.
    pub fn register_group(&self, jid: &str, group: RegisteredGroup) -> Result<(), RegistryError> {
        if jid.trim().is_empty() {
            return Err(RegistryError::Rejected("chat jid must be non-empty".to_string()));
        }
        let mut inner = self.guard();
        if inner.groups.contains_key(jid) {
            return Err(RegistryError::Rejected(format!(
                "chat `{jid}` is already registered"
            )));
        }
        if inner
            .groups
            .values()
            .any(|existing| existing.folder == group.folder)
        {
            return Err(RegistryError::Rejected(format!(
                "folder `{}` is already in use",
                group.folder
            )));
        }

        // The sandbox tree and IPC queues must exist before the first
        // container mount, or the runtime creates them root-owned.
        for dir in [
            self.paths.group_logs_dir(group.folder.as_str()),
            self.paths.ipc_messages_dir(group.folder.as_str()),
            self.paths.ipc_tasks_dir(group.folder.as_str()),
        ] {
            fs::create_dir_all(&dir).map_err(|source| RegistryError::CreateDir {
                path: dir.display().to_string(),
                source,
            })?;
        }

        inner.groups.insert(jid.to_string(), group);
        write_state(&self.paths.registered_groups_path(), &inner.groups)
    }

    pub fn session_for(&self, folder: &str) -> Option<String> {
        self.guard().sessions.get(folder).cloned()
    }

    pub fn set_session(&self, folder: &str, session_id: &str) -> Result<(), RegistryError> {
        let mut inner = self.guard();
        inner
            .sessions
            .insert(folder.to_string(), session_id.to_string());
        write_state(&self.paths.sessions_path(), &inner.sessions)
    }

    pub fn router_cursor(&self) -> i64 {
        self.guard().cursors.last_timestamp
    }

    pub fn agent_cursor(&self, jid: &str) -> i64 {
        self.guard()
            .cursors
            .last_agent_timestamp
            .get(jid)
            .copied()
            .unwrap_or(0)
    }

    /// Advance the global router cursor. Monotonic: an older timestamp is a
    /// no-op that still reports success.
    pub fn advance_router_cursor(&self, timestamp: i64) -> Result<(), RegistryError> {
        let mut inner = self.guard();
        if timestamp <= inner.cursors.last_timestamp {
            return Ok(());
        }
        inner.cursors.last_timestamp = timestamp;
        write_state(&self.paths.router_state_path(), &inner.cursors)
    }

    pub fn advance_agent_cursor(&self, jid: &str, timestamp: i64) -> Result<(), RegistryError> {
        let mut inner = self.guard();
        let current = inner
            .cursors
            .last_agent_timestamp
            .get(jid)
            .copied()
            .unwrap_or(0);
        if timestamp <= current {
            return Ok(());
        }
        inner
            .cursors
            .last_agent_timestamp
            .insert(jid.to_string(), timestamp);
        write_state(&self.paths.router_state_path(), &inner.cursors)
    }

    /// Claim the per-folder invocation slot. At most one container run per
    /// group folder may be in flight; a second claim fails until released.
    pub fn try_begin_invocation(&self, folder: &str) -> bool {
        self.guard().in_flight.insert(folder.to_string())
    }

    pub fn end_invocation(&self, folder: &str) {
        self.guard().in_flight.remove(folder);
    }
}
