//! Context artifacts refreshed before every agent turn. Agents read these
//! from their mounted sandbox; visibility is tenant-scoped except for main,
//! which sees everything.

use super::ContainerError;
use crate::registry::GroupRegistry;
use crate::runtime::StatePaths;
use crate::shared::fs_atomic::write_json_atomic;
use crate::shared::ids::GroupFolder;
use crate::store::MessageStore;
use serde::Serialize;
use std::fs;
use std::path::Path;

pub const TASKS_SNAPSHOT_FILE: &str = "tasks.json";
pub const GROUPS_SNAPSHOT_FILE: &str = "available_groups.json";

#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub group_folder: String,
    pub prompt: String,
    pub schedule_type: String,
    pub schedule_value: String,
    pub status: String,
    pub next_run: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvailableGroup {
    pub jid: String,
    pub name: String,
    pub last_activity: i64,
    pub folder: Option<String>,
}

/// Rewrite both snapshot files in the group's context directory. Main sees
/// every task and every registered chat; other folders see only their own.
pub fn write_context_snapshots(
    paths: &StatePaths,
    store: &MessageStore,
    registry: &GroupRegistry,
    folder: &GroupFolder,
) -> Result<(), ContainerError> {
    let context_dir = paths.group_context_dir(folder.as_str());
    fs::create_dir_all(&context_dir).map_err(|err| ContainerError::Snapshot {
        path: context_dir.display().to_string(),
        detail: err.to_string(),
    })?;

    let is_main = folder.is_main();

    let tasks: Vec<TaskSnapshot> = store
        .all_tasks()
        .map_err(|err| ContainerError::Snapshot {
            path: context_dir.display().to_string(),
            detail: format!("failed to load tasks: {err}"),
        })?
        .into_iter()
        .filter(|task| is_main || task.group_folder == *folder)
        .map(|task| TaskSnapshot {
            id: task.id,
            group_folder: task.group_folder.to_string(),
            prompt: task.prompt,
            schedule_type: task.schedule_type,
            schedule_value: task.schedule_value,
            status: task.status.as_str().to_string(),
            next_run: task.next_run,
        })
        .collect();
    write_snapshot(&context_dir.join(TASKS_SNAPSHOT_FILE), &tasks)?;

    let registrations = registry.groups_snapshot();
    let groups: Vec<AvailableGroup> = store
        .all_chats()
        .map_err(|err| ContainerError::Snapshot {
            path: context_dir.display().to_string(),
            detail: format!("failed to load chats: {err}"),
        })?
        .into_iter()
        .filter_map(|chat| {
            let registration = registrations.get(&chat.jid)?;
            if !is_main && registration.folder != *folder {
                return None;
            }
            Some(AvailableGroup {
                jid: chat.jid,
                name: chat.name,
                last_activity: chat.last_message_at,
                folder: Some(registration.folder.to_string()),
            })
        })
        .collect();
    write_snapshot(&context_dir.join(GROUPS_SNAPSHOT_FILE), &groups)
}

fn write_snapshot<T: Serialize>(path: &Path, value: &T) -> Result<(), ContainerError> {
    write_json_atomic(path, value).map_err(|err| ContainerError::Snapshot {
        path: path.display().to_string(),
        detail: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegisteredGroup;
    use crate::shared::ids::MAIN_GROUP_FOLDER;
    use crate::store::{ContextMode, Task, TaskStatus};
    use tempfile::tempdir;

    fn registration(folder: &str) -> RegisteredGroup {
        RegisteredGroup {
            name: format!("{folder} chat"),
            folder: GroupFolder::parse(folder).expect("folder"),
            trigger: "bot".to_string(),
            added_at: 0,
            container_config: None,
        }
    }

    fn new_task(folder: &str) -> Task {
        Task {
            id: format!("task-{folder}"),
            group_folder: GroupFolder::parse(folder).expect("folder"),
            chat_jid: format!("telegram:{folder}"),
            prompt: "report".to_string(),
            schedule_type: "interval".to_string(),
            schedule_value: "60000".to_string(),
            context_mode: ContextMode::Isolated,
            next_run: 10,
            status: TaskStatus::Active,
            created_at: 0,
        }
    }

    #[test]
    fn non_main_folders_see_only_their_own_tasks() {
        let tmp = tempdir().expect("tempdir");
        let paths = StatePaths::new(tmp.path());
        crate::runtime::bootstrap_state_root(&paths).expect("bootstrap");
        let registry = GroupRegistry::open(paths.clone()).expect("registry");
        registry
            .register_group("telegram:1", registration(MAIN_GROUP_FOLDER))
            .expect("main");
        registry
            .register_group("telegram:acme", registration("acme"))
            .expect("acme");

        let store = MessageStore::open(&paths.store_db_path()).expect("store");
        store.create_task(&new_task("acme")).expect("task a");
        store.create_task(&new_task("main")).expect("task b");

        let acme = GroupFolder::parse("acme").expect("folder");
        write_context_snapshots(&paths, &store, &registry, &acme).expect("snapshots");
        let raw = std::fs::read_to_string(
            paths.group_context_dir("acme").join(TASKS_SNAPSHOT_FILE),
        )
        .expect("read");
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&raw).expect("json");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["group_folder"], "acme");

        let main = GroupFolder::main();
        write_context_snapshots(&paths, &store, &registry, &main).expect("snapshots");
        let raw = std::fs::read_to_string(
            paths.group_context_dir(MAIN_GROUP_FOLDER).join(TASKS_SNAPSHOT_FILE),
        )
        .expect("read");
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&raw).expect("json");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn groups_snapshot_lists_registered_chats_only() {
        let tmp = tempdir().expect("tempdir");
        let paths = StatePaths::new(tmp.path());
        crate::runtime::bootstrap_state_root(&paths).expect("bootstrap");
        let registry = GroupRegistry::open(paths.clone()).expect("registry");
        registry
            .register_group("telegram:1", registration(MAIN_GROUP_FOLDER))
            .expect("main");

        let store = MessageStore::open(&paths.store_db_path()).expect("store");
        store.store_chat_metadata("telegram:1", "Main Chat", 50).expect("chat");
        store
            .store_chat_metadata("telegram:999", "Stranger", 60)
            .expect("chat");

        let main = GroupFolder::main();
        write_context_snapshots(&paths, &store, &registry, &main).expect("snapshots");
        let raw = std::fs::read_to_string(
            paths.group_context_dir(MAIN_GROUP_FOLDER).join(GROUPS_SNAPSHOT_FILE),
        )
        .expect("read");
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&raw).expect("json");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["jid"], "telegram:1");
    }
}
