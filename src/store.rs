use crate::shared::ids::GroupFolder;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create store parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("invalid {field} value `{value}` in database")]
    InvalidColumn { field: &'static str, value: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(source: rusqlite::Error) -> Self {
        Self::Sql { source }
    }
}

/// One inbound chat message as persisted by the channel worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: String,
    pub chat_jid: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub from_me: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRecord {
    pub jid: String,
    pub name: String,
    pub last_message_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
        }
    }

    fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            other => Err(StoreError::InvalidColumn {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// Run without the group's conversational session.
    #[default]
    Isolated,
    /// Share the group's session handle.
    Group,
}

impl ContextMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Isolated => "isolated",
            Self::Group => "group",
        }
    }

    /// Agent-declared mode; anything other than `group` falls back to the
    /// isolated default.
    pub fn from_declared(raw: &str) -> Self {
        if raw == "group" {
            Self::Group
        } else {
            Self::Isolated
        }
    }

    fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "isolated" => Ok(Self::Isolated),
            "group" => Ok(Self::Group),
            other => Err(StoreError::InvalidColumn {
                field: "context_mode",
                value: other.to_string(),
            }),
        }
    }
}

/// A scheduled agent run owned by one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub group_folder: GroupFolder,
    pub chat_jid: String,
    pub prompt: String,
    /// `cron`, `interval` or `once`; the value is interpreted by the
    /// scheduler module.
    pub schedule_type: String,
    pub schedule_value: String,
    pub context_mode: ContextMode,
    /// Unix milliseconds of the next firing.
    pub next_run: i64,
    pub status: TaskStatus,
    pub created_at: i64,
}

/// Durable message/chat/task store backing the router and scheduler. Opens a
/// fresh connection per operation; callers serialize writes through the
/// worker loops.
pub struct MessageStore {
    db_path: PathBuf,
}

impl MessageStore {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        Connection::open(&self.db_path).map_err(|source| StoreError::Open {
            path: self.db_path.display().to_string(),
            source,
        })
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS chats (
                jid TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                last_message_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT NOT NULL,
                chat_jid TEXT NOT NULL REFERENCES chats(jid),
                sender_id TEXT NOT NULL,
                sender_name TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                from_me INTEGER NOT NULL,
                PRIMARY KEY (id, chat_jid)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat_ts
                ON messages(chat_jid, timestamp);
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                group_folder TEXT NOT NULL,
                chat_jid TEXT NOT NULL,
                prompt TEXT NOT NULL,
                schedule_type TEXT NOT NULL,
                schedule_value TEXT NOT NULL,
                context_mode TEXT NOT NULL,
                next_run INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    pub fn store_chat_metadata(
        &self,
        jid: &str,
        name: &str,
        last_message_at: i64,
    ) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO chats (jid, name, last_message_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(jid) DO UPDATE SET
                 name = excluded.name,
                 last_message_at = MAX(last_message_at, excluded.last_message_at)",
            params![jid, name, last_message_at],
        )?;
        Ok(())
    }

    pub fn store_message(&self, message: &MessageRecord) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT OR REPLACE INTO messages
                 (id, chat_jid, sender_id, sender_name, content, timestamp, from_me)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                message.chat_jid,
                message.sender_id,
                message.sender_name,
                message.content,
                message.timestamp,
                message.from_me as i64,
            ],
        )?;
        Ok(())
    }

    /// Messages across `jids` strictly newer than `cursor`, in arrival order.
    /// The assistant's own outbound messages are excluded.
    pub fn new_messages_since(
        &self,
        jids: &[String],
        cursor: i64,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        if jids.is_empty() {
            return Ok(Vec::new());
        }
        let connection = self.connect()?;
        let placeholders = vec!["?"; jids.len()].join(", ");
        let sql = format!(
            "SELECT id, chat_jid, sender_id, sender_name, content, timestamp, from_me
             FROM messages
             WHERE timestamp > ? AND from_me = 0 AND chat_jid IN ({placeholders})
             ORDER BY timestamp ASC, id ASC"
        );
        let mut statement = connection.prepare(&sql)?;
        let mut bound: Vec<rusqlite::types::Value> = Vec::with_capacity(jids.len() + 1);
        bound.push(cursor.into());
        for jid in jids {
            bound.push(jid.clone().into());
        }
        let rows = statement.query_map(params_from_iter(bound), row_to_message)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Full backlog for one chat strictly newer than `cursor`.
    pub fn messages_since(&self, jid: &str, cursor: i64) -> Result<Vec<MessageRecord>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT id, chat_jid, sender_id, sender_name, content, timestamp, from_me
             FROM messages
             WHERE chat_jid = ?1 AND timestamp > ?2 AND from_me = 0
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = statement.query_map(params![jid, cursor], row_to_message)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn all_chats(&self) -> Result<Vec<ChatRecord>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT jid, name, last_message_at FROM chats ORDER BY last_message_at DESC",
        )?;
        let rows = statement.query_map([], |row| {
            Ok(ChatRecord {
                jid: row.get(0)?,
                name: row.get(1)?,
                last_message_at: row.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO tasks
                 (id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
                  context_mode, next_run, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                task.id,
                task.group_folder.as_str(),
                task.chat_jid,
                task.prompt,
                task.schedule_type,
                task.schedule_value,
                task.context_mode.as_str(),
                task.next_run,
                task.status.as_str(),
                task.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn task_by_id(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let connection = self.connect()?;
        let row = connection
            .query_row(
                "SELECT id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
                        context_mode, next_run, status, created_at
                 FROM tasks WHERE id = ?1",
                params![id],
                row_to_task_columns,
            )
            .optional()?;
        row.map(columns_to_task).transpose()
    }

    pub fn all_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
                    context_mode, next_run, status, created_at
             FROM tasks ORDER BY created_at ASC",
        )?;
        let rows = statement.query_map([], row_to_task_columns)?;
        let mut tasks = Vec::new();
        for columns in rows {
            tasks.push(columns_to_task(columns?)?);
        }
        Ok(tasks)
    }

    /// Active tasks whose next run is due at or before `now`.
    pub fn due_tasks(&self, now: i64) -> Result<Vec<Task>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
                    context_mode, next_run, status, created_at
             FROM tasks WHERE status = 'active' AND next_run <= ?1
             ORDER BY next_run ASC",
        )?;
        let rows = statement.query_map(params![now], row_to_task_columns)?;
        let mut tasks = Vec::new();
        for columns in rows {
            tasks.push(columns_to_task(columns?)?);
        }
        Ok(tasks)
    }

    pub fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<bool, StoreError> {
        let connection = self.connect()?;
        let changed = connection.execute(
            "UPDATE tasks SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(changed > 0)
    }

    pub fn set_task_next_run(&self, id: &str, next_run: i64) -> Result<bool, StoreError> {
        let connection = self.connect()?;
        let changed = connection.execute(
            "UPDATE tasks SET next_run = ?2 WHERE id = ?1",
            params![id, next_run],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_task(&self, id: &str) -> Result<bool, StoreError> {
        let connection = self.connect()?;
        let changed = connection.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }
}

type TaskColumns = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    String,
    i64,
);

fn row_to_task_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn columns_to_task(columns: TaskColumns) -> Result<Task, StoreError> {
    let (
        id,
        group_folder,
        chat_jid,
        prompt,
        schedule_type,
        schedule_value,
        context_mode,
        next_run,
        status,
        created_at,
    ) = columns;
    Ok(Task {
        id,
        group_folder: GroupFolder::parse(&group_folder).map_err(|_| StoreError::InvalidColumn {
            field: "group_folder",
            value: group_folder,
        })?,
        chat_jid,
        prompt,
        schedule_type,
        schedule_value,
        context_mode: ContextMode::parse(&context_mode)?,
        next_run,
        status: TaskStatus::parse(&status)?,
        created_at,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        chat_jid: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        content: row.get(4)?,
        timestamp: row.get(5)?,
        from_me: row.get::<_, i64>(6)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_message(id: &str, jid: &str, ts: i64) -> MessageRecord {
        MessageRecord {
            id: id.to_string(),
            chat_jid: jid.to_string(),
            sender_id: "tg:1".to_string(),
            sender_name: "Alice".to_string(),
            content: format!("message {id}"),
            timestamp: ts,
            from_me: false,
        }
    }

    fn open_store(dir: &Path) -> MessageStore {
        MessageStore::open(&dir.join("messages.sqlite")).expect("open store")
    }

    fn sample_task(id: &str, folder: &str, next_run: i64) -> Task {
        Task {
            id: id.to_string(),
            group_folder: GroupFolder::parse(folder).expect("folder"),
            chat_jid: "telegram:100".to_string(),
            prompt: "do the thing".to_string(),
            schedule_type: "interval".to_string(),
            schedule_value: "60000".to_string(),
            context_mode: ContextMode::Isolated,
            next_run,
            status: TaskStatus::Active,
            created_at: 1,
        }
    }

    #[test]
    fn new_messages_filter_by_cursor_and_jid() {
        let tmp = tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        store
            .store_chat_metadata("telegram:1", "Chat One", 10)
            .expect("chat");
        store
            .store_chat_metadata("telegram:2", "Chat Two", 10)
            .expect("chat");
        store
            .store_message(&sample_message("a", "telegram:1", 10))
            .expect("store");
        store
            .store_message(&sample_message("b", "telegram:1", 20))
            .expect("store");
        store
            .store_message(&sample_message("c", "telegram:2", 30))
            .expect("store");

        let jids = vec!["telegram:1".to_string()];
        let fresh = store.new_messages_since(&jids, 10).expect("query");
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].id, "b");

        let none = store.new_messages_since(&[], 0).expect("empty jids");
        assert!(none.is_empty());
    }

    #[test]
    fn assistant_messages_are_excluded_from_backlog() {
        let tmp = tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        store
            .store_chat_metadata("telegram:1", "Chat", 10)
            .expect("chat");
        store
            .store_message(&sample_message("in", "telegram:1", 10))
            .expect("store");
        let mut reply = sample_message("out", "telegram:1", 11);
        reply.from_me = true;
        store.store_message(&reply).expect("store reply");

        let backlog = store.messages_since("telegram:1", 0).expect("query");
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].id, "in");
    }

    #[test]
    fn chat_metadata_keeps_latest_activity() {
        let tmp = tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        store
            .store_chat_metadata("telegram:1", "Chat", 50)
            .expect("chat");
        store
            .store_chat_metadata("telegram:1", "Chat Renamed", 40)
            .expect("chat again");

        let chats = store.all_chats().expect("chats");
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].name, "Chat Renamed");
        assert_eq!(chats[0].last_message_at, 50);
    }

    #[test]
    fn task_lifecycle_create_pause_delete() {
        let tmp = tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        store
            .create_task(&sample_task("task-1", "acme", 100))
            .expect("create");

        let loaded = store.task_by_id("task-1").expect("query").expect("task");
        assert_eq!(loaded.status, TaskStatus::Active);
        assert_eq!(loaded.group_folder.as_str(), "acme");

        assert!(store
            .update_task_status("task-1", TaskStatus::Paused)
            .expect("pause"));
        let paused = store.task_by_id("task-1").expect("query").expect("task");
        assert_eq!(paused.status, TaskStatus::Paused);

        assert!(store.delete_task("task-1").expect("delete"));
        assert!(store.task_by_id("task-1").expect("query").is_none());
        assert!(!store.delete_task("task-1").expect("delete missing"));
    }

    #[test]
    fn due_tasks_skip_paused_and_future() {
        let tmp = tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        store
            .create_task(&sample_task("due", "acme", 100))
            .expect("create");
        store
            .create_task(&sample_task("future", "acme", 10_000))
            .expect("create");
        let mut paused = sample_task("paused", "acme", 100);
        paused.status = TaskStatus::Paused;
        store.create_task(&paused).expect("create");

        let due = store.due_tasks(500).expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "due");
    }
}
