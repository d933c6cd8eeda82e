//! Wire schema of agent request files: one JSON object per file, tagged by
//! `type`. Field casing follows the protocol the agents speak, not this
//! crate's conventions.

use crate::registry::ContainerOverrides;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    Message {
        #[serde(rename = "chatJid")]
        chat_jid: String,
        text: String,
    },
    Media {
        #[serde(rename = "chatJid")]
        chat_jid: String,
        #[serde(rename = "filePath")]
        file_path: String,
        #[serde(rename = "mediaType")]
        media_type: String,
        #[serde(default)]
        caption: Option<String>,
        /// Which sandbox the declared path is relative to. Only main may
        /// name one other than its own, and the value must be a plain
        /// folder name.
        #[serde(rename = "groupFolder", default)]
        group_folder: Option<String>,
    },
    ScheduleTask {
        prompt: String,
        schedule_type: String,
        schedule_value: String,
        #[serde(default)]
        context_mode: Option<String>,
        #[serde(rename = "groupFolder")]
        group_folder: String,
    },
    PauseTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    ResumeTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    CancelTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    RefreshGroups,
    RegisterGroup {
        jid: String,
        name: String,
        folder: String,
        trigger: String,
        #[serde(rename = "containerConfig", default)]
        container_config: Option<ContainerOverrides>,
    },
    /// Tags this build does not know. Logged and dropped, never quarantined.
    #[serde(other)]
    Unrecognized,
}
