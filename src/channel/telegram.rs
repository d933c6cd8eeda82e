//! Telegram Bot API client: outbound delivery plus the long-poll inbound
//! cycle that feeds the message store.

use super::{telegram_chat_id, ChannelError, ChannelGateway, MediaKind, TELEGRAM_JID_PREFIX};
use crate::config::Settings;
use crate::registry::{GroupRegistry, RegisteredGroup};
use crate::runtime::{append_runtime_log, StatePaths};
use crate::shared::fs_atomic::write_json_atomic;
use crate::shared::ids::GroupFolder;
use crate::shared::time::now_millis;
use crate::store::{MessageRecord, MessageStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::Path;

pub const BOT_TOKEN_ENV: &str = "TELEGRAM_BOT_TOKEN";

// Telegram rejects messages over 4096 chars; stay under it.
const OUTBOUND_CHUNK_CHARS: usize = 4000;

#[derive(Debug, Clone)]
pub struct TelegramClient {
    api_base: String,
    token: String,
    poll_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct TgEnvelope<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TgUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TgMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TgMessage {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<TgUser>,
    pub chat: TgChat,
    #[serde(default)]
    pub text: Option<String>,
    /// Only presence matters; transcription happens outside this process.
    #[serde(default)]
    pub voice: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TgUser {
    pub id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TgChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct OffsetState {
    #[serde(default)]
    next_offset: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundReport {
    pub stored: usize,
    pub auto_registered: bool,
}

impl TelegramClient {
    /// Reads the bot token from `TELEGRAM_BOT_TOKEN`. Absence is a fatal
    /// startup condition for the caller.
    pub fn from_env(settings: &Settings) -> Result<Self, ChannelError> {
        let token = std::env::var(BOT_TOKEN_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ChannelError::MissingEnvVar(BOT_TOKEN_ENV.to_string()))?;
        Ok(Self {
            api_base: settings.telegram.api_base.trim_end_matches('/').to_string(),
            token,
            poll_timeout_seconds: settings.telegram.poll_timeout_seconds,
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, ChannelError> {
        let response = ureq::post(&self.endpoint(method))
            .send_json(body.clone())
            .map_err(|e| ChannelError::ApiRequest(e.to_string()))?;
        let envelope: TgEnvelope<T> = response
            .into_json()
            .map_err(|e| ChannelError::ApiRequest(e.to_string()))?;
        if !envelope.ok {
            return Err(ChannelError::ApiResponse(
                envelope
                    .description
                    .unwrap_or_else(|| format!("{method} failed")),
            ));
        }
        envelope
            .result
            .ok_or_else(|| ChannelError::ApiResponse(format!("{method} returned no result")))
    }

    /// One long-poll cycle: fetch updates after the persisted offset, ingest
    /// each into the store, then persist the advanced offset.
    pub fn run_inbound_cycle(
        &self,
        settings: &Settings,
        paths: &StatePaths,
        store: &MessageStore,
        registry: &GroupRegistry,
    ) -> Result<InboundReport, ChannelError> {
        let offset_path = paths.telegram_offset_path();
        let mut state = load_offset(&offset_path)?;

        let updates: Vec<TgUpdate> = self.call(
            "getUpdates",
            &json!({
                "offset": state.next_offset,
                "timeout": self.poll_timeout_seconds,
                "allowed_updates": ["message"],
            }),
        )?;

        let mut report = InboundReport::default();
        for update in updates {
            if let Some(message) = update.message {
                match ingest_message(settings, paths, store, registry, &message, now_millis()) {
                    Ok(outcome) => {
                        report.stored += usize::from(outcome.stored);
                        report.auto_registered |= outcome.auto_registered;
                    }
                    Err(err) => {
                        // Persist progress so the failed update is retried,
                        // not skipped.
                        save_offset(&offset_path, &state)?;
                        return Err(err);
                    }
                }
            }
            state.next_offset = state.next_offset.max(update.update_id + 1);
        }
        save_offset(&offset_path, &state)?;
        Ok(report)
    }
}

fn load_offset(path: &Path) -> Result<OffsetState, ChannelError> {
    if !path.exists() {
        return Ok(OffsetState::default());
    }
    let raw = fs::read_to_string(path).map_err(|source| ChannelError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ChannelError::Json {
        path: path.display().to_string(),
        source,
    })
}

fn save_offset(path: &Path, state: &OffsetState) -> Result<(), ChannelError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ChannelError::Io {
            path: parent.display().to_string(),
            source,
        })?;
    }
    write_json_atomic(path, state).map_err(|source| ChannelError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[derive(Debug, Clone, Copy, Default)]
struct IngestOutcome {
    stored: bool,
    auto_registered: bool,
}

/// Store one inbound message. A first private chat auto-registers as the
/// main group when none exists; messages from unregistered chats are
/// dropped. Trigger gating is the router's job, so every message from a
/// registered chat lands in the store.
fn ingest_message(
    settings: &Settings,
    paths: &StatePaths,
    store: &MessageStore,
    registry: &GroupRegistry,
    message: &TgMessage,
    now_ms: i64,
) -> Result<IngestOutcome, ChannelError> {
    let jid = format!("{TELEGRAM_JID_PREFIX}{}", message.chat.id);
    let is_private = message.chat.kind == "private";
    let sender_name = message
        .from
        .as_ref()
        .and_then(|user| user.first_name.clone().or_else(|| user.username.clone()))
        .unwrap_or_else(|| "Telegram User".to_string());

    let mut outcome = IngestOutcome::default();
    if registry.group_for_jid(&jid).is_none() {
        if !(is_private && registry.main_group_jid().is_none()) {
            return Ok(outcome);
        }
        let chat_name = if is_private {
            format!("{sender_name}'s Chat")
        } else {
            message
                .chat
                .title
                .clone()
                .unwrap_or_else(|| "Telegram Chat".to_string())
        };
        registry
            .register_group(
                &jid,
                RegisteredGroup {
                    name: chat_name.clone(),
                    folder: GroupFolder::main(),
                    trigger: settings.assistant_name.clone(),
                    added_at: now_ms,
                    container_config: None,
                },
            )
            .map_err(|err| ChannelError::ApiResponse(format!("auto-registration failed: {err}")))?;
        append_runtime_log(
            paths,
            "info",
            "main_group_registered",
            &format!("auto-registered `{chat_name}` ({jid}) as the main group"),
        );
        outcome.auto_registered = true;
    }

    let content = match (&message.text, &message.voice) {
        (Some(text), _) => text.clone(),
        // Transcription is an external collaborator; keep a visible marker
        // until it fills the text in.
        (None, Some(_)) => "[Voice message]".to_string(),
        (None, None) => return Ok(outcome),
    };

    let sender_id = message
        .from
        .as_ref()
        .map(|user| format!("{TELEGRAM_JID_PREFIX}{}", user.id))
        .unwrap_or_else(|| jid.clone());
    let chat_name = message
        .chat
        .title
        .clone()
        .unwrap_or_else(|| format!("{sender_name}'s Chat"));

    store
        .store_chat_metadata(&jid, &chat_name, now_ms)
        .map_err(|err| ChannelError::ApiResponse(format!("chat upsert failed: {err}")))?;
    store
        .store_message(&MessageRecord {
            id: format!("tg-{}", message.message_id),
            chat_jid: jid,
            sender_id,
            sender_name,
            content,
            timestamp: now_ms,
            from_me: false,
        })
        .map_err(|err| ChannelError::ApiResponse(format!("message store failed: {err}")))?;
    outcome.stored = true;
    Ok(outcome)
}

impl ChannelGateway for TelegramClient {
    fn send_text(&self, chat_jid: &str, text: &str) -> Result<(), ChannelError> {
        let chat_id = telegram_chat_id(chat_jid)?;
        for chunk in chunk_text(text, OUTBOUND_CHUNK_CHARS) {
            let _: serde_json::Value = self.call(
                "sendMessage",
                &json!({ "chat_id": chat_id, "text": chunk }),
            )?;
        }
        Ok(())
    }

    fn send_media(
        &self,
        chat_jid: &str,
        file_path: &Path,
        kind: MediaKind,
        caption: Option<&str>,
    ) -> Result<(), ChannelError> {
        let chat_id = telegram_chat_id(chat_jid)?;
        let (method, field) = match kind {
            MediaKind::Image => ("sendPhoto", "photo"),
            MediaKind::Video => ("sendVideo", "video"),
            MediaKind::Audio => ("sendAudio", "audio"),
            MediaKind::Document => ("sendDocument", "document"),
        };

        let bytes = fs::read(file_path).map_err(|source| ChannelError::Io {
            path: file_path.display().to_string(),
            source,
        })?;
        let file_name = file_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("upload.bin");

        let mut fields = vec![("chat_id".to_string(), chat_id.to_string())];
        if let Some(caption) = caption {
            fields.push(("caption".to_string(), caption.to_string()));
        }
        let (content_type, body) = encode_multipart(&fields, field, file_name, &bytes);

        let response = ureq::post(&self.endpoint(method))
            .set("Content-Type", &content_type)
            .send_bytes(&body)
            .map_err(|e| ChannelError::ApiRequest(e.to_string()))?;
        let envelope: TgEnvelope<serde_json::Value> = response
            .into_json()
            .map_err(|e| ChannelError::ApiRequest(e.to_string()))?;
        if !envelope.ok {
            return Err(ChannelError::ApiResponse(
                envelope
                    .description
                    .unwrap_or_else(|| format!("{method} failed")),
            ));
        }
        Ok(())
    }

    fn send_typing(&self, chat_jid: &str) -> Result<(), ChannelError> {
        let chat_id = telegram_chat_id(chat_jid)?;
        let _: bool = self.call(
            "sendChatAction",
            &json!({ "chat_id": chat_id, "action": "typing" }),
        )?;
        Ok(())
    }
}

fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if current.chars().count() >= max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn multipart_boundary() -> String {
    let mut seed = [0u8; 16];
    let _ = getrandom::getrandom(&mut seed);
    let suffix: String = seed.iter().map(|b| format!("{b:02x}")).collect();
    format!("----chatclaw-{suffix}")
}

fn encode_multipart(
    fields: &[(String, String)],
    file_field: &str,
    file_name: &str,
    file_bytes: &[u8],
) -> (String, Vec<u8>) {
    let boundary = multipart_boundary();
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{file_field}\"; filename=\"{file_name}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(file_bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    (
        format!("multipart/form-data; boundary={boundary}"),
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ids::MAIN_GROUP_FOLDER;
    use tempfile::tempdir;

    fn harness() -> (tempfile::TempDir, StatePaths, MessageStore, GroupRegistry) {
        let tmp = tempdir().expect("tempdir");
        let paths = StatePaths::new(tmp.path());
        crate::runtime::bootstrap_state_root(&paths).expect("bootstrap");
        let store = MessageStore::open(&paths.store_db_path()).expect("store");
        let registry = GroupRegistry::open(paths.clone()).expect("registry");
        (tmp, paths, store, registry)
    }

    fn text_message(chat_id: i64, kind: &str, text: &str) -> TgMessage {
        TgMessage {
            message_id: 7,
            from: Some(TgUser {
                id: 99,
                first_name: Some("Dana".to_string()),
                username: None,
            }),
            chat: TgChat {
                id: chat_id,
                kind: kind.to_string(),
                title: None,
            },
            text: Some(text.to_string()),
            voice: None,
        }
    }

    #[test]
    fn first_private_chat_becomes_the_main_group() {
        let (_tmp, paths, store, registry) = harness();
        let settings = Settings::default();
        let outcome = ingest_message(
            &settings,
            &paths,
            &store,
            &registry,
            &text_message(42, "private", "hello"),
            1_000,
        )
        .expect("ingest");
        assert!(outcome.auto_registered);
        assert!(outcome.stored);
        let group = registry.group_for_jid("telegram:42").expect("registered");
        assert_eq!(group.folder.as_str(), MAIN_GROUP_FOLDER);
        assert_eq!(group.name, "Dana's Chat");
        assert_eq!(
            store.messages_since("telegram:42", 0).expect("messages").len(),
            1
        );
    }

    #[test]
    fn unregistered_group_chats_are_dropped() {
        let (_tmp, paths, store, registry) = harness();
        let settings = Settings::default();
        let outcome = ingest_message(
            &settings,
            &paths,
            &store,
            &registry,
            &text_message(-500, "group", "hello"),
            1_000,
        )
        .expect("ingest");
        assert!(!outcome.stored);
        assert!(!outcome.auto_registered);
        assert!(registry.group_for_jid("telegram:-500").is_none());
    }

    #[test]
    fn voice_messages_store_a_placeholder() {
        let (_tmp, paths, store, registry) = harness();
        let settings = Settings::default();
        let mut message = text_message(42, "private", "");
        message.text = None;
        message.voice = Some(serde_json::json!({ "file_id": "abc" }));
        let outcome =
            ingest_message(&settings, &paths, &store, &registry, &message, 1_000).expect("ingest");
        assert!(outcome.stored);
        let stored = store.messages_since("telegram:42", 0).expect("messages");
        assert_eq!(stored[0].content, "[Voice message]");
    }

    #[test]
    fn long_text_is_chunked_under_the_api_limit() {
        let text = "x".repeat(9_500);
        let chunks = chunk_text(&text, 4_000);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 4_000));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn offset_state_round_trips() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("channels/telegram_offset.json");
        assert_eq!(load_offset(&path).expect("default"), OffsetState::default());
        save_offset(&path, &OffsetState { next_offset: 314 }).expect("save");
        assert_eq!(
            load_offset(&path).expect("reload"),
            OffsetState { next_offset: 314 }
        );
    }

    #[test]
    fn multipart_body_carries_fields_and_file() {
        let (content_type, body) = encode_multipart(
            &[("chat_id".to_string(), "42".to_string())],
            "photo",
            "pic.jpg",
            b"JPEGDATA",
        );
        let body_text = String::from_utf8_lossy(&body);
        assert!(content_type.starts_with("multipart/form-data; boundary="));
        assert!(body_text.contains("name=\"chat_id\"\r\n\r\n42"));
        assert!(body_text.contains("filename=\"pic.jpg\""));
        assert!(body_text.contains("JPEGDATA"));
        assert!(body_text.trim_end().ends_with("--"));
    }
}
