//! Chat gateway abstraction. The orchestrator talks to chats through
//! [`ChannelGateway`]; Telegram is the shipped implementation.

pub mod telegram;

pub use telegram::TelegramClient;

use std::path::Path;

pub const TELEGRAM_JID_PREFIX: &str = "telegram:";

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("missing required env var `{0}`")]
    MissingEnvVar(String),
    #[error("chat jid `{0}` does not belong to this channel")]
    InvalidJid(String),
    #[error("channel api request failed: {0}")]
    ApiRequest(String),
    #[error("channel api responded with error: {0}")]
    ApiResponse(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    /// Maps an agent-declared media type; anything unrecognized is sent as a
    /// plain document.
    pub fn from_declared(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "image" | "photo" => Self::Image,
            "video" => Self::Video,
            "audio" | "voice" => Self::Audio,
            _ => Self::Document,
        }
    }
}

/// Outbound surface of a chat channel. Inbound polling is channel-specific
/// and lives on the concrete client.
pub trait ChannelGateway: Send + Sync {
    fn send_text(&self, chat_jid: &str, text: &str) -> Result<(), ChannelError>;
    fn send_media(
        &self,
        chat_jid: &str,
        file_path: &Path,
        kind: MediaKind,
        caption: Option<&str>,
    ) -> Result<(), ChannelError>;
    fn send_typing(&self, chat_jid: &str) -> Result<(), ChannelError>;
}

/// Extract the numeric Telegram chat id from a `telegram:<id>` jid.
pub fn telegram_chat_id(chat_jid: &str) -> Result<i64, ChannelError> {
    chat_jid
        .strip_prefix(TELEGRAM_JID_PREFIX)
        .and_then(|raw| raw.parse::<i64>().ok())
        .ok_or_else(|| ChannelError::InvalidJid(chat_jid.to_string()))
}
