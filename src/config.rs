use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("settings validation failed: {0}")]
    Settings(String),
    #[error("failed to resolve home directory for state root")]
    HomeDirectoryUnavailable,
}

pub const DEFAULT_STATE_ROOT_DIR: &str = ".chatclaw";
pub const SETTINGS_FILE_NAME: &str = "config.yaml";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Name the assistant signs outbound messages with and responds to as a
    /// trigger in the main group.
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,
    /// IANA timezone used when evaluating cron schedules.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_message_poll_interval_ms")]
    pub message_poll_interval_ms: u64,
    #[serde(default = "default_ipc_poll_interval_ms")]
    pub ipc_poll_interval_ms: u64,
    #[serde(default = "default_scheduler_poll_interval_ms")]
    pub scheduler_poll_interval_ms: u64,
    /// Host directory mounted as `/workspace/project` for the main group.
    /// Defaults to the process working directory at startup.
    #[serde(default)]
    pub project_root: Option<PathBuf>,
    #[serde(default)]
    pub container: ContainerSettings,
    #[serde(default)]
    pub telegram: TelegramSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContainerSettings {
    #[serde(default = "default_container_binary")]
    pub binary: String,
    #[serde(default = "default_container_image")]
    pub image: String,
    #[serde(default = "default_container_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramSettings {
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
    /// Long-poll wait passed to `getUpdates`.
    #[serde(default = "default_telegram_poll_timeout_seconds")]
    pub poll_timeout_seconds: u64,
}

fn default_assistant_name() -> String {
    "Claw".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_message_poll_interval_ms() -> u64 {
    2_000
}

fn default_ipc_poll_interval_ms() -> u64 {
    1_000
}

fn default_scheduler_poll_interval_ms() -> u64 {
    30_000
}

fn default_container_binary() -> String {
    "docker".to_string()
}

fn default_container_image() -> String {
    "chatclaw-agent".to_string()
}

fn default_container_timeout_seconds() -> u64 {
    300
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_telegram_poll_timeout_seconds() -> u64 {
    25
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            binary: default_container_binary(),
            image: default_container_image(),
            timeout_seconds: default_container_timeout_seconds(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            api_base: default_telegram_api_base(),
            poll_timeout_seconds: default_telegram_poll_timeout_seconds(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            assistant_name: default_assistant_name(),
            timezone: default_timezone(),
            message_poll_interval_ms: default_message_poll_interval_ms(),
            ipc_poll_interval_ms: default_ipc_poll_interval_ms(),
            scheduler_poll_interval_ms: default_scheduler_poll_interval_ms(),
            project_root: None,
            container: ContainerSettings::default(),
            telegram: TelegramSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load settings from `<state_root>/config.yaml`, falling back to
    /// defaults when the file does not exist.
    pub fn load_or_default(state_root: &Path) -> Result<Self, ConfigError> {
        let path = state_root.join(SETTINGS_FILE_NAME);
        let settings = if path.exists() {
            Self::from_path(&path)?
        } else {
            Self::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.assistant_name.trim().is_empty() {
            return Err(ConfigError::Settings(
                "assistant_name must be non-empty".to_string(),
            ));
        }
        self.cron_timezone()?;
        if self.message_poll_interval_ms == 0 {
            return Err(ConfigError::Settings(
                "message_poll_interval_ms must be >= 1".to_string(),
            ));
        }
        if self.ipc_poll_interval_ms == 0 {
            return Err(ConfigError::Settings(
                "ipc_poll_interval_ms must be >= 1".to_string(),
            ));
        }
        if self.scheduler_poll_interval_ms == 0 {
            return Err(ConfigError::Settings(
                "scheduler_poll_interval_ms must be >= 1".to_string(),
            ));
        }
        if self.container.timeout_seconds == 0 {
            return Err(ConfigError::Settings(
                "container.timeout_seconds must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cron_timezone(&self) -> Result<Tz, ConfigError> {
        self.timezone.parse::<Tz>().map_err(|_| {
            ConfigError::Settings(format!(
                "invalid timezone `{}`; expected IANA timezone id",
                self.timezone
            ))
        })
    }

    pub fn resolve_project_root(&self) -> PathBuf {
        self.project_root
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

pub fn default_state_root_path() -> Result<PathBuf, ConfigError> {
    let home = std::env::var_os("HOME").ok_or(ConfigError::HomeDirectoryUnavailable)?;
    Ok(PathBuf::from(home).join(DEFAULT_STATE_ROOT_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_validate() {
        Settings::default().validate().expect("defaults valid");
    }

    #[test]
    fn missing_settings_file_falls_back_to_defaults() {
        let tmp = tempdir().expect("tempdir");
        let settings = Settings::load_or_default(tmp.path()).expect("load");
        assert_eq!(settings.assistant_name, "Claw");
        assert_eq!(settings.container.binary, "docker");
    }

    #[test]
    fn yaml_overrides_apply() {
        let tmp = tempdir().expect("tempdir");
        fs::write(
            tmp.path().join(SETTINGS_FILE_NAME),
            r#"
assistant_name: Nano
timezone: America/New_York
container:
  image: custom-agent
  timeout_seconds: 60
"#,
        )
        .expect("write settings");
        let settings = Settings::load_or_default(tmp.path()).expect("load");
        assert_eq!(settings.assistant_name, "Nano");
        assert_eq!(settings.container.image, "custom-agent");
        assert_eq!(settings.container.timeout_seconds, 60);
        assert_eq!(settings.message_poll_interval_ms, 2_000);
    }

    #[test]
    fn invalid_timezone_is_rejected() {
        let settings = Settings {
            timezone: "Mars/Olympus".to_string(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let settings = Settings {
            ipc_poll_interval_ms: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
