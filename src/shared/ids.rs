use getrandom::getrandom;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// Folder of the group with cross-tenant administrative privilege.
pub const MAIN_GROUP_FOLDER: &str = "main";

pub fn validate_folder_value(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("group folder must be non-empty".to_string());
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err("group folder must use only ASCII letters, digits, '-' or '_'".to_string())
}

/// Unique sandbox/isolation identifier of a registered group. The value is
/// used as a directory name, so it is restricted to filename-safe ASCII.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct GroupFolder(String);

impl GroupFolder {
    pub fn parse(raw: &str) -> Result<Self, String> {
        validate_folder_value(raw)?;
        Ok(Self(raw.to_string()))
    }

    pub fn main() -> Self {
        Self(MAIN_GROUP_FOLDER.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_main(&self) -> bool {
        self.0 == MAIN_GROUP_FOLDER
    }
}

impl std::fmt::Display for GroupFolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::borrow::Borrow<str> for GroupFolder {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<String> for GroupFolder {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl<'de> Deserialize<'de> for GroupFolder {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .map_err(|err| D::Error::custom(format!("invalid group folder `{raw}`: {err}")))
    }
}

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn base36_encode_u64(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut chars = Vec::new();
    while value > 0 {
        chars.push(BASE36_ALPHABET[(value % 36) as usize] as char);
        value /= 36;
    }
    chars.iter().rev().collect()
}

/// Generate a task id of the form `task-<ts36>-<rand36>`. Uniqueness comes
/// from the millisecond timestamp plus 4 random base36 characters.
pub fn generate_task_id(now_ms: i64) -> Result<String, String> {
    let timestamp = u64::try_from(now_ms.max(0)).unwrap_or(0);
    let mut bytes = [0_u8; 4];
    getrandom(&mut bytes).map_err(|err| format!("failed to generate task id randomness: {err}"))?;
    let mut sample = u32::from_le_bytes(bytes) % 36_u32.pow(4);
    let mut suffix = ['0'; 4];
    for slot in suffix.iter_mut().rev() {
        *slot = BASE36_ALPHABET[(sample % 36) as usize] as char;
        sample /= 36;
    }
    Ok(format!(
        "task-{}-{}",
        base36_encode_u64(timestamp),
        suffix.iter().collect::<String>()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_accepts_filename_safe_ascii_only() {
        assert!(GroupFolder::parse("acme-team_2").is_ok());
        assert!(GroupFolder::parse("").is_err());
        assert!(GroupFolder::parse("../escape").is_err());
        assert!(GroupFolder::parse("with space").is_err());
    }

    #[test]
    fn main_folder_is_recognized() {
        assert!(GroupFolder::main().is_main());
        assert!(!GroupFolder::parse("acme").expect("parse").is_main());
    }

    #[test]
    fn folder_deserialization_rejects_invalid_values() {
        let ok: Result<GroupFolder, _> = serde_json::from_str("\"acme\"");
        assert!(ok.is_ok());
        let bad: Result<GroupFolder, _> = serde_json::from_str("\"a/b\"");
        assert!(bad.is_err());
    }

    #[test]
    fn task_ids_carry_prefix_and_differ() {
        let a = generate_task_id(1_700_000_000_000).expect("id");
        let b = generate_task_id(1_700_000_000_000).expect("id");
        assert!(a.starts_with("task-"));
        assert_ne!(a, b);
    }
}
