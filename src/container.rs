//! Container invocation bridge: snapshot assembly, `docker run` plumbing and
//! terminal-output interpretation for one agent turn.

pub mod health;
pub mod invocation;
pub mod runner;
pub mod snapshots;

use crate::config::Settings;
use crate::registry::GroupRegistry;
use crate::runtime::{append_runtime_log, StatePaths};
use crate::shared::ids::GroupFolder;
use crate::store::MessageStore;
use serde::{Deserialize, Serialize};

pub use health::check_container_runtime;
pub use invocation::{build_invocation, InvocationSpec};
pub use runner::run_container;
pub use snapshots::{write_context_snapshots, AvailableGroup, TaskSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("container runtime `{binary}` is unavailable: {detail}")]
    RuntimeUnavailable { binary: String, detail: String },
    #[error("container binary `{binary}` was not found on PATH")]
    MissingBinary { binary: String },
    #[error("container process failed at {stage}: {source}")]
    Process {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("container exited with status {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i32, stderr: String },
    #[error("container run exceeded {timeout_seconds}s and was killed")]
    Timeout { timeout_seconds: u64 },
    #[error("container output unusable: {0}")]
    Output(String),
    #[error("no registration found for folder `{0}`")]
    UnknownGroup(String),
    #[error("failed to write context snapshot {path}: {detail}")]
    Snapshot { path: String, detail: String },
}

/// Payload written to the agent's stdin as a single JSON document.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInput<'a> {
    pub prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<&'a str>,
    pub group_folder: &'a str,
    pub chat_jid: &'a str,
    pub is_main: bool,
}

/// Terminal JSON document an agent prints as its last stdout line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentOutput {
    pub status: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub new_session_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Text to deliver back to the chat; `None` means stay silent.
    pub reply: Option<String>,
}

/// Run one agent turn for a group: refresh its context snapshots, invoke the
/// container with the prompt and (optionally) the stored session handle, and
/// interpret the terminal output. Callers hold the per-folder invocation
/// slot; this function never takes it.
pub fn run_agent_turn(
    settings: &Settings,
    paths: &StatePaths,
    store: &MessageStore,
    registry: &GroupRegistry,
    folder: &GroupFolder,
    prompt: &str,
    reuse_session: bool,
) -> Result<TurnOutcome, ContainerError> {
    let jid = registry
        .jid_for_folder(folder.as_str())
        .ok_or_else(|| ContainerError::UnknownGroup(folder.to_string()))?;
    let group = registry
        .group_for_jid(&jid)
        .ok_or_else(|| ContainerError::UnknownGroup(folder.to_string()))?;

    write_context_snapshots(paths, store, registry, folder)?;

    let session_id = if reuse_session {
        registry.session_for(folder.as_str())
    } else {
        None
    };
    let input = AgentInput {
        prompt,
        session_id: session_id.as_deref(),
        group_folder: folder.as_str(),
        chat_jid: &jid,
        is_main: folder.is_main(),
    };
    let input_json = serde_json::to_string(&input)
        .map_err(|err| ContainerError::Output(format!("failed to encode agent input: {err}")))?;

    let spec = build_invocation(settings, paths, &group)?;
    let timeout_seconds = group
        .container_config
        .as_ref()
        .and_then(|overrides| overrides.timeout_seconds)
        .unwrap_or(settings.container.timeout_seconds);
    let stdout = run_container(&spec, &input_json, timeout_seconds)?;
    let output = parse_agent_output(&stdout)?;

    if output.status == "error" {
        // A failed turn leaves session state untouched: the next turn
        // resumes from the last good handle.
        append_runtime_log(
            paths,
            "error",
            "agent_error",
            &format!(
                "folder {folder}: {}",
                output.error.as_deref().unwrap_or("unspecified agent error")
            ),
        );
        return Ok(TurnOutcome { reply: None });
    }

    if let Some(new_session_id) = output.new_session_id.as_deref() {
        if reuse_session {
            if let Err(err) = registry.set_session(folder.as_str(), new_session_id) {
                append_runtime_log(
                    paths,
                    "error",
                    "session_persist_failed",
                    &format!("folder {folder}: {err}"),
                );
            }
        }
    }

    Ok(TurnOutcome {
        reply: output.result.filter(|text| !text.trim().is_empty()),
    })
}

/// Agents may print progress lines before their terminal document; the last
/// stdout line that parses as JSON wins.
pub fn parse_agent_output(stdout: &str) -> Result<AgentOutput, ContainerError> {
    let mut last_parsed = None;
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(output) = serde_json::from_str::<AgentOutput>(line) {
            last_parsed = Some(output);
        }
    }
    last_parsed.ok_or_else(|| {
        ContainerError::Output("no terminal JSON document found on stdout".to_string())
    })
}
