//! Builds the `docker run` command line for one agent turn.

use super::ContainerError;
use crate::config::Settings;
use crate::registry::RegisteredGroup;
use crate::runtime::StatePaths;
use std::path::Path;

/// Container mount points the agent sees. The group sandbox is writable;
/// the project checkout is read-only; the IPC queue is where the agent
/// drops request files for the host.
pub const MOUNT_GROUP: &str = "/workspace/group";
pub const MOUNT_PROJECT: &str = "/workspace/project";
pub const MOUNT_IPC: &str = "/workspace/ipc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationSpec {
    pub binary: String,
    pub args: Vec<String>,
}

impl InvocationSpec {
    pub fn command_form(&self) -> String {
        format!("{} {}", self.binary, self.args.join(" "))
    }
}

pub fn build_invocation(
    settings: &Settings,
    paths: &StatePaths,
    group: &RegisteredGroup,
) -> Result<InvocationSpec, ContainerError> {
    let folder = group.folder.as_str();
    let overrides = group.container_config.as_ref();
    let image = overrides
        .and_then(|o| o.image.as_deref())
        .unwrap_or(&settings.container.image);

    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--interactive".to_string(),
        "--network".to_string(),
        "none".to_string(),
        "--name".to_string(),
        format!("chatclaw-{folder}"),
    ];
    push_mount(&mut args, &paths.group_dir(folder), MOUNT_GROUP, false)?;
    push_mount(&mut args, &settings.resolve_project_root(), MOUNT_PROJECT, true)?;
    push_mount(&mut args, &paths.ipc_group_dir(folder), MOUNT_IPC, false)?;
    args.extend(settings.container.extra_args.iter().cloned());
    if let Some(overrides) = overrides {
        args.extend(overrides.extra_args.iter().cloned());
    }
    args.push(image.to_string());

    Ok(InvocationSpec {
        binary: settings.container.binary.clone(),
        args,
    })
}

fn push_mount(
    args: &mut Vec<String>,
    host: &Path,
    container: &str,
    read_only: bool,
) -> Result<(), ContainerError> {
    let host = host.to_str().ok_or_else(|| ContainerError::Snapshot {
        path: host.display().to_string(),
        detail: "mount path is not valid UTF-8".to_string(),
    })?;
    let suffix = if read_only { ":ro" } else { "" };
    args.push("--volume".to_string());
    args.push(format!("{host}:{container}{suffix}"));
    Ok(())
}
