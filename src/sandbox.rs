//! Container-to-host path translation.
//!
//! Agents declare file paths relative to their container mounts. The only
//! prefixes a container ever sees are `/workspace/group` (its own sandbox)
//! and `/workspace/project` (the shared project checkout). Everything the
//! host touches on behalf of an agent goes through [`translate_container_path`].

use crate::runtime::StatePaths;
use crate::shared::ids::validate_folder_value;
use std::path::{Component, Path, PathBuf};

pub const CONTAINER_GROUP_ROOT: &str = "/workspace/group";
pub const CONTAINER_PROJECT_ROOT: &str = "/workspace/project";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("path `{0}` is outside the recognized container mounts")]
    UnknownPrefix(String),
    #[error("path `{0}` escapes its sandbox")]
    Traversal(String),
    #[error("no project root is configured; `{0}` cannot be mapped")]
    ProjectRootUnset(String),
    #[error("`{0}` is not a valid group folder name")]
    InvalidFolder(String),
}

/// Resolve `.` and `..` lexically, without touching the filesystem.
/// Returns `None` when `..` would climb above the starting point.
fn resolve_within(base: &Path, relative: &Path) -> Option<PathBuf> {
    let mut resolved = base.to_path_buf();
    let mut depth: usize = 0;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

/// Map an agent-declared container path onto the host filesystem.
///
/// `/workspace/group/<rest>` maps into the requester's own group sandbox,
/// `/workspace/project/<rest>` into the configured project root. Any other
/// prefix is rejected, as is any `<rest>` that climbs out of its base.
pub fn translate_container_path(
    container_path: &str,
    group_folder: &str,
    paths: &StatePaths,
    project_root: Option<&Path>,
) -> Result<PathBuf, SandboxError> {
    let (base, rest) = if let Some(rest) = strip_mount(container_path, CONTAINER_GROUP_ROOT) {
        // The folder names the sandbox base directory, so it must itself be
        // a plain directory name. Anything else would move the base.
        validate_folder_value(group_folder)
            .map_err(|_| SandboxError::InvalidFolder(group_folder.to_string()))?;
        (paths.group_dir(group_folder), rest)
    } else if let Some(rest) = strip_mount(container_path, CONTAINER_PROJECT_ROOT) {
        let root = project_root
            .ok_or_else(|| SandboxError::ProjectRootUnset(container_path.to_string()))?;
        (root.to_path_buf(), rest)
    } else {
        return Err(SandboxError::UnknownPrefix(container_path.to_string()));
    };

    resolve_within(&base, Path::new(rest))
        .ok_or_else(|| SandboxError::Traversal(container_path.to_string()))
}

/// Split off a mount prefix, accepting the bare mount itself and requiring a
/// `/` separator otherwise so `/workspace/groupX` does not match.
fn strip_mount<'a>(path: &'a str, mount: &str) -> Option<&'a str> {
    let stripped = path.strip_prefix(mount)?;
    if stripped.is_empty() {
        Some("")
    } else {
        stripped.strip_prefix('/')
    }
}
