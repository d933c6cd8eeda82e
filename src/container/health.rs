use super::ContainerError;
use crate::config::Settings;
use std::process::{Command, Stdio};

/// Startup probe for the container runtime (`docker info`). A failure here
/// is fatal: agents cannot run without it, so the caller should exit with
/// an operator-facing diagnostic rather than limp along.
pub fn check_container_runtime(settings: &Settings) -> Result<(), ContainerError> {
    let binary = &settings.container.binary;
    let output = Command::new(binary)
        .arg("info")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output();

    match output {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => Err(ContainerError::RuntimeUnavailable {
            binary: binary.clone(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(ContainerError::MissingBinary {
                binary: binary.clone(),
            })
        }
        Err(err) => Err(ContainerError::RuntimeUnavailable {
            binary: binary.clone(),
            detail: err.to_string(),
        }),
    }
}
