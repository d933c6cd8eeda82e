//! Spawns the container process, feeds the agent input document on stdin and
//! collects stdout until exit or timeout.

use super::{ContainerError, InvocationSpec};
use std::io::{BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn process_error(stage: &'static str) -> impl FnOnce(std::io::Error) -> ContainerError {
    move |source| ContainerError::Process { stage, source }
}

pub fn run_container(
    spec: &InvocationSpec,
    input_json: &str,
    timeout_seconds: u64,
) -> Result<String, ContainerError> {
    let mut command = Command::new(&spec.binary);
    command
        .args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ContainerError::MissingBinary {
                binary: spec.binary.clone(),
            })
        }
        Err(err) => return Err(ContainerError::Process { stage: "spawn", source: err }),
    };

    // Write the input and close stdin so the agent sees EOF.
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| process_error("stdin")(std::io::Error::other("missing stdin pipe")))?;
    stdin
        .write_all(input_json.as_bytes())
        .and_then(|_| stdin.write_all(b"\n"))
        .map_err(process_error("stdin"))?;
    drop(stdin);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| process_error("stdout")(std::io::Error::other("missing stdout pipe")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| process_error("stderr")(std::io::Error::other("missing stderr pipe")))?;

    let stdout_reader = thread::spawn(move || {
        let mut buf = String::new();
        let mut reader = BufReader::new(stdout);
        let _ = reader.read_to_string(&mut buf);
        buf
    });
    let stderr_reader = thread::spawn(move || {
        let mut buf = String::new();
        let mut reader = BufReader::new(stderr);
        let _ = reader.read_to_string(&mut buf);
        buf
    });

    let timeout = Duration::from_secs(timeout_seconds);
    let start = Instant::now();
    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_reader.join();
                    let _ = stderr_reader.join();
                    return Err(ContainerError::Timeout { timeout_seconds });
                }
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) => return Err(ContainerError::Process { stage: "wait", source: err }),
        }
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    if !exit_status.success() {
        return Err(ContainerError::NonZeroExit {
            exit_code: exit_status.code().unwrap_or(-1),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(stdout)
}
