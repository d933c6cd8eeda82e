//! CLI verbs. Each command returns its human-readable output as a string;
//! the binary prints it and maps errors to a non-zero exit.

use crate::channel::TelegramClient;
use crate::config::{default_state_root_path, Settings};
use crate::container::check_container_runtime;
use crate::runtime::{
    append_runtime_log, bootstrap_state_root, cleanup_stale_supervisor, clear_start_lock,
    load_supervisor_state, reserve_start_lock, run_supervisor, save_supervisor_state,
    stop_active_supervisor, supervisor_ownership_state, OwnershipState, StatePaths,
};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Start,
    Stop,
    Restart,
    Status,
    Logs,
    Doctor,
    Help,
    Unknown,
}

pub fn parse_cli_verb(raw: &str) -> CliVerb {
    match raw {
        "start" => CliVerb::Start,
        "stop" => CliVerb::Stop,
        "restart" => CliVerb::Restart,
        "status" => CliVerb::Status,
        "logs" => CliVerb::Logs,
        "doctor" => CliVerb::Doctor,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

pub fn help_text() -> String {
    [
        "usage: chatclaw <command>",
        "",
        "commands:",
        "  start    run the orchestrator in the foreground",
        "  stop     ask a running orchestrator to shut down",
        "  restart  stop then start",
        "  status   show runtime and worker health",
        "  logs     print recent runtime log lines",
        "  doctor   check container runtime, bot token and state root",
        "  help     show this message",
    ]
    .join("\n")
}

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    if args.is_empty() {
        return Ok(help_text());
    }

    match parse_cli_verb(args[0].as_str()) {
        CliVerb::Start => cmd_start(),
        CliVerb::Stop => cmd_stop(),
        CliVerb::Restart => cmd_restart(),
        CliVerb::Status => cmd_status(),
        CliVerb::Logs => cmd_logs(),
        CliVerb::Doctor => cmd_doctor(),
        CliVerb::Help => Ok(help_text()),
        CliVerb::Unknown => Err(format!("unknown command `{}`\n\n{}", args[0], help_text())),
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn state_root() -> Result<PathBuf, String> {
    default_state_root_path().map_err(|e| e.to_string())
}

fn ensure_runtime_root() -> Result<StatePaths, String> {
    let root = state_root()?;
    let paths = StatePaths::new(root);
    bootstrap_state_root(&paths).map_err(|e| e.to_string())?;
    Ok(paths)
}

fn load_settings(paths: &StatePaths) -> Result<Settings, String> {
    let settings = Settings::load_or_default(&paths.root).map_err(|e| e.to_string())?;
    settings.validate().map_err(|e| e.to_string())?;
    Ok(settings)
}

fn cmd_start() -> Result<String, String> {
    let paths = ensure_runtime_root()?;
    let settings = load_settings(&paths)?;

    // Fatal startup checks: a missing container runtime or bot token means
    // nothing downstream can work, so fail before taking the lock.
    check_container_runtime(&settings).map_err(|e| {
        format!("container runtime check failed: {e}\nstart aborted; is docker installed and running?")
    })?;
    let telegram = TelegramClient::from_env(&settings).map_err(|e| e.to_string())?;

    match supervisor_ownership_state(&paths).map_err(|e| e.to_string())? {
        OwnershipState::Running { pid } => {
            return Err(format!("orchestrator already running (pid={pid})"))
        }
        OwnershipState::Stale => cleanup_stale_supervisor(&paths).map_err(|e| e.to_string())?,
        OwnershipState::NotRunning => {}
    }

    reserve_start_lock(&paths).map_err(|e| e.to_string())?;
    append_runtime_log(
        &paths,
        "info",
        "supervisor.start.requested",
        &format!("pid={}", std::process::id()),
    );

    // Blocks until a stop is signalled; run_supervisor clears the lock on a
    // clean exit, so only the error path has to clean up here.
    if let Err(err) = run_supervisor(&paths.root, settings, telegram) {
        clear_start_lock(&paths);
        return Err(err.to_string());
    }

    Ok(format!("stopped\nstate_root={}", paths.root.display()))
}

fn cmd_stop() -> Result<String, String> {
    let paths = ensure_runtime_root()?;
    match stop_active_supervisor(&paths, Duration::from_secs(5)) {
        Ok(result) => Ok(format!(
            "stopped\npid={}\nforced={}",
            result.pid, result.forced
        )),
        Err(crate::runtime::RuntimeError::NotRunning) => Ok("stopped\nrunning=false".to_string()),
        Err(err) => Err(err.to_string()),
    }
}

fn cmd_restart() -> Result<String, String> {
    let stop = cmd_stop()?;
    let start = cmd_start()?;
    Ok(format!("restart complete\n{stop}\n{start}"))
}

fn cmd_status() -> Result<String, String> {
    let paths = ensure_runtime_root()?;
    status_report(&paths)
}

fn status_report(paths: &StatePaths) -> Result<String, String> {
    let mut state = load_supervisor_state(paths).map_err(|e| e.to_string())?;
    let mut ownership = "not_running".to_string();
    match supervisor_ownership_state(paths).map_err(|e| e.to_string())? {
        OwnershipState::Running { pid } => {
            ownership = "running".to_string();
            if !state.running || state.pid != Some(pid) {
                state.running = true;
                state.pid = Some(pid);
                if state.started_at.is_none() {
                    state.started_at = Some(now_secs());
                }
                state.stopped_at = None;
                save_supervisor_state(paths, &state).map_err(|e| e.to_string())?;
            }
        }
        OwnershipState::Stale => {
            ownership = "stale".to_string();
            cleanup_stale_supervisor(paths).map_err(|e| e.to_string())?;
            state = load_supervisor_state(paths).map_err(|e| e.to_string())?;
        }
        OwnershipState::NotRunning => {}
    }

    let mut lines = Vec::new();
    lines.push(format!("ownership={ownership}"));
    lines.push(format!("running={}", state.running));
    lines.push(format!("pid={}", render_opt(state.pid)));
    lines.push(format!("started_at={}", render_opt(state.started_at)));
    lines.push(format!("stopped_at={}", render_opt(state.stopped_at)));
    lines.push(format!(
        "last_error={}",
        state.last_error.as_deref().unwrap_or("none")
    ));
    for (id, worker) in &state.workers {
        lines.push(format!("worker:{id}.state={:?}", worker.state).to_lowercase());
        lines.push(format!(
            "worker:{id}.last_heartbeat={}",
            render_opt(worker.last_heartbeat)
        ));
        lines.push(format!(
            "worker:{id}.last_error={}",
            worker.last_error.as_deref().unwrap_or("none")
        ));
    }
    Ok(lines.join("\n"))
}

fn render_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "none".to_string())
}

const LOG_TAIL_LINES: usize = 100;

fn cmd_logs() -> Result<String, String> {
    let paths = ensure_runtime_root()?;
    logs_report(&paths)
}

fn logs_report(paths: &StatePaths) -> Result<String, String> {
    let path = paths.runtime_log_path();
    if !path.exists() {
        return Ok("no runtime log yet".to_string());
    }
    let raw =
        fs::read_to_string(&path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let lines: Vec<&str> = raw.lines().collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    Ok(lines[start..].join("\n"))
}

fn cmd_doctor() -> Result<String, String> {
    let paths = ensure_runtime_root()?;
    let mut lines = Vec::new();
    lines.push(format!("state_root={}", paths.root.display()));

    let settings = match load_settings(&paths) {
        Ok(settings) => {
            lines.push("settings=ok".to_string());
            Some(settings)
        }
        Err(err) => {
            lines.push(format!("settings=error\nsettings_error={err}"));
            None
        }
    };

    if let Some(settings) = &settings {
        match check_container_runtime(settings) {
            Ok(()) => lines.push(format!("container_runtime=ok binary={}", settings.container.binary)),
            Err(err) => lines.push(format!("container_runtime=error\ncontainer_error={err}")),
        }
        match TelegramClient::from_env(settings) {
            Ok(_) => lines.push("telegram_token=present".to_string()),
            Err(err) => lines.push(format!("telegram_token=missing\ntelegram_error={err}")),
        }
    }

    match supervisor_ownership_state(&paths).map_err(|e| e.to_string())? {
        OwnershipState::Running { pid } => lines.push(format!("orchestrator=running pid={pid}")),
        OwnershipState::Stale => lines.push("orchestrator=stale".to_string()),
        OwnershipState::NotRunning => lines.push("orchestrator=not_running".to_string()),
    }

    Ok(lines.join("\n"))
}
