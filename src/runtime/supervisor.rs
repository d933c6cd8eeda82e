//! Orchestrator supervisor: owns the worker threads and the persisted
//! runtime state, and watches for the stop file.

use super::worker::{build_worker_specs, run_worker, WorkerContext, WorkerEvent};
use super::worker_registry::{apply_worker_event, WorkerHealth, WorkerState};
use super::{
    append_runtime_log, atomic_write_file, bootstrap_state_root, clear_start_lock, now_secs,
    RuntimeError, StatePaths,
};
use crate::channel::TelegramClient;
use crate::config::Settings;
use crate::registry::GroupRegistry;
use crate::store::MessageStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SupervisorState {
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
    pub workers: BTreeMap<String, WorkerHealth>,
    pub last_error: Option<String>,
}

/// Run the orchestrator until the stop file appears. Blocking; the caller
/// has already passed the fatal startup checks (container runtime, bot
/// token) and holds the start lock.
pub fn run_supervisor(
    state_root: &Path,
    settings: Settings,
    telegram: TelegramClient,
) -> Result<(), RuntimeError> {
    let paths = StatePaths::new(state_root);
    bootstrap_state_root(&paths)?;

    let stop_path = paths.stop_signal_path();
    if stop_path.exists() {
        let _ = fs::remove_file(&stop_path);
    }

    let store = Arc::new(
        MessageStore::open(&paths.store_db_path())
            .map_err(|err| RuntimeError::Init(err.to_string()))?,
    );
    let registry = Arc::new(
        GroupRegistry::open(paths.clone()).map_err(|err| RuntimeError::Init(err.to_string()))?,
    );
    let telegram = Arc::new(telegram);

    let specs = build_worker_specs(&settings);
    let mut state = SupervisorState {
        running: true,
        pid: Some(std::process::id()),
        started_at: Some(now_secs()),
        stopped_at: None,
        workers: BTreeMap::new(),
        last_error: None,
    };
    for spec in &specs {
        state
            .workers
            .insert(spec.id.clone(), WorkerHealth::default());
    }
    save_supervisor_state(&paths, &state)?;
    append_runtime_log(
        &paths,
        "info",
        "supervisor.started",
        &format!("pid={} workers={}", std::process::id(), specs.len()),
    );

    let stop = Arc::new(AtomicBool::new(false));
    let (events_tx, events_rx) = mpsc::channel::<WorkerEvent>();
    let mut handles = Vec::new();
    let mut active = BTreeSet::new();

    for spec in specs {
        active.insert(spec.id.clone());
        let ctx = WorkerContext {
            paths: paths.clone(),
            settings: settings.clone(),
            store: store.clone(),
            registry: registry.clone(),
            telegram: telegram.clone(),
            stop: stop.clone(),
            events: events_tx.clone(),
        };
        handles.push(thread::spawn(move || run_worker(spec, ctx)));
    }
    drop(events_tx);

    while !stop.load(Ordering::Relaxed) {
        if paths.stop_signal_path().exists() {
            stop.store(true, Ordering::Relaxed);
            append_runtime_log(
                &paths,
                "info",
                "supervisor.stop.signal",
                "stop file detected",
            );
        }

        match events_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => handle_worker_event(&paths, &mut state, &mut active, event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let deadline = std::time::Instant::now() + shutdown_wait_timeout();
    while !active.is_empty() && std::time::Instant::now() < deadline {
        match events_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => handle_worker_event(&paths, &mut state, &mut active, event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if !active.is_empty() {
        let message = format!(
            "shutdown timeout waiting for workers: {}",
            active.iter().cloned().collect::<Vec<_>>().join(",")
        );
        state.last_error = Some(message.clone());
        for worker_id in &active {
            if let Some(worker) = state.workers.get_mut(worker_id) {
                worker.state = WorkerState::Error;
                worker.last_error = Some("shutdown timeout".to_string());
            }
        }
        append_runtime_log(&paths, "warn", "supervisor.shutdown.timeout", &message);
    }

    for handle in handles {
        let _ = handle.join();
    }

    state.running = false;
    state.pid = None;
    state.stopped_at = Some(now_secs());
    save_supervisor_state(&paths, &state)?;

    clear_start_lock(&paths);
    let _ = fs::remove_file(paths.stop_signal_path());
    append_runtime_log(
        &paths,
        "info",
        "supervisor.stopped",
        "runtime stopped cleanly",
    );
    Ok(())
}

fn shutdown_wait_timeout() -> Duration {
    let seconds = std::env::var("CHATCLAW_SHUTDOWN_TIMEOUT_SECONDS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(5);
    Duration::from_secs(seconds)
}

fn handle_worker_event(
    paths: &StatePaths,
    state: &mut SupervisorState,
    active: &mut BTreeSet<String>,
    event: WorkerEvent,
) {
    if let Some(log) = apply_worker_event(&mut state.workers, active, event) {
        append_runtime_log(paths, log.level, log.event, &log.message);
    }
    let _ = save_supervisor_state(paths, state);
}

pub fn load_supervisor_state(paths: &StatePaths) -> Result<SupervisorState, RuntimeError> {
    let path = paths.supervisor_state_path();
    if !path.exists() {
        return Ok(SupervisorState::default());
    }
    let raw = fs::read_to_string(&path).map_err(|source| RuntimeError::ReadState {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| RuntimeError::ParseState {
        path: path.display().to_string(),
        source,
    })
}

pub fn save_supervisor_state(
    paths: &StatePaths,
    state: &SupervisorState,
) -> Result<(), RuntimeError> {
    let path = paths.supervisor_state_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RuntimeError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }
    let encoded = serde_json::to_vec_pretty(state).map_err(|source| RuntimeError::ParseState {
        path: path.display().to_string(),
        source,
    })?;
    atomic_write_file(&path, &encoded).map_err(|source| RuntimeError::WriteState {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn supervisor_state_round_trips() {
        let tmp = tempdir().expect("tempdir");
        let paths = StatePaths::new(tmp.path());
        assert_eq!(
            load_supervisor_state(&paths).expect("default"),
            SupervisorState::default()
        );

        let mut state = SupervisorState {
            running: true,
            pid: Some(1234),
            started_at: Some(100),
            ..SupervisorState::default()
        };
        state
            .workers
            .insert("router".to_string(), WorkerHealth::default());
        save_supervisor_state(&paths, &state).expect("save");
        assert_eq!(load_supervisor_state(&paths).expect("reload"), state);
    }
}
