pub mod logging;
pub mod ownership_lock;
pub mod state_paths;
pub mod supervisor;
pub mod worker;
pub mod worker_registry;

pub(crate) use crate::shared::fs_atomic::atomic_write_file;
pub(crate) use crate::shared::time::now_secs;
pub use logging::append_runtime_log;
pub use ownership_lock::{
    cleanup_stale_supervisor, clear_start_lock, is_process_alive, reserve_start_lock, signal_stop,
    stop_active_supervisor, supervisor_ownership_state, OwnershipState, StopResult,
};
pub use state_paths::{bootstrap_state_root, StatePaths};
pub use supervisor::{
    load_supervisor_state, run_supervisor, save_supervisor_state, SupervisorState,
};
pub use worker::{build_worker_specs, WorkerEvent, WorkerSpec};
pub use worker_registry::{WorkerHealth, WorkerState};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to create runtime path {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read runtime state {path}: {source}")]
    ReadState {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse runtime state {path}: {source}")]
    ParseState {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write runtime state {path}: {source}")]
    WriteState {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("supervisor is already running with pid {pid}")]
    AlreadyRunning { pid: u32 },
    #[error("no running supervisor instance")]
    NotRunning,
    #[error("failed to read lock file {path}: {source}")]
    ReadLock {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write lock file {path}: {source}")]
    WriteLock {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to stop supervisor process {pid}; process is still alive")]
    StopFailedAlive { pid: u32 },
    #[error("failed to initialize runtime: {0}")]
    Init(String),
}
