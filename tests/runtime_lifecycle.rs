//! Supervisor lifecycle: foreground run, stop-file shutdown and the
//! persisted runtime state left behind.

use chatclaw::channel::TelegramClient;
use chatclaw::config::Settings;
use chatclaw::runtime::{
    bootstrap_state_root, load_supervisor_state, run_supervisor, signal_stop,
    supervisor_ownership_state, OwnershipState, StatePaths,
};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    // Point every poller at an unreachable endpoint so cycles fail fast
    // instead of talking to the network.
    settings.telegram.api_base = "http://127.0.0.1:1".to_string();
    settings.telegram.poll_timeout_seconds = 1;
    settings.message_poll_interval_ms = 100;
    settings.ipc_poll_interval_ms = 100;
    settings.scheduler_poll_interval_ms = 100;
    settings
}

#[test]
fn supervisor_runs_until_stopped_and_persists_final_state() {
    std::env::set_var("TELEGRAM_BOT_TOKEN", "test-token");
    let tmp = TempDir::new().expect("tempdir");
    let paths = StatePaths::new(tmp.path());
    bootstrap_state_root(&paths).expect("bootstrap");

    let settings = test_settings();
    let telegram = TelegramClient::from_env(&settings).expect("client");
    let root = tmp.path().to_path_buf();
    let handle = thread::spawn(move || run_supervisor(&root, settings, telegram));

    // Wait for the runtime to report itself running.
    let mut running = false;
    for _ in 0..50 {
        if load_supervisor_state(&paths).expect("state").running {
            running = true;
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }
    assert!(running, "supervisor never reported running");

    signal_stop(&paths).expect("signal stop");
    handle
        .join()
        .expect("join supervisor thread")
        .expect("supervisor exits cleanly");

    let state = load_supervisor_state(&paths).expect("final state");
    assert!(!state.running);
    assert_eq!(state.pid, None);
    assert!(state.stopped_at.is_some());
    for id in ["inbound", "router", "ipc", "scheduler"] {
        assert!(state.workers.contains_key(id), "missing worker {id}");
    }

    // Stop file and lock are cleared; a fresh start would be allowed.
    assert!(!paths.stop_signal_path().exists());
    assert!(!paths.supervisor_lock_path().exists());
    assert_eq!(
        supervisor_ownership_state(&paths).expect("ownership"),
        OwnershipState::NotRunning
    );
}
