//! End-to-end router cycles against a stub agent binary and a recording
//! channel gateway.

use chatclaw::channel::{ChannelError, ChannelGateway, MediaKind};
use chatclaw::config::Settings;
use chatclaw::registry::{GroupRegistry, RegisteredGroup};
use chatclaw::router::run_router_cycle;
use chatclaw::runtime::{bootstrap_state_root, StatePaths};
use chatclaw::shared::ids::GroupFolder;
use chatclaw::store::{MessageRecord, MessageStore};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

struct RecordingGateway {
    sent: Mutex<Vec<(String, String)>>,
    fail_sends: bool,
}

impl RecordingGateway {
    fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_sends: false,
        }
    }

    fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_sends: true,
        }
    }

    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

impl ChannelGateway for RecordingGateway {
    fn send_text(&self, chat_jid: &str, text: &str) -> Result<(), ChannelError> {
        if self.fail_sends {
            return Err(ChannelError::ApiResponse("simulated outage".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((chat_jid.to_string(), text.to_string()));
        Ok(())
    }

    fn send_media(
        &self,
        _chat_jid: &str,
        _file_path: &Path,
        _kind: MediaKind,
        _caption: Option<&str>,
    ) -> Result<(), ChannelError> {
        Ok(())
    }

    fn send_typing(&self, _chat_jid: &str) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Stand-in for the container runtime: swallows stdin, ignores the run
/// arguments and prints a fixed terminal document.
fn write_stub_agent(dir: &Path, terminal_json: &str) -> PathBuf {
    let path = dir.join("agent-stub.sh");
    fs::write(
        &path,
        format!("#!/bin/sh\ncat > /dev/null\necho '{terminal_json}'\n"),
    )
    .expect("write stub agent");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path).expect("stat stub").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod stub");
    }
    path
}

struct Harness {
    _tmp: TempDir,
    paths: StatePaths,
    settings: Settings,
    store: MessageStore,
    registry: GroupRegistry,
}

fn harness(terminal_json: &str) -> Harness {
    let tmp = TempDir::new().expect("tempdir");
    let paths = StatePaths::new(tmp.path());
    bootstrap_state_root(&paths).expect("bootstrap");

    let stub = write_stub_agent(tmp.path(), terminal_json);
    let mut settings = Settings::default();
    settings.container.binary = stub.display().to_string();
    settings.project_root = Some(tmp.path().to_path_buf());

    let store = MessageStore::open(&paths.store_db_path()).expect("open store");
    let registry = GroupRegistry::open(paths.clone()).expect("open registry");
    Harness {
        _tmp: tmp,
        paths,
        settings,
        store,
        registry,
    }
}

fn register(harness: &Harness, jid: &str, folder: &str, trigger: &str) {
    let folder = if folder == "main" {
        GroupFolder::main()
    } else {
        GroupFolder::parse(folder).expect("folder")
    };
    harness
        .registry
        .register_group(
            jid,
            RegisteredGroup {
                name: format!("group {jid}"),
                folder,
                trigger: trigger.to_string(),
                added_at: 0,
                container_config: None,
            },
        )
        .expect("register group");
}

fn inbound(harness: &Harness, jid: &str, id: &str, content: &str, timestamp: i64) {
    harness
        .store
        .store_chat_metadata(jid, "chat", timestamp)
        .expect("chat metadata");
    harness
        .store
        .store_message(&MessageRecord {
            id: id.to_string(),
            chat_jid: jid.to_string(),
            sender_id: "telegram:9".to_string(),
            sender_name: "Dana".to_string(),
            content: content.to_string(),
            timestamp,
            from_me: false,
        })
        .expect("store message");
}

#[cfg(unix)]
#[test]
fn main_group_reply_is_delivered_and_cursors_advance() {
    let h = harness(r#"{"status":"success","result":"hi there","new_session_id":"sess-1"}"#);
    register(&h, "telegram:1", "main", "Claw");
    inbound(&h, "telegram:1", "m1", "what is up", 1_000);

    let gateway = RecordingGateway::new();
    let report =
        run_router_cycle(&h.settings, &h.paths, &h.store, &h.registry, &gateway).expect("cycle");

    assert_eq!(report.advanced, 1);
    assert_eq!(report.dispatched, 1);
    assert_eq!(
        gateway.sent(),
        vec![("telegram:1".to_string(), "Claw: hi there".to_string())]
    );
    assert_eq!(h.registry.router_cursor(), 1_000);
    assert_eq!(h.registry.agent_cursor("telegram:1"), 1_000);
    assert_eq!(h.registry.session_for("main").as_deref(), Some("sess-1"));
}

#[cfg(unix)]
#[test]
fn untriggered_message_is_consumed_without_dispatch() {
    let h = harness(r#"{"status":"success","result":"should never run"}"#);
    register(&h, "telegram:2", "acme", "claw");
    inbound(&h, "telegram:2", "m1", "just chatting among ourselves", 2_000);

    let gateway = RecordingGateway::new();
    let report =
        run_router_cycle(&h.settings, &h.paths, &h.store, &h.registry, &gateway).expect("cycle");

    assert_eq!(report.advanced, 1);
    assert_eq!(report.dispatched, 0);
    assert!(gateway.sent().is_empty());
    assert_eq!(h.registry.router_cursor(), 2_000);
    // The backlog stays pending for a later triggered message.
    assert_eq!(h.registry.agent_cursor("telegram:2"), 0);
}

#[cfg(unix)]
#[test]
fn triggered_message_feeds_the_whole_backlog() {
    let h = harness(r#"{"status":"success","result":"summarized"}"#);
    register(&h, "telegram:2", "acme", "claw");
    inbound(&h, "telegram:2", "m1", "context one", 1_000);
    inbound(&h, "telegram:2", "m2", "context two", 2_000);
    inbound(&h, "telegram:2", "m3", "claw summarize the above", 3_000);

    let gateway = RecordingGateway::new();
    let report =
        run_router_cycle(&h.settings, &h.paths, &h.store, &h.registry, &gateway).expect("cycle");

    assert_eq!(report.advanced, 3);
    assert_eq!(report.dispatched, 1);
    assert_eq!(gateway.sent().len(), 1);
    // Everything up to and including the triggering message is consumed.
    assert_eq!(h.registry.agent_cursor("telegram:2"), 3_000);
}

#[cfg(unix)]
#[test]
fn agent_error_stays_silent_but_consumes_the_message() {
    let h = harness(r#"{"status":"error","error":"tool crashed"}"#);
    register(&h, "telegram:1", "main", "Claw");
    inbound(&h, "telegram:1", "m1", "hello", 1_000);

    let gateway = RecordingGateway::new();
    let report =
        run_router_cycle(&h.settings, &h.paths, &h.store, &h.registry, &gateway).expect("cycle");

    assert_eq!(report.advanced, 1);
    assert_eq!(report.dispatched, 1);
    assert!(gateway.sent().is_empty());
    assert_eq!(h.registry.router_cursor(), 1_000);
    // No reply means the backlog is not marked consumed.
    assert_eq!(h.registry.agent_cursor("telegram:1"), 0);
}

#[cfg(unix)]
#[test]
fn failed_turn_keeps_the_last_good_session_handle() {
    let h = harness(r#"{"status":"error","new_session_id":"hijacked","error":"tool crashed"}"#);
    register(&h, "telegram:1", "main", "Claw");
    h.registry.set_session("main", "sess-good").expect("seed session");
    inbound(&h, "telegram:1", "m1", "hello", 1_000);

    let gateway = RecordingGateway::new();
    run_router_cycle(&h.settings, &h.paths, &h.store, &h.registry, &gateway).expect("cycle");

    assert_eq!(h.registry.session_for("main").as_deref(), Some("sess-good"));
}

#[cfg(unix)]
#[test]
fn failed_delivery_does_not_block_the_cursor() {
    let h = harness(r#"{"status":"success","result":"undeliverable"}"#);
    register(&h, "telegram:1", "main", "Claw");
    inbound(&h, "telegram:1", "m1", "hello", 1_000);

    let gateway = RecordingGateway::failing();
    let report =
        run_router_cycle(&h.settings, &h.paths, &h.store, &h.registry, &gateway).expect("cycle");

    assert_eq!(report.advanced, 1);
    assert_eq!(report.dispatched, 1);
    assert_eq!(h.registry.router_cursor(), 1_000);
    assert_eq!(h.registry.agent_cursor("telegram:1"), 1_000);
}

#[cfg(unix)]
#[test]
fn unregistered_chat_is_skipped_entirely() {
    let h = harness(r#"{"status":"success","result":"should never run"}"#);
    register(&h, "telegram:1", "main", "Claw");
    inbound(&h, "telegram:99", "m1", "hello strangers", 1_000);

    let gateway = RecordingGateway::new();
    let report =
        run_router_cycle(&h.settings, &h.paths, &h.store, &h.registry, &gateway).expect("cycle");

    // The chat is not registered, so its messages never enter the batch.
    assert_eq!(report.advanced, 0);
    assert_eq!(report.dispatched, 0);
    assert!(gateway.sent().is_empty());
}
