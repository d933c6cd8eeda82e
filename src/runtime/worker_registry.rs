use super::worker::WorkerEvent;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Stopped,
    Running,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WorkerHealth {
    pub state: WorkerState,
    pub last_heartbeat: Option<i64>,
    pub last_error: Option<String>,
}

pub(crate) struct WorkerLogLine {
    pub level: &'static str,
    pub event: &'static str,
    pub message: String,
}

/// Fold one worker event into the health table, returning a log line when
/// the event is worth recording.
pub(crate) fn apply_worker_event(
    workers: &mut BTreeMap<String, WorkerHealth>,
    active: &mut BTreeSet<String>,
    event: WorkerEvent,
) -> Option<WorkerLogLine> {
    match event {
        WorkerEvent::Started { worker_id, at } => {
            let entry = workers.entry(worker_id.clone()).or_default();
            entry.state = WorkerState::Running;
            entry.last_heartbeat = Some(at);
            Some(WorkerLogLine {
                level: "info",
                event: "worker.started",
                message: worker_id,
            })
        }
        WorkerEvent::Heartbeat { worker_id, at } => {
            let entry = workers.entry(worker_id).or_default();
            if entry.state != WorkerState::Error {
                entry.state = WorkerState::Running;
            }
            entry.last_heartbeat = Some(at);
            None
        }
        WorkerEvent::Error {
            worker_id,
            at,
            message,
            fatal,
        } => {
            let entry = workers.entry(worker_id.clone()).or_default();
            entry.state = WorkerState::Error;
            entry.last_heartbeat = Some(at);
            entry.last_error = Some(message.clone());
            Some(WorkerLogLine {
                level: if fatal { "error" } else { "warn" },
                event: "worker.error",
                message: format!("{worker_id}: {message}"),
            })
        }
        WorkerEvent::Stopped { worker_id, at } => {
            let entry = workers.entry(worker_id.clone()).or_default();
            if entry.state != WorkerState::Error {
                entry.state = WorkerState::Stopped;
            }
            entry.last_heartbeat = Some(at);
            active.remove(&worker_id);
            Some(WorkerLogLine {
                level: "info",
                event: "worker.stopped",
                message: worker_id,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_after_error_keeps_the_error_state() {
        let mut workers = BTreeMap::new();
        let mut active: BTreeSet<String> = ["router".to_string()].into_iter().collect();

        apply_worker_event(
            &mut workers,
            &mut active,
            WorkerEvent::Error {
                worker_id: "router".to_string(),
                at: 10,
                message: "poll failed".to_string(),
                fatal: false,
            },
        );
        apply_worker_event(
            &mut workers,
            &mut active,
            WorkerEvent::Stopped {
                worker_id: "router".to_string(),
                at: 11,
            },
        );

        let health = workers.get("router").expect("health");
        assert_eq!(health.state, WorkerState::Error);
        assert_eq!(health.last_error.as_deref(), Some("poll failed"));
        assert!(active.is_empty());
    }

    #[test]
    fn heartbeat_refreshes_without_clearing_errors() {
        let mut workers = BTreeMap::new();
        let mut active = BTreeSet::new();

        apply_worker_event(
            &mut workers,
            &mut active,
            WorkerEvent::Started {
                worker_id: "ipc".to_string(),
                at: 1,
            },
        );
        let logged = apply_worker_event(
            &mut workers,
            &mut active,
            WorkerEvent::Heartbeat {
                worker_id: "ipc".to_string(),
                at: 2,
            },
        );
        assert!(logged.is_none());
        let health = workers.get("ipc").expect("health");
        assert_eq!(health.state, WorkerState::Running);
        assert_eq!(health.last_heartbeat, Some(2));
    }
}
