//! Worker loops. Each long-running concern (inbound channel poll, message
//! router, IPC drain, task scheduler) runs on its own thread, reporting
//! lifecycle events to the supervisor over a channel. A cycle failure is a
//! non-fatal event; the loop sleeps and tries again.

use super::{append_runtime_log, now_secs, StatePaths};
use crate::channel::TelegramClient;
use crate::config::Settings;
use crate::ipc::{self, IpcContext};
use crate::registry::GroupRegistry;
use crate::router;
use crate::scheduler;
use crate::shared::time::now_millis;
use crate::store::MessageStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started {
        worker_id: String,
        at: i64,
    },
    Heartbeat {
        worker_id: String,
        at: i64,
    },
    Error {
        worker_id: String,
        at: i64,
        message: String,
        fatal: bool,
    },
    Stopped {
        worker_id: String,
        at: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Inbound,
    Router,
    Ipc,
    Scheduler,
}

#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub id: String,
    pub kind: WorkerKind,
    pub interval: Duration,
}

pub fn build_worker_specs(settings: &Settings) -> Vec<WorkerSpec> {
    vec![
        WorkerSpec {
            id: "inbound".to_string(),
            kind: WorkerKind::Inbound,
            // The Telegram long poll blocks server-side; a short gap between
            // calls is enough.
            interval: Duration::from_millis(500),
        },
        WorkerSpec {
            id: "router".to_string(),
            kind: WorkerKind::Router,
            interval: Duration::from_millis(settings.message_poll_interval_ms),
        },
        WorkerSpec {
            id: "ipc".to_string(),
            kind: WorkerKind::Ipc,
            interval: Duration::from_millis(settings.ipc_poll_interval_ms),
        },
        WorkerSpec {
            id: "scheduler".to_string(),
            kind: WorkerKind::Scheduler,
            interval: Duration::from_millis(settings.scheduler_poll_interval_ms),
        },
    ]
}

/// Shared collaborators handed to every worker thread. The registry is the
/// mutual-exclusion point for tenant state; the store serializes through
/// sqlite itself.
#[derive(Clone)]
pub struct WorkerContext {
    pub paths: StatePaths,
    pub settings: Settings,
    pub store: Arc<MessageStore>,
    pub registry: Arc<GroupRegistry>,
    pub telegram: Arc<TelegramClient>,
    pub stop: Arc<AtomicBool>,
    pub events: Sender<WorkerEvent>,
}

/// Sleep in small slices so a stop request interrupts promptly. Returns
/// false when stopping.
pub(crate) fn sleep_with_stop(stop: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::from_millis(0) {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(Duration::from_millis(200));
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !stop.load(Ordering::Relaxed)
}

pub fn run_worker(spec: WorkerSpec, ctx: WorkerContext) {
    let _ = ctx.events.send(WorkerEvent::Started {
        worker_id: spec.id.clone(),
        at: now_secs(),
    });

    while !ctx.stop.load(Ordering::Relaxed) {
        match run_cycle(&spec, &ctx) {
            Ok(summary) => {
                if let Some(summary) = summary {
                    append_runtime_log(&ctx.paths, "info", "worker.cycle", &summary);
                }
                let _ = ctx.events.send(WorkerEvent::Heartbeat {
                    worker_id: spec.id.clone(),
                    at: now_secs(),
                });
            }
            Err(message) => {
                let _ = ctx.events.send(WorkerEvent::Error {
                    worker_id: spec.id.clone(),
                    at: now_secs(),
                    message,
                    fatal: false,
                });
            }
        }
        if !sleep_with_stop(&ctx.stop, spec.interval) {
            break;
        }
    }

    let _ = ctx.events.send(WorkerEvent::Stopped {
        worker_id: spec.id,
        at: now_secs(),
    });
}

/// One poll cycle for this worker's concern. `Ok(Some(..))` carries a
/// summary worth logging; quiet cycles return `Ok(None)`.
fn run_cycle(spec: &WorkerSpec, ctx: &WorkerContext) -> Result<Option<String>, String> {
    match spec.kind {
        WorkerKind::Inbound => {
            let report = ctx
                .telegram
                .run_inbound_cycle(&ctx.settings, &ctx.paths, &ctx.store, &ctx.registry)
                .map_err(|err| err.to_string())?;
            Ok((report.stored > 0)
                .then(|| format!("stored={} auto_registered={}", report.stored, report.auto_registered)))
        }
        WorkerKind::Router => {
            let report = router::run_router_cycle(
                &ctx.settings,
                &ctx.paths,
                &ctx.store,
                &ctx.registry,
                ctx.telegram.as_ref(),
            )?;
            Ok((report.advanced > 0)
                .then(|| format!("advanced={} dispatched={}", report.advanced, report.dispatched)))
        }
        WorkerKind::Ipc => {
            let report = ipc::run_ipc_cycle(&IpcContext {
                settings: &ctx.settings,
                paths: &ctx.paths,
                store: &ctx.store,
                registry: &ctx.registry,
                gateway: ctx.telegram.as_ref(),
            })
            .map_err(|err| err.to_string())?;
            Ok((report.processed > 0 || report.quarantined > 0).then(|| {
                format!(
                    "processed={} quarantined={}",
                    report.processed, report.quarantined
                )
            }))
        }
        WorkerKind::Scheduler => {
            let dispatched = scheduler::run_due_tasks(
                &ctx.settings,
                &ctx.paths,
                &ctx.store,
                &ctx.registry,
                ctx.telegram.as_ref(),
                now_millis(),
            )?;
            Ok((dispatched > 0).then(|| format!("dispatched={dispatched}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    #[test]
    fn specs_follow_configured_intervals() {
        let mut settings = Settings::default();
        settings.message_poll_interval_ms = 1_500;
        settings.ipc_poll_interval_ms = 750;
        let specs = build_worker_specs(&settings);
        assert_eq!(specs.len(), 4);
        let router = specs.iter().find(|s| s.id == "router").expect("router");
        assert_eq!(router.interval, Duration::from_millis(1_500));
        let ipc = specs.iter().find(|s| s.id == "ipc").expect("ipc");
        assert_eq!(ipc.interval, Duration::from_millis(750));
    }

    #[test]
    fn sleep_with_stop_returns_early_when_stopped() {
        let stop = AtomicBool::new(true);
        let start = Instant::now();
        assert!(!sleep_with_stop(&stop, Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
