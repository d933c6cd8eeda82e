//! Scheduled-task engine: next-run computation for the three schedule kinds
//! and the dispatch tick that runs due tasks through the container bridge.

pub mod cron;

use crate::channel::ChannelGateway;
use crate::config::Settings;
use crate::container;
use crate::registry::GroupRegistry;
use crate::runtime::{append_runtime_log, StatePaths};
use crate::shared::time::parse_rfc3339_millis;
use crate::store::{ContextMode, MessageStore, Task, TaskStatus};
use chrono_tz::Tz;

pub const SCHEDULE_CRON: &str = "cron";
pub const SCHEDULE_INTERVAL: &str = "interval";
pub const SCHEDULE_ONCE: &str = "once";

/// Validate a schedule and compute its first due instant. `once` values may
/// be RFC 3339 or raw unix milliseconds; `interval` values are milliseconds.
pub fn compute_initial_next_run(
    schedule_type: &str,
    schedule_value: &str,
    timezone: &Tz,
    now_ms: i64,
) -> Result<i64, String> {
    match schedule_type {
        SCHEDULE_CRON => {
            let expr = cron::parse_cron_expression(schedule_value)?;
            cron::next_cron_occurrence(&expr, now_ms, timezone)
        }
        SCHEDULE_INTERVAL => Ok(now_ms.saturating_add(parse_interval_ms(schedule_value)?)),
        SCHEDULE_ONCE => parse_once_instant(schedule_value),
        other => Err(format!("unknown schedule type `{other}`")),
    }
}

/// Re-arm a task after it fired. `None` means the task is finished and
/// should be deleted.
pub fn compute_followup_next_run(
    task: &Task,
    timezone: &Tz,
    now_ms: i64,
) -> Result<Option<i64>, String> {
    match task.schedule_type.as_str() {
        SCHEDULE_ONCE => Ok(None),
        SCHEDULE_INTERVAL => Ok(Some(
            now_ms.saturating_add(parse_interval_ms(&task.schedule_value)?),
        )),
        SCHEDULE_CRON => {
            let expr = cron::parse_cron_expression(&task.schedule_value)?;
            cron::next_cron_occurrence(&expr, now_ms, timezone).map(Some)
        }
        other => Err(format!("unknown schedule type `{other}`")),
    }
}

fn parse_interval_ms(raw: &str) -> Result<i64, String> {
    let ms = raw
        .trim()
        .parse::<i64>()
        .map_err(|_| format!("invalid interval `{raw}`; expected milliseconds"))?;
    if ms <= 0 {
        return Err(format!("invalid interval `{raw}`; must be positive"));
    }
    Ok(ms)
}

fn parse_once_instant(raw: &str) -> Result<i64, String> {
    if let Ok(ms) = raw.trim().parse::<i64>() {
        return Ok(ms);
    }
    parse_rfc3339_millis(raw)
        .map_err(|_| format!("invalid timestamp `{raw}`; expected RFC 3339 or unix milliseconds"))
}

/// One dispatch cycle: run every due active task and re-arm or delete it.
/// Per-task failures are logged and never abort the cycle; a task whose
/// folder is busy simply stays due until the next tick.
pub fn run_due_tasks(
    settings: &Settings,
    paths: &StatePaths,
    store: &MessageStore,
    registry: &GroupRegistry,
    gateway: &dyn ChannelGateway,
    now_ms: i64,
) -> Result<usize, String> {
    let due = store
        .due_tasks(now_ms)
        .map_err(|err| format!("failed to load due tasks: {err}"))?;

    let mut dispatched = 0;
    for task in due {
        let folder = task.group_folder.as_str();
        if !registry.is_folder_registered(folder) {
            append_runtime_log(
                paths,
                "warn",
                "task_orphaned",
                &format!("pausing task {}; folder `{folder}` is not registered", task.id),
            );
            let _ = store.update_task_status(&task.id, TaskStatus::Paused);
            continue;
        }
        if !registry.try_begin_invocation(folder) {
            continue;
        }
        let outcome = run_single_task(settings, paths, store, registry, gateway, &task, now_ms);
        registry.end_invocation(folder);
        match outcome {
            Ok(()) => dispatched += 1,
            Err(err) => append_runtime_log(
                paths,
                "error",
                "task_failed",
                &format!("task {}: {err}", task.id),
            ),
        }
    }
    Ok(dispatched)
}

fn run_single_task(
    settings: &Settings,
    paths: &StatePaths,
    store: &MessageStore,
    registry: &GroupRegistry,
    gateway: &dyn ChannelGateway,
    task: &Task,
    now_ms: i64,
) -> Result<(), String> {
    let reuse_session = task.context_mode == ContextMode::Group;
    let turn = container::run_agent_turn(
        settings,
        paths,
        store,
        registry,
        &task.group_folder,
        &task.prompt,
        reuse_session,
    )
    .map_err(|err| format!("agent invocation failed: {err}"))?;

    if let Some(reply) = turn.reply.as_deref() {
        let text = format!("{}: {}", settings.assistant_name, reply);
        if let Err(err) = gateway.send_text(&task.chat_jid, &text) {
            append_runtime_log(
                paths,
                "warn",
                "task_delivery_failed",
                &format!("task {} to {}: {err}", task.id, task.chat_jid),
            );
        }
    }

    reschedule(settings, store, task, now_ms)
}

fn reschedule(
    settings: &Settings,
    store: &MessageStore,
    task: &Task,
    now_ms: i64,
) -> Result<(), String> {
    let timezone = settings.cron_timezone().map_err(|err| err.to_string())?;
    match compute_followup_next_run(task, &timezone, now_ms)? {
        Some(next_run) => store
            .set_task_next_run(&task.id, next_run)
            .map(|_| ())
            .map_err(|err| format!("failed to re-arm task {}: {err}", task.id)),
        None => store
            .delete_task(&task.id)
            .map(|_| ())
            .map_err(|err| format!("failed to delete finished task {}: {err}", task.id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ids::GroupFolder;

    fn utc() -> Tz {
        "UTC".parse().expect("tz")
    }

    fn task_with(schedule_type: &str, schedule_value: &str) -> Task {
        Task {
            id: "task-1".to_string(),
            group_folder: GroupFolder::parse("acme").expect("folder"),
            chat_jid: "telegram:1".to_string(),
            prompt: "status report".to_string(),
            schedule_type: schedule_type.to_string(),
            schedule_value: schedule_value.to_string(),
            context_mode: ContextMode::Isolated,
            next_run: 0,
            status: TaskStatus::Active,
            created_at: 0,
        }
    }

    #[test]
    fn initial_interval_is_relative_to_now() {
        let next = compute_initial_next_run(SCHEDULE_INTERVAL, "60000", &utc(), 1_000)
            .expect("next run");
        assert_eq!(next, 61_000);
    }

    #[test]
    fn initial_cron_lands_on_the_next_top_of_hour() {
        // 2025-06-01T12:34:56Z -> 2025-06-01T13:00:00Z
        let next = compute_initial_next_run(SCHEDULE_CRON, "0 * * * *", &utc(), 1_748_781_296_000)
            .expect("next run");
        assert_eq!(next, 1_748_782_800_000);
    }

    #[test]
    fn once_accepts_rfc3339_and_raw_millis() {
        let from_text =
            compute_initial_next_run(SCHEDULE_ONCE, "2025-06-01T12:00:00+02:00", &utc(), 0)
                .expect("rfc3339");
        assert_eq!(from_text, 1_748_772_000_000);
        let from_millis =
            compute_initial_next_run(SCHEDULE_ONCE, "1748772000000", &utc(), 0).expect("millis");
        assert_eq!(from_millis, 1_748_772_000_000);
    }

    #[test]
    fn invalid_schedules_are_rejected() {
        assert!(compute_initial_next_run(SCHEDULE_INTERVAL, "-5", &utc(), 0).is_err());
        assert!(compute_initial_next_run(SCHEDULE_INTERVAL, "soon", &utc(), 0).is_err());
        assert!(compute_initial_next_run(SCHEDULE_CRON, "* * *", &utc(), 0).is_err());
        assert!(compute_initial_next_run(SCHEDULE_ONCE, "tomorrow", &utc(), 0).is_err());
        assert!(compute_initial_next_run("weekly", "1", &utc(), 0).is_err());
    }

    #[test]
    fn followup_deletes_once_and_rearms_interval() {
        let once = task_with(SCHEDULE_ONCE, "1748772000000");
        assert_eq!(
            compute_followup_next_run(&once, &utc(), 5_000).expect("once"),
            None
        );

        let interval = task_with(SCHEDULE_INTERVAL, "30000");
        assert_eq!(
            compute_followup_next_run(&interval, &utc(), 5_000).expect("interval"),
            Some(35_000)
        );
    }
}
