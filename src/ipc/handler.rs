//! Executes one parsed IPC request. Authorization trusts the directory the
//! file arrived in, never the payload: `source_group` comes from the path,
//! and main may act on any tenant while everyone else may only act on
//! themselves. Unauthorized and invalid requests are logged and dropped;
//! only processing failures bubble up (and quarantine the file).

use super::IpcError;
use crate::channel::{ChannelGateway, MediaKind};
use crate::config::Settings;
use crate::container::write_context_snapshots;
use crate::ipc::request::IpcRequest;
use crate::registry::{GroupRegistry, RegisteredGroup};
use crate::runtime::{append_runtime_log, StatePaths};
use crate::sandbox::translate_container_path;
use crate::scheduler::compute_initial_next_run;
use crate::shared::ids::{generate_task_id, GroupFolder};
use crate::shared::time::now_millis;
use crate::store::{ContextMode, MessageStore, Task, TaskStatus};

pub struct IpcContext<'a> {
    pub settings: &'a Settings,
    pub paths: &'a StatePaths,
    pub store: &'a MessageStore,
    pub registry: &'a GroupRegistry,
    pub gateway: &'a dyn ChannelGateway,
}

impl IpcContext<'_> {
    fn drop_request(&self, event: &str, detail: &str) {
        append_runtime_log(self.paths, "warn", event, detail);
    }
}

pub fn handle_request(
    ctx: &IpcContext<'_>,
    request: IpcRequest,
    source_group: &str,
    is_main: bool,
) -> Result<(), IpcError> {
    match request {
        IpcRequest::Message { chat_jid, text } => {
            if !authorized_for_chat(ctx, &chat_jid, source_group, is_main) {
                ctx.drop_request(
                    "ipc_unauthorized",
                    &format!("message from `{source_group}` to {chat_jid} blocked"),
                );
                return Ok(());
            }
            let text = format!("{}: {}", ctx.settings.assistant_name, text);
            ctx.gateway
                .send_text(&chat_jid, &text)
                .map_err(IpcError::Delivery)?;
            Ok(())
        }
        IpcRequest::Media {
            chat_jid,
            file_path,
            media_type,
            caption,
            group_folder,
        } => {
            if !authorized_for_chat(ctx, &chat_jid, source_group, is_main) {
                ctx.drop_request(
                    "ipc_unauthorized",
                    &format!("media from `{source_group}` to {chat_jid} blocked"),
                );
                return Ok(());
            }
            // The declared folder selects which sandbox the path is relative
            // to. Same rule as everywhere else: only main may name a folder
            // other than its own. The value is validated during translation.
            let path_folder = group_folder.as_deref().unwrap_or(source_group);
            if !is_main && path_folder != source_group {
                ctx.drop_request(
                    "ipc_unauthorized",
                    &format!(
                        "media path in sandbox `{path_folder}` from `{source_group}` blocked"
                    ),
                );
                return Ok(());
            }
            let project_root = ctx.settings.resolve_project_root();
            let host_path = translate_container_path(
                &file_path,
                path_folder,
                ctx.paths,
                Some(project_root.as_path()),
            )?;
            ctx.gateway
                .send_media(
                    &chat_jid,
                    &host_path,
                    MediaKind::from_declared(&media_type),
                    caption.as_deref(),
                )
                .map_err(IpcError::Delivery)?;
            Ok(())
        }
        IpcRequest::ScheduleTask {
            prompt,
            schedule_type,
            schedule_value,
            context_mode,
            group_folder,
        } => handle_schedule_task(
            ctx,
            source_group,
            is_main,
            prompt,
            schedule_type,
            schedule_value,
            context_mode,
            group_folder,
        ),
        IpcRequest::PauseTask { task_id } => {
            mutate_task(ctx, source_group, is_main, &task_id, TaskMutation::Pause)
        }
        IpcRequest::ResumeTask { task_id } => {
            mutate_task(ctx, source_group, is_main, &task_id, TaskMutation::Resume)
        }
        IpcRequest::CancelTask { task_id } => {
            mutate_task(ctx, source_group, is_main, &task_id, TaskMutation::Cancel)
        }
        IpcRequest::RefreshGroups => {
            if !is_main {
                ctx.drop_request(
                    "ipc_unauthorized",
                    &format!("refresh_groups from `{source_group}` blocked"),
                );
                return Ok(());
            }
            write_context_snapshots(ctx.paths, ctx.store, ctx.registry, &GroupFolder::main())
                .map_err(|err| IpcError::Processing(err.to_string()))
        }
        IpcRequest::RegisterGroup {
            jid,
            name,
            folder,
            trigger,
            container_config,
        } => {
            if !is_main {
                ctx.drop_request(
                    "ipc_unauthorized",
                    &format!("register_group from `{source_group}` blocked"),
                );
                return Ok(());
            }
            if jid.trim().is_empty() || name.trim().is_empty() || trigger.trim().is_empty() {
                ctx.drop_request("ipc_invalid", "register_group with empty required field");
                return Ok(());
            }
            let folder = match GroupFolder::parse(&folder) {
                Ok(folder) => folder,
                Err(err) => {
                    ctx.drop_request("ipc_invalid", &format!("register_group rejected: {err}"));
                    return Ok(());
                }
            };
            let registration = RegisteredGroup {
                name,
                folder,
                trigger,
                added_at: now_millis(),
                container_config,
            };
            match ctx.registry.register_group(&jid, registration) {
                Ok(()) => {
                    append_runtime_log(
                        ctx.paths,
                        "info",
                        "group_registered",
                        &format!("registered {jid} via main"),
                    );
                    Ok(())
                }
                Err(crate::registry::RegistryError::Rejected(reason)) => {
                    ctx.drop_request("ipc_invalid", &format!("register_group rejected: {reason}"));
                    Ok(())
                }
                Err(err) => Err(IpcError::Processing(err.to_string())),
            }
        }
        IpcRequest::Unrecognized => {
            ctx.drop_request(
                "ipc_unrecognized",
                &format!("unrecognized request tag from `{source_group}`"),
            );
            Ok(())
        }
    }
}

/// A chat target is in bounds when the requester is main or owns the chat's
/// registered folder. Unregistered chats are never in bounds.
fn authorized_for_chat(
    ctx: &IpcContext<'_>,
    chat_jid: &str,
    source_group: &str,
    is_main: bool,
) -> bool {
    if is_main {
        return true;
    }
    ctx.registry
        .group_for_jid(chat_jid)
        .is_some_and(|group| group.folder.as_str() == source_group)
}

#[allow(clippy::too_many_arguments)]
fn handle_schedule_task(
    ctx: &IpcContext<'_>,
    source_group: &str,
    is_main: bool,
    prompt: String,
    schedule_type: String,
    schedule_value: String,
    context_mode: Option<String>,
    target_folder: String,
) -> Result<(), IpcError> {
    if !is_main && target_folder != source_group {
        ctx.drop_request(
            "ipc_unauthorized",
            &format!("schedule_task from `{source_group}` for `{target_folder}` blocked"),
        );
        return Ok(());
    }
    // The chat a task reports to is derived from the registration table, not
    // from anything the payload claims.
    let Some(target_jid) = ctx.registry.jid_for_folder(&target_folder) else {
        ctx.drop_request(
            "ipc_invalid",
            &format!("schedule_task for unregistered folder `{target_folder}`"),
        );
        return Ok(());
    };
    let group_folder = match GroupFolder::parse(&target_folder) {
        Ok(folder) => folder,
        Err(err) => {
            ctx.drop_request("ipc_invalid", &format!("schedule_task rejected: {err}"));
            return Ok(());
        }
    };
    if prompt.trim().is_empty() {
        ctx.drop_request("ipc_invalid", "schedule_task with empty prompt");
        return Ok(());
    }

    let timezone = ctx
        .settings
        .cron_timezone()
        .map_err(|err| IpcError::Processing(err.to_string()))?;
    let now = now_millis();
    let next_run = match compute_initial_next_run(&schedule_type, &schedule_value, &timezone, now) {
        Ok(next_run) => next_run,
        Err(err) => {
            ctx.drop_request("ipc_invalid", &format!("schedule_task rejected: {err}"));
            return Ok(());
        }
    };

    let id = generate_task_id(now).map_err(IpcError::Processing)?;
    let task = Task {
        id,
        group_folder,
        chat_jid: target_jid,
        prompt,
        schedule_type,
        schedule_value,
        context_mode: context_mode
            .as_deref()
            .map(ContextMode::from_declared)
            .unwrap_or_default(),
        next_run,
        status: TaskStatus::Active,
        created_at: now,
    };
    ctx.store
        .create_task(&task)
        .map_err(|err| IpcError::Processing(err.to_string()))?;
    append_runtime_log(
        ctx.paths,
        "info",
        "task_created",
        &format!("task {} scheduled for `{}`", task.id, task.group_folder),
    );
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum TaskMutation {
    Pause,
    Resume,
    Cancel,
}

fn mutate_task(
    ctx: &IpcContext<'_>,
    source_group: &str,
    is_main: bool,
    task_id: &str,
    mutation: TaskMutation,
) -> Result<(), IpcError> {
    let task = ctx
        .store
        .task_by_id(task_id)
        .map_err(|err| IpcError::Processing(err.to_string()))?;
    let authorized = task
        .as_ref()
        .map(|task| is_main || task.group_folder.as_str() == source_group);
    match authorized {
        Some(true) => {}
        Some(false) => {
            ctx.drop_request(
                "ipc_unauthorized",
                &format!("task mutation on {task_id} from `{source_group}` blocked"),
            );
            return Ok(());
        }
        None => {
            ctx.drop_request("ipc_invalid", &format!("task {task_id} not found"));
            return Ok(());
        }
    }

    let result = match mutation {
        TaskMutation::Pause => ctx.store.update_task_status(task_id, TaskStatus::Paused),
        TaskMutation::Resume => ctx.store.update_task_status(task_id, TaskStatus::Active),
        TaskMutation::Cancel => ctx.store.delete_task(task_id),
    };
    result.map_err(|err| IpcError::Processing(err.to_string()))?;
    Ok(())
}
