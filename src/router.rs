//! Message router: drains new inbound messages, applies per-group trigger
//! policy, renders the backlog transcript and drives the container bridge.
//! Cursor discipline gives at-least-once handling: the global cursor only
//! advances past a message once that message has been fully dealt with.

use crate::channel::ChannelGateway;
use crate::config::Settings;
use crate::container;
use crate::registry::{GroupRegistry, RegisteredGroup};
use crate::runtime::{append_runtime_log, StatePaths};
use crate::shared::time::format_rfc3339;
use crate::store::{MessageRecord, MessageStore};

/// Anchored, case-insensitive trigger match: the message must open with the
/// trigger token (an optional `@` allowed), followed by a non-word character
/// or end of input. "bot, hello" matches trigger `bot`; "hello" does not,
/// nor does "bots rule".
pub fn trigger_matches(trigger: &str, content: &str) -> bool {
    let trigger = trigger.trim();
    if trigger.is_empty() {
        return false;
    }
    let content = content.trim_start();
    let content = content.strip_prefix('@').unwrap_or(content);
    let mut content_chars = content.chars();
    for expected in trigger.chars() {
        match content_chars.next() {
            Some(actual) if actual.eq_ignore_ascii_case(&expected) => {}
            _ => return false,
        }
    }
    match content_chars.next() {
        None => true,
        Some(next) => !next.is_alphanumeric(),
    }
}

fn escape_xml(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render a backlog as the `<messages>` transcript the agent consumes.
pub fn render_transcript(messages: &[MessageRecord]) -> String {
    let lines: Vec<String> = messages
        .iter()
        .map(|message| {
            format!(
                "<message sender=\"{}\" time=\"{}\">{}</message>",
                escape_xml(&message.sender_name),
                format_rfc3339(message.timestamp),
                escape_xml(&message.content),
            )
        })
        .collect();
    format!("<messages>\n{}\n</messages>", lines.join("\n"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterReport {
    /// Messages the cursor moved past this cycle.
    pub advanced: usize,
    /// Agent turns actually dispatched.
    pub dispatched: usize,
}

/// One router cycle. Messages are handled oldest-first; on the first
/// failure the rest of the batch is left for the next cycle so the failed
/// message is retried rather than skipped.
pub fn run_router_cycle(
    settings: &Settings,
    paths: &StatePaths,
    store: &MessageStore,
    registry: &GroupRegistry,
    gateway: &dyn ChannelGateway,
) -> Result<RouterReport, String> {
    let jids = registry.registered_jids();
    let batch = store
        .new_messages_since(&jids, registry.router_cursor())
        .map_err(|err| format!("failed to poll new messages: {err}"))?;

    let mut report = RouterReport::default();
    for message in batch {
        match process_message(settings, paths, store, registry, gateway, &message) {
            Ok(dispatched) => {
                report.advanced += 1;
                report.dispatched += usize::from(dispatched);
                registry
                    .advance_router_cursor(message.timestamp)
                    .map_err(|err| format!("failed to persist router cursor: {err}"))?;
            }
            Err(err) => {
                append_runtime_log(
                    paths,
                    "error",
                    "message_retry",
                    &format!("message {} will be retried: {err}", message.id),
                );
                break;
            }
        }
    }
    Ok(report)
}

/// Handle one inbound message. Returns whether an agent turn ran. Gated or
/// unroutable messages succeed without dispatching so the cursor can move
/// past them.
fn process_message(
    settings: &Settings,
    paths: &StatePaths,
    store: &MessageStore,
    registry: &GroupRegistry,
    gateway: &dyn ChannelGateway,
    message: &MessageRecord,
) -> Result<bool, String> {
    let Some(group) = registry.group_for_jid(&message.chat_jid) else {
        return Ok(false);
    };
    if !group.folder.is_main() && !trigger_matches(&group.trigger, message.content.trim()) {
        return Ok(false);
    }

    let backlog = store
        .messages_since(&message.chat_jid, registry.agent_cursor(&message.chat_jid))
        .map_err(|err| format!("failed to load backlog: {err}"))?;
    if backlog.is_empty() {
        return Ok(false);
    }
    let prompt = render_transcript(&backlog);

    if !registry.try_begin_invocation(group.folder.as_str()) {
        return Err(format!("folder `{}` has an invocation in flight", group.folder));
    }
    let _ = gateway.send_typing(&message.chat_jid);
    let turn = container::run_agent_turn(
        settings,
        paths,
        store,
        registry,
        &group.folder,
        &prompt,
        true,
    );
    registry.end_invocation(group.folder.as_str());
    let turn = turn.map_err(|err| format!("agent invocation failed: {err}"))?;

    let Some(reply) = turn.reply.as_deref() else {
        // Agent-side error: stay silent, let the cursor move on.
        return Ok(true);
    };

    // Delivery is best-effort once the agent has answered; the backlog is
    // consumed either way.
    deliver_reply(settings, paths, gateway, &group, &message.chat_jid, reply);
    registry
        .advance_agent_cursor(&message.chat_jid, message.timestamp)
        .map_err(|err| format!("failed to persist agent cursor: {err}"))?;
    Ok(true)
}

fn deliver_reply(
    settings: &Settings,
    paths: &StatePaths,
    gateway: &dyn ChannelGateway,
    group: &RegisteredGroup,
    chat_jid: &str,
    reply: &str,
) {
    let text = format!("{}: {}", settings.assistant_name, reply);
    if let Err(err) = gateway.send_text(chat_jid, &text) {
        append_runtime_log(
            paths,
            "warn",
            "delivery_failed",
            &format!("reply to {chat_jid} for group `{}` dropped: {err}", group.folder),
        );
    }
}
