use std::sync::Arc;

use teloxide::prelude::*;

use relay_core::{
    broadcast::{BroadcastHandle, JobStatus},
    domain::{ConversationId, JobId},
    messaging::types::{Attachment, OutboundMessage},
    reminder::{format_times, parse_times, ReminderTime},
    repair::{repair, validate_markdown_v2, Dialect},
};

use crate::router::AppState;

use super::reply;

/// Undelivered recipients listed in a broadcast summary.
const SUMMARY_DETAILS: usize = 20;

const HELP: &str = "Send me a message and I'll answer. Several quick messages in a row are read as one.\n\n\
Commands:\n\
/start - Show this help message\n\
/forget - Start a fresh conversation (I stop using earlier messages)";

const ADMIN_HELP: &str = "\n\nAdmin:\n\
/broadcast <text> - Send MarkdownV2 text to every active chat (reply to a document to attach it)\n\
/broadcast_to <id,id,...> <text> - Send to the listed chats only\n\
/broadcast_status <id> - Delivery counts for a broadcast\n\
/broadcast_cancel <id> - Stop a running broadcast\n\
/stats [chat_id] - Activity of all chats or of one chat\n\
/send_reminders - Send a reminder to every chat that has reminders on\n\
/set_reminder_times <chat_id> <HH:MM ...|off|default> - Reminder times of one chat";

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

fn parse_job_id(arg: &str) -> Option<JobId> {
    arg.trim().trim_start_matches('#').parse::<u64>().ok().map(JobId)
}

/// `-100123,42 rest of text` -> recipients and text.
fn parse_recipients(arg: &str) -> Option<(Vec<ConversationId>, String)> {
    let mut parts = arg.trim().splitn(2, char::is_whitespace);
    let ids = parts.next()?;
    let text = parts.next().unwrap_or("").trim().to_string();

    let recipients: Vec<ConversationId> = ids
        .split(',')
        .map(|s| s.trim().parse::<i64>().ok().map(ConversationId))
        .collect::<Option<_>>()?;
    if recipients.is_empty() {
        return None;
    }
    Some((recipients, text))
}

/// Admin text is MarkdownV2. Broken markup is repaired once here instead of
/// failing for every recipient.
fn broadcast_payload(text: &str, attachment: Option<Attachment>) -> OutboundMessage {
    let text = match validate_markdown_v2(text) {
        Ok(()) => text.to_string(),
        Err(offset) => repair(text, Some(offset), Dialect::MarkdownV2),
    };
    OutboundMessage {
        attachment,
        ..OutboundMessage::markdown(text)
    }
}

/// `<chat_id> <HH:MM ...|off|default>`. `None` times restore the defaults.
fn parse_reminder_times(arg: &str) -> Option<(ConversationId, Option<Vec<ReminderTime>>)> {
    let mut parts = arg.trim().splitn(2, char::is_whitespace);
    let id = parts.next()?.parse::<i64>().ok().map(ConversationId)?;
    let rest = parts.next().unwrap_or("").trim();

    let times = match rest.to_lowercase().as_str() {
        "" => return None,
        "off" => Some(Vec::new()),
        "default" => None,
        _ => Some(parse_times(rest).ok()?),
    };
    Some((id, times))
}

fn format_status(id: JobId, s: &JobStatus) -> String {
    format!(
        "Broadcast #{id}: {}\ndelivered {}, failed {}, skipped {}, pending {} (of {})",
        if s.is_finished() { "finished" } else { "running" },
        s.delivered,
        s.failed,
        s.skipped,
        s.pending,
        s.total
    )
}

fn is_admin(state: &AppState, user_id: Option<i64>) -> bool {
    user_id.is_some_and(|id| state.cfg.telegram.admin_users.contains(&id))
}

pub async fn handle_command(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let chat_id = ConversationId(msg.chat.id.0);
    let user_id = msg.from().map(|u| u.id.0 as i64);
    let admin = is_admin(&state, user_id);
    let (cmd, arg) = parse_command(text);

    match cmd.as_str() {
        "start" | "help" => {
            if let Err(e) = state.relay.register(chat_id).await {
                tracing::warn!(conversation_id = %chat_id, error = %e, "register failed");
            }
            let body = if admin {
                format!("{HELP}{ADMIN_HELP}")
            } else {
                HELP.to_string()
            };
            reply(&state, chat_id, body).await;
        }

        "forget" => match state.relay.forget(chat_id).await {
            Ok(()) => reply(&state, chat_id, "Done. I've forgotten our conversation so far.").await,
            Err(e) => {
                tracing::warn!(conversation_id = %chat_id, error = %e, "forget failed");
                reply(&state, chat_id, "Couldn't reset the conversation, please try again.").await;
            }
        },

        "broadcast" | "broadcast_to" | "broadcast_status" | "broadcast_cancel" | "stats"
        | "send_reminders" | "set_reminder_times"
            if !admin =>
        {
            tracing::warn!(conversation_id = %chat_id, user_id, command = %cmd, "admin command refused");
            reply(&state, chat_id, "This command is for admins only.").await;
        }

        "broadcast" => {
            let attachment = msg
                .reply_to_message()
                .and_then(|m| m.document())
                .map(|d| Attachment {
                    file_id: d.file.id.clone(),
                });
            if arg.is_empty() && attachment.is_none() {
                reply(&state, chat_id, "Usage: /broadcast <text>").await;
                return Ok(());
            }
            start_broadcast(&state, chat_id, broadcast_payload(&arg, attachment), None).await;
        }

        "broadcast_to" => {
            let Some((recipients, text)) = parse_recipients(&arg).filter(|(_, t)| !t.is_empty())
            else {
                reply(&state, chat_id, "Usage: /broadcast_to <id,id,...> <text>").await;
                return Ok(());
            };
            start_broadcast(&state, chat_id, broadcast_payload(&text, None), Some(recipients)).await;
        }

        "broadcast_status" => {
            let body = match parse_job_id(&arg) {
                None => "Usage: /broadcast_status <id>".to_string(),
                Some(id) => match state.relay.broadcast_status(id) {
                    Some(s) => format_status(id, &s),
                    None => format!("No broadcast #{id}."),
                },
            };
            reply(&state, chat_id, body).await;
        }

        "broadcast_cancel" => {
            let body = match parse_job_id(&arg) {
                None => "Usage: /broadcast_cancel <id>".to_string(),
                Some(id) if state.relay.cancel_broadcast(id) => {
                    format!("Cancelling broadcast #{id}. Sends already in flight will finish.")
                }
                Some(id) => format!("Broadcast #{id} is not running."),
            };
            reply(&state, chat_id, body).await;
        }

        "stats" => {
            let scope = match arg.as_str() {
                "" => None,
                raw => match raw.parse::<i64>() {
                    Ok(id) => Some(ConversationId(id)),
                    Err(_) => {
                        reply(&state, chat_id, "Usage: /stats [chat_id]").await;
                        return Ok(());
                    }
                },
            };
            let body = match state.relay.activity_stats(scope).await {
                Ok(stats) => stats.render(),
                Err(e) => {
                    tracing::error!(error = %e, "stats failed");
                    format!("Stats unavailable: {e}")
                }
            };
            reply(&state, chat_id, body).await;
        }

        "send_reminders" => {
            reply(&state, chat_id, "Sending reminders...").await;
            tokio::spawn(send_reminders(state.clone(), chat_id));
        }

        "set_reminder_times" => {
            let Some((target, times)) = parse_reminder_times(&arg) else {
                reply(
                    &state,
                    chat_id,
                    "Usage: /set_reminder_times <chat_id> <HH:MM ...|off|default>",
                )
                .await;
                return Ok(());
            };
            let shown = match &times {
                Some(own) => format_times(own),
                None => format!(
                    "default ({})",
                    format_times(&state.relay.reminder_config().default_times)
                ),
            };
            let body = match state.relay.set_reminder_times(target, times).await {
                Ok(()) => format!("Reminders for {target}: {shown}"),
                Err(e) => {
                    tracing::error!(conversation_id = %target, error = %e, "reminder times not saved");
                    format!("Reminder times not saved: {e}")
                }
            };
            reply(&state, chat_id, body).await;
        }

        _ => {
            reply(&state, chat_id, "Unknown command. Try /help.").await;
        }
    }

    Ok(())
}

async fn start_broadcast(
    state: &Arc<AppState>,
    chat_id: ConversationId,
    payload: OutboundMessage,
    recipients: Option<Vec<ConversationId>>,
) {
    let handle = match state.relay.start_broadcast(payload, recipients).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "broadcast not started");
            reply(state, chat_id, format!("Broadcast not started: {e}")).await;
            return;
        }
    };

    let total = handle.status().total;
    reply(
        state,
        chat_id,
        format!(
            "Broadcast #{} started for {total} chats. /broadcast_status {} for progress.",
            handle.id(),
            handle.id()
        ),
    )
    .await;

    tokio::spawn(report_when_done(state.clone(), chat_id, handle));
}

async fn report_when_done(state: Arc<AppState>, chat_id: ConversationId, handle: BroadcastHandle) {
    let id = handle.id();
    let summary = match handle.join().await {
        Ok(report) => report.summary(SUMMARY_DETAILS),
        Err(e) => format!("Broadcast #{id} failed: {e}"),
    };

    notify_admins(&state, chat_id, summary).await;
}

async fn send_reminders(state: Arc<AppState>, chat_id: ConversationId) {
    let summary = match state.relay.send_reminders_now().await {
        Ok(run) => run.to_string(),
        Err(e) => format!("Reminders not sent: {e}"),
    };
    tracing::info!(summary = %summary, "manual reminder round finished");
    notify_admins(&state, chat_id, summary).await;
}

/// Reply to the requester and copy the admin chat.
async fn notify_admins(state: &AppState, chat_id: ConversationId, text: String) {
    reply(state, chat_id, text.clone()).await;
    if let Some(admin_chat) = state.cfg.telegram.admin_chat.map(ConversationId) {
        if admin_chat != chat_id {
            reply(state, admin_chat, text).await;
        }
    }
}
