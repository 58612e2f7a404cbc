//! Conversation relay: buffered user turns in, model replies out.
//!
//! Also the entry point for everything else the bot sends on its own:
//! broadcasts and scheduled reminders.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    broadcast::{BroadcastConfig, BroadcastDispatcher, BroadcastHandle, JobStatus},
    buffer::{BoxFuture, BufferConfig, FlushFn, MessageBuffer},
    classify::{classify_send_error, DeliveryError},
    config::Config,
    domain::{ConversationId, JobId},
    formatting::to_markdown_v2,
    messaging::{throttled::FloodGate, types::OutboundMessage},
    model::types::ChatMessage,
    ports::{LlmGateway, PersistencePort, TransportPort},
    reminder::{is_due, ReminderConfig, ReminderRun, ReminderTime},
    repair::{escape_all, repair, Dialect},
    stats::ActivityStats,
    store::HistoryConfig,
    utils::split_text,
    Error, Result,
};

/// Sent when a buffered turn produced no reply.
pub const FAILURE_NOTICE: &str =
    "Sorry, I couldn't get a reply this time. Please try again in a moment.";

/// Telegram shows a chat action for about five seconds.
const TYPING_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Clone, Debug, Default)]
pub struct RelayConfig {
    pub buffer: BufferConfig,
    pub history: HistoryConfig,
    pub broadcast: BroadcastConfig,
    pub reminders: ReminderConfig,
}

impl From<&Config> for RelayConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            buffer: cfg.buffer,
            history: cfg.history,
            broadcast: cfg.broadcast,
            reminders: cfg.reminders.clone(),
        }
    }
}

pub struct Relay {
    buffer: Arc<MessageBuffer>,
    dispatcher: Arc<BroadcastDispatcher>,
    persistence: Arc<dyn PersistencePort>,
    turns: Arc<TurnHandler>,
    reminders: ReminderConfig,
}

impl Relay {
    /// `gate` is the flood gate the transport sends through; replies and
    /// broadcasts wait on it after a rate-limit answer.
    pub fn new(
        cfg: RelayConfig,
        llm: Arc<dyn LlmGateway>,
        transport: Arc<dyn TransportPort>,
        persistence: Arc<dyn PersistencePort>,
        gate: Arc<FloodGate>,
    ) -> Arc<Self> {
        let turns = Arc::new(TurnHandler {
            llm,
            transport: transport.clone(),
            persistence: persistence.clone(),
            history: cfg.history,
            gate: gate.clone(),
        });

        let flush: FlushFn = {
            let turns = turns.clone();
            Arc::new(move |id: ConversationId, text: String| {
                let turns = turns.clone();
                let fut: BoxFuture<Result<()>> =
                    Box::pin(async move { turns.handle(id, text).await });
                fut
            })
        };

        Arc::new(Self {
            buffer: MessageBuffer::new(cfg.buffer, flush),
            dispatcher: BroadcastDispatcher::new(
                cfg.broadcast,
                transport,
                persistence.clone(),
                gate,
            ),
            persistence,
            turns,
            reminders: cfg.reminders,
        })
    }

    /// Feed one inbound fragment. The turn is answered once the conversation
    /// has been quiet for the debounce interval.
    pub async fn on_fragment(
        &self,
        id: ConversationId,
        text: impl Into<String>,
        now: Instant,
    ) -> Result<()> {
        self.buffer.append(id, text, now);
        self.persistence.upsert_conversation(id).await
    }

    /// First contact (`/start`).
    pub async fn register(&self, id: ConversationId) -> Result<()> {
        self.persistence.upsert_conversation(id).await
    }

    /// Drop the model context. Stored history is kept and a pending buffer
    /// for the conversation is left alone.
    pub async fn forget(&self, id: ConversationId) -> Result<()> {
        tracing::info!(conversation_id = %id, "context forgotten");
        self.persistence.forget(id).await
    }

    /// Start a broadcast. Without explicit recipients it goes to every
    /// active conversation.
    pub async fn start_broadcast(
        &self,
        payload: OutboundMessage,
        recipients: Option<Vec<ConversationId>>,
    ) -> Result<BroadcastHandle> {
        let recipients = match recipients {
            Some(r) => r,
            None => self.active_sorted().await?,
        };
        self.dispatcher.start(payload, recipients).await
    }

    pub fn cancel_broadcast(&self, job: JobId) -> bool {
        self.dispatcher.cancel(job)
    }

    pub fn broadcast_status(&self, job: JobId) -> Option<JobStatus> {
        self.dispatcher.status(job)
    }

    pub fn reminder_config(&self) -> &ReminderConfig {
        &self.reminders
    }

    /// Remind every conversation whose reminder time came up within the
    /// last check interval.
    pub async fn send_due_reminders(&self, now: DateTime<Utc>) -> Result<ReminderRun> {
        let cfg = &self.reminders;
        let mut due: Vec<ConversationId> = self
            .persistence
            .list_reminder_targets()
            .await?
            .into_iter()
            .filter(|t| {
                is_due(
                    cfg.times_for(t.times.as_deref()),
                    now,
                    cfg.utc_offset,
                    cfg.check_interval,
                    t.last_reminded,
                )
            })
            .map(|t| t.id)
            .collect();
        due.sort();
        Ok(self.remind_all(due, now).await)
    }

    /// Remind every active conversation that has reminders on, regardless
    /// of the time of day (`/send_reminders`).
    pub async fn send_reminders_now(&self) -> Result<ReminderRun> {
        let cfg = &self.reminders;
        let mut ids: Vec<ConversationId> = self
            .persistence
            .list_reminder_targets()
            .await?
            .into_iter()
            .filter(|t| !cfg.times_for(t.times.as_deref()).is_empty())
            .map(|t| t.id)
            .collect();
        ids.sort();
        Ok(self.remind_all(ids, Utc::now()).await)
    }

    /// Own reminder times for a conversation; `None` restores the defaults.
    pub async fn set_reminder_times(
        &self,
        id: ConversationId,
        times: Option<Vec<ReminderTime>>,
    ) -> Result<()> {
        tracing::info!(conversation_id = %id, times = ?times, "reminder times changed");
        self.persistence.set_reminder_times(id, times).await
    }

    /// Activity report for one conversation or all of them, in the
    /// reminder clock's offset.
    pub async fn activity_stats(&self, id: Option<ConversationId>) -> Result<ActivityStats> {
        let activity = self.persistence.activity(id).await?;
        Ok(ActivityStats::compute(id, &activity, self.reminders.utc_offset))
    }

    async fn remind_all(&self, ids: Vec<ConversationId>, now: DateTime<Utc>) -> ReminderRun {
        let mut run = ReminderRun {
            total: ids.len(),
            ..ReminderRun::default()
        };
        if ids.is_empty() {
            return run;
        }

        let instruction = self.reminders.render_prompt(now);
        for id in ids {
            match self.turns.remind(id, &instruction, now).await {
                Ok(()) => run.sent += 1,
                Err(e) => {
                    run.failed += 1;
                    tracing::warn!(conversation_id = %id, error = %e, "reminder not sent");
                }
            }
        }
        run
    }

    async fn active_sorted(&self) -> Result<Vec<ConversationId>> {
        let mut all: Vec<_> = self
            .persistence
            .list_active_recipients()
            .await?
            .into_iter()
            .collect();
        all.sort();
        Ok(all)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Formatted,
    Repaired,
    Plain,
}

/// Repeats the "typing..." chat action until stopped.
struct TypingIndicator {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TypingIndicator {
    fn start(transport: Arc<dyn TransportPort>, id: ConversationId) -> Self {
        let (stop, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(TYPING_INTERVAL);
            loop {
                tokio::select! {
                  _ = tick.tick() => {
                    if let Err(e) = transport.typing(id).await {
                        tracing::debug!(conversation_id = %id, error = %e, "typing action failed");
                    }
                  }
                  _ = &mut stop_rx => break,
                }
            }
        });
        Self { stop, task }
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}

/// Consumer of flushed turns, and the sender of reminders.
struct TurnHandler {
    llm: Arc<dyn LlmGateway>,
    transport: Arc<dyn TransportPort>,
    persistence: Arc<dyn PersistencePort>,
    history: HistoryConfig,
    gate: Arc<FloodGate>,
}

impl TurnHandler {
    async fn handle(&self, id: ConversationId, text: String) -> Result<()> {
        let typing = TypingIndicator::start(self.transport.clone(), id);
        let generated = self.generate(id, &text).await;
        typing.stop().await;

        let reply = match generated {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(conversation_id = %id, error = %e, "no reply for turn");
                let notice = OutboundMessage::plain(FAILURE_NOTICE);
                if let Err(send_err) = self.transport.send(id, &notice).await {
                    tracing::warn!(conversation_id = %id, error = %send_err, "failure notice not sent");
                }
                return Err(e);
            }
        };
        self.deliver(id, &reply).await
    }

    async fn generate(&self, id: ConversationId, text: &str) -> Result<String> {
        let history = self
            .persistence
            .load_history(id, self.history.max_context)
            .await?;

        let started = Instant::now();
        let reply = non_empty_reply(self.llm.complete(&history, text).await?)?;
        tracing::info!(
            conversation_id = %id,
            context = history.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model replied"
        );

        for entry in [ChatMessage::user(text), ChatMessage::assistant(reply.clone())] {
            if let Err(e) = self.persistence.append_history(id, entry).await {
                tracing::warn!(conversation_id = %id, error = %e, "history not saved");
            }
        }
        Ok(reply)
    }

    /// Generate and deliver one reminder. The reminder becomes part of the
    /// history so the user's answer has context.
    async fn remind(&self, id: ConversationId, instruction: &str, now: DateTime<Utc>) -> Result<()> {
        let history = self
            .persistence
            .load_history(id, self.history.max_context)
            .await?;
        let reply = non_empty_reply(self.llm.remind(&history, instruction).await?)?;

        self.deliver(id, &reply).await?;
        if let Err(e) = self
            .persistence
            .append_history(id, ChatMessage::assistant(reply))
            .await
        {
            tracing::warn!(conversation_id = %id, error = %e, "reminder not saved to history");
        }
        self.persistence.mark_reminded(id, now).await?;
        tracing::info!(conversation_id = %id, "reminder sent");
        Ok(())
    }

    async fn deliver(&self, id: ConversationId, reply: &str) -> Result<()> {
        let caps = self.transport.capabilities();
        let max_len = caps.max_message_len.max(1);

        // Room for the escapes MarkdownV2 adds.
        for chunk in split_text(reply, (max_len * 3 / 4).max(1)) {
            let formatted = caps
                .supports_markdown
                .then(|| to_markdown_v2(&chunk))
                .filter(|f| f.chars().count() <= max_len);
            self.send_with_fallback(id, formatted, &chunk).await?;
        }
        Ok(())
    }

    /// MarkdownV2, then repaired MarkdownV2, then plain text. A rate limit
    /// pauses the shared gate and is waited out once; a gone recipient is
    /// deactivated.
    async fn send_with_fallback(
        &self,
        id: ConversationId,
        formatted: Option<String>,
        raw: &str,
    ) -> Result<()> {
        let (mut message, mut stage) = match formatted {
            Some(text) => (OutboundMessage::markdown(text), Stage::Formatted),
            None => (OutboundMessage::plain(raw), Stage::Plain),
        };
        let mut waited = false;

        loop {
            let err = match self.transport.send(id, &message).await {
                Ok(_) => return Ok(()),
                Err(err) => err,
            };

            match classify_send_error(&err) {
                DeliveryError::RateLimited { retry_after } if !waited => {
                    waited = true;
                    let wait = retry_after.unwrap_or(self.gate.config().default_pause);
                    tracing::info!(conversation_id = %id, wait_ms = wait.as_millis() as u64, "reply rate limited");
                    self.gate.pause_for(wait);
                    self.gate.wait_resume(&CancellationToken::new()).await;
                }
                DeliveryError::RateLimited { .. } => {
                    return Err(Error::Transport(err.to_string()));
                }
                DeliveryError::PermanentRecipientGone => {
                    self.persistence.deactivate(id).await?;
                    return Err(Error::Transport(format!("recipient gone: {err}")));
                }
                DeliveryError::MalformedContent { offset } if stage == Stage::Formatted => {
                    let mut fixed = repair(&message.text, Some(offset), Dialect::MarkdownV2);
                    if fixed == message.text {
                        fixed = escape_all(&message.text, Dialect::MarkdownV2);
                    }
                    tracing::debug!(conversation_id = %id, offset, "resending repaired reply");
                    message = message.with_text(fixed);
                    stage = Stage::Repaired;
                }
                kind if stage != Stage::Plain => {
                    tracing::debug!(conversation_id = %id, kind = kind.label(), "falling back to plain text");
                    message = OutboundMessage::plain(raw);
                    stage = Stage::Plain;
                }
                _ => return Err(Error::Transport(err.to_string())),
            }
        }
    }
}

fn non_empty_reply(reply: String) -> Result<String> {
    let reply = reply.trim();
    if reply.is_empty() {
        return Err(Error::Llm("model returned an empty reply".to_string()));
    }
    Ok(reply.to_string())
}
