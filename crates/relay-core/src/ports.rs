//! Hexagonal ports consumed by the relay core.
//!
//! Transport and LLM ports live next to their types (`messaging`, `model`);
//! they are re-exported here so adapters can import every port from one place.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    broadcast::RecipientOutcome,
    domain::{ConversationId, JobId},
    model::types::ChatMessage,
    reminder::{ReminderTarget, ReminderTime},
    stats::Activity,
    Result,
};

pub use crate::messaging::port::TransportPort;
pub use crate::model::client::LlmGateway;

/// Persistence port.
///
/// Append-only from the core's point of view: every write is independent and
/// idempotent (writing the same terminal value twice is harmless).
#[async_trait]
pub trait PersistencePort: Send + Sync {
    /// Register a conversation (first contact). Reactivates a deactivated one.
    async fn upsert_conversation(&self, id: ConversationId) -> Result<()>;

    /// Mark a conversation as unreachable (blocked the bot, deleted, ...).
    async fn deactivate(&self, id: ConversationId) -> Result<()>;

    async fn list_active_recipients(&self) -> Result<HashSet<ConversationId>>;

    async fn record_delivery_result(
        &self,
        job: JobId,
        recipient: ConversationId,
        outcome: &RecipientOutcome,
    ) -> Result<()>;

    /// Highest job id ever recorded, including jobs whose results were
    /// already pruned. New jobs are numbered past it.
    async fn last_job_id(&self) -> Result<Option<JobId>>;

    /// Last entries of the model context window, oldest first, at most `limit`.
    async fn load_history(&self, id: ConversationId, limit: usize) -> Result<Vec<ChatMessage>>;

    /// Append one entry; the oldest entries beyond the storage bound are dropped.
    async fn append_history(&self, id: ConversationId, message: ChatMessage) -> Result<()>;

    /// Reset the model context window without deleting stored history.
    async fn forget(&self, id: ConversationId) -> Result<()>;

    /// Own reminder times of a conversation. `None` returns it to the
    /// configured defaults; an empty list turns reminders off.
    async fn set_reminder_times(
        &self,
        id: ConversationId,
        times: Option<Vec<ReminderTime>>,
    ) -> Result<()>;

    /// Reminder settings of every active conversation.
    async fn list_reminder_targets(&self) -> Result<Vec<ReminderTarget>>;

    async fn mark_reminded(&self, id: ConversationId, at: DateTime<Utc>) -> Result<()>;

    /// Conversation counts and user-message times, for one conversation or
    /// for all of them.
    async fn activity(&self, id: Option<ConversationId>) -> Result<Activity>;
}
