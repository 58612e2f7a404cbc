//! In-memory persistence with an optional JSON snapshot on disk.
//!
//! Mutations only touch memory. When a snapshot path is configured, a
//! background writer serializes the whole store at most once per
//! `SNAPSHOT_DELAY` after a change and replaces the file with
//! write-then-rename through `tokio::fs`.

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::{
    broadcast::RecipientOutcome,
    domain::{ConversationId, JobId},
    model::types::{ChatMessage, ChatRole},
    ports::PersistencePort,
    reminder::{ReminderTarget, ReminderTime},
    stats::Activity,
    utils::iso_timestamp_utc,
    Result,
};

/// Delivery results are kept for this many most recent jobs.
const DELIVERY_JOBS_KEPT: usize = 20;
/// Changes within this window after the first one share a single write.
const SNAPSHOT_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryConfig {
    /// Entries sent to the model at most.
    pub max_context: usize,
    /// Entries stored per conversation; the oldest are dropped first.
    pub max_storage: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_context: 10,
            max_storage: 100,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ConversationRecord {
    active: bool,
    history: VecDeque<ChatMessage>,
    /// Entries visible to the model. `None` means the whole stored history;
    /// forget sets it to zero and every later append widens it by one.
    context_window: Option<usize>,
    #[serde(default)]
    reminder_times: Option<Vec<ReminderTime>>,
    #[serde(default)]
    last_reminded: Option<String>,
}

impl Default for ConversationRecord {
    fn default() -> Self {
        Self {
            active: true,
            history: VecDeque::new(),
            context_window: None,
            reminder_times: None,
            last_reminded: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoreData {
    conversations: BTreeMap<ConversationId, ConversationRecord>,
    deliveries: BTreeMap<JobId, BTreeMap<ConversationId, RecipientOutcome>>,
    /// Jobs in the order their first result arrived; pruning pops the front.
    #[serde(default)]
    job_order: VecDeque<JobId>,
    /// Survives pruning so job ids never repeat.
    #[serde(default)]
    last_job: Option<JobId>,
    saved_at: Option<String>,
    #[serde(skip)]
    dirty: bool,
}

impl StoreData {
    /// Snapshots written before `job_order` existed list jobs by id only.
    fn normalize(&mut self) {
        let deliveries = &self.deliveries;
        self.job_order.retain(|job| deliveries.contains_key(job));
        let known: HashSet<JobId> = self.job_order.iter().copied().collect();
        let missing: Vec<JobId> = deliveries
            .keys()
            .copied()
            .filter(|job| !known.contains(job))
            .collect();
        self.job_order.extend(missing);
        self.last_job = self.last_job.max(self.deliveries.keys().next_back().copied());
    }
}

struct SnapshotFile {
    path: PathBuf,
    data: Arc<Mutex<StoreData>>,
    /// One file write at a time (background writer vs `flush`).
    writing: Mutex<()>,
    writes: AtomicU64,
}

impl SnapshotFile {
    async fn write(&self) -> Result<()> {
        let _writing = self.writing.lock().await;
        let txt = {
            let mut data = self.data.lock().await;
            if !data.dirty {
                return Ok(());
            }
            data.saved_at = Some(iso_timestamp_utc());
            let txt = serde_json::to_string(&*data)?;
            data.dirty = false;
            txt
        };

        if let Err(e) = write_atomically(&self.path, txt).await {
            self.data.lock().await.dirty = true;
            return Err(e);
        }
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(path = %self.path.display(), writes, "store snapshot written");
        Ok(())
    }
}

struct Snapshot {
    file: Arc<SnapshotFile>,
    changed: Arc<Notify>,
    stop: CancellationToken,
}

pub struct MemoryStore {
    cfg: HistoryConfig,
    data: Arc<Mutex<StoreData>>,
    snapshot: Option<Snapshot>,
}

impl MemoryStore {
    pub fn new(cfg: HistoryConfig) -> Self {
        Self {
            cfg,
            data: Arc::new(Mutex::new(StoreData::default())),
            snapshot: None,
        }
    }

    /// Open a store backed by a snapshot file. A missing or empty file starts
    /// an empty store.
    ///
    /// Must be called from within a tokio runtime (it starts the writer).
    pub fn open(cfg: HistoryConfig, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut data = load_snapshot(&path)?.unwrap_or_default();
        data.normalize();
        tracing::info!(
            path = %path.display(),
            conversations = data.conversations.len(),
            last_job = ?data.last_job.map(|j| j.0),
            "store snapshot loaded"
        );

        let data = Arc::new(Mutex::new(data));
        let file = Arc::new(SnapshotFile {
            path,
            data: data.clone(),
            writing: Mutex::new(()),
            writes: AtomicU64::new(0),
        });
        let changed = Arc::new(Notify::new());
        let stop = CancellationToken::new();
        tokio::spawn(write_on_change(file.clone(), changed.clone(), stop.clone()));

        Ok(Self {
            cfg,
            data,
            snapshot: Some(Snapshot {
                file,
                changed,
                stop,
            }),
        })
    }

    /// Write pending changes now. No-op without a snapshot path.
    pub async fn flush(&self) -> Result<()> {
        match &self.snapshot {
            Some(snapshot) => snapshot.file.write().await,
            None => Ok(()),
        }
    }

    /// Delivery result recorded for `(job, recipient)`, if any.
    pub async fn delivery_result(
        &self,
        job: JobId,
        recipient: ConversationId,
    ) -> Option<RecipientOutcome> {
        let data = self.data.lock().await;
        data.deliveries.get(&job)?.get(&recipient).cloned()
    }

    /// Stored entries for a conversation (not just the model window).
    pub async fn stored_len(&self, id: ConversationId) -> usize {
        let data = self.data.lock().await;
        data.conversations.get(&id).map_or(0, |r| r.history.len())
    }

    /// Mark the data changed and wake the snapshot writer.
    fn touch(&self, data: &mut StoreData) {
        data.dirty = true;
        if let Some(snapshot) = &self.snapshot {
            snapshot.changed.notify_one();
        }
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(snapshot) = &self.snapshot {
            snapshot.stop.cancel();
        }
    }
}

async fn write_on_change(file: Arc<SnapshotFile>, changed: Arc<Notify>, stop: CancellationToken) {
    loop {
        tokio::select! {
          _ = stop.cancelled() => break,
          _ = changed.notified() => {}
        }
        tokio::select! {
          _ = stop.cancelled() => {}
          _ = tokio::time::sleep(SNAPSHOT_DELAY) => {}
        }
        if let Err(e) = file.write().await {
            tracing::warn!(path = %file.path.display(), error = %e, "store snapshot not written");
        }
    }

    if let Err(e) = file.write().await {
        tracing::warn!(path = %file.path.display(), error = %e, "final store snapshot not written");
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[async_trait]
impl PersistencePort for MemoryStore {
    async fn upsert_conversation(&self, id: ConversationId) -> Result<()> {
        let mut data = self.data.lock().await;
        match data.conversations.get(&id).map(|r| r.active) {
            Some(true) => return Ok(()),
            Some(false) => tracing::info!(conversation_id = %id, "conversation reactivated"),
            None => tracing::debug!(conversation_id = %id, "new conversation"),
        }
        data.conversations.entry(id).or_default().active = true;
        self.touch(&mut data);
        Ok(())
    }

    async fn deactivate(&self, id: ConversationId) -> Result<()> {
        let mut data = self.data.lock().await;
        let record = data.conversations.entry(id).or_default();
        if !record.active {
            return Ok(());
        }
        record.active = false;
        tracing::info!(conversation_id = %id, "conversation deactivated");
        self.touch(&mut data);
        Ok(())
    }

    async fn list_active_recipients(&self) -> Result<HashSet<ConversationId>> {
        let data = self.data.lock().await;
        Ok(data
            .conversations
            .iter()
            .filter(|(_, r)| r.active)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn record_delivery_result(
        &self,
        job: JobId,
        recipient: ConversationId,
        outcome: &RecipientOutcome,
    ) -> Result<()> {
        let mut data = self.data.lock().await;
        if let Some(existing) = data.deliveries.get(&job).and_then(|r| r.get(&recipient)) {
            if existing != outcome {
                tracing::warn!(
                    job_id = %job,
                    recipient = %recipient,
                    existing = existing.label(),
                    attempted = outcome.label(),
                    "ignoring a second terminal result"
                );
            }
            return Ok(());
        }

        if !data.deliveries.contains_key(&job) {
            data.job_order.push_back(job);
        }
        data.deliveries
            .entry(job)
            .or_default()
            .insert(recipient, outcome.clone());
        data.last_job = data.last_job.max(Some(job));

        while data.job_order.len() > DELIVERY_JOBS_KEPT {
            if let Some(oldest) = data.job_order.pop_front() {
                data.deliveries.remove(&oldest);
            }
        }
        self.touch(&mut data);
        Ok(())
    }

    async fn last_job_id(&self) -> Result<Option<JobId>> {
        let data = self.data.lock().await;
        Ok(data.last_job)
    }

    async fn load_history(&self, id: ConversationId, limit: usize) -> Result<Vec<ChatMessage>> {
        let data = self.data.lock().await;
        let Some(record) = data.conversations.get(&id) else {
            return Ok(Vec::new());
        };

        let window = record.context_window.unwrap_or(usize::MAX);
        let n = limit.min(window).min(record.history.len());
        let skip = record.history.len() - n;
        Ok(record.history.iter().skip(skip).cloned().collect())
    }

    async fn append_history(&self, id: ConversationId, message: ChatMessage) -> Result<()> {
        let mut data = self.data.lock().await;
        let max_storage = self.cfg.max_storage.max(1);
        let record = data.conversations.entry(id).or_default();

        record.history.push_back(message);
        while record.history.len() > max_storage {
            record.history.pop_front();
        }
        if let Some(window) = record.context_window.as_mut() {
            *window += 1;
        }
        self.touch(&mut data);
        Ok(())
    }

    async fn forget(&self, id: ConversationId) -> Result<()> {
        let mut data = self.data.lock().await;
        data.conversations.entry(id).or_default().context_window = Some(0);
        self.touch(&mut data);
        Ok(())
    }

    async fn set_reminder_times(
        &self,
        id: ConversationId,
        times: Option<Vec<ReminderTime>>,
    ) -> Result<()> {
        let mut data = self.data.lock().await;
        data.conversations.entry(id).or_default().reminder_times = times;
        self.touch(&mut data);
        Ok(())
    }

    async fn list_reminder_targets(&self) -> Result<Vec<ReminderTarget>> {
        let data = self.data.lock().await;
        Ok(data
            .conversations
            .iter()
            .filter(|(_, r)| r.active)
            .map(|(id, r)| ReminderTarget {
                id: *id,
                times: r.reminder_times.clone(),
                last_reminded: r.last_reminded.as_deref().and_then(parse_timestamp),
            })
            .collect())
    }

    async fn mark_reminded(&self, id: ConversationId, at: DateTime<Utc>) -> Result<()> {
        let mut data = self.data.lock().await;
        data.conversations.entry(id).or_default().last_reminded = Some(at.to_rfc3339());
        self.touch(&mut data);
        Ok(())
    }

    async fn activity(&self, id: Option<ConversationId>) -> Result<Activity> {
        let data = self.data.lock().await;
        let records: Vec<&ConversationRecord> = match id {
            Some(id) => data.conversations.get(&id).into_iter().collect(),
            None => data.conversations.values().collect(),
        };

        Ok(Activity {
            conversations: records.len(),
            active: records.iter().filter(|r| r.active).count(),
            user_messages: records
                .iter()
                .flat_map(|r| r.history.iter())
                .filter(|m| m.role == ChatRole::User)
                .filter_map(|m| parse_timestamp(&m.timestamp))
                .collect(),
        })
    }
}

fn load_snapshot(path: &Path) -> Result<Option<StoreData>> {
    if !path.exists() {
        return Ok(None);
    }
    let txt = std::fs::read_to_string(path)?;
    if txt.trim().is_empty() {
        return Ok(None);
    }
    let data: StoreData = serde_json::from_str(&txt)?;
    Ok(Some(data))
}

async fn write_atomically(path: &Path, txt: String) -> Result<()> {
    // Write-then-rename so a crash never leaves a truncated snapshot.
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, txt).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
