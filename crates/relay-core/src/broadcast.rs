//! Mass delivery of one payload to many conversations.
//!
//! Each recipient walks `Pending → Sending → {Delivered | Failed | Skipped}`,
//! with one repair-and-resend detour for malformed markup. Sends are admitted
//! through a counting gate (`max_in_flight`); a rate-limit answer pauses the
//! shared [`FloodGate`] so replies and broadcasts both wait out the platform's
//! retry-after. Cancelling stops admissions only: a recipient already being
//! sent to finishes its retries. Results are written through the persistence
//! port as soon as they are known.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    fmt::Write as _,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{OnceCell, Semaphore},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::{
    classify::{classify_send_error, DeliveryError},
    domain::{ConversationId, JobId},
    messaging::{throttled::FloodGate, types::OutboundMessage},
    ports::{PersistencePort, TransportPort},
    repair::{escape_all, repair, Dialect},
    utils::truncate_text,
    Error, Result,
};

const FINISHED_JOBS_KEPT: usize = 64;
const MAX_BACKOFF_DOUBLINGS: u32 = 10;

/// Terminal result for one recipient. Never overwritten once recorded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RecipientOutcome {
    Delivered,
    Skipped(String),
    Failed(String),
}

impl RecipientOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RecipientOutcome::Delivered => "delivered",
            RecipientOutcome::Skipped(_) => "skipped",
            RecipientOutcome::Failed(_) => "failed",
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        RecipientOutcome::Failed(reason.into())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Maximum simultaneous in-flight sends.
    pub max_in_flight: usize,
    /// Retries of a transient failure before the recipient is failed.
    pub transient_retries: u32,
    /// First backoff delay; doubled on every further transient failure.
    pub backoff_base: Duration,
    /// Rate-limit pauses tolerated per recipient before giving up on it.
    pub max_rate_limit_waits: u32,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            transient_retries: 3,
            backoff_base: Duration::from_millis(500),
            max_rate_limit_waits: 20,
        }
    }
}

/// Aggregate counts of a job. `pending` includes recipients being sent to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub total: usize,
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        self.pending == 0
    }
}

/// Final outcome of a job: counts plus the full per-recipient map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReport {
    pub job: JobId,
    pub status: JobStatus,
    pub results: BTreeMap<ConversationId, RecipientOutcome>,
    pub cancelled: bool,
    /// Set when a fatal internal fault stopped the job.
    pub aborted: Option<String>,
}

impl BroadcastReport {
    /// Human-readable summary for the operator: counts, then every recipient
    /// that was not delivered.
    pub fn summary(&self, max_details: usize) -> String {
        let s = self.status;
        let mut out = format!(
            "Broadcast #{} {}: delivered {}, failed {}, skipped {} (of {})",
            self.job,
            if self.aborted.is_some() {
                "aborted"
            } else if self.cancelled {
                "cancelled"
            } else {
                "finished"
            },
            s.delivered,
            s.failed,
            s.skipped,
            s.total,
        );
        if let Some(reason) = &self.aborted {
            let _ = write!(out, "\nReason: {reason}");
        }

        let mut undelivered = self.results.iter().filter_map(|(id, o)| match o {
            RecipientOutcome::Delivered => None,
            RecipientOutcome::Skipped(r) | RecipientOutcome::Failed(r) => Some((id, o.label(), r)),
        });
        for (id, label, reason) in undelivered.by_ref().take(max_details) {
            let _ = write!(out, "\n{id}: {label} ({})", truncate_text(reason, 120));
        }
        let rest = undelivered.count();
        if rest > 0 {
            let _ = write!(out, "\n... and {rest} more");
        }
        out
    }
}

/// Live state of one broadcast job.
pub struct Job {
    id: JobId,
    recipients: Vec<ConversationId>,
    results: Mutex<BTreeMap<ConversationId, RecipientOutcome>>,
    cancel: CancellationToken,
    /// Fired on a fatal fault: in-flight retries stop too.
    abort: CancellationToken,
    /// Fired by either cancel or abort: no new sends are admitted.
    halt: CancellationToken,
    abort_reason: Mutex<Option<String>>,
}

impl Job {
    fn new(id: JobId, recipients: Vec<ConversationId>) -> Self {
        Self {
            id,
            recipients,
            results: Mutex::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
            abort: CancellationToken::new(),
            halt: CancellationToken::new(),
            abort_reason: Mutex::new(None),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        let results = lock(&self.results);
        let mut s = JobStatus {
            total: self.recipients.len(),
            ..JobStatus::default()
        };
        for outcome in results.values() {
            match outcome {
                RecipientOutcome::Delivered => s.delivered += 1,
                RecipientOutcome::Skipped(_) => s.skipped += 1,
                RecipientOutcome::Failed(_) => s.failed += 1,
            }
        }
        s.pending = s.total - (s.delivered + s.failed + s.skipped);
        s
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
        self.halt.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Stop the job on a fatal fault. Every recipient without a terminal
    /// result (pending or in flight) is failed right away.
    fn abort(&self, reason: String) {
        {
            let mut slot = lock(&self.abort_reason);
            if slot.is_some() {
                return;
            }
            *slot = Some(reason);
        }
        self.abort.cancel();
        self.halt.cancel();

        let mut results = lock(&self.results);
        for id in &self.recipients {
            results
                .entry(*id)
                .or_insert_with(|| RecipientOutcome::failed("aborted"));
        }
    }

    /// Record a terminal result. Returns `false` if one was already recorded.
    fn settle(&self, recipient: ConversationId, outcome: RecipientOutcome) -> bool {
        let mut results = lock(&self.results);
        if results.contains_key(&recipient) {
            return false;
        }
        results.insert(recipient, outcome);
        true
    }

    fn report(&self) -> BroadcastReport {
        BroadcastReport {
            job: self.id,
            status: self.status(),
            results: lock(&self.results).clone(),
            cancelled: self.is_cancelled(),
            aborted: lock(&self.abort_reason).clone(),
        }
    }
}

/// Handle to a running job.
pub struct BroadcastHandle {
    job: Arc<Job>,
    task: JoinHandle<BroadcastReport>,
}

impl BroadcastHandle {
    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn status(&self) -> JobStatus {
        self.job.status()
    }

    pub fn cancel(&self) {
        self.job.cancel();
    }

    /// Wait for every recipient to reach a terminal state.
    pub async fn join(self) -> Result<BroadcastReport> {
        self.task
            .await
            .map_err(|e| Error::External(format!("broadcast task failed: {e}")))
    }
}

pub struct BroadcastDispatcher {
    cfg: BroadcastConfig,
    transport: Arc<dyn TransportPort>,
    persistence: Arc<dyn PersistencePort>,
    gate: Arc<FloodGate>,
    next_id: AtomicU64,
    /// Set once `next_id` has been moved past the last persisted job.
    ids_seeded: OnceCell<()>,
    jobs: Mutex<HashMap<JobId, Arc<Job>>>,
    finished: Mutex<VecDeque<(JobId, JobStatus)>>,
}

impl BroadcastDispatcher {
    pub fn new(
        cfg: BroadcastConfig,
        transport: Arc<dyn TransportPort>,
        persistence: Arc<dyn PersistencePort>,
        gate: Arc<FloodGate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            transport,
            persistence,
            gate,
            next_id: AtomicU64::new(1),
            ids_seeded: OnceCell::new(),
            jobs: Mutex::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
        })
    }

    /// Start delivering `payload` to `recipients` (duplicates are ignored).
    pub async fn start(
        self: &Arc<Self>,
        payload: OutboundMessage,
        recipients: Vec<ConversationId>,
    ) -> Result<BroadcastHandle> {
        let id = self.next_job_id().await?;

        let mut seen = HashSet::new();
        let recipients: Vec<ConversationId> =
            recipients.into_iter().filter(|r| seen.insert(*r)).collect();

        let job = Arc::new(Job::new(id, recipients));
        lock(&self.jobs).insert(id, job.clone());

        tracing::info!(job_id = %id, recipients = job.recipients.len(), "broadcast started");

        let dispatcher = Arc::clone(self);
        let task = tokio::spawn(dispatcher.run(job.clone(), payload));
        Ok(BroadcastHandle { job, task })
    }

    /// Job ids continue after the highest one persistence has seen, so a
    /// restart never reuses the id of a recorded job.
    async fn next_job_id(&self) -> Result<JobId> {
        self.ids_seeded
            .get_or_try_init(|| async {
                if let Some(last) = self.persistence.last_job_id().await? {
                    self.next_id.fetch_max(last.0 + 1, Ordering::Relaxed);
                    tracing::info!(last_job_id = %last, "continuing job ids");
                }
                Ok::<(), Error>(())
            })
            .await?;
        Ok(JobId(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    /// Signal cooperative cancellation. Returns `false` for unknown or
    /// already finished jobs.
    pub fn cancel(&self, id: JobId) -> bool {
        let Some(job) = lock(&self.jobs).get(&id).cloned() else {
            return false;
        };
        tracing::info!(job_id = %id, "broadcast cancellation requested");
        job.cancel();
        true
    }

    /// Counts for a running or recently finished job.
    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        if let Some(job) = lock(&self.jobs).get(&id).cloned() {
            return Some(job.status());
        }
        lock(&self.finished)
            .iter()
            .find(|(job_id, _)| *job_id == id)
            .map(|(_, status)| *status)
    }

    async fn run(self: Arc<Self>, job: Arc<Job>, payload: OutboundMessage) -> BroadcastReport {
        let delivery = Arc::new(Delivery {
            cfg: self.cfg,
            transport: self.transport.clone(),
            persistence: self.persistence.clone(),
            gate: self.gate.clone(),
            job: job.clone(),
            payload,
        });

        match self.persistence.list_active_recipients().await {
            Ok(active) => {
                let mut to_send = Vec::with_capacity(job.recipients.len());
                for recipient in &job.recipients {
                    if active.contains(recipient) {
                        to_send.push(*recipient);
                    } else {
                        delivery
                            .finish(*recipient, RecipientOutcome::Skipped("deactivated".into()))
                            .await;
                    }
                }
                self.feed(&delivery, to_send).await;
            }
            Err(e) => job.abort(format!("listing active recipients failed: {e}")),
        }

        // Whatever was never admitted.
        let leftover = if job.is_aborted() {
            RecipientOutcome::failed("aborted")
        } else {
            RecipientOutcome::Skipped("cancelled".into())
        };
        for recipient in &job.recipients {
            delivery.finish(*recipient, leftover.clone()).await;
        }

        let report = job.report();
        match &report.aborted {
            Some(reason) => {
                tracing::error!(job_id = %job.id, reason = %reason, "broadcast aborted")
            }
            None => tracing::info!(
                job_id = %job.id,
                delivered = report.status.delivered,
                failed = report.status.failed,
                skipped = report.status.skipped,
                cancelled = report.cancelled,
                "broadcast finished"
            ),
        }

        lock(&self.jobs).remove(&job.id);
        {
            let mut finished = lock(&self.finished);
            finished.push_back((job.id, report.status));
            while finished.len() > FINISHED_JOBS_KEPT {
                finished.pop_front();
            }
        }

        report
    }

    async fn feed(&self, delivery: &Arc<Delivery>, to_send: Vec<ConversationId>) {
        let job = &delivery.job;
        let admission = Arc::new(Semaphore::new(self.cfg.max_in_flight.max(1)));
        let mut in_flight = JoinSet::new();

        for recipient in to_send {
            let permit = tokio::select! {
              biased;
              _ = job.halt.cancelled() => break,
              permit = admission.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
              },
            };

            if !self.gate.wait_resume(&job.halt).await {
                break;
            }

            let delivery = Arc::clone(delivery);
            in_flight.spawn(async move {
                let _permit = permit;
                let outcome = delivery.attempt(recipient).await;
                delivery.finish(recipient, outcome).await;
            });
        }

        if job.is_aborted() {
            in_flight.abort_all();
        }
        while let Some(res) = in_flight.join_next().await {
            if let Err(e) = res {
                if !e.is_cancelled() {
                    tracing::error!(job_id = %job.id, error = %e, "delivery task panicked");
                }
            }
        }
    }
}

/// Everything one recipient's delivery needs.
struct Delivery {
    cfg: BroadcastConfig,
    transport: Arc<dyn TransportPort>,
    persistence: Arc<dyn PersistencePort>,
    gate: Arc<FloodGate>,
    job: Arc<Job>,
    payload: OutboundMessage,
}

impl Delivery {
    async fn attempt(&self, recipient: ConversationId) -> RecipientOutcome {
        let job_id = self.job.id;
        let mut message = self.payload.clone();
        let mut repaired = false;
        let mut transient_failures = 0u32;
        let mut rate_limit_waits = 0u32;

        loop {
            // Cancellation does not interrupt an admitted recipient.
            if !self.gate.wait_resume(&self.job.abort).await {
                return RecipientOutcome::failed("aborted");
            }

            let err = match self.transport.send(recipient, &message).await {
                Ok(_) => {
                    tracing::debug!(job_id = %job_id, recipient = %recipient, repaired, "delivered");
                    return RecipientOutcome::Delivered;
                }
                Err(err) => err,
            };

            let kind = classify_send_error(&err);
            tracing::debug!(
                job_id = %job_id,
                recipient = %recipient,
                kind = kind.label(),
                error = %err,
                "send failed"
            );

            match kind {
                DeliveryError::RateLimited { retry_after } => {
                    rate_limit_waits += 1;
                    let wait = retry_after.unwrap_or(self.gate.config().default_pause);
                    self.gate.pause_for(wait);
                    tracing::info!(
                        job_id = %job_id,
                        recipient = %recipient,
                        wait_ms = wait.as_millis() as u64,
                        "rate limited, pausing sends"
                    );
                    if rate_limit_waits > self.cfg.max_rate_limit_waits {
                        return RecipientOutcome::failed(format!(
                            "rate limited {rate_limit_waits} times"
                        ));
                    }
                }
                // The repaired resend gets exactly one chance.
                _ if repaired => {
                    return RecipientOutcome::failed(format!(
                        "{} after repair: {}",
                        kind.label(),
                        err.message
                    ));
                }
                DeliveryError::MalformedContent { offset } => {
                    let dialect = Dialect::for_format(message.format);
                    let mut fixed = repair(&message.text, Some(offset), dialect);
                    if fixed == message.text {
                        fixed = escape_all(&message.text, dialect);
                    }
                    tracing::info!(job_id = %job_id, recipient = %recipient, offset, "resending repaired text");
                    message = message.with_text(fixed);
                    repaired = true;
                }
                DeliveryError::Transient => {
                    transient_failures += 1;
                    if transient_failures > self.cfg.transient_retries {
                        return RecipientOutcome::failed(format!(
                            "transient failure after {} retries: {}",
                            self.cfg.transient_retries, err.message
                        ));
                    }
                    let backoff = self.cfg.backoff_base
                        * 2u32.pow((transient_failures - 1).min(MAX_BACKOFF_DOUBLINGS));
                    tokio::select! {
                      _ = self.job.abort.cancelled() => return RecipientOutcome::failed("aborted"),
                      _ = tokio::time::sleep(backoff) => {}
                    }
                }
                DeliveryError::PermanentRecipientGone => {
                    if let Err(e) = self.persistence.deactivate(recipient).await {
                        tracing::warn!(recipient = %recipient, error = %e, "failed to deactivate recipient");
                    }
                    return RecipientOutcome::failed(format!("recipient gone: {}", err.message));
                }
                DeliveryError::Unknown => {
                    tracing::warn!(
                        job_id = %job_id,
                        recipient = %recipient,
                        error = %err,
                        "unclassified delivery error"
                    );
                    return RecipientOutcome::failed(format!("unclassified: {err}"));
                }
            }
        }
    }

    /// Settle and persist a terminal result (first write wins).
    async fn finish(&self, recipient: ConversationId, outcome: RecipientOutcome) {
        if !self.job.settle(recipient, outcome.clone()) {
            return;
        }
        if self.job.is_aborted() {
            // The persistence port is what failed; the report carries the rest.
            return;
        }
        if let Err(e) = self
            .persistence
            .record_delivery_result(self.job.id, recipient, &outcome)
            .await
        {
            self.job
                .abort(format!("recording result for {recipient} failed: {e}"));
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{MessageId, MessageRef},
        messaging::{
            throttled::ThrottleConfig,
            types::{SendError, TransportCapabilities},
        },
        model::types::ChatMessage,
        reminder::{ReminderTarget, ReminderTime},
        stats::Activity,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tokio::time::Instant;

    const PARSE_ERROR: &str =
        "Bad Request: can't parse entities: Can't find end of the entity starting at byte offset 12";

    struct FakeTransport {
        delay: Duration,
        delays: HashMap<ConversationId, Duration>,
        script: Mutex<HashMap<ConversationId, VecDeque<SendError>>>,
        sent: Mutex<Vec<(ConversationId, String, Instant)>>,
    }

    impl FakeTransport {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                delays: HashMap::new(),
                script: Mutex::new(HashMap::new()),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn delay_for(mut self, id: i64, delay: Duration) -> Self {
            self.delays.insert(ConversationId(id), delay);
            self
        }

        /// Queue failures for a recipient; sends succeed once they run out.
        fn fail(self, id: i64, errors: &[SendError]) -> Self {
            self.script
                .lock()
                .unwrap()
                .entry(ConversationId(id))
                .or_default()
                .extend(errors.iter().cloned());
            self
        }

        fn sent_to(&self, id: i64) -> Vec<(String, Instant)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _, _)| *c == ConversationId(id))
                .map(|(_, text, at)| (text.clone(), *at))
                .collect()
        }
    }

    #[async_trait]
    impl TransportPort for FakeTransport {
        fn capabilities(&self) -> TransportCapabilities {
            TransportCapabilities {
                supports_markdown: true,
                supports_attachments: true,
                max_message_len: 4096,
            }
        }

        async fn send(
            &self,
            conversation_id: ConversationId,
            message: &OutboundMessage,
        ) -> std::result::Result<MessageRef, SendError> {
            self.sent
                .lock()
                .unwrap()
                .push((conversation_id, message.text.clone(), Instant::now()));
            let next = self
                .script
                .lock()
                .unwrap()
                .get_mut(&conversation_id)
                .and_then(|q| q.pop_front());

            let delay = self.delays.get(&conversation_id).copied().unwrap_or(self.delay);
            tokio::time::sleep(delay).await;

            match next {
                Some(err) => Err(err),
                None => Ok(MessageRef {
                    conversation_id,
                    message_id: MessageId(1),
                }),
            }
        }
    }

    #[derive(Default)]
    struct FakePersistence {
        inactive: HashSet<ConversationId>,
        known: Vec<ConversationId>,
        deactivated: Mutex<Vec<ConversationId>>,
        records: Mutex<Vec<(JobId, ConversationId, RecipientOutcome)>>,
        fail_records_after: Option<usize>,
        fail_listing: bool,
        last_job: Option<JobId>,
    }

    impl FakePersistence {
        fn with_recipients(ids: impl IntoIterator<Item = i64>) -> Self {
            Self {
                known: ids.into_iter().map(ConversationId).collect(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl PersistencePort for FakePersistence {
        async fn upsert_conversation(&self, _id: ConversationId) -> Result<()> {
            Ok(())
        }

        async fn deactivate(&self, id: ConversationId) -> Result<()> {
            self.deactivated.lock().unwrap().push(id);
            Ok(())
        }

        async fn list_active_recipients(&self) -> Result<HashSet<ConversationId>> {
            if self.fail_listing {
                return Err(Error::Persistence("database is down".to_string()));
            }
            Ok(self
                .known
                .iter()
                .copied()
                .filter(|id| !self.inactive.contains(id))
                .collect())
        }

        async fn record_delivery_result(
            &self,
            job: JobId,
            recipient: ConversationId,
            outcome: &RecipientOutcome,
        ) -> Result<()> {
            let mut records = self.records.lock().unwrap();
            if self.fail_records_after.is_some_and(|n| records.len() >= n) {
                return Err(Error::Persistence("database is down".to_string()));
            }
            records.push((job, recipient, outcome.clone()));
            Ok(())
        }

        async fn last_job_id(&self) -> Result<Option<JobId>> {
            Ok(self.last_job)
        }

        async fn load_history(&self, _id: ConversationId, _limit: usize) -> Result<Vec<ChatMessage>> {
            Ok(Vec::new())
        }

        async fn append_history(&self, _id: ConversationId, _message: ChatMessage) -> Result<()> {
            Ok(())
        }

        async fn forget(&self, _id: ConversationId) -> Result<()> {
            Ok(())
        }

        async fn set_reminder_times(
            &self,
            _id: ConversationId,
            _times: Option<Vec<ReminderTime>>,
        ) -> Result<()> {
            Ok(())
        }

        async fn list_reminder_targets(&self) -> Result<Vec<ReminderTarget>> {
            Ok(Vec::new())
        }

        async fn mark_reminded(&self, _id: ConversationId, _at: DateTime<Utc>) -> Result<()> {
            Ok(())
        }

        async fn activity(&self, _id: Option<ConversationId>) -> Result<Activity> {
            Ok(Activity::default())
        }
    }

    fn ids(range: std::ops::RangeInclusive<i64>) -> Vec<ConversationId> {
        range.map(ConversationId).collect()
    }

    fn cfg(max_in_flight: usize) -> BroadcastConfig {
        BroadcastConfig {
            max_in_flight,
            ..BroadcastConfig::default()
        }
    }

    fn dispatcher(
        cfg: BroadcastConfig,
        transport: &Arc<FakeTransport>,
        persistence: &Arc<FakePersistence>,
    ) -> Arc<BroadcastDispatcher> {
        BroadcastDispatcher::new(
            cfg,
            transport.clone(),
            persistence.clone(),
            FloodGate::new(ThrottleConfig::default()),
        )
    }

    async fn run_job(
        d: &Arc<BroadcastDispatcher>,
        payload: OutboundMessage,
        recipients: Vec<ConversationId>,
    ) -> BroadcastReport {
        d.start(payload, recipients)
            .await
            .unwrap()
            .join()
            .await
            .unwrap()
    }

    fn assert_complete(report: &BroadcastReport, recipients: &[ConversationId]) {
        let s = report.status;
        assert_eq!(s.total, recipients.len());
        assert_eq!(s.delivered + s.failed + s.skipped, recipients.len());
        assert_eq!(s.pending, 0);
        assert_eq!(report.results.len(), recipients.len());
        for id in recipients {
            assert!(report.results.contains_key(id), "missing result for {id}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_content_is_repaired_and_resent_once() {
        let transport = Arc::new(
            FakeTransport::new(Duration::from_millis(50))
                .fail(3, &[SendError::new(Some(400), PARSE_ERROR)]),
        );
        let persistence = Arc::new(FakePersistence::with_recipients(1..=5));
        let d = dispatcher(cfg(2), &transport, &persistence);

        let recipients = ids(1..=5);
        let report = run_job(
            &d,
            OutboundMessage::markdown("Visit today *now"),
            recipients.clone(),
        )
        .await;

        assert_complete(&report, &recipients);
        assert_eq!(report.status.delivered, 5);

        let attempts: Vec<String> = transport.sent_to(3).into_iter().map(|(t, _)| t).collect();
        assert_eq!(attempts, vec!["Visit today *now", "Visit today \\*now"]);
        assert_eq!(transport.sent_to(1).len(), 1);
        assert_eq!(persistence.records.lock().unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_repair_is_terminal() {
        let transport = Arc::new(FakeTransport::new(Duration::from_millis(10)).fail(
            3,
            &[
                SendError::new(Some(400), PARSE_ERROR),
                SendError::new(Some(400), PARSE_ERROR),
            ],
        ));
        let persistence = Arc::new(FakePersistence::with_recipients(1..=5));
        let d = dispatcher(cfg(4), &transport, &persistence);

        let recipients = ids(1..=5);
        let report = run_job(
            &d,
            OutboundMessage::markdown("Visit today *now"),
            recipients.clone(),
        )
        .await;

        assert_complete(&report, &recipients);
        assert_eq!(report.status.delivered, 4);
        assert!(matches!(
            report.results[&ConversationId(3)],
            RecipientOutcome::Failed(ref r) if r.contains("after repair")
        ));
        assert_eq!(transport.sent_to(3).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_pauses_new_sends_without_failing_anyone() {
        let transport = Arc::new(
            FakeTransport::new(Duration::from_millis(100))
                .delay_for(2, Duration::ZERO)
                .fail(
                    2,
                    &[SendError::new(Some(429), "Too Many Requests: retry after 5")],
                ),
        );
        let persistence = Arc::new(FakePersistence::with_recipients(1..=5));
        let d = dispatcher(cfg(3), &transport, &persistence);

        let t0 = Instant::now();
        let recipients = ids(1..=5);
        let report = run_job(&d, OutboundMessage::plain("hello"), recipients.clone()).await;

        assert_complete(&report, &recipients);
        assert_eq!(report.status.delivered, 5);
        assert_eq!(report.status.failed, 0);

        let pause_end = t0 + Duration::from_secs(5);
        let second = transport.sent_to(2);
        assert_eq!(second.len(), 2);
        assert!(second[1].1 >= pause_end);
        for id in [4, 5] {
            let sends = transport.sent_to(id);
            assert_eq!(sends.len(), 1);
            assert!(sends[0].1 >= pause_end, "recipient {id} sent during the pause");
        }
        // Already in flight when the pause started.
        assert!(transport.sent_to(1)[0].1 < pause_end);
        assert!(transport.sent_to(3)[0].1 < pause_end);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_without_retry_after_uses_the_default_pause() {
        let transport = Arc::new(
            FakeTransport::new(Duration::ZERO)
                .fail(1, &[SendError::new(Some(429), "Too Many Requests")]),
        );
        let persistence = Arc::new(FakePersistence::with_recipients([1]));
        let d = dispatcher(cfg(1), &transport, &persistence);

        let t0 = Instant::now();
        let report = run_job(&d, OutboundMessage::plain("x"), ids(1..=1)).await;

        assert_eq!(report.status.delivered, 1);
        let sends = transport.sent_to(1);
        assert!(sends[1].1 - t0 >= ThrottleConfig::default().default_pause);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_skips_untouched_recipients() {
        let transport = Arc::new(FakeTransport::new(Duration::from_secs(1)));
        let persistence = Arc::new(FakePersistence::with_recipients(1..=10));
        let d = dispatcher(cfg(1), &transport, &persistence);

        let recipients = ids(1..=10);
        let handle = d
            .start(OutboundMessage::plain("news"), recipients.clone())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        let mid = handle.status();
        assert_eq!(mid.delivered, 2);
        assert_eq!(mid.pending, 8);

        assert!(d.cancel(handle.id()));
        let report = handle.join().await.unwrap();

        assert_complete(&report, &recipients);
        assert!(report.cancelled);
        // The in-flight send to #3 was allowed to complete.
        assert_eq!(report.status.delivered, 3);
        assert_eq!(report.status.skipped, 7);
        for id in 4..=10 {
            assert_eq!(
                report.results[&ConversationId(id)],
                RecipientOutcome::Skipped("cancelled".into())
            );
            assert!(transport.sent_to(id).is_empty());
        }
        assert_eq!(persistence.records.lock().unwrap().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_with_backoff() {
        let bad_gateway = SendError::new(Some(502), "Bad Gateway");
        let transport = Arc::new(
            FakeTransport::new(Duration::ZERO)
                .fail(1, &[bad_gateway.clone()])
                .fail(2, &vec![bad_gateway; 4]),
        );
        let persistence = Arc::new(FakePersistence::with_recipients(1..=2));
        let d = dispatcher(cfg(2), &transport, &persistence);

        let report = run_job(&d, OutboundMessage::plain("x"), ids(1..=2)).await;

        assert_eq!(report.results[&ConversationId(1)], RecipientOutcome::Delivered);
        assert!(matches!(
            report.results[&ConversationId(2)],
            RecipientOutcome::Failed(ref r) if r.starts_with("transient")
        ));

        let sends = transport.sent_to(2);
        assert_eq!(sends.len(), 4);
        let base = BroadcastConfig::default().backoff_base;
        assert!(sends[1].1 - sends[0].1 >= base);
        assert!(sends[2].1 - sends[1].1 >= base * 2);
        assert!(sends[3].1 - sends[2].1 >= base * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gone_and_unknown_errors_fail_without_retry() {
        let transport = Arc::new(
            FakeTransport::new(Duration::ZERO)
                .fail(1, &[SendError::new(Some(403), "Forbidden: bot was blocked by the user")])
                .fail(2, &[SendError::new(Some(400), "Bad Request: message is too long")]),
        );
        let persistence = Arc::new(FakePersistence::with_recipients(1..=3));
        let d = dispatcher(cfg(3), &transport, &persistence);

        let recipients = ids(1..=3);
        let report = run_job(&d, OutboundMessage::plain("x"), recipients.clone()).await;

        assert_complete(&report, &recipients);
        assert_eq!(report.status.failed, 2);
        assert_eq!(transport.sent_to(1).len(), 1);
        assert_eq!(transport.sent_to(2).len(), 1);
        assert_eq!(*persistence.deactivated.lock().unwrap(), vec![ConversationId(1)]);
        assert_eq!(report.results[&ConversationId(3)], RecipientOutcome::Delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn deactivated_and_duplicate_recipients() {
        let transport = Arc::new(FakeTransport::new(Duration::ZERO));
        let persistence = Arc::new(FakePersistence {
            inactive: [ConversationId(2)].into_iter().collect(),
            ..FakePersistence::with_recipients(1..=3)
        });
        let d = dispatcher(cfg(2), &transport, &persistence);

        let recipients = vec![
            ConversationId(1),
            ConversationId(2),
            ConversationId(1),
            ConversationId(3),
            ConversationId(4),
        ];
        let report = run_job(&d, OutboundMessage::plain("x"), recipients).await;

        assert_complete(&report, &ids(1..=4));
        assert_eq!(report.status.delivered, 2);
        assert_eq!(report.status.skipped, 2);
        assert_eq!(
            report.results[&ConversationId(2)],
            RecipientOutcome::Skipped("deactivated".into())
        );
        assert!(transport.sent_to(2).is_empty());
        assert!(transport.sent_to(4).is_empty());
        assert_eq!(transport.sent_to(1).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failure_aborts_the_job() {
        let transport = Arc::new(FakeTransport::new(Duration::from_secs(1)));
        let persistence = Arc::new(FakePersistence {
            fail_records_after: Some(2),
            ..FakePersistence::with_recipients(1..=6)
        });
        let d = dispatcher(cfg(1), &transport, &persistence);

        let recipients = ids(1..=6);
        let report = run_job(&d, OutboundMessage::plain("x"), recipients.clone()).await;

        assert_complete(&report, &recipients);
        assert!(report.aborted.is_some());
        assert_eq!(report.status.delivered, 3);
        assert_eq!(report.status.failed, 3);
        for id in 4..=6 {
            assert_eq!(
                report.results[&ConversationId(id)],
                RecipientOutcome::Failed("aborted".into())
            );
        }
        assert!(report.summary(10).contains("aborted"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_persistence_fails_everyone() {
        let transport = Arc::new(FakeTransport::new(Duration::ZERO));
        let persistence = Arc::new(FakePersistence {
            fail_listing: true,
            ..FakePersistence::with_recipients(1..=3)
        });
        let d = dispatcher(cfg(2), &transport, &persistence);

        let recipients = ids(1..=3);
        let report = run_job(&d, OutboundMessage::plain("x"), recipients.clone()).await;

        assert_complete(&report, &recipients);
        assert_eq!(report.status.failed, 3);
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn status_is_kept_after_the_job_finishes() {
        let transport = Arc::new(FakeTransport::new(Duration::ZERO));
        let persistence = Arc::new(FakePersistence::with_recipients(1..=2));
        let d = dispatcher(cfg(2), &transport, &persistence);

        let handle = d
            .start(OutboundMessage::plain("x"), ids(1..=2))
            .await
            .unwrap();
        let id = handle.id();
        handle.join().await.unwrap();

        let status = d.status(id).unwrap();
        assert!(status.is_finished());
        assert_eq!(status.delivered, 2);
        assert!(!d.cancel(id));
        assert_eq!(d.status(JobId(999)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_a_rate_limit_pause_lets_the_admitted_recipient_finish() {
        let transport = Arc::new(
            FakeTransport::new(Duration::ZERO).fail(
                1,
                &[SendError::new(Some(429), "Too Many Requests: retry after 5")],
            ),
        );
        let persistence = Arc::new(FakePersistence::with_recipients(1..=3));
        let d = dispatcher(cfg(1), &transport, &persistence);

        let t0 = Instant::now();
        let recipients = ids(1..=3);
        let handle = d
            .start(OutboundMessage::plain("news"), recipients.clone())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
        let report = handle.join().await.unwrap();

        assert_complete(&report, &recipients);
        assert!(report.cancelled);
        assert_eq!(report.results[&ConversationId(1)], RecipientOutcome::Delivered);
        let sends = transport.sent_to(1);
        assert_eq!(sends.len(), 2);
        assert!(sends[1].1 - t0 >= Duration::from_secs(5));
        for id in 2..=3 {
            assert_eq!(
                report.results[&ConversationId(id)],
                RecipientOutcome::Skipped("cancelled".into())
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_lets_the_retry_run() {
        let transport = Arc::new(
            FakeTransport::new(Duration::ZERO).fail(1, &[SendError::new(Some(502), "Bad Gateway")]),
        );
        let persistence = Arc::new(FakePersistence::with_recipients(1..=2));
        let d = dispatcher(cfg(1), &transport, &persistence);

        let handle = d
            .start(OutboundMessage::plain("x"), ids(1..=2))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        let report = handle.join().await.unwrap();

        assert_eq!(report.results[&ConversationId(1)], RecipientOutcome::Delivered);
        assert_eq!(
            report.results[&ConversationId(2)],
            RecipientOutcome::Skipped("cancelled".into())
        );
        assert_eq!(transport.sent_to(1).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn job_ids_continue_after_the_last_persisted_job() {
        let transport = Arc::new(FakeTransport::new(Duration::ZERO));
        let persistence = Arc::new(FakePersistence {
            last_job: Some(JobId(7)),
            ..FakePersistence::with_recipients(1..=2)
        });
        let d = dispatcher(cfg(2), &transport, &persistence);

        let first = d
            .start(OutboundMessage::plain("a"), ids(1..=2))
            .await
            .unwrap();
        assert_eq!(first.id(), JobId(8));
        first.join().await.unwrap();

        let second = d
            .start(OutboundMessage::plain("b"), ids(1..=2))
            .await
            .unwrap();
        assert_eq!(second.id(), JobId(9));
        second.join().await.unwrap();

        let jobs: HashSet<JobId> = persistence
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|(job, _, _)| *job)
            .collect();
        assert_eq!(jobs, HashSet::from([JobId(8), JobId(9)]));
    }

    #[test]
    fn summary_lists_undelivered_recipients() {
        let mut results = BTreeMap::new();
        results.insert(ConversationId(1), RecipientOutcome::Delivered);
        results.insert(ConversationId(2), RecipientOutcome::failed("recipient gone: blocked"));
        results.insert(ConversationId(3), RecipientOutcome::Skipped("deactivated".into()));
        let report = BroadcastReport {
            job: JobId(7),
            status: JobStatus {
                total: 3,
                delivered: 1,
                failed: 1,
                skipped: 1,
                pending: 0,
            },
            results,
            cancelled: false,
            aborted: None,
        };

        let text = report.summary(1);
        assert!(text.starts_with("Broadcast #7 finished: delivered 1, failed 1, skipped 1 (of 3)"));
        assert!(text.contains("2: failed (recipient gone: blocked)"));
        assert!(text.ends_with("... and 1 more"));
    }
}
