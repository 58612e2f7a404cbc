//! Outbound flood control shared by replies and broadcasts.
//!
//! A single [`FloodGate`] hands out send slots (global spacing plus per-chat
//! spacing) and carries the platform-wide pause started by a rate-limit
//! answer. Every path that sends through [`ThrottledTransport`] or waits on
//! the gate observes the same pause.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    classify::{classify_send_error, DeliveryError},
    domain::{ConversationId, MessageRef},
    messaging::{
        port::TransportPort,
        types::{OutboundMessage, SendError, TransportCapabilities},
    },
};

/// Per-chat slots kept before stale ones are dropped.
const CHAT_SLOTS_SOFT_LIMIT: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* two sends (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between sends to the same chat.
    pub per_chat_min_interval: Duration,
    /// Pause applied when a rate-limit answer carries no retry-after.
    pub default_pause: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_chat_min_interval: Duration::from_millis(1050), // ~0.95/sec
            default_pause: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct GateState {
    next_global: Instant,
    next_per_chat: HashMap<ConversationId, Instant>,
    paused_until: Option<Instant>,
}

/// Send slots plus the shared rate-limit pause.
#[derive(Debug)]
pub struct FloodGate {
    cfg: ThrottleConfig,
    state: Mutex<GateState>,
}

impl FloodGate {
    pub fn new(cfg: ThrottleConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            state: Mutex::new(GateState {
                next_global: Instant::now(),
                next_per_chat: HashMap::new(),
                paused_until: None,
            }),
        })
    }

    pub fn config(&self) -> ThrottleConfig {
        self.cfg
    }

    /// Hold every send until `wait` from now. An earlier end never shortens a
    /// pause that is already running.
    pub fn pause_for(&self, wait: Duration) {
        let until = Instant::now() + wait;
        let mut st = self.lock();
        if st.paused_until.map_or(true, |current| current < until) {
            st.paused_until = Some(until);
        }
    }

    /// End of the running pause, if any.
    pub fn paused_until(&self) -> Option<Instant> {
        let st = self.lock();
        st.paused_until.filter(|at| *at > Instant::now())
    }

    /// Wait out any pause. Returns `false` if `stop` fired first.
    pub async fn wait_resume(&self, stop: &CancellationToken) -> bool {
        while let Some(at) = self.paused_until() {
            tokio::select! {
              _ = stop.cancelled() => return false,
              _ = sleep_until(at) => {}
            }
        }
        !stop.is_cancelled()
    }

    /// Book the earliest slot that honours both spacings and the pause.
    fn reserve(&self, chat: ConversationId) -> Instant {
        let now = Instant::now();
        let mut st = self.lock();

        let mut at = now.max(st.next_global);
        if let Some(paused) = st.paused_until {
            at = at.max(paused);
        }
        if let Some(chat_next) = st.next_per_chat.get(&chat) {
            at = at.max(*chat_next);
        }

        st.next_global = at + self.cfg.global_min_interval;
        if st.next_per_chat.len() >= CHAT_SLOTS_SOFT_LIMIT {
            st.next_per_chat.retain(|_, next| *next > now);
        }
        st.next_per_chat
            .insert(chat, at + self.cfg.per_chat_min_interval);
        at
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// TransportPort decorator that waits for a [`FloodGate`] slot before every
/// send and starts a gate-wide pause when the platform answers 429.
///
/// Spacing lowers the odds of a 429 but does not rule it out; callers still
/// classify the error they get back.
pub struct ThrottledTransport {
    inner: Arc<dyn TransportPort>,
    gate: Arc<FloodGate>,
}

impl ThrottledTransport {
    pub fn new(inner: Arc<dyn TransportPort>, gate: Arc<FloodGate>) -> Self {
        Self { inner, gate }
    }

    async fn acquire_slot(&self, id: ConversationId) {
        loop {
            let at = self.gate.reserve(id);
            sleep_until(at).await;
            // A pause may have started while this send was queued.
            if self.gate.paused_until().is_none() {
                return;
            }
        }
    }
}

#[async_trait]
impl TransportPort for ThrottledTransport {
    fn capabilities(&self) -> TransportCapabilities {
        self.inner.capabilities()
    }

    async fn send(
        &self,
        conversation_id: ConversationId,
        message: &OutboundMessage,
    ) -> Result<MessageRef, SendError> {
        self.acquire_slot(conversation_id).await;
        let result = self.inner.send(conversation_id, message).await;

        if let Err(err) = &result {
            if let DeliveryError::RateLimited { retry_after } = classify_send_error(err) {
                let wait = retry_after.unwrap_or(self.gate.cfg.default_pause);
                tracing::info!(
                    conversation_id = %conversation_id,
                    wait_ms = wait.as_millis() as u64,
                    "flood limit hit, pausing all sends"
                );
                self.gate.pause_for(wait);
            }
        }
        result
    }

    async fn typing(&self, conversation_id: ConversationId) -> Result<(), SendError> {
        self.inner.typing(conversation_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageId;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct RecordingTransport {
        sent_at: Mutex<Vec<(ConversationId, Instant)>>,
        errors: Mutex<VecDeque<SendError>>,
    }

    #[async_trait]
    impl TransportPort for RecordingTransport {
        fn capabilities(&self) -> TransportCapabilities {
            TransportCapabilities {
                supports_markdown: true,
                supports_attachments: false,
                max_message_len: 4096,
            }
        }

        async fn send(
            &self,
            conversation_id: ConversationId,
            _message: &OutboundMessage,
        ) -> Result<MessageRef, SendError> {
            self.sent_at
                .lock()
                .unwrap()
                .push((conversation_id, Instant::now()));
            match self.errors.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(MessageRef {
                    conversation_id,
                    message_id: MessageId(1),
                }),
            }
        }
    }

    fn gate(global_ms: u64, per_chat_ms: u64) -> Arc<FloodGate> {
        FloodGate::new(ThrottleConfig {
            global_min_interval: Duration::from_millis(global_ms),
            per_chat_min_interval: Duration::from_millis(per_chat_ms),
            default_pause: Duration::from_secs(1),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn spaces_sends_globally_and_per_chat() {
        let inner = Arc::new(RecordingTransport::default());
        let throttled = ThrottledTransport::new(inner.clone(), gate(10, 1000));

        let msg = OutboundMessage::plain("hi");
        throttled.send(ConversationId(1), &msg).await.unwrap();
        throttled.send(ConversationId(2), &msg).await.unwrap();
        throttled.send(ConversationId(1), &msg).await.unwrap();

        let sent = inner.sent_at.lock().unwrap().clone();
        assert_eq!(sent.len(), 3);
        assert!(sent[1].1 - sent[0].1 >= Duration::from_millis(10));
        assert!(sent[1].1 - sent[0].1 < Duration::from_millis(1000));
        assert!(sent[2].1 - sent[0].1 >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn a_rate_limit_answer_pauses_every_chat() {
        let inner = Arc::new(RecordingTransport::default());
        inner
            .errors
            .lock()
            .unwrap()
            .push_back(SendError::new(Some(429), "Too Many Requests: retry after 5"));
        let gate = gate(0, 0);
        let throttled = ThrottledTransport::new(inner.clone(), gate.clone());

        let t0 = Instant::now();
        let msg = OutboundMessage::plain("hi");
        assert!(throttled.send(ConversationId(1), &msg).await.is_err());
        assert!(gate.paused_until().is_some());

        throttled.send(ConversationId(2), &msg).await.unwrap();
        let sent = inner.sent_at.lock().unwrap().clone();
        assert!(sent[1].1 - t0 >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn a_pause_set_elsewhere_holds_queued_sends() {
        let inner = Arc::new(RecordingTransport::default());
        let gate = gate(0, 0);
        let throttled = ThrottledTransport::new(inner.clone(), gate.clone());

        let t0 = Instant::now();
        gate.pause_for(Duration::from_secs(3));
        throttled
            .send(ConversationId(9), &OutboundMessage::plain("x"))
            .await
            .unwrap();

        let sent = inner.sent_at.lock().unwrap().clone();
        assert!(sent[0].1 - t0 >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_resume_stops_on_cancel() {
        let paused = gate(0, 0);
        paused.pause_for(Duration::from_secs(60));
        let stop = CancellationToken::new();
        stop.cancel();
        assert!(!paused.wait_resume(&stop).await);

        let idle = gate(0, 0);
        assert!(idle.wait_resume(&CancellationToken::new()).await);
    }
}
