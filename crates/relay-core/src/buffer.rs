//! Per-conversation debounce buffer.
//!
//! Rapid successive fragments from one conversation are coalesced into a single
//! logical turn: every fragment pushes the deadline forward, and the flush
//! callback runs once the conversation has been quiet for `debounce`.
//!
//! At most one flush per conversation is in flight. Fragments arriving while a
//! flush runs start a new accumulation cycle; the running flush already owns
//! its snapshot. Idle buffers are evicted after `grace`.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{domain::ConversationId, Result};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Consumer of a flushed turn: `(conversation, fragments joined with "\n")`.
pub type FlushFn = Arc<dyn Fn(ConversationId, String) -> BoxFuture<Result<()>> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferConfig {
    /// Quiet period after the last fragment before a flush fires.
    pub debounce: Duration,
    /// How long an idle buffer is kept before it is evicted.
    pub grace: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(3),
            grace: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    Idle,
    Accumulating,
    Flushing,
}

#[derive(Clone, Copy, Debug)]
enum TimerKind {
    Flush,
    Evict,
}

/// Buffer of one conversation. Only ever touched under its own lock.
#[derive(Default)]
struct Slot {
    pending: Vec<String>,
    deadline: Option<Instant>,
    flushing: bool,
    evicted: bool,
    /// Bumped every time a timer is armed; a firing timer with an older
    /// generation is stale and does nothing.
    generation: u64,
    timer: Option<CancellationToken>,
}

impl Slot {
    fn rearm(&mut self) -> (u64, CancellationToken) {
        if let Some(old) = self.timer.take() {
            old.cancel();
        }
        self.generation += 1;
        let token = CancellationToken::new();
        self.timer = Some(token.clone());
        (self.generation, token)
    }

    fn begin_flush(&mut self) -> Vec<String> {
        self.flushing = true;
        self.deadline = None;
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        std::mem::take(&mut self.pending)
    }

    fn state(&self) -> BufferState {
        if self.flushing {
            BufferState::Flushing
        } else if self.pending.is_empty() {
            BufferState::Idle
        } else {
            BufferState::Accumulating
        }
    }
}

enum AfterFlush {
    Again(Vec<String>),
    Wait,
    Evict(u64, CancellationToken),
}

pub struct MessageBuffer {
    cfg: BufferConfig,
    flush: FlushFn,
    slots: Mutex<HashMap<ConversationId, Arc<Mutex<Slot>>>>,
}

impl MessageBuffer {
    pub fn new(cfg: BufferConfig, flush: FlushFn) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            flush,
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Buffer a fragment and (re)schedule the flush at `now + debounce`.
    ///
    /// Never suspends. Must be called from within a tokio runtime.
    pub fn append(self: &Arc<Self>, id: ConversationId, fragment: impl Into<String>, now: Instant) {
        let fragment = fragment.into();
        let deadline = now + self.cfg.debounce;

        loop {
            let slot = self.slot_for(id);
            let mut s = lock(&slot);
            if s.evicted {
                // Lost a race with eviction; the map now has (or will get) a fresh slot.
                continue;
            }

            s.pending.push(fragment);
            s.deadline = Some(deadline);
            let (generation, cancel) = s.rearm();
            let pending = s.pending.len();
            let flushing = s.flushing;
            drop(s);

            tracing::debug!(conversation_id = %id, pending, flushing, "fragment buffered");
            self.spawn_timer(id, TimerKind::Flush, generation, cancel, deadline);
            return;
        }
    }

    pub fn state(&self, id: ConversationId) -> Option<BufferState> {
        self.existing(id).map(|slot| {
            let s = lock(&slot);
            s.state()
        })
    }

    /// Fragments waiting for the next flush (not counting an in-flight one).
    pub fn pending_len(&self, id: ConversationId) -> usize {
        self.existing(id).map_or(0, |slot| {
            let s = lock(&slot);
            s.pending.len()
        })
    }

    /// Number of live (not evicted) buffers.
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot_for(&self, id: ConversationId) -> Arc<Mutex<Slot>> {
        let mut slots = lock(&self.slots);
        slots.entry(id).or_default().clone()
    }

    fn existing(&self, id: ConversationId) -> Option<Arc<Mutex<Slot>>> {
        lock(&self.slots).get(&id).cloned()
    }

    fn spawn_timer(
        self: &Arc<Self>,
        id: ConversationId,
        kind: TimerKind,
        generation: u64,
        cancel: CancellationToken,
        at: Instant,
    ) {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
              _ = cancel.cancelled() => {}
              _ = tokio::time::sleep_until(at) => match kind {
                TimerKind::Flush => buffer.on_deadline(id, generation).await,
                TimerKind::Evict => buffer.evict(id, generation),
              }
            }
        });
    }

    async fn on_deadline(self: &Arc<Self>, id: ConversationId, generation: u64) {
        let Some(slot) = self.existing(id) else {
            return;
        };

        let mut batch = {
            let mut s = lock(&slot);
            // A flush in progress picks up the new cycle when it completes.
            if s.generation != generation || s.flushing || s.pending.is_empty() {
                return;
            }
            s.begin_flush()
        };

        loop {
            let fragments = batch.len();
            let text = batch.join("\n");
            tracing::info!(conversation_id = %id, fragments, "flushing buffered turn");

            // Run on its own task so a panicking consumer cannot leave the
            // slot stuck in `flushing`. Flushed content is not re-queued.
            match tokio::spawn((self.flush)(id, text)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(conversation_id = %id, error = %e, "flush consumer failed")
                }
                Err(e) => {
                    tracing::error!(conversation_id = %id, error = %e, "flush consumer panicked")
                }
            }

            let next = {
                let mut s = lock(&slot);
                s.flushing = false;
                if s.pending.is_empty() {
                    let (generation, cancel) = s.rearm();
                    AfterFlush::Evict(generation, cancel)
                } else if s.deadline.is_some_and(|d| d <= Instant::now()) {
                    AfterFlush::Again(s.begin_flush())
                } else {
                    AfterFlush::Wait
                }
            };

            match next {
                AfterFlush::Again(b) => batch = b,
                AfterFlush::Wait => return,
                AfterFlush::Evict(generation, cancel) => {
                    let at = Instant::now() + self.cfg.grace;
                    self.spawn_timer(id, TimerKind::Evict, generation, cancel, at);
                    return;
                }
            }
        }
    }

    fn evict(&self, id: ConversationId, generation: u64) {
        let mut slots = lock(&self.slots);
        let Some(slot) = slots.get(&id).cloned() else {
            return;
        };

        let mut s = lock(&slot);
        if s.generation != generation || s.flushing || !s.pending.is_empty() {
            return;
        }
        s.evicted = true;
        drop(s);

        slots.remove(&id);
        tracing::debug!(conversation_id = %id, "idle buffer evicted");
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
