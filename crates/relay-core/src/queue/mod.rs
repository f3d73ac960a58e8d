//! Durable, batching event queue.
//!
//! # Architecture
//!
//! ```text
//! add_event ──► context capture ──► buffer (VecDeque) ──► EventLog (durable)
//!                                       │
//!        threshold / timer / explicit ──┴──► flush ──► EventSender::send(batch)
//!                                                        │
//!                        Ok ─► evict from buffer + advance log watermark
//!                 Retryable ─► keep, back off before next automatic attempt
//!                  Rejected ─► discard batch
//! ```
//!
//! All buffer and log mutation happens under one mutex, and that mutex is
//! never held across the sender call. At most one flush is in flight; a
//! trigger that arrives meanwhile queues a follow-up pass instead of
//! starting a second upload.
//!
//! Delivery is at-least-once with stable ordering: if the process dies
//! between a successful send and the purge, the batch is replayed by
//! [`EventQueue::restore`] and sent again. Receivers deduplicate by
//! [`Event::id`].

pub mod backoff;
pub mod log;

pub use backoff::BackoffPolicy;
pub use log::EventLog;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::context::{self, ContextProvider};
use crate::error::SendError;
use crate::event::{Event, EventInfo};
use crate::storage::KeyValueStore;

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Uploads one batch of events. Wire format and timeouts belong to the
/// implementation; the queue only looks at success or failure.
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send(&self, batch: &[Event]) -> std::result::Result<(), SendError>;
}

/// Notified after every [`EventQueue::add_event`].
pub trait EventQueueObserver: Send + Sync {
    fn event_queue_did_add_event(&self, info: &EventInfo);
}

// ---------------------------------------------------------------------------
// Flush bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Buffered count reached `flush_at`.
    Threshold,
    /// Oldest buffered event aged past `flush_interval`, or a backoff expired.
    Timer,
    /// Caller asked for it. Ignores backoff.
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every pass ran to the end of its snapshot.
    Completed { delivered: usize, discarded: usize },
    /// A retryable send failure stopped the flush.
    Failed { delivered: usize },
    /// Nothing to send, or fewer events than the trigger requires.
    Skipped,
    /// Another flush is in flight; it will run a follow-up pass.
    Deferred,
    /// Automatic trigger arrived before the retry delay elapsed.
    BackingOff,
}

struct Pending {
    event: Event,
    /// `None` until the event has been written to the log.
    seq: Option<u64>,
    /// Position in arrival order; bounds threshold flushes.
    ordinal: u64,
    enqueued_at: Instant,
}

struct QueueState {
    buffer: VecDeque<Pending>,
    log: EventLog,
    flushing: bool,
    follow_up: bool,
    failures: u32,
    retry_at: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    next_ordinal: u64,
    /// Last ordinal already handed to a threshold flush.
    claimed: Option<u64>,
}

impl QueueState {
    fn take_ordinal(&mut self) -> u64 {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        ordinal
    }

    /// Buffered events up to and including `through` (all when `None`).
    fn eligible(&self, through: Option<u64>) -> usize {
        self.buffer
            .iter()
            .take_while(|p| through.map_or(true, |t| p.ordinal <= t))
            .count()
    }

    /// Write every not-yet-persisted event to the log, oldest first.
    ///
    /// Stops at the first failure so persisted events always form a prefix
    /// of the buffer and the log order matches the buffer order.
    fn persist_backlog(&mut self) {
        for pending in self.buffer.iter_mut().filter(|p| p.seq.is_none()) {
            match self.log.append(&pending.event) {
                Ok(seq) => pending.seq = Some(seq),
                Err(e) => {
                    warn!(event = %pending.event.name, error = %e, "Failed to persist event: keeping it in memory, will retry");
                    break;
                }
            }
        }
    }

    /// Move the log watermark up to the oldest event still buffered.
    fn sync_watermark(&mut self) {
        let target = match self.buffer.iter().find_map(|p| p.seq) {
            Some(seq) => seq,
            None => match self.log.next_seq() {
                Ok(next) => next,
                Err(e) => {
                    warn!(error = %e, "Failed to read event log position");
                    return;
                }
            },
        };
        if let Err(e) = self.log.purge_below(target) {
            warn!(error = %e, "Failed to purge delivered events from the event log");
        }
    }

    fn remove_ids(&mut self, ids: &HashSet<Uuid>) -> usize {
        let before = self.buffer.len();
        self.buffer.retain(|p| !ids.contains(&p.event.id));
        self.sync_watermark();
        before - self.buffer.len()
    }
}

/// Resets the in-flight flag if a flush is dropped or unwinds early.
struct FlushGuard<'a> {
    queue: &'a EventQueue,
    armed: bool,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.state().flushing = false;
            self.queue.shared.wake.notify_one();
        }
    }
}

// ---------------------------------------------------------------------------
// EventQueue
// ---------------------------------------------------------------------------

struct Shared {
    config: QueueConfig,
    sender: Arc<dyn EventSender>,
    state: Mutex<QueueState>,
    providers: RwLock<Vec<Arc<dyn ContextProvider>>>,
    observers: RwLock<Vec<Arc<dyn EventQueueObserver>>>,
    wake: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

/// Cheap to clone; clones share the same buffer and log.
#[derive(Clone)]
pub struct EventQueue {
    shared: Arc<Shared>,
}

impl EventQueue {
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn KeyValueStore>,
        sender: Arc<dyn EventSender>,
    ) -> Self {
        let state = QueueState {
            buffer: VecDeque::new(),
            log: EventLog::new(store),
            flushing: false,
            follow_up: false,
            failures: 0,
            retry_at: None,
            timer: None,
            next_ordinal: 0,
            claimed: None,
        };
        Self {
            shared: Arc::new(Shared {
                config,
                sender,
                state: Mutex::new(state),
                providers: RwLock::new(Vec::new()),
                observers: RwLock::new(Vec::new()),
                wake: Arc::new(Notify::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn add_context_provider(&self, provider: Arc<dyn ContextProvider>) {
        self.shared
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(provider);
    }

    pub fn add_observer(&self, observer: Arc<dyn EventQueueObserver>) {
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Load events left in the log by a previous process.
    ///
    /// Replayed events take their original order at the front of the buffer;
    /// anything added earlier in this process that never reached the log
    /// stays behind them. Returns the number of events restored.
    pub fn restore(&self) -> usize {
        debug!("Restoring events from the event log...");
        let mut st = self.state();
        let entries = match st.log.replay() {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "Failed to restore events from the event log");
                return 0;
            }
        };

        let now = Instant::now();
        let mut known: HashMap<Uuid, Instant> = st
            .buffer
            .iter()
            .map(|p| (p.event.id, p.enqueued_at))
            .collect();
        let mut restored = 0;
        let mut buffer: VecDeque<Pending> = entries
            .into_iter()
            .map(|(seq, event)| {
                let enqueued_at = known.remove(&event.id).unwrap_or_else(|| {
                    restored += 1;
                    now
                });
                Pending {
                    event,
                    seq: Some(seq),
                    ordinal: 0,
                    enqueued_at,
                }
            })
            .collect();
        // an append whose meta write failed is replayed from the log and
        // must not be carried over a second time
        let replayed: HashSet<Uuid> = buffer.iter().map(|p| p.event.id).collect();
        buffer.extend(
            st.buffer
                .drain(..)
                .filter(|p| p.seq.is_none() && !replayed.contains(&p.event.id)),
        );
        for pending in buffer.iter_mut() {
            pending.ordinal = st.take_ordinal();
        }
        st.buffer = buffer;
        st.claimed = None;
        st.persist_backlog();

        if restored == 0 {
            debug!("Event log is empty, no events to restore");
        } else {
            info!(count = restored, "Restored event(s) from the event log");
        }
        drop(st);
        self.shared.wake.notify_one();
        restored
    }

    /// Enqueue an event and write it to the log before returning.
    ///
    /// A failed log write is logged and retried on the next mutation; the
    /// event stays buffered either way. Every `flush_at` events not yet
    /// claimed by a threshold flush spawn one in the background (inside a
    /// Tokio runtime). That flush sends only the events buffered up to and
    /// including this one.
    pub fn add_event(&self, info: EventInfo) {
        let providers = self
            .shared
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let event = Event::from_info(&info, context::capture(&providers));

        let (len, claim) = {
            let mut st = self.state();
            if let Some(max) = self.shared.config.max_queue_size {
                while st.buffer.len() >= max.max(1) {
                    if let Some(oldest) = st.buffer.pop_front() {
                        warn!(capacity = max, event = %oldest.event.name, "Event queue is at capacity: removing oldest event");
                    }
                    st.sync_watermark();
                }
            }
            let ordinal = st.take_ordinal();
            st.buffer.push_back(Pending {
                event,
                seq: None,
                ordinal,
                enqueued_at: Instant::now(),
            });
            st.persist_backlog();

            let claimed = st.claimed;
            let unclaimed = st
                .buffer
                .iter()
                .rev()
                .take_while(|p| claimed.map_or(true, |c| p.ordinal > c))
                .count();
            let claim = if unclaimed >= self.shared.config.flush_at.max(1) {
                st.claimed = Some(ordinal);
                Some(ordinal)
            } else {
                None
            };
            (st.buffer.len(), claim)
        };
        debug!(event = %info.name, count = len, "Added event to queue");
        self.shared.wake.notify_one();

        let observers = self
            .shared
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in &observers {
            observer.event_queue_did_add_event(&info);
        }

        if let Some(through) = claim {
            self.spawn_flush(FlushTrigger::Threshold, Some(through));
        }
    }

    /// Discard every buffered and persisted event.
    pub fn clear(&self) {
        let mut st = self.state();
        let count = st.buffer.len();
        st.buffer.clear();
        st.claimed = None;
        if let Err(e) = st.log.clear() {
            warn!(error = %e, "Failed to clear the event log");
        }
        st.failures = 0;
        st.retry_at = None;
        drop(st);
        info!(count, "Cleared event queue");
        self.shared.wake.notify_one();
    }

    /// Deliver everything currently buffered, ignoring any backoff.
    ///
    /// If another flush is already in flight this returns
    /// [`FlushOutcome::Deferred`] at once. The in-flight flush runs a
    /// follow-up pass only if its own pass succeeds; after a retryable
    /// failure the deferred events wait for the next trigger, so `Deferred`
    /// does not mean they were delivered.
    pub async fn flush(&self) -> FlushOutcome {
        self.run_flush(FlushTrigger::Explicit, None).await
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.state().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of buffered events in delivery order.
    pub fn pending(&self) -> Vec<Event> {
        self.state().buffer.iter().map(|p| p.event.clone()).collect()
    }

    /// Consecutive retryable send failures since the last success.
    pub fn failures(&self) -> u32 {
        self.state().failures
    }

    /// When the next automatic attempt may run after a failure.
    pub fn retry_at(&self) -> Option<Instant> {
        self.state().retry_at
    }

    /// Wait for every background flush spawned so far to finish.
    pub async fn settle(&self) {
        loop {
            let handles = std::mem::take(
                &mut *self
                    .shared
                    .tasks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Timer
    // -----------------------------------------------------------------------

    /// Start the time-based trigger. Call when the host becomes active.
    pub fn start_timer(&self) {
        let Some(interval) = self.shared.config.flush_interval() else {
            debug!("Flush interval is 0: timer disabled");
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("start_timer called outside a Tokio runtime: timer not started");
            return;
        }
        let handle = tokio::spawn(timer_loop(
            Arc::downgrade(&self.shared),
            self.shared.wake.clone(),
            interval,
        ));
        if let Some(previous) = self.state().timer.replace(handle) {
            previous.abort();
        }
        debug!(interval_secs = interval.as_secs_f64(), "Started flush timer");
    }

    /// Stop the time-based trigger. Call when the host resigns active.
    pub fn stop_timer(&self) {
        if let Some(timer) = self.state().timer.take() {
            timer.abort();
            debug!("Stopped flush timer");
        }
    }

    fn next_deadline(&self, interval: Duration) -> Option<Instant> {
        let st = self.state();
        if st.flushing {
            return None;
        }
        let due = st.buffer.front()?.enqueued_at.checked_add(interval)?;
        Some(match st.retry_at {
            Some(retry_at) if retry_at > due => retry_at,
            _ => due,
        })
    }

    // -----------------------------------------------------------------------
    // Flushing
    // -----------------------------------------------------------------------

    fn spawn_flush(&self, trigger: FlushTrigger, through: Option<u64>) {
        if tokio::runtime::Handle::try_current().is_err() {
            debug!(?trigger, "No Tokio runtime: leaving flush to the next explicit call");
            return;
        }
        let queue = self.clone();
        let handle = tokio::spawn(async move {
            queue.run_flush(trigger, through).await;
        });
        let mut tasks = self
            .shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// `through` limits the first pass to events up to that ordinal;
    /// follow-up passes take the whole buffer.
    async fn run_flush(&self, trigger: FlushTrigger, through: Option<u64>) -> FlushOutcome {
        {
            let mut st = self.state();
            if st.flushing {
                st.follow_up = true;
                debug!(?trigger, "Skipping flush: already in progress, follow-up queued");
                return FlushOutcome::Deferred;
            }
            if trigger != FlushTrigger::Explicit {
                if let Some(retry_at) = st.retry_at {
                    if Instant::now() < retry_at {
                        debug!(?trigger, "Skipping flush: backing off after a failed upload");
                        return FlushOutcome::BackingOff;
                    }
                }
            }
            let min_batch = match trigger {
                FlushTrigger::Threshold => self.shared.config.flush_at.max(1),
                FlushTrigger::Timer | FlushTrigger::Explicit => 1,
            };
            let eligible = st.eligible(through);
            if eligible == 0 {
                debug!(?trigger, "Skipping flush: no events in the queue");
                return FlushOutcome::Skipped;
            }
            if eligible < min_batch {
                debug!(?trigger, min_batch, "Skipping flush: too few events in the queue");
                return FlushOutcome::Skipped;
            }
            st.flushing = true;
        }

        let mut guard = FlushGuard {
            queue: self,
            armed: true,
        };
        let mut delivered = 0;
        let mut discarded = 0;
        let mut through = through;

        loop {
            if !self.flush_pass(through, &mut delivered, &mut discarded).await {
                return FlushOutcome::Failed { delivered };
            }
            let mut st = self.state();
            if st.follow_up && !st.buffer.is_empty() {
                st.follow_up = false;
                through = None;
                debug!("Running queued follow-up flush");
                continue;
            }
            st.follow_up = false;
            st.flushing = false;
            guard.armed = false;
            drop(st);
            self.shared.wake.notify_one();
            return FlushOutcome::Completed {
                delivered,
                discarded,
            };
        }
    }

    /// Send the events buffered at the start of the pass (up to `through`),
    /// in order, in batches of at most `max_batch_size`. Returns `false` on a
    /// retryable failure.
    async fn flush_pass(
        &self,
        through: Option<u64>,
        delivered: &mut usize,
        discarded: &mut usize,
    ) -> bool {
        let max_batch = self.shared.config.max_batch_size.max(1);
        let mut remaining = {
            let mut st = self.state();
            st.persist_backlog();
            st.eligible(through)
        };

        while remaining > 0 {
            let batch: Vec<Event> = {
                let st = self.state();
                st.buffer
                    .iter()
                    .take_while(|p| through.map_or(true, |t| p.ordinal <= t))
                    .take(max_batch.min(remaining))
                    .map(|p| p.event.clone())
                    .collect()
            };
            if batch.is_empty() {
                break;
            }
            remaining = remaining.saturating_sub(batch.len());
            debug!(count = batch.len(), "Uploading event(s)");

            let result = self.shared.sender.send(&batch).await;
            let ids: HashSet<Uuid> = batch.iter().map(|e| e.id).collect();

            let mut st = self.state();
            match result {
                Ok(()) => {
                    st.remove_ids(&ids);
                    st.failures = 0;
                    st.retry_at = None;
                    *delivered += batch.len();
                    info!(count = batch.len(), queued = st.buffer.len(), "Successfully uploaded event(s)");
                }
                Err(e) if e.is_retryable() => {
                    let delay = self.shared.config.backoff.policy().next(st.failures);
                    st.failures = st.failures.saturating_add(1);
                    st.retry_at = Some(Instant::now() + delay);
                    warn!(
                        error = %e,
                        attempt = st.failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to upload events: will retry"
                    );
                    return false;
                }
                Err(e) => {
                    let removed = st.remove_ids(&ids);
                    *discarded += removed;
                    error!(error = %e, count = removed, "Upload rejected: discarding events");
                }
            }
        }
        true
    }
}

async fn timer_loop(shared: Weak<Shared>, wake: Arc<Notify>, interval: Duration) {
    loop {
        let deadline = match shared.upgrade() {
            Some(shared) => EventQueue { shared }.next_deadline(interval),
            None => return,
        };
        match deadline {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {
                        let Some(shared) = shared.upgrade() else { return };
                        EventQueue { shared }.run_flush(FlushTrigger::Timer, None).await;
                    }
                    _ = wake.notified() => {}
                }
            }
            None => wake.notified().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
