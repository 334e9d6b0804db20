//! Retry scheduler: a time-ordered queue of delivery attempts.
//!
//! Scheduling is pure re-queuing; the scheduler never performs calls itself.
//! Delayed execution uses clock sleeps interruptible by new work and
//! shutdown, never thread-blocking waits. Attempts can be cancelled when
//! their triggering event is superseded; a cancelled attempt is discarded
//! silently and never reported to the circuit breaker.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use conflux_core::{now_utc, Clock, DedupeKey};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::outbound::OutboundRequest;

/// A pending outbound delivery owned by the scheduler.
///
/// Created by the event processor when an outbound call fails transiently;
/// owned here until terminal success, terminal failure, or cancellation.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    /// Dedupe key of the originating event, for record completion.
    pub key: DedupeKey,
    /// The outbound call to repeat.
    pub request: OutboundRequest,
    /// Attempt number this dispatch will perform (1-based; attempt 1 was
    /// the inline attempt at intake time).
    pub attempt_number: u32,
    /// When the attempt becomes due.
    pub scheduled_at: DateTime<Utc>,
    /// Error from the previous attempt.
    pub last_error: Option<String>,
}

/// Heap entry ordered by due time, FIFO within the same instant.
struct Entry {
    due: DateTime<Utc>,
    seq: u64,
    attempt: DeliveryAttempt,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert for earliest-due-first.
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct SchedulerState {
    heap: BinaryHeap<Entry>,
    cancelled: HashSet<String>,
    seq: u64,
}

/// Time-ordered work queue for delivery retries.
pub struct RetryScheduler {
    state: Mutex<SchedulerState>,
    notify: Notify,
    clock: Arc<dyn Clock>,
}

impl RetryScheduler {
    /// Idle wait between queue checks when nothing is due.
    const IDLE_POLL: Duration = Duration::from_millis(500);

    /// Creates an empty scheduler.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { state: Mutex::new(SchedulerState::default()), notify: Notify::new(), clock }
    }

    /// Enqueues an attempt at its `scheduled_at` time.
    pub async fn schedule(&self, attempt: DeliveryAttempt) {
        debug!(
            key = %attempt.key,
            attempt = attempt.attempt_number,
            due = %attempt.scheduled_at,
            "scheduling delivery attempt"
        );

        let mut state = self.state.lock().await;
        state.seq += 1;
        let entry = Entry { due: attempt.scheduled_at, seq: state.seq, attempt };
        state.heap.push(entry);
        drop(state);

        self.notify.notify_one();
    }

    /// Cancels every queued attempt with the given request fingerprint.
    ///
    /// Used when a newer event supersedes the one that triggered the
    /// attempt. Discarded attempts are not failures: the circuit breaker
    /// never hears about them.
    pub async fn cancel(&self, fingerprint: &str) {
        let mut state = self.state.lock().await;
        state.cancelled.insert(fingerprint.to_string());
    }

    /// Number of queued attempts, including not-yet-skipped cancelled ones.
    pub async fn pending(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    /// Due time of the earliest queued attempt.
    pub async fn next_due(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.heap.peek().map(|entry| entry.due)
    }

    /// Pops every attempt due at `now`, dropping cancelled ones.
    pub async fn pop_due(&self, now: DateTime<Utc>) -> Vec<DeliveryAttempt> {
        let mut state = self.state.lock().await;
        let mut due = Vec::new();

        while state.heap.peek().is_some_and(|entry| entry.due <= now) {
            let entry = state.heap.pop().expect("peeked entry exists");
            if state.cancelled.remove(&entry.attempt.request.fingerprint) {
                info!(
                    key = %entry.attempt.key,
                    fingerprint = %entry.attempt.request.fingerprint,
                    "discarding cancelled delivery attempt"
                );
                continue;
            }
            due.push(entry.attempt);
        }

        due
    }

    /// Feeds due attempts into `dispatch` until shutdown.
    ///
    /// Sleeps until the earliest due time, waking early when new work is
    /// scheduled. Exits when the dispatch channel closes or the token fires.
    pub async fn run(&self, dispatch: mpsc::Sender<DeliveryAttempt>, shutdown: CancellationToken) {
        info!("retry scheduler starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            for attempt in self.pop_due(now_utc(self.clock.as_ref())).await {
                if dispatch.send(attempt).await.is_err() {
                    info!("retry dispatch channel closed, scheduler stopping");
                    return;
                }
            }

            let wait = match self.next_due().await {
                Some(due) => {
                    let until = due - now_utc(self.clock.as_ref());
                    until.to_std().unwrap_or(Duration::ZERO).min(Self::IDLE_POLL)
                },
                None => Self::IDLE_POLL,
            };

            tokio::select! {
                () = self.clock.sleep(wait) => {},
                () = self.notify.notified() => {},
                () = shutdown.cancelled() => break,
            }
        }

        info!("retry scheduler stopped");
    }
}
