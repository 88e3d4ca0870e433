//! Blocking MPMC queue with configurable drain-after-stop semantics
//!
//! Producers enqueue until the queue is stopped or its owner's cancellation
//! token fires; consumers either poll with `try_take` or park in
//! `wait_and_take`. Whether items still in the queue may be consumed after
//! stop/cancellation is a per-queue policy: handlers that must finish
//! already-accepted work drain, everything else discards.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, Once, PoisonError};

use tracing::{debug, info};

use crate::cancel::CancellationToken;

/// Thread-safe blocking queue.
///
/// No operation fails other than by returning `false`/`None`; in
/// particular, enqueueing on a stopped queue is silently rejected.
pub struct BlockingQueue<T> {
    name: String,

    cancellation: CancellationToken,

    /// Whether items may still be taken once stopped/cancelled.
    drain_after_stop: bool,

    stopped: AtomicBool,

    items: Mutex<VecDeque<T>>,
    available: Condvar,

    drain_notice: Once,
    stop_notice: Once,
}

impl<T> BlockingQueue<T> {
    /// `name` feeds the log lines only. `cancellation` is observed, not
    /// owned: when the owning component cancels, the queue finishes too.
    pub fn new(
        name: impl Into<String>,
        cancellation: CancellationToken,
        drain_after_stop: bool,
    ) -> Self {
        let name = name.into();
        debug!(queue = %name, drain_after_stop, "queue created");

        Self {
            name,
            cancellation,
            drain_after_stop,
            stopped: AtomicBool::new(false),
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            drain_notice: Once::new(),
            stop_notice: Once::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    #[inline]
    pub fn cancelled(&self) -> bool {
        self.cancellation.cancelled()
    }

    /// Stopped or cancelled; either way no new items are accepted.
    #[inline]
    fn finished(&self) -> bool {
        self.cancelled() || self.stopped()
    }

    /// Whether a finished queue still serves its backlog. Logs the drain
    /// notice the first time it matters.
    fn proceed_to_take(&self) -> bool {
        if !self.finished() {
            return true;
        }

        if !self.drain_after_stop {
            return false;
        }

        self.drain_notice.call_once(|| {
            info!(
                queue = %self.name,
                "stop/cancellation detected; no further enqueues, draining remaining items"
            );
        });

        true
    }

    /// Queue one item. Returns `false` once the queue is finished.
    pub fn enqueue(&self, item: T) -> bool {
        if self.finished() {
            return false;
        }

        {
            let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            items.push_back(item);
        }

        self.available.notify_one();

        true
    }

    /// Queue several items at once. Returns `false` once the queue is
    /// finished; on success every waiting consumer is woken.
    pub fn enqueue_many(&self, batch: impl IntoIterator<Item = T>) -> bool {
        if self.finished() {
            return false;
        }

        {
            let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            items.extend(batch);
        }

        self.available.notify_all();

        true
    }

    /// Non-blocking take.
    pub fn try_take(&self) -> Option<T> {
        if !self.proceed_to_take() {
            return None;
        }

        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);

        items.pop_front()
    }

    /// Blocking take.
    ///
    /// Parks until an item is available or the queue finishes. When the
    /// queue is finished and empty (or draining is off), calls [`stop`]
    /// so every sibling waiter is released, then returns `None`.
    ///
    /// [`stop`]: Self::stop
    pub fn wait_and_take(&self) -> Option<T> {
        if !self.proceed_to_take() {
            return None;
        }

        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);

        while items.is_empty() && !self.finished() {
            items = self
                .available
                .wait(items)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if self.finished() && (!self.proceed_to_take() || items.is_empty()) {
            drop(items);
            self.stop();
            return None;
        }

        items.pop_front()
    }

    /// Empty the queue without stopping it.
    pub fn clear(&self) {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.clear();
    }

    /// Current number of queued items. Takes the queue lock.
    pub fn len(&self) -> usize {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the queue and release every parked `wait_and_take`. Idempotent;
    /// a stopped queue cannot be restarted.
    pub fn stop(&self) {
        self.stop_notice.call_once(|| {
            self.stopped.store(true, Ordering::Release);

            // One waiter taking the last item is not enough; everyone
            // parked behind it has to observe the stop too.
            self.available.notify_all();

            info!(
                queue = %self.name,
                cancelled = self.cancelled(),
                drain_after_stop = self.drain_after_stop,
                "queue stopped"
            );
        });
    }
}
