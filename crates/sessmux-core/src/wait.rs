//! Cooperative pause/resume gate
//!
//! A `WaitTokenSource` lets one coordinator hold many worker threads at a
//! barrier: `wait()` raises the gate, `continue_all()` drops it and wakes
//! every blocked token. Workers only ever observe the gate through tokens;
//! they cannot change its state.
//!
//! All flag transitions happen under the condition mutex so that a wakeup
//! always observes the transition that caused it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::trace;

struct Gate {
    lock: Mutex<()>,
    condition: Condvar,
}

/// Owner side of the pause gate.
pub struct WaitTokenSource {
    waiting: Arc<AtomicBool>,
    gate: Arc<Gate>,
}

impl WaitTokenSource {
    /// `start_waiting` raises the gate immediately, before any token exists.
    pub fn new(start_waiting: bool) -> Self {
        Self {
            waiting: Arc::new(AtomicBool::new(start_waiting)),
            gate: Arc::new(Gate {
                lock: Mutex::new(()),
                condition: Condvar::new(),
            }),
        }
    }

    /// Obtain a token observing this source. Copies are cheap; one per
    /// thread is the recommended usage.
    pub fn token(&self) -> WaitToken {
        WaitToken {
            waiting: Arc::downgrade(&self.waiting),
            gate: Arc::clone(&self.gate),
        }
    }

    #[inline]
    pub fn waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    /// Raise the gate. Returns `true` iff this call performed the
    /// `not-waiting -> waiting` transition.
    pub fn wait(&self) -> bool {
        let _guard = self
            .gate
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        self.waiting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drop the gate and wake every blocked token.
    ///
    /// `notify_all` is required: several polling threads may be parked on
    /// the condition at once. Returns `true` iff this call performed the
    /// `waiting -> not-waiting` transition.
    pub fn continue_all(&self) -> bool {
        let continuing = {
            let _guard = self
                .gate
                .lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            self.waiting
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        };

        if continuing {
            self.gate.condition.notify_all();
        }

        continuing
    }
}

impl Drop for WaitTokenSource {
    fn drop(&mut self) {
        // Never leave a token blocked behind a gate nobody can drop.
        self.continue_all();
    }
}

/// Worker side of the pause gate.
///
/// The lifetime of a token is independent of its source; once the source is
/// gone, `waiting()` reports `false` and every blocked call returns.
#[derive(Clone)]
pub struct WaitToken {
    waiting: Weak<AtomicBool>,
    gate: Arc<Gate>,
}

impl WaitToken {
    /// `true` while the parent source is in its waiting state.
    #[inline]
    pub fn waiting(&self) -> bool {
        match self.waiting.upgrade() {
            Some(flag) => flag.load(Ordering::Acquire),
            None => false,
        }
    }

    /// Block the caller until the source leaves its waiting state.
    ///
    /// Returns immediately when the gate is down. Spurious wakeups are
    /// absorbed by the predicate. `caller` only feeds the trace logs.
    pub fn wait_until_continue(&self, caller: &str) {
        let mut guard = self
            .gate
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        while self.waiting() {
            trace!(caller, "blocked waiting for continuation");
            guard = self
                .gate
                .condition
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait_until_continue`](Self::wait_until_continue) with a
    /// deadline. Returns `true` iff the source left its waiting state
    /// before `max_wait` elapsed.
    pub fn wait_until_continue_or_timeout(&self, caller: &str, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;

        let mut guard = self
            .gate
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        while self.waiting() {
            let now = Instant::now();
            if now >= deadline {
                trace!(caller, "timed out waiting for continuation");
                return false;
            }

            let (next, _timeout) = self
                .gate
                .condition
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_not_waiting_passes_through() {
        let source = WaitTokenSource::new(false);
        let token = source.token();

        assert!(!source.waiting());
        assert!(!token.waiting());

        // Must not block.
        token.wait_until_continue("test");
        assert!(token.wait_until_continue_or_timeout("test", Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_and_continue_transitions() {
        let source = WaitTokenSource::new(false);

        assert!(source.wait());
        assert!(!source.wait());
        assert!(source.waiting());

        assert!(source.continue_all());
        assert!(!source.continue_all());
        assert!(!source.waiting());
    }

    #[test]
    fn test_continue_wakes_all_waiters() {
        let source = WaitTokenSource::new(true);
        let (tx, rx) = mpsc::channel();

        let mut workers = Vec::new();
        for i in 0..4 {
            let token = source.token();
            let tx = tx.clone();
            workers.push(thread::spawn(move || {
                token.wait_until_continue(&format!("worker-{i}"));
                tx.send(i).unwrap();
            }));
        }

        // Nobody gets through while the gate is up.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        source.continue_all();

        for _ in 0..4 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn test_timeout_expires_while_waiting() {
        let source = WaitTokenSource::new(true);
        let token = source.token();

        assert!(!token.wait_until_continue_or_timeout("test", Duration::from_millis(50)));
        assert!(token.waiting());

        source.continue_all();
        assert!(token.wait_until_continue_or_timeout("test", Duration::from_millis(50)));
    }

    #[test]
    fn test_dropped_source_releases_waiters() {
        let source = WaitTokenSource::new(true);
        let token = source.token();

        let waiter = thread::spawn(move || {
            token.wait_until_continue("test");
        });

        thread::sleep(Duration::from_millis(50));
        drop(source);

        waiter.join().unwrap();
    }

    #[test]
    fn test_token_of_dropped_source_not_waiting() {
        let source = WaitTokenSource::new(true);
        let token = source.token();

        assert!(token.waiting());
        drop(source);
        assert!(!token.waiting());
    }
}
