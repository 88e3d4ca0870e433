//! Cancellation source and token for cooperative shutdown
//!
//! A `CancellationSource` owns the cancelled flag; the cheap tokens it hands
//! out can be cloned freely and passed to worker threads, which check them at
//! their iteration boundaries and exit gracefully.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// One-shot cancellation switch.
///
/// `cancel()` flips the flag exactly once; the transition is irreversible.
/// Components that own a source typically also guard their `start()` with it
/// so that a stopped component cannot be restarted.
pub struct CancellationSource {
    cancelled: Arc<AtomicBool>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation.
    ///
    /// Returns `true` iff this call performed the `false -> true` transition.
    /// Subsequent calls return `false`.
    pub fn cancel(&self) -> bool {
        self.cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Check whether cancellation was requested.
    #[inline]
    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Obtain a token observing this source.
    ///
    /// Tokens hold only a weak reference; they never keep the source alive.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            cancelled: Arc::downgrade(&self.cancelled),
        }
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSource")
            .field("cancelled", &self.cancelled())
            .finish()
    }
}

/// Read-only view of a [`CancellationSource`].
///
/// The lifetime of a token is independent of its source. A token that
/// outlives its source reports cancelled: a task whose owner is gone has
/// nothing left to run for.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Weak<AtomicBool>,
}

impl CancellationToken {
    /// `true` when the source was cancelled or has been dropped.
    #[inline]
    pub fn cancelled(&self) -> bool {
        match self.cancelled.upgrade() {
            Some(flag) => flag.load(Ordering::Acquire),
            None => true,
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_cancellation() {
        let source = CancellationSource::new();
        let token = source.token();

        assert!(!source.cancelled());
        assert!(!token.cancelled());

        assert!(source.cancel());

        assert!(source.cancelled());
        assert!(token.cancelled());
    }

    #[test]
    fn test_cancel_reports_unique_transition() {
        let source = CancellationSource::new();

        assert!(source.cancel());
        assert!(!source.cancel());
        assert!(!source.cancel());
    }

    #[test]
    fn test_dropped_source_means_cancelled() {
        let source = CancellationSource::new();
        let token = source.token();

        assert!(!token.cancelled());
        drop(source);
        assert!(token.cancelled());
    }

    #[test]
    fn test_tokens_share_state() {
        let source = CancellationSource::new();
        let token1 = source.token();
        let token2 = token1.clone();

        source.cancel();
        assert!(token1.cancelled());
        assert!(token2.cancelled());
    }

    #[test]
    fn test_cancel_visible_across_threads() {
        let source = CancellationSource::new();
        let token = source.token();

        let waiter = std::thread::spawn(move || {
            while !token.cancelled() {
                std::thread::yield_now();
            }
        });

        source.cancel();
        waiter.join().unwrap();
    }
}
