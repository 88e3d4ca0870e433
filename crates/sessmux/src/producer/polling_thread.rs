//! Per-thread record of the event-array producer
//!
//! A polling thread owns a contiguous window of the shared sessions
//! vector and waits on the corresponding socket events. The record holds
//! everything the coordinator and the thread use to talk to each other:
//! the window, the shared pause token and abort event, the thread's join
//! event, and a per-thread cancellation source that retires just this
//! thread without touching the rest of the pool.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;

use tracing::error;

use sessmux_core::{CancellationSource, WaitToken};

use crate::sys::windows::{ManualResetEvent, RawEventHandle};

pub(crate) struct PollingThread {
    id: u32,

    /// Start of this thread's window into the shared sessions vector.
    /// Written only by the coordinator while the thread is paused.
    group_offset: AtomicUsize,

    /// Length of the window. Same write discipline as `group_offset`.
    socket_count: AtomicUsize,

    wait_token: WaitToken,

    /// Shared abort event, slot 0 of the thread's wait array.
    abort_event: RawEventHandle,

    /// Raised by the thread to acknowledge pause and resume points (and
    /// its exit); reset only by the coordinator.
    join_event: ManualResetEvent,
    join_event_set: AtomicBool,

    thread_exited: AtomicBool,

    /// Retires this thread alone; the producer-wide source stops everyone.
    cancellation: CancellationSource,

    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PollingThread {
    pub(crate) fn new(
        id: u32,
        group_offset: usize,
        socket_count: usize,
        wait_token: WaitToken,
        abort_event: RawEventHandle,
    ) -> io::Result<Self> {
        Ok(Self {
            id,
            group_offset: AtomicUsize::new(group_offset),
            socket_count: AtomicUsize::new(socket_count),
            wait_token,
            abort_event,
            join_event: ManualResetEvent::new()?,
            join_event_set: AtomicBool::new(false),
            thread_exited: AtomicBool::new(false),
            cancellation: CancellationSource::new(),
            handle: Mutex::new(None),
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub(crate) fn group_offset(&self) -> usize {
        self.group_offset.load(Ordering::Acquire)
    }

    pub(crate) fn set_group_offset(&self, offset: usize) {
        self.group_offset.store(offset, Ordering::Release);
    }

    #[inline]
    pub(crate) fn socket_count(&self) -> usize {
        self.socket_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_socket_count(&self, count: usize) {
        self.socket_count.store(count, Ordering::Release);
    }

    pub(crate) fn wait_token(&self) -> &WaitToken {
        &self.wait_token
    }

    pub(crate) fn abort_event(&self) -> RawEventHandle {
        self.abort_event
    }

    pub(crate) fn join_event_handle(&self) -> RawEventHandle {
        self.join_event.handle()
    }

    /// Signal the join event. Returns `true` when the event is set after
    /// the call — including when it already was; `false` only on OS
    /// failure, which leaves the flag untouched.
    pub(crate) fn set_join_event(&self) -> bool {
        if self
            .join_event_set
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return true;
        }

        if !self.join_event.set() {
            error!(
                thread = self.id,
                "failed to set the polling thread's join event"
            );
            self.join_event_set.store(false, Ordering::Release);
            return false;
        }

        true
    }

    /// Reset the join event; coordinator-only. Same contract as
    /// [`set_join_event`](Self::set_join_event).
    pub(crate) fn reset_join_event(&self) -> bool {
        if self
            .join_event_set
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return true;
        }

        if !self.join_event.reset() {
            error!(
                thread = self.id,
                "failed to reset the polling thread's join event"
            );
            self.join_event_set.store(true, Ordering::Release);
            return false;
        }

        true
    }

    #[inline]
    pub(crate) fn is_join_event_set(&self) -> bool {
        self.join_event_set.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn thread_exited(&self) -> bool {
        self.thread_exited.load(Ordering::Acquire)
    }

    /// Mark this thread as exited. Returns `true` iff this call performed
    /// the transition.
    pub(crate) fn set_thread_exited(&self) -> bool {
        self.thread_exited
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn cancelled(&self) -> bool {
        self.cancellation.cancelled()
    }

    pub(crate) fn cancel(&self) -> bool {
        self.cancellation.cancel()
    }

    pub(crate) fn attach(&self, handle: JoinHandle<()>) {
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Take the OS thread handle, leaving the record without one. The
    /// record's lifetime and the thread's are independent.
    pub(crate) fn detach(&self) -> Option<JoinHandle<()>> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Display for PollingThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{id: {}, offset: {}, sockets: {}, waiting: {}, cancelled: {}}}",
            self.id,
            self.group_offset(),
            self.socket_count(),
            self.wait_token.waiting(),
            self.cancelled(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessmux_core::WaitTokenSource;

    // A plain kernel event stands in for the WSA abort event; the record
    // never cares which kind it waits on, and WSA events would need the
    // socket subsystem initialized.
    fn polling_thread(abort: &ManualResetEvent) -> PollingThread {
        let gate = WaitTokenSource::new(false);
        PollingThread::new(1, 0, 0, gate.token(), abort.handle()).unwrap()
    }

    #[test]
    fn test_join_event_set_reset_round_trip() {
        let abort = ManualResetEvent::new().unwrap();
        let thread = polling_thread(&abort);

        assert!(!thread.is_join_event_set());

        assert!(thread.set_join_event());
        assert!(thread.is_join_event_set());
        // Setting an already-set event succeeds without touching the OS.
        assert!(thread.set_join_event());

        assert!(thread.reset_join_event());
        assert!(!thread.is_join_event_set());
        assert!(thread.reset_join_event());
    }

    #[test]
    fn test_thread_exited_reports_unique_transition() {
        let abort = ManualResetEvent::new().unwrap();
        let thread = polling_thread(&abort);

        assert!(!thread.thread_exited());
        assert!(thread.set_thread_exited());
        assert!(thread.thread_exited());
        assert!(!thread.set_thread_exited());
    }

    #[test]
    fn test_window_updates() {
        let abort = ManualResetEvent::new().unwrap();
        let thread = polling_thread(&abort);

        thread.set_group_offset(14);
        thread.set_socket_count(6);

        assert_eq!(thread.group_offset(), 14);
        assert_eq!(thread.socket_count(), 6);
    }
}
