//! Event-array event producer (WSA)
//!
//! This platform waits on arrays of kernel event objects, at most 64 per
//! call, so monitoring N sockets takes a pool of polling threads, each
//! owning a contiguous window of the shared sessions vector. Slot 0 of
//! every thread's wait array is the shared abort event: the coordinator
//! signals it to pull every thread out of its OS wait at once.
//!
//! Re-partitioning the windows while events keep arriving is the delicate
//! part. `update_sessions` runs a 7-step pause/resume protocol:
//!
//! 1. Raise the pause gate, then set the abort event to unblock threads
//!    waiting for socket I/O.
//! 2. Wait for every thread's join event — the pause acknowledgement.
//! 3. Mutate the registry: drop closed or no-longer-connected sessions,
//!    append new ones.
//! 4. Recompute the per-thread windows.
//! 5. Retire excess threads (sessions disconnected).
//! 6. Update the surviving threads' windows and reset their join events;
//!    create new threads for any shortfall.
//! 7. Reset the abort event, drop the pause gate, and wait for the join
//!    events again to confirm every thread observed the wake.
//!
//! Between steps 2 and 7, no thread reads the sessions vector or sits in
//! the network-event enumeration; all mutation happens on the coordinator.
//!
//! Ground rules: the abort event is set and reset only by the coordinator;
//! a join event is set only by its polling thread and reset only by the
//! coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::thread;

use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use sessmux_core::{CancellationSource, CancellationToken, WaitTokenSource};

use crate::config::ProducerConfig;
use crate::enums::SessionConnectionState;
use crate::error::{ProducerError, ProducerResult};
use crate::event::{ClosedEvent, ClosedEventHandler, ReadEvent, ReadEventHandler};
use crate::fanout::EventFanout;
use crate::info::SessionInfo;
use crate::producer::partition;
use crate::producer::polling_thread::PollingThread;
use crate::producer::SessionEventProducer;
use crate::session::INVALID_SOCKET_ID;
use crate::sys::windows::{
    enumerate_network_events, is_not_a_socket, wait_for_event_handles, wait_for_wsa_events,
    NetworkEvents, RawEventHandle, WaitOutcome, WsaEvent,
};

/// Bound on one OS wait, so cancellation and pause requests are observed
/// within it.
const LISTENER_IO_WAIT_TIMEOUT_MS: u32 = 100;

/// Bound on one join-event wait by the coordinator.
const POLLING_THREAD_JOIN_TIMEOUT_MS: u32 = 100;

/// Consecutive join-wait timeouts tolerated before the protocol is
/// declared broken.
const JOIN_WAIT_MAX_ATTEMPTS: u32 = 100;

struct Shared {
    name: String,

    /// The shared registry. Each polling thread reads only its own
    /// `[offset, offset + count)` window, and only while un-paused.
    sessions: Mutex<Vec<Arc<SessionInfo>>>,

    fanout: EventFanout,

    /// The pause gate of the update protocol.
    wait_token_source: WaitTokenSource,

    /// Slot 0 of every thread's wait array; created at start.
    abort_event: OnceLock<WsaEvent>,

    /// Coordinator-side shadow of the abort event's state, so threads can
    /// tell an abort-timeout from an idle one without an extra OS call.
    abort_event_set: AtomicBool,
}

struct Pool {
    threads: Vec<Arc<PollingThread>>,
    next_thread_id: u32,
}

/// The event-array producer.
pub struct EventArrayProducer {
    shared: Arc<Shared>,

    config: ProducerConfig,

    started: AtomicBool,

    cancellation: CancellationSource,

    /// Guards start/stop/update transitions and owns the thread pool.
    start_stop: Mutex<Pool>,
}

impl EventArrayProducer {
    pub fn new(name: impl Into<String>, config: ProducerConfig) -> Self {
        let name = name.into();
        let config = config.clamped();

        info!(
            producer = %name,
            minimum_polling_threads = config.minimum_polling_threads,
            maximum_events_per_polling_thread = config.maximum_events_per_polling_thread,
            "creating event-array producer"
        );

        Self {
            shared: Arc::new(Shared {
                fanout: EventFanout::new(name.clone()),
                name,
                sessions: Mutex::new(Vec::new()),
                wait_token_source: WaitTokenSource::new(false),
                abort_event: OnceLock::new(),
                abort_event_set: AtomicBool::new(false),
            }),
            config,
            started: AtomicBool::new(false),
            cancellation: CancellationSource::new(),
            start_stop: Mutex::new(Pool {
                threads: Vec::new(),
                next_thread_id: 1,
            }),
        }
    }

    fn spawn_polling_thread(
        &self,
        id: u32,
        group_offset: usize,
        socket_count: usize,
    ) -> ProducerResult<Arc<PollingThread>> {
        let Some(abort_event) = self.shared.abort_event.get() else {
            return Err(ProducerError::Protocol(
                "abort event must exist before polling threads".into(),
            ));
        };

        let thread = PollingThread::new(
            id,
            group_offset,
            socket_count,
            self.shared.wait_token_source.token(),
            abort_event.handle(),
        )
        .map(Arc::new)
        .map_err(|source| ProducerError::Os {
            operation: "create join event",
            source,
        })?;

        let shared = Arc::clone(&self.shared);
        let cancellation = self.cancellation.token();
        let worker = Arc::clone(&thread);

        let handle = thread::Builder::new()
            .name(format!("{}-poll-{}", self.shared.name, id))
            .spawn(move || listen_and_produce_events(shared, cancellation, worker))
            .map_err(|source| ProducerError::Os {
                operation: "spawn polling thread",
                source,
            })?;

        thread.attach(handle);

        Ok(thread)
    }

    /// Signal the abort event. Returns `true` when it is set afterwards —
    /// including when it already was.
    fn set_abort_io_wait_event(&self) -> bool {
        let Some(event) = self.shared.abort_event.get() else {
            return false;
        };

        if self
            .shared
            .abort_event_set
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return true;
        }

        if !event.set() {
            error!(producer = %self.shared.name, "failed to set the abort-IO-wait event");
            self.shared.abort_event_set.store(false, Ordering::Release);
            return false;
        }

        true
    }

    /// Reset the abort event. Same contract as
    /// [`set_abort_io_wait_event`](Self::set_abort_io_wait_event).
    fn reset_abort_io_wait_event(&self) -> bool {
        let Some(event) = self.shared.abort_event.get() else {
            return false;
        };

        if self
            .shared
            .abort_event_set
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return true;
        }

        if !event.reset() {
            error!(producer = %self.shared.name, "failed to reset the abort-IO-wait event");
            self.shared.abort_event_set.store(true, Ordering::Release);
            return false;
        }

        true
    }
}

impl SessionEventProducer for EventArrayProducer {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn start(&self) -> ProducerResult<bool> {
        let mut pool = self
            .start_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        info!(producer = %self.shared.name, "starting");

        if self.cancellation.cancelled() {
            return Err(ProducerError::Stopped {
                name: self.shared.name.clone(),
            });
        }

        if self.started.load(Ordering::Acquire) {
            return Ok(false);
        }

        if self.shared.abort_event.get().is_none() {
            let event = WsaEvent::new().map_err(|source| ProducerError::Os {
                operation: "create abort-IO-wait event",
                source,
            })?;
            let _ = self.shared.abort_event.set(event);
        }

        for _ in 0..self.config.minimum_polling_threads {
            let id = pool.next_thread_id;
            pool.next_thread_id += 1;

            let thread = self.spawn_polling_thread(id, 0, 0)?;
            pool.threads.push(thread);
        }

        // Consume the first-run sync acknowledgements. Join events left
        // set here would let the first update's pause wait pass before
        // the threads have actually paused.
        wait_for_all_join_events(&self.shared.name, &pool.threads)?;
        for thread in &pool.threads {
            thread.reset_join_event();
        }

        self.started.store(true, Ordering::Release);

        info!(producer = %self.shared.name, "started");

        Ok(true)
    }

    fn stop(&self) -> bool {
        if !self.started.load(Ordering::Acquire) || self.cancellation.cancelled() {
            return false;
        }

        self.started.store(false, Ordering::Release);
        self.cancellation.cancel();

        let mut pool = self
            .start_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        info!(producer = %self.shared.name, "stopping");

        for thread in &pool.threads {
            thread.cancel();
        }

        // Unblock every thread from its socket I/O wait, then collect them.
        if self.set_abort_io_wait_event() {
            for thread in &pool.threads {
                if let Some(handle) = thread.detach() {
                    let _ = handle.join();
                }
            }
        } else {
            error!(
                producer = %self.shared.name,
                "failed to set the abort event on stop"
            );
        }

        pool.threads.clear();

        self.shared
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        info!(producer = %self.shared.name, "stopped");

        true
    }

    fn started(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.cancellation.cancelled()
    }

    fn can_start(&self) -> bool {
        !self.started.load(Ordering::Acquire) && !self.cancellation.cancelled()
    }

    fn update_sessions(
        &self,
        new: Vec<Arc<SessionInfo>>,
        closed: Vec<Arc<SessionInfo>>,
    ) -> ProducerResult<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(if self.cancellation.cancelled() {
                ProducerError::Stopped {
                    name: self.shared.name.clone(),
                }
            } else {
                ProducerError::NotStarted {
                    name: self.shared.name.clone(),
                }
            });
        }

        // A stop racing in: the registry is about to be cleared anyway.
        if self.cancellation.cancelled() {
            return Ok(());
        }

        let mut pool = self
            .start_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Step 1: signal pause, then unblock threads waiting for socket
        // I/O so they can observe it.
        self.shared.wait_token_source.wait();

        if !self.set_abort_io_wait_event() {
            return Err(ProducerError::Protocol(
                "failed to set the abort-IO-wait event for pausing threads".into(),
            ));
        }

        // Step 2: wait for every thread to acknowledge the pause.
        wait_for_all_join_events(&self.shared.name, &pool.threads)?;

        // Step 3: every thread is out of the vector now; mutate it.
        let total_sessions = {
            let mut sessions = self
                .shared
                .sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            sessions.retain(|session| {
                let keep = session.connection_state() == SessionConnectionState::Connected
                    && !closed.iter().any(|c| c.id() == session.id());
                if !keep {
                    debug!(
                        producer = %self.shared.name,
                        session = %session,
                        "erased from registry"
                    );
                }
                keep
            });

            for session in new {
                debug!(producer = %self.shared.name, session = %session, "added session");
                sessions.push(session);
            }

            sessions.len()
        };

        // Step 4: recompute the windows.
        let sizes = partition::polling_group_sizes(
            total_sessions,
            self.config.maximum_events_per_polling_thread,
            self.config.minimum_polling_threads,
        );
        let offsets = partition::group_offsets(&sizes);

        // Step 5: drop threads that died on a wait failure, then any
        // excess ones. Retired threads wake at step 7, observe their
        // cancellation and exit; the detached handle is independent of
        // the OS thread's lifetime.
        pool.threads.retain(|thread| {
            if thread.thread_exited() {
                warn!(
                    producer = %self.shared.name,
                    thread = %thread,
                    "dropping exited polling thread"
                );
                thread.cancel();
                drop(thread.detach());
                return false;
            }
            true
        });

        while pool.threads.len() > sizes.len() {
            if let Some(thread) = pool.threads.pop() {
                debug!(producer = %self.shared.name, thread = %thread, "retiring polling thread");
                thread.cancel();
                drop(thread.detach());
            }
        }

        // Step 6: update the survivors and fill the shortfall. New threads
        // set their join event only after they first observe the wake.
        for (index, thread) in pool.threads.iter().enumerate() {
            thread.set_group_offset(offsets[index]);
            thread.set_socket_count(sizes[index]);
            thread.reset_join_event();
        }

        for index in pool.threads.len()..sizes.len() {
            let id = pool.next_thread_id;
            pool.next_thread_id += 1;

            let thread = self.spawn_polling_thread(id, offsets[index], sizes[index])?;
            pool.threads.push(thread);
        }

        info!(
            producer = %self.shared.name,
            sessions = total_sessions,
            polling_threads = pool.threads.len(),
            "sessions updated"
        );

        // Step 7: resume, and confirm that every thread observed the
        // wake — a quick follow-up update must never catch a thread still
        // inside the previous pause.
        if !self.reset_abort_io_wait_event() {
            return Err(ProducerError::Protocol(
                "failed to reset the abort-IO-wait event for resuming threads".into(),
            ));
        }

        self.shared.wait_token_source.continue_all();

        wait_for_all_join_events(&self.shared.name, &pool.threads)?;

        for thread in &pool.threads {
            thread.reset_join_event();
        }

        Ok(())
    }

    fn rearm_session(&self, session: &SessionInfo) {
        // Manual-reset socket events are re-armed by the polling threads
        // themselves; nothing to do here.
        trace!(
            producer = %self.shared.name,
            session = %session,
            "re-arm ignored by the event-array producer"
        );
    }

    fn subscribe_to_read_events(&self, handler: Weak<dyn ReadEventHandler>) -> bool {
        self.shared.fanout.subscribe_to_read_events(handler)
    }

    fn unsubscribe_from_read_events(&self, id: Uuid) -> bool {
        self.shared.fanout.unsubscribe_from_read_events(id)
    }

    fn subscribe_to_closed_events(&self, handler: Weak<dyn ClosedEventHandler>) -> bool {
        self.shared.fanout.subscribe_to_closed_events(handler)
    }

    fn unsubscribe_from_closed_events(&self, id: Uuid) -> bool {
        self.shared.fanout.unsubscribe_from_closed_events(id)
    }
}

impl Drop for EventArrayProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait until every thread has raised its join event.
///
/// The OS wait is bounded; on every timeout the per-thread flags are
/// re-checked so that a thread which exited (its join event possibly
/// already reset) does not hold the protocol hostage. After
/// [`JOIN_WAIT_MAX_ATTEMPTS`] consecutive timeouts the protocol is
/// declared broken instead of blocking forever.
fn wait_for_all_join_events(
    producer: &str,
    threads: &[Arc<PollingThread>],
) -> ProducerResult<()> {
    if threads.is_empty() {
        return Ok(());
    }

    let handles: Vec<RawEventHandle> =
        threads.iter().map(|thread| thread.join_event_handle()).collect();

    let mut timeouts = 0;

    loop {
        match wait_for_event_handles(&handles, true, POLLING_THREAD_JOIN_TIMEOUT_MS) {
            WaitOutcome::Signaled(_) => return Ok(()),
            WaitOutcome::Failed(source) => {
                return Err(ProducerError::Protocol(format!(
                    "failed waiting for polling threads to join: {source}"
                )));
            }
            WaitOutcome::Timeout => {
                let all_signalled = threads
                    .iter()
                    .all(|thread| thread.is_join_event_set() || thread.thread_exited());
                if all_signalled {
                    return Ok(());
                }

                timeouts += 1;
                if timeouts >= JOIN_WAIT_MAX_ATTEMPTS {
                    error!(producer, "polling threads did not acknowledge in time");
                    return Err(ProducerError::Protocol(format!(
                        "polling threads did not acknowledge within {JOIN_WAIT_MAX_ATTEMPTS} waits"
                    )));
                }
            }
        }
    }
}

/// The polling thread body.
fn listen_and_produce_events(
    shared: Arc<Shared>,
    cancellation: CancellationToken,
    thread: Arc<PollingThread>,
) {
    let log_prefix = format!("{}[thread-{}]", shared.name, thread.id());

    info!(thread = %log_prefix, "polling thread started");

    let mut local_sessions: Vec<Arc<SessionInfo>> = Vec::new();
    let mut wait_events: Vec<RawEventHandle> = Vec::new();

    let mut refresh_sessions = true;
    let mut synchronized = false;

    let cancelled = || cancellation.cancelled() || thread.cancelled();

    loop {
        if cancelled() {
            break;
        }

        if refresh_sessions {
            refresh_sessions = false;

            local_sessions.clear();
            wait_events.clear();

            // Slot 0 is always the abort event.
            wait_events.push(thread.abort_event());

            let sessions = shared
                .sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            for session in sessions
                .iter()
                .skip(thread.group_offset())
                .take(thread.socket_count())
            {
                match session.socket_event() {
                    Some(event) => {
                        wait_events.push(event.handle());
                        local_sessions.push(Arc::clone(session));
                    }
                    None => {
                        error!(
                            thread = %log_prefix,
                            session = %session,
                            "session without a socket event cannot be monitored"
                        );
                    }
                }
            }

            trace!(thread = %log_prefix, state = %thread, "refreshed session snapshot");
        }

        if !synchronized {
            synchronized = true;

            // Let a possibly in-flight update finish before first use of
            // the snapshot, then acknowledge.
            thread.wait_token().wait_until_continue(&log_prefix);

            if !thread.set_join_event() {
                warn!(thread = %log_prefix, "failed to set the join event on sync");
            }
        }

        // Wait for socket I/O. An update pulls us out of here through the
        // abort event.
        let mut pause_requested = false;
        let mut stop_thread_on_wait_error = false;
        let mut event_index = 0usize;

        loop {
            match wait_for_wsa_events(&wait_events, false, LISTENER_IO_WAIT_TIMEOUT_MS) {
                WaitOutcome::Failed(source) => {
                    error!(thread = %log_prefix, error = %source, "socket event wait failed");
                    stop_thread_on_wait_error = true;
                    break;
                }
                WaitOutcome::Timeout => {
                    if cancelled() {
                        break;
                    }
                    if shared.abort_event_set.load(Ordering::Acquire) {
                        pause_requested = true;
                        break;
                    }
                    continue;
                }
                WaitOutcome::Signaled(index) => {
                    event_index = index;
                    break;
                }
            }
        }

        if stop_thread_on_wait_error || cancelled() {
            break;
        }

        if !pause_requested && event_index >= wait_events.len() {
            error!(
                thread = %log_prefix,
                event_index,
                total_events = wait_events.len(),
                "socket event wait returned an invalid index"
            );
            continue;
        }

        if !pause_requested {
            pause_requested = event_index == 0;
        }

        if pause_requested {
            // Acknowledge the pause, sleep through the update, then
            // acknowledge the resume and rebuild the snapshot.
            if !thread.set_join_event() {
                error!(thread = %log_prefix, "failed to set the join event, terminating");
                break;
            }

            thread.wait_token().wait_until_continue(&log_prefix);

            if !thread.set_join_event() {
                error!(thread = %log_prefix, "failed to set the join event, terminating");
                break;
            }

            refresh_sessions = true;
            continue;
        }

        let mut reading_sessions = Vec::new();
        let mut closed_sessions = Vec::new();

        // More than one socket may have signalled while we handled the
        // first; sweeping the rest of the snapshot here saves OS waits.
        for index in event_index..wait_events.len() {
            let session = &local_sessions[index - 1];

            if let WaitOutcome::Failed(_) =
                wait_for_wsa_events(&wait_events[index..=index], true, 0)
            {
                continue;
            }

            // The event may arrive late; a disconnected session already
            // had its terminal notification.
            if session.connection_state() != SessionConnectionState::Connected {
                continue;
            }

            session.reset_socket_event();

            let socket = session.socket();
            let mut force_close = socket == INVALID_SOCKET_ID;
            let mut network_events = NetworkEvents::default();

            if !force_close {
                match enumerate_network_events(socket, wait_events[index]) {
                    Ok(events) => network_events = events,
                    Err(source) if is_not_a_socket(&source) => force_close = true,
                    Err(source) => {
                        error!(
                            thread = %log_prefix,
                            session = %session,
                            error = %source,
                            "failed to enumerate network events"
                        );
                        continue;
                    }
                }
            }

            if !force_close && network_events.read {
                if network_events.read_error != 0 {
                    error!(
                        thread = %log_prefix,
                        session = %session,
                        error_code = network_events.read_error,
                        "read bit indicates an error"
                    );
                    continue;
                }

                reading_sessions.push(Arc::clone(session));
            } else if force_close || network_events.close {
                if !force_close && network_events.close_error != 0 {
                    error!(
                        thread = %log_prefix,
                        session = %session,
                        error_code = network_events.close_error,
                        "close bit indicates an error, disconnecting session"
                    );
                }

                if session.set_as_disconnected() {
                    closed_sessions.push(Arc::clone(session));
                    info!(thread = %log_prefix, session = %session, "session closed");
                }
            }
        }

        if !reading_sessions.is_empty() {
            shared.fanout.raise_read_event(ReadEvent::new(reading_sessions));
        }

        if !closed_sessions.is_empty() {
            shared
                .fanout
                .raise_closed_event(ClosedEvent::new(closed_sessions));
        }
    }

    thread.set_thread_exited();

    if !thread.set_join_event() {
        error!(thread = %log_prefix, "failed to set the join event on exit");
    }

    info!(thread = %log_prefix, "polling thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    // The producers never touch process-wide socket initialization; that
    // belongs to the embedding application. Tests are that application.
    fn ensure_socket_subsystem() {
        use windows_sys::Win32::Networking::WinSock::{WSAStartup, WSADATA};

        static INIT: Once = Once::new();
        INIT.call_once(|| unsafe {
            let mut data: WSADATA = std::mem::zeroed();
            WSAStartup(0x0202, &mut data);
        });
    }

    fn producer(minimum_threads: u32) -> EventArrayProducer {
        ensure_socket_subsystem();
        EventArrayProducer::new(
            "test-producer",
            ProducerConfig::new()
                .minimum_polling_threads(minimum_threads)
                .maximum_events_per_polling_thread(8),
        )
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let producer = producer(2);

        assert!(!producer.started());
        assert!(producer.can_start());

        assert!(producer.start().unwrap());
        assert!(producer.started());
        assert!(!producer.start().unwrap());

        assert!(producer.stop());
        assert!(!producer.started());
        assert!(!producer.stop());
    }

    #[test]
    fn test_restart_after_stop_is_an_error() {
        let producer = producer(1);

        producer.start().unwrap();
        producer.stop();

        assert!(matches!(
            producer.start(),
            Err(ProducerError::Stopped { .. })
        ));
    }

    #[test]
    fn test_update_before_start_is_an_error() {
        let producer = producer(1);

        assert!(matches!(
            producer.update_sessions(Vec::new(), Vec::new()),
            Err(ProducerError::NotStarted { .. })
        ));
    }

    #[test]
    fn test_empty_update_runs_the_full_protocol() {
        let producer = producer(2);

        producer.start().unwrap();

        // Pause, re-partition nothing, resume — twice in quick
        // succession, which is exactly the case the resume confirmation
        // of step 7 exists for.
        producer.update_sessions(Vec::new(), Vec::new()).unwrap();
        producer.update_sessions(Vec::new(), Vec::new()).unwrap();

        let pool = producer.start_stop.lock().unwrap();
        assert_eq!(pool.threads.len(), 2);
        drop(pool);

        assert!(producer.stop());
    }
}
