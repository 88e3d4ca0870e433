//! Readiness-API event producer (epoll)
//!
//! One polling thread monitors every registered socket through a single
//! epoll set. Registrations are level-triggered in spirit but armed with
//! `EPOLLET | EPOLLONESHOT`: the first read event for a socket suppresses
//! further notifications until the consumer has drained the socket and
//! called [`rearm_session`](crate::SessionEventProducer::rearm_session).
//! That keeps per-session read ordering stable under a sequential dispatch
//! model — a second read event cannot overtake the handling of the first.
//!
//! There is deliberately only one polling thread. This platform has no
//! per-thread socket limit, and spreading one epoll set across threads
//! buys nothing downstream while making the lifecycle considerably harder
//! to get right.
//!
//! Close detection relies on `EPOLLRDHUP` (peer shutdown) and `EPOLLHUP`;
//! a closing descriptor is deleted from the set immediately, so at most
//! one closed notification is ever produced for a session.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, trace};
use uuid::Uuid;

use sessmux_core::{CancellationSource, CancellationToken};

use crate::config::ProducerConfig;
use crate::enums::SessionConnectionState;
use crate::error::{ProducerError, ProducerResult};
use crate::event::{ClosedEvent, ClosedEventHandler, ReadEvent, ReadEventHandler};
use crate::fanout::EventFanout;
use crate::info::SessionInfo;
use crate::producer::SessionEventProducer;
use crate::session::SocketId;

/// Upper bound on events drained per wait; more simply arrive next pass.
const MAX_EPOLL_EVENTS: usize = 1024;

/// Bound on one OS wait, so cancellation is observed within it.
const IO_WAIT_TIMEOUT_MS: i32 = 100;

struct Shared {
    name: String,

    /// The epoll set; `-1` until started and again after stop.
    epoll_fd: AtomicI32,

    /// Registered sessions by socket descriptor. Mutated only inside
    /// `update_sessions`; the polling thread holds the lock only while
    /// classifying one batch of events.
    sessions: Mutex<HashMap<SocketId, Arc<SessionInfo>>>,

    fanout: EventFanout,
}

/// The readiness-API producer.
pub struct EpollEventProducer {
    shared: Arc<Shared>,

    started: AtomicBool,

    cancellation: CancellationSource,

    /// Guards start/stop/update transitions; holds the poller's handle.
    start_stop: Mutex<Option<JoinHandle<()>>>,
}

impl EpollEventProducer {
    /// `config` is accepted for interface parity; neither knob applies to
    /// the single-threaded readiness strategy.
    pub fn new(name: impl Into<String>, _config: ProducerConfig) -> Self {
        let name = name.into();
        info!(producer = %name, "creating epoll event producer");

        Self {
            shared: Arc::new(Shared {
                fanout: EventFanout::new(name.clone()),
                name,
                epoll_fd: AtomicI32::new(-1),
                sessions: Mutex::new(HashMap::new()),
            }),
            started: AtomicBool::new(false),
            cancellation: CancellationSource::new(),
            start_stop: Mutex::new(None),
        }
    }

    fn add_to_set(shared: &Shared, epoll_fd: i32, session: &Arc<SessionInfo>) {
        let socket = session.socket();
        let mut event = libc::epoll_event {
            events: session.interest(),
            u64: socket as u64,
        };

        let rc = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, socket, &mut event) };
        if rc == -1 {
            error!(
                producer = %shared.name,
                session = %session,
                error = %io::Error::last_os_error(),
                "epoll add failed"
            );
        }
    }
}

impl SessionEventProducer for EpollEventProducer {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn start(&self) -> ProducerResult<bool> {
        let mut poller = self
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

        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(ProducerError::Os {
                operation: "epoll_create1",
                source: io::Error::last_os_error(),
            });
        }

        self.shared.epoll_fd.store(epoll_fd, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let token = self.cancellation.token();
        let spawned = thread::Builder::new()
            .name(format!("{}-poll", self.shared.name))
            .spawn(move || listen_and_produce_events(shared, token));

        match spawned {
            Ok(handle) => *poller = Some(handle),
            Err(source) => {
                self.shared.epoll_fd.store(-1, Ordering::Release);
                unsafe { libc::close(epoll_fd) };
                return Err(ProducerError::Os {
                    operation: "spawn polling thread",
                    source,
                });
            }
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

        let mut poller = self
            .start_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        info!(producer = %self.shared.name, "stopping");

        if let Some(handle) = poller.take() {
            let _ = handle.join();
        }

        let epoll_fd = self.shared.epoll_fd.swap(-1, Ordering::AcqRel);
        if epoll_fd != -1 {
            unsafe { libc::close(epoll_fd) };
        }

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

        let _guard = self
            .start_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let epoll_fd = self.shared.epoll_fd.load(Ordering::Acquire);

        let mut sessions = self
            .shared
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for session in &closed {
            if sessions.remove(&session.socket()).is_none() {
                error!(
                    producer = %self.shared.name,
                    session = %session,
                    "registry erase failed"
                );
            } else {
                debug!(
                    producer = %self.shared.name,
                    session = %session,
                    "erased from registry"
                );
            }
        }

        for session in new {
            match sessions.entry(session.socket()) {
                Entry::Occupied(existing) => {
                    error!(
                        producer = %self.shared.name,
                        session = %session,
                        existing = %existing.get(),
                        "registry add failed, descriptor already present"
                    );
                    continue;
                }
                Entry::Vacant(slot) => {
                    debug!(
                        producer = %self.shared.name,
                        session = %session,
                        "added session"
                    );
                    Self::add_to_set(&self.shared, epoll_fd, &session);
                    slot.insert(session);
                }
            }
        }

        Ok(())
    }

    fn rearm_session(&self, session: &SessionInfo) {
        // A session that already closed is never re-armed; its descriptor
        // left the set with the close.
        if session.connection_state() != SessionConnectionState::Connected {
            trace!(
                producer = %self.shared.name,
                session = %session,
                "skipping re-arm of non-connected session"
            );
            return;
        }

        let epoll_fd = self.shared.epoll_fd.load(Ordering::Acquire);
        if epoll_fd == -1 {
            return;
        }

        let socket = session.socket();
        let mut event = libc::epoll_event {
            events: session.interest(),
            u64: socket as u64,
        };

        let rc = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_MOD, socket, &mut event) };
        if rc == -1 {
            error!(
                producer = %self.shared.name,
                session = %session,
                error = %io::Error::last_os_error(),
                "epoll re-arm failed"
            );
            return;
        }

        trace!(producer = %self.shared.name, session = %session, "re-armed session");
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

impl Drop for EpollEventProducer {
    fn drop(&mut self) {
        self.stop();

        // Never started, or start raced the drop: the set may still be open.
        let epoll_fd = self.shared.epoll_fd.swap(-1, Ordering::AcqRel);
        if epoll_fd != -1 {
            unsafe { libc::close(epoll_fd) };
        }
    }
}

/// The polling thread body.
fn listen_and_produce_events(shared: Arc<Shared>, cancellation: CancellationToken) {
    info!(producer = %shared.name, "polling thread started");

    let epoll_fd = shared.epoll_fd.load(Ordering::Acquire);

    let mut events =
        vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EPOLL_EVENTS];

    while !cancellation.cancelled() {
        let count = unsafe {
            libc::epoll_wait(
                epoll_fd,
                events.as_mut_ptr(),
                MAX_EPOLL_EVENTS as i32,
                IO_WAIT_TIMEOUT_MS,
            )
        };

        if count == -1 {
            let source = io::Error::last_os_error();
            if source.raw_os_error() != Some(libc::EINTR) {
                error!(producer = %shared.name, error = %source, "epoll_wait failed");
            }
            continue;
        }

        if count == 0 {
            continue;
        }

        trace!(producer = %shared.name, count, "events found");

        let mut reading_sessions = Vec::new();
        let mut closed_sessions = Vec::new();

        {
            let sessions = shared
                .sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            for event in &events[..count as usize] {
                let socket = event.u64 as SocketId;
                let bits = event.events;

                let Some(session) = sessions.get(&socket) else {
                    debug!(
                        producer = %shared.name,
                        socket,
                        "event for descriptor not in registry"
                    );
                    continue;
                };

                if bits & (libc::EPOLLRDHUP | libc::EPOLLHUP) as u32 != 0 {
                    let rc = unsafe {
                        libc::epoll_ctl(
                            epoll_fd,
                            libc::EPOLL_CTL_DEL,
                            socket,
                            std::ptr::null_mut(),
                        )
                    };
                    if rc == -1 {
                        error!(
                            producer = %shared.name,
                            socket,
                            error = %io::Error::last_os_error(),
                            "epoll delete failed"
                        );
                    }

                    // Whoever wins this transition owns the single closed
                    // notification for the session.
                    if session.set_as_disconnected() {
                        closed_sessions.push(Arc::clone(session));
                        trace!(
                            producer = %shared.name,
                            session = %session,
                            "registered session close"
                        );
                    }
                } else if bits & libc::EPOLLIN as u32 != 0 {
                    reading_sessions.push(Arc::clone(session));
                    trace!(
                        producer = %shared.name,
                        session = %session,
                        "registered session read"
                    );
                } else {
                    debug!(
                        producer = %shared.name,
                        bits = format!("{bits:032b}"),
                        "unhandled event bits"
                    );
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

    info!(producer = %shared.name, "polling thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn producer() -> EpollEventProducer {
        EpollEventProducer::new("test-producer", ProducerConfig::default())
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let producer = producer();

        assert!(!producer.started());
        assert!(producer.can_start());

        assert!(producer.start().unwrap());
        assert!(producer.started());
        assert!(!producer.can_start());

        // Idempotent-false while running.
        assert!(!producer.start().unwrap());

        assert!(producer.stop());
        assert!(!producer.started());
        assert!(!producer.can_start());

        // Idempotent-false once stopped.
        assert!(!producer.stop());
    }

    #[test]
    fn test_restart_after_stop_is_an_error() {
        let producer = producer();

        producer.start().unwrap();
        producer.stop();

        assert!(matches!(
            producer.start(),
            Err(ProducerError::Stopped { .. })
        ));
    }

    #[test]
    fn test_update_before_start_is_an_error() {
        let producer = producer();

        assert!(matches!(
            producer.update_sessions(Vec::new(), Vec::new()),
            Err(ProducerError::NotStarted { .. })
        ));
    }

    #[test]
    fn test_update_after_stop_is_an_error() {
        let producer = producer();

        producer.start().unwrap();
        producer.stop();

        assert!(matches!(
            producer.update_sessions(Vec::new(), Vec::new()),
            Err(ProducerError::Stopped { .. })
        ));
    }
}
