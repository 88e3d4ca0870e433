//! The session registry record
//!
//! [`SessionInfo`] wraps a [`Session`] with the extended, partly
//! platform-specific state the event producers need: identity, connection
//! state, the OS event registration for the session's socket, and the
//! counters graceful teardown relies on. The `Session` itself stays
//! platform-independent.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::enums::{
    MessageProcessingAfterDisconnect, MessageReceptionAfterDisconnect, SessionConnectionState,
    SessionOperationState, TaskExecutionMode,
};
use crate::session::{Session, SocketId};

#[cfg(windows)]
use std::sync::OnceLock;

#[cfg(windows)]
use tracing::error;

#[cfg(windows)]
use crate::sys::windows::WsaSocketEvent;

/// Extended registry record for one live (or recently live) client session.
///
/// Equality and hashing go by the immutable session id only; everything
/// else is mutable or derived.
///
/// The record owns a strong handle to its [`Session`] and keeps it alive
/// for its own lifetime; the session never points back. The legacy
/// refcount hooks are driven from construction and drop.
pub struct SessionInfo {
    id: Uuid,

    name: Mutex<String>,

    session: Arc<dyn Session>,

    connection_state: AtomicU8,

    reception_after_disconnect: MessageReceptionAfterDisconnect,
    processing_after_disconnect: MessageProcessingAfterDisconnect,

    /// Messages handed to dispatch but not yet completed.
    messages_waiting: AtomicU32,

    /// What the readiness set will report for this socket: readable and
    /// peer-closed, edge-triggered, one-shot.
    #[cfg(unix)]
    interest: u32,

    /// Manual-reset event bound to the socket for read/close, created once
    /// the session is connected. `None` after a creation failure; the
    /// producer logs and skips such sessions at registration.
    #[cfg(windows)]
    socket_event: OnceLock<WsaSocketEvent>,
}

impl SessionInfo {
    /// Build a record for `session`.
    ///
    /// When `connection_state` is already `Connected` the OS registration
    /// for the socket is prepared immediately; deferred (outgoing)
    /// sessions get theirs when [`set_as_connected`](Self::set_as_connected)
    /// succeeds.
    pub fn new(
        name: impl Into<String>,
        session: Arc<dyn Session>,
        connection_state: SessionConnectionState,
        reception_after_disconnect: MessageReceptionAfterDisconnect,
        processing_after_disconnect: MessageProcessingAfterDisconnect,
    ) -> Arc<Self> {
        session.increment_refcount();

        let info = Self {
            id: session.id(),
            name: Mutex::new(name.into()),
            session,
            connection_state: AtomicU8::new(connection_state as u8),
            reception_after_disconnect,
            processing_after_disconnect,
            messages_waiting: AtomicU32::new(0),
            #[cfg(unix)]
            interest: (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLET | libc::EPOLLONESHOT)
                as u32,
            #[cfg(windows)]
            socket_event: OnceLock::new(),
        };

        #[cfg(windows)]
        if connection_state == SessionConnectionState::Connected {
            info.create_socket_event();
        }

        Arc::new(info)
    }

    /// Unique identifier of this session; the equality key across the
    /// whole system.
    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> String {
        self.name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Update the display name, e.g. once the session has authenticated.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().unwrap_or_else(PoisonError::into_inner) = name.into();
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// The raw socket, reached through the session.
    #[inline]
    pub fn socket(&self) -> SocketId {
        self.session.socket()
    }

    pub fn message_reception_mode(&self) -> TaskExecutionMode {
        self.session.message_reception_mode()
    }

    pub fn message_reception_state(&self) -> SessionOperationState {
        self.session.message_reception_state()
    }

    pub fn message_processing_state(&self) -> SessionOperationState {
        self.session.message_processing_state()
    }

    #[inline]
    pub fn connection_state(&self) -> SessionConnectionState {
        SessionConnectionState::from_raw(self.connection_state.load(Ordering::Acquire))
    }

    /// CAS `NotConnected -> Connected`. Returns `true` iff this call
    /// performed the transition.
    pub fn set_as_connected(&self) -> bool {
        let changed = self
            .connection_state
            .compare_exchange(
                SessionConnectionState::NotConnected as u8,
                SessionConnectionState::Connected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        #[cfg(windows)]
        if changed {
            self.create_socket_event();
        }

        changed
    }

    /// CAS `Connected -> Disconnected`. Returns `true` iff this call
    /// performed the transition. Disconnected is terminal.
    pub fn set_as_disconnected(&self) -> bool {
        self.connection_state
            .compare_exchange(
                SessionConnectionState::Connected as u8,
                SessionConnectionState::Disconnected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn reception_after_disconnect(&self) -> MessageReceptionAfterDisconnect {
        self.reception_after_disconnect
    }

    pub fn processing_after_disconnect(&self) -> MessageProcessingAfterDisconnect {
        self.processing_after_disconnect
    }

    /// Account for a message handed to dispatch. Returns the new count.
    pub fn increment_messages_waiting(&self) -> u32 {
        self.messages_waiting.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Account for a completed dispatch. Saturates at zero; returns the
    /// new count.
    pub fn decrement_messages_waiting(&self) -> u32 {
        match self
            .messages_waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }

    pub fn messages_waiting(&self) -> u32 {
        self.messages_waiting.load(Ordering::Acquire)
    }

    /// The readiness-set interest mask for this session's socket.
    #[cfg(unix)]
    #[inline]
    pub(crate) fn interest(&self) -> u32 {
        self.interest
    }

    /// The manual-reset event bound to this session's socket, if its
    /// creation succeeded.
    #[cfg(windows)]
    pub(crate) fn socket_event(&self) -> Option<&WsaSocketEvent> {
        self.socket_event.get()
    }

    /// Reset the manual-reset socket event after the OS signalled it.
    #[cfg(windows)]
    pub(crate) fn reset_socket_event(&self) -> bool {
        match self.socket_event.get() {
            Some(event) => event.reset(),
            None => true,
        }
    }

    #[cfg(windows)]
    fn create_socket_event(&self) {
        match WsaSocketEvent::for_socket(self.session.socket()) {
            Ok(event) => {
                let _ = self.socket_event.set(event);
            }
            Err(source) => {
                error!(session = %self, error = %source, "failed to create socket event");
            }
        }
    }
}

impl Drop for SessionInfo {
    fn drop(&mut self) {
        self.session.decrement_refcount();
    }
}

impl PartialEq for SessionInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SessionInfo {}

impl Hash for SessionInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{id: {}, name: {}, user: {}, socket: {}, state: {}}}",
            self.id,
            self.name(),
            self.session.user_name(),
            self.socket(),
            self.connection_state(),
        )
    }
}

impl fmt::Debug for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct StubSession {
        id: Uuid,
        socket: SocketId,
        refcount: AtomicU64,
    }

    impl StubSession {
        fn new(socket: SocketId) -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                socket,
                refcount: AtomicU64::new(0),
            })
        }
    }

    impl Session for StubSession {
        fn id(&self) -> Uuid {
            self.id
        }

        fn name(&self) -> String {
            "stub".into()
        }

        fn user_name(&self) -> String {
            "nobody".into()
        }

        fn socket(&self) -> SocketId {
            self.socket
        }

        fn message_reception_mode(&self) -> TaskExecutionMode {
            TaskExecutionMode::Sequential
        }

        fn message_reception_state(&self) -> SessionOperationState {
            SessionOperationState::Ready
        }

        fn message_processing_state(&self) -> SessionOperationState {
            SessionOperationState::Ready
        }

        fn receive_incoming_message(&self) -> Option<(crate::Message, TaskExecutionMode)> {
            None
        }

        fn handle_rx_message(&self, _message: crate::Message) {}

        fn disconnect(&self, _socket_was_closed: bool) {}

        fn increment_refcount(&self) {
            self.refcount.fetch_add(1, Ordering::AcqRel);
        }

        fn decrement_refcount(&self) {
            self.refcount.fetch_sub(1, Ordering::AcqRel);
        }

        fn current_refcount(&self) -> u64 {
            self.refcount.load(Ordering::Acquire)
        }
    }

    fn info_for(
        session: &Arc<StubSession>,
        state: SessionConnectionState,
    ) -> Arc<SessionInfo> {
        SessionInfo::new(
            "test-session",
            Arc::clone(session) as Arc<dyn Session>,
            state,
            MessageReceptionAfterDisconnect::NotSupported,
            MessageProcessingAfterDisconnect::NotSupported,
        )
    }

    #[test]
    fn test_monotonic_connection_state() {
        let session = StubSession::new(7);
        let info = info_for(&session, SessionConnectionState::NotConnected);

        assert_eq!(info.connection_state(), SessionConnectionState::NotConnected);

        // Cannot skip straight to Disconnected.
        assert!(!info.set_as_disconnected());
        assert_eq!(info.connection_state(), SessionConnectionState::NotConnected);

        assert!(info.set_as_connected());
        assert_eq!(info.connection_state(), SessionConnectionState::Connected);

        assert!(info.set_as_disconnected());
        assert_eq!(info.connection_state(), SessionConnectionState::Disconnected);

        // Terminal: no way back, no re-transition.
        assert!(!info.set_as_connected());
        assert!(!info.set_as_disconnected());
        assert_eq!(info.connection_state(), SessionConnectionState::Disconnected);
    }

    #[test]
    fn test_exactly_one_disconnector() {
        let session = StubSession::new(7);
        let info = info_for(&session, SessionConnectionState::Connected);

        let transitions: Vec<bool> = (0..8)
            .map(|_| {
                let info = Arc::clone(&info);
                std::thread::spawn(move || info.set_as_disconnected())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        assert_eq!(transitions.iter().filter(|&&t| t).count(), 1);
    }

    #[test]
    fn test_refcount_follows_record_lifetime() {
        let session = StubSession::new(7);
        assert_eq!(session.current_refcount(), 0);

        let info = info_for(&session, SessionConnectionState::Connected);
        assert_eq!(session.current_refcount(), 1);

        drop(info);
        assert_eq!(session.current_refcount(), 0);
    }

    #[test]
    fn test_messages_waiting_counter() {
        let session = StubSession::new(7);
        let info = info_for(&session, SessionConnectionState::Connected);

        assert_eq!(info.increment_messages_waiting(), 1);
        assert_eq!(info.increment_messages_waiting(), 2);
        assert_eq!(info.decrement_messages_waiting(), 1);
        assert_eq!(info.decrement_messages_waiting(), 0);
        // Saturates instead of wrapping.
        assert_eq!(info.decrement_messages_waiting(), 0);
        assert_eq!(info.messages_waiting(), 0);
    }

    #[test]
    fn test_equality_by_id_only() {
        let session = StubSession::new(7);
        let a = info_for(&session, SessionConnectionState::Connected);
        let b = info_for(&session, SessionConnectionState::NotConnected);

        // Same underlying session id, different mutable state.
        a.set_name("renamed");
        assert_eq!(*a, *b);

        let other = StubSession::new(8);
        let c = info_for(&other, SessionConnectionState::Connected);
        assert_ne!(*a, *c);
    }

    #[test]
    fn test_mutable_name() {
        let session = StubSession::new(7);
        let info = info_for(&session, SessionConnectionState::Connected);

        assert_eq!(info.name(), "test-session");
        info.set_name("user-42");
        assert_eq!(info.name(), "user-42");
    }
}
