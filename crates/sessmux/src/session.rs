//! The `Session` collaborator contract
//!
//! A [`Session`] is the application-level object behind a socket: it knows
//! how to frame bytes into messages and how to handle them. The
//! multiplexing core never does either; it only watches the socket and
//! tells subscribers when there is something to do. Everything the core
//! needs from the application goes through this trait.

use uuid::Uuid;

use crate::enums::{SessionOperationState, TaskExecutionMode};

/// Raw socket identity, as registered with the OS readiness machinery.
#[cfg(unix)]
pub type SocketId = std::os::unix::io::RawFd;

/// Raw socket identity, as registered with the OS readiness machinery.
#[cfg(windows)]
pub type SocketId = std::os::windows::io::RawSocket;

/// Sentinel for a socket that is already gone. A session reporting this is
/// treated as force-closed by the producers.
#[cfg(unix)]
pub const INVALID_SOCKET_ID: SocketId = -1;

/// Sentinel for a socket that is already gone. A session reporting this is
/// treated as force-closed by the producers.
#[cfg(windows)]
pub const INVALID_SOCKET_ID: SocketId = SocketId::MAX;

/// One framed application message.
///
/// The multiplexing core carries these around without ever interpreting
/// the payload; framing and meaning belong to the session layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Vec<u8>,
}

impl Message {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Application-level session behind one client connection.
///
/// Implementations are shared across the polling, framing and dispatch
/// threads, so every method takes `&self`; mutable session state lives
/// behind the implementor's own interior mutability.
pub trait Session: Send + Sync {
    /// Canonical identity of this session, generated at construction.
    /// [`SessionInfo`](crate::info::SessionInfo) adopts it as its own.
    fn id(&self) -> Uuid;

    /// Display-friendly name, for logging.
    fn name(&self) -> String;

    /// The logged-in user behind this session. Changes as the session
    /// authenticates.
    fn user_name(&self) -> String;

    /// The raw, underlying socket for this session.
    fn socket(&self) -> SocketId;

    /// How incoming messages for this session must currently be received.
    /// The answer may change over the session's lifetime.
    fn message_reception_mode(&self) -> TaskExecutionMode;

    fn message_reception_state(&self) -> SessionOperationState;

    fn message_processing_state(&self) -> SessionOperationState;

    /// Called by the framing layer once a read event is pending: consume
    /// readable bytes into the next message, if a whole one is available.
    ///
    /// Non-fatal read errors are this session's problem and must be
    /// handled here, not surfaced.
    fn receive_incoming_message(&self) -> Option<(Message, TaskExecutionMode)>;

    /// Called by the dispatch layer with a fully framed message.
    fn handle_rx_message(&self, message: Message);

    /// Disconnect and clean up. `socket_was_closed` tells the session
    /// whether the socket is already gone (peer close) or still needs
    /// closing locally.
    fn disconnect(&self, socket_was_closed: bool);

    /// Legacy reference counting, kept for session types whose lifetimes
    /// are tracked outside of `Arc`. `SessionInfo` increments on
    /// construction and decrements on drop; implementations that are
    /// purely `Arc`-owned may ignore all three.
    fn increment_refcount(&self);

    fn decrement_refcount(&self);

    fn current_refcount(&self) -> u64;
}
