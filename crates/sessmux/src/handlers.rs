//! Downstream collaborator contracts
//!
//! The producer's read and closed batches ultimately feed three
//! application-side components: the message receiver (frames readable
//! bytes into messages), the message dispatcher (delivers framed messages
//! to their sessions) and the session lifetime manager (feeds
//! registrations back into `update_sessions`). Those components live in
//! the embedding server; these are the contracts they implement.
//!
//! All three take batches: sessions connect, disconnect and signal in
//! bursts, and per-item calls would swamp the executors driving them.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::enums::TaskExecutionMode;
use crate::info::SessionInfo;
use crate::session::Message;

/// What happened to a session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifetimeAction {
    /// A new session exists (incoming connection accepted, or an outgoing
    /// session established).
    Created,
    /// The session disconnected or was shut down.
    Deleted,
}

impl fmt::Display for SessionLifetimeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Deleted => write!(f, "Deleted"),
        }
    }
}

/// One session lifetime change.
#[derive(Clone)]
pub struct SessionLifetimeChange {
    pub session: Arc<SessionInfo>,
    pub action: SessionLifetimeAction,
}

impl SessionLifetimeChange {
    pub fn created(session: Arc<SessionInfo>) -> Self {
        Self {
            session,
            action: SessionLifetimeAction::Created,
        }
    }

    pub fn deleted(session: Arc<SessionInfo>) -> Self {
        Self {
            session,
            action: SessionLifetimeAction::Deleted,
        }
    }
}

/// Handles notifications affecting the lifetime of sessions.
///
/// The implementor owns the registry bookkeeping: splitting a batch into
/// new and closed sessions and driving the producer's `update_sessions`
/// with it.
pub trait SessionLifetimeHandler: Send + Sync {
    /// Called with every detected batch of lifetime changes. Returns
    /// `false` only for irrecoverable failures; everything else is the
    /// implementor's to absorb.
    fn manage_sessions_lifetime(&self, changes: &[SessionLifetimeChange]) -> bool;
}

/// Handles notifications of incoming bytes.
///
/// The implementation reads each session's socket and constructs message
/// objects from it. It runs on the receiver's executor for *all*
/// sessions; single-session errors must be contained, and only failures
/// that should stop the whole receiver may surface as `false`.
pub trait RxMessageReceptionHandler: Send + Sync {
    fn receive_incoming_messages(&self, sessions: &[Arc<SessionInfo>]) -> bool;
}

/// One framed message on its way to processing, with the timestamps the
/// latency accounting needs.
pub struct DispatchInfo {
    pub session: Arc<SessionInfo>,
    pub message: Message,
    pub processing_mode: TaskExecutionMode,

    /// When the message was read off the socket.
    pub received_at: Instant,

    /// When the message was queued for processing.
    pub queued_at: Instant,
}

impl DispatchInfo {
    pub fn new(
        session: Arc<SessionInfo>,
        message: Message,
        processing_mode: TaskExecutionMode,
        received_at: Instant,
    ) -> Self {
        Self {
            session,
            message,
            processing_mode,
            received_at,
            queued_at: received_at,
        }
    }

    /// Stamp the moment the message entered the processing queue.
    pub fn mark_queued(mut self) -> Self {
        self.queued_at = Instant::now();
        self
    }

    /// Time the message spent between reception and queueing.
    pub fn queueing_latency(&self) -> std::time::Duration {
        self.queued_at.saturating_duration_since(self.received_at)
    }
}

/// Dispatches framed messages to the sessions that handle them.
///
/// Same propagation contract as [`RxMessageReceptionHandler`]: `false`
/// stops the whole dispatcher, so it is reserved for irrecoverable
/// failures.
pub trait RxMessageDispatchHandler: Send + Sync {
    fn dispatch_incoming_message(&self, dispatch: DispatchInfo) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_action_display_names() {
        assert_eq!(SessionLifetimeAction::Created.to_string(), "Created");
        assert_eq!(SessionLifetimeAction::Deleted.to_string(), "Deleted");
    }

    #[test]
    fn test_queueing_latency_is_non_negative() {
        let received_at = Instant::now();
        let later = received_at + Duration::from_millis(5);

        // saturating: a queued_at before received_at clamps to zero.
        assert_eq!(later.saturating_duration_since(received_at), Duration::from_millis(5));
        assert_eq!(
            received_at.saturating_duration_since(later),
            Duration::ZERO
        );
    }
}
