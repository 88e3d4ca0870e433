//! Event batches and handler contracts
//!
//! A polling pass emits at most one read batch and one closed batch; the
//! batch is the unit of handler invocation. A read event only says that
//! data is pending for those sessions, not that anything has been read.

use std::sync::Arc;

use uuid::Uuid;

use crate::info::SessionInfo;

/// One or more sessions with data pending to be read.
#[derive(Clone)]
pub struct ReadEvent {
    sessions: Vec<Arc<SessionInfo>>,
}

impl ReadEvent {
    pub fn new(sessions: Vec<Arc<SessionInfo>>) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &[Arc<SessionInfo>] {
        &self.sessions
    }
}

/// One or more sessions whose connection has closed.
///
/// Delivered at most once per session, and never followed by another event
/// for that session.
#[derive(Clone)]
pub struct ClosedEvent {
    sessions: Vec<Arc<SessionInfo>>,
}

impl ClosedEvent {
    pub fn new(sessions: Vec<Arc<SessionInfo>>) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &[Arc<SessionInfo>] {
        &self.sessions
    }
}

/// Observer of read batches.
///
/// `handle_event` runs synchronously on the polling thread that produced
/// the batch; implementations must shed the actual work to their own
/// executors and return quickly.
pub trait ReadEventHandler: Send + Sync {
    /// Stable unique id of this handler; the subscription key.
    fn handler_id(&self) -> Uuid;

    fn handle_event(&self, event: &ReadEvent);
}

/// Observer of closed batches. Same invocation contract as
/// [`ReadEventHandler`].
pub trait ClosedEventHandler: Send + Sync {
    /// Stable unique id of this handler; the subscription key.
    fn handler_id(&self) -> Uuid;

    fn handle_event(&self, event: &ClosedEvent);
}
