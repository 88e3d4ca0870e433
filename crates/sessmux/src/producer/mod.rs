//! Session event producers
//!
//! One trait, one implementation per platform. The implementations share
//! nothing beyond the session record and the subscriber fan-out; the
//! monitoring strategies are too different for common plumbing to help.

use std::sync::{Arc, Weak};

use uuid::Uuid;

use crate::config::ProducerConfig;
use crate::error::ProducerResult;
use crate::event::{ClosedEventHandler, ReadEventHandler};
use crate::info::SessionInfo;

#[cfg(unix)]
pub mod epoll;

#[cfg(windows)]
pub mod event_array;

pub mod partition;

#[cfg(windows)]
pub(crate) mod polling_thread;

/// Monitors the sockets of registered sessions and fans out read/closed
/// batches to subscribed handlers.
///
/// Lifecycle: `start` once, `update_sessions` as connections come and go,
/// `stop` once — a stopped producer can never be restarted. Handlers run
/// synchronously on the producer's polling threads and must not block.
pub trait SessionEventProducer: Send + Sync {
    /// Display name, used as the prefix of every log line.
    fn name(&self) -> &str;

    /// Start the polling machinery.
    ///
    /// Returns `Ok(false)` when already started, and
    /// [`ProducerError::Stopped`](crate::ProducerError::Stopped) when
    /// start is attempted after `stop`.
    fn start(&self) -> ProducerResult<bool>;

    /// Stop the producer and join its polling threads. Irreversible.
    ///
    /// Returns `false` when the producer is not started or already
    /// stopped.
    fn stop(&self) -> bool;

    fn started(&self) -> bool;

    fn can_start(&self) -> bool;

    /// Update the set of monitored sessions: register `new` sessions and
    /// drop `closed` ones from the registry.
    ///
    /// Per-session registration failures are logged and absorbed; only
    /// lifecycle misuse and protocol failures surface as errors.
    fn update_sessions(
        &self,
        new: Vec<Arc<SessionInfo>>,
        closed: Vec<Arc<SessionInfo>>,
    ) -> ProducerResult<()>;

    /// Re-enable readiness notifications for a session after its pending
    /// bytes have been consumed.
    ///
    /// Only meaningful on the readiness-API platform, whose one-shot
    /// registrations suppress further events until re-armed; the
    /// event-array producer ignores it.
    fn rearm_session(&self, session: &SessionInfo);

    /// Subscribe a read-batch observer. Returns `false` for a duplicate
    /// handler id or a dead handle.
    fn subscribe_to_read_events(&self, handler: Weak<dyn ReadEventHandler>) -> bool;

    /// Returns `false` when the handler id is unknown.
    fn unsubscribe_from_read_events(&self, id: Uuid) -> bool;

    /// Subscribe a closed-batch observer. Returns `false` for a duplicate
    /// handler id or a dead handle.
    fn subscribe_to_closed_events(&self, handler: Weak<dyn ClosedEventHandler>) -> bool;

    /// Returns `false` when the handler id is unknown.
    fn unsubscribe_from_closed_events(&self, id: Uuid) -> bool;
}

/// Build the event producer for this platform.
///
/// The configuration is clamped to the platform limits first. The result
/// is a plain value — callers own it and decide how widely to share it.
pub fn new_session_event_producer(
    name: &str,
    config: ProducerConfig,
) -> Arc<dyn SessionEventProducer> {
    let config = config.clamped();

    #[cfg(unix)]
    return Arc::new(epoll::EpollEventProducer::new(name, config));

    #[cfg(windows)]
    return Arc::new(event_array::EventArrayProducer::new(name, config));
}
