//! # sessmux
//!
//! Session event multiplexing core for long-lived TCP servers.
//!
//! An external accept loop creates sessions and hands them to a
//! [`SessionEventProducer`], which registers their sockets with the OS
//! readiness machinery and runs the polling thread(s). Whenever sockets
//! become readable or close, the producer builds a batch per event kind and
//! invokes every subscribed handler synchronously on the polling thread.
//! Handlers are expected to shed work to their own executors immediately;
//! the producer owns no worker pools, never reads payload bytes and never
//! writes to a socket.
//!
//! Two producer implementations exist, one per platform:
//!
//! - unix: a single polling thread over an epoll set with edge-triggered,
//!   one-shot registrations ([`producer::epoll`]); consumed sessions are
//!   explicitly re-armed after their bytes have been read.
//! - windows: a pool of polling threads over WSA event arrays, at most 63
//!   sockets per thread, re-partitioned under a cooperative pause/resume
//!   protocol as sessions come and go ([`producer::event_array`]).
//!
//! ## Modules
//!
//! - `enums` - Session state enums
//! - `session` - The `Session` collaborator contract
//! - `info` - The `SessionInfo` registry record
//! - `event` - Read/closed batches and handler contracts
//! - `handlers` - Contracts of the downstream receiver/dispatcher/lifetime components
//! - `config` - Producer configuration
//! - `error` - Producer error type
//! - `producer` - The producer trait and its platform implementations

pub mod config;
pub mod enums;
pub mod error;
pub mod event;
pub(crate) mod fanout;
pub mod handlers;
pub mod info;
pub mod producer;
pub mod session;

#[cfg(windows)]
pub(crate) mod sys;

// Re-exports for convenience
pub use config::ProducerConfig;
pub use enums::{
    MessageProcessingAfterDisconnect, MessageReceptionAfterDisconnect, SessionConnectionState,
    SessionOperationState, TaskExecutionMode,
};
pub use error::{ProducerError, ProducerResult};
pub use event::{ClosedEvent, ClosedEventHandler, ReadEvent, ReadEventHandler};
pub use handlers::{
    DispatchInfo, RxMessageDispatchHandler, RxMessageReceptionHandler, SessionLifetimeAction,
    SessionLifetimeChange, SessionLifetimeHandler,
};
pub use info::SessionInfo;
pub use producer::{new_session_event_producer, SessionEventProducer};
pub use session::{Message, Session, SocketId, INVALID_SOCKET_ID};
