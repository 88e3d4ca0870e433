//! Session state enums

use std::fmt;

/// Connection state of a session record.
///
/// Transitions are monotonic: `NotConnected -> Connected -> Disconnected`.
/// Disconnected is terminal; the producers never deliver another event for
/// a disconnected session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionConnectionState {
    NotConnected = 0,
    Connected = 1,
    Disconnected = 2,
}

impl SessionConnectionState {
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::NotConnected,
            1 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for SessionConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "NotConnected"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Whether the framing layer may keep reading queued bytes for a session
/// after its peer has closed.
///
/// Send-and-disconnect clients open a session, write one message and close
/// immediately; by the time the reader gets scheduled the session may
/// already be disconnected, and the message would be lost without this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageReceptionAfterDisconnect {
    NotSupported,
    Supported,
}

impl fmt::Display for MessageReceptionAfterDisconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSupported => write!(f, "NotSupported"),
            Self::Supported => write!(f, "Supported"),
        }
    }
}

/// Whether the dispatch layer may still deliver already-framed messages for
/// a session after its peer has closed. Same rationale as
/// [`MessageReceptionAfterDisconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageProcessingAfterDisconnect {
    NotSupported,
    Supported,
}

impl fmt::Display for MessageProcessingAfterDisconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSupported => write!(f, "NotSupported"),
            Self::Supported => write!(f, "Supported"),
        }
    }
}

/// How a session's incoming messages must be executed downstream.
///
/// `Sequential` messages carry ordering requirements and are handled
/// one-by-one in arrival order; `Concurrent` messages may be spread across
/// a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExecutionMode {
    Sequential,
    Concurrent,
}

impl fmt::Display for TaskExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "Sequential"),
            Self::Concurrent => write!(f, "Concurrent"),
        }
    }
}

/// Operational state of a session with respect to one of its duties
/// (receiving or processing messages).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOperationState {
    /// Stopped for good; no message will be handled now or later.
    Stopped,
    /// Ready for the next message.
    Ready,
    /// Currently handling a message.
    Busy,
}

impl fmt::Display for SessionOperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Ready => write!(f, "Ready"),
            Self::Busy => write!(f, "Busy"),
        }
    }
}
