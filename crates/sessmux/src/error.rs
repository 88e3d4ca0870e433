//! Producer error type
//!
//! Only two classes of failure ever reach a caller: lifecycle misuse
//! (start/update on a producer that is stopped or was never started) and
//! protocol-invariant violations, after which the producer can no longer
//! guarantee safe registry mutation. Per-session failures are logged and
//! absorbed where they happen.

use thiserror::Error;

pub type ProducerResult<T> = Result<T, ProducerError>;

#[derive(Debug, Error)]
pub enum ProducerError {
    /// The producer was stopped; stopping is irreversible.
    #[error("event producer `{name}` is stopped and cannot be used again")]
    Stopped { name: String },

    /// The producer was never started.
    #[error("event producer `{name}` is not started and cannot manage sessions")]
    NotStarted { name: String },

    /// A fatal OS-level setup failure.
    #[error("{operation} failed")]
    Os {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The pause/resume protocol could not complete; the registry can no
    /// longer be mutated safely.
    #[error("pause/resume protocol failure: {0}")]
    Protocol(String),
}
