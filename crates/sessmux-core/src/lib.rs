//! # sessmux-core
//!
//! Platform-agnostic primitives for the sessmux session event core.
//!
//! This crate contains no OS-specific code. The event producers in the
//! `sessmux` crate build their coordination protocols out of these pieces.
//!
//! ## Modules
//!
//! - `cancel` - One-shot cancellation source and read-many tokens
//! - `wait` - Cooperative pause/resume gate for polling threads
//! - `queue` - Blocking MPMC queue with drain-after-stop semantics

pub mod cancel;
pub mod queue;
pub mod wait;

// Re-exports for convenience
pub use cancel::{CancellationSource, CancellationToken};
pub use queue::BlockingQueue;
pub use wait::{WaitToken, WaitTokenSource};
