//! Platform helpers for the event-array producer.

pub(crate) mod windows;
