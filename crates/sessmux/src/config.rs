//! Producer configuration

/// Hard per-thread cap of the event-array platform: the OS waits on at most
/// 64 event objects per call, and slot 0 is reserved for the abort event.
pub const MAX_EVENTS_PER_POLLING_THREAD: u32 = 63;

/// Configuration for a session event producer.
///
/// Both knobs only matter on the event-array platform; the readiness-API
/// producer runs a single polling thread regardless (its OS has no
/// per-thread socket limit, and event handling downstream is sequential
/// anyway, so extra polling threads buy nothing).
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Polling threads that are always kept running, whatever the session
    /// count. Sized right for the expected load, this avoids churning
    /// thread creation and retirement as clients come and go.
    pub minimum_polling_threads: u32,

    /// Sockets monitored by one polling thread, at most. Smaller groups
    /// respond faster when many sockets signal at once; the trade-off is
    /// more threads. Clamped to [`MAX_EVENTS_PER_POLLING_THREAD`].
    pub maximum_events_per_polling_thread: u32,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            minimum_polling_threads: 2,
            maximum_events_per_polling_thread: 32,
        }
    }
}

impl ProducerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum number of polling threads.
    pub fn minimum_polling_threads(mut self, n: u32) -> Self {
        self.minimum_polling_threads = n;
        self
    }

    /// Set the per-thread socket cap.
    pub fn maximum_events_per_polling_thread(mut self, n: u32) -> Self {
        self.maximum_events_per_polling_thread = n;
        self
    }

    /// Clamp to the platform limits.
    pub fn clamped(mut self) -> Self {
        if self.maximum_events_per_polling_thread > MAX_EVENTS_PER_POLLING_THREAD {
            self.maximum_events_per_polling_thread = MAX_EVENTS_PER_POLLING_THREAD;
        }
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.minimum_polling_threads == 0 {
            return Err("minimum_polling_threads must be at least 1");
        }
        if self.maximum_events_per_polling_thread == 0 {
            return Err("maximum_events_per_polling_thread must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ProducerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_clamp_to_platform_cap() {
        let config = ProducerConfig::new()
            .maximum_events_per_polling_thread(1024)
            .clamped();

        assert_eq!(
            config.maximum_events_per_polling_thread,
            MAX_EVENTS_PER_POLLING_THREAD
        );
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(ProducerConfig::new()
            .minimum_polling_threads(0)
            .validate()
            .is_err());
        assert!(ProducerConfig::new()
            .maximum_events_per_polling_thread(0)
            .validate()
            .is_err());
    }
}
