//! Event loop counters.

/// Running totals kept by the event loop.
///
/// Single-threaded, so plain integers are enough.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Connections accepted and registered.
    pub accepted: u64,
    /// Connections accepted then dropped because the registry was full.
    pub rejected: u64,
    /// Connections removed for any reason.
    pub closed: u64,
    /// Connections removed by the idle sweep.
    pub timed_out: u64,
    /// Connections removed after a transport error.
    pub errors: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// WRITE wakeups that found nothing queued. Stays zero unless WRITE
    /// interest outlives the outbound queue.
    pub spurious_writable: u64,
}

impl Stats {
    /// Connections currently accounted as open.
    pub fn open(&self) -> u64 {
        self.accepted.saturating_sub(self.closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_connections() {
        let stats = Stats {
            accepted: 5,
            closed: 3,
            ..Default::default()
        };
        assert_eq!(stats.open(), 2);
        assert_eq!(Stats::default().open(), 0);
    }
}
