/// The `NetworkStats` struct contains datagram traffic counters for the current session.
///
/// All counters start at 0 when the session starts and only grow.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "NetworkStats should be inspected or used after being queried"]
pub struct NetworkStats {
    /// Datagrams handed to the transport, retransmissions included.
    pub datagrams_sent: u64,
    /// Datagrams pulled from the transport, including ones that failed to decode.
    pub datagrams_received: u64,
    /// Bytes of all sent datagrams.
    pub bytes_sent: u64,
    /// Bytes of all received datagrams.
    pub bytes_received: u64,
    /// Request-input datagrams sent. The first request of each fetch is included.
    pub requests_sent: u64,
    /// Request-input datagrams repeated because the event had not arrived in time.
    ///
    /// A high ratio of retransmissions to requests indicates a lossy or slow relay path.
    pub retransmissions: u64,
    /// Events the relay sent again for a sequence already buffered.
    pub duplicate_events: u64,
    /// Events for a sequence the slot had already consumed.
    pub stale_events: u64,
    /// Datagrams skipped because of an unknown tag.
    pub unknown_datagrams: u64,
    /// Fetches that gave up waiting. At most 1, the session is lost afterwards.
    pub timeouts: u64,
}

impl NetworkStats {
    /// Creates a new `NetworkStats` instance with every counter at zero.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            datagrams_sent,
            datagrams_received,
            bytes_sent,
            bytes_received,
            requests_sent,
            retransmissions,
            duplicate_events,
            stale_events,
            unknown_datagrams,
            timeouts,
        } = self;

        write!(
            f,
            "NetworkStats {{ sent: {} ({} bytes), received: {} ({} bytes), requests: {}, retransmissions: {}, duplicates: {}, stale: {}, unknown: {}, timeouts: {} }}",
            datagrams_sent,
            bytes_sent,
            datagrams_received,
            bytes_received,
            requests_sent,
            retransmissions,
            duplicate_events,
            stale_events,
            unknown_datagrams,
            timeouts
        )
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn test_network_stats_default() {
        let stats = NetworkStats::default();
        assert_eq!(stats.datagrams_sent, 0);
        assert_eq!(stats.timeouts, 0);
        assert_eq!(stats, NetworkStats::new());
    }

    #[test]
    fn test_network_stats_display_includes_every_counter() {
        let stats = NetworkStats {
            datagrams_sent: 10,
            datagrams_received: 8,
            bytes_sent: 120,
            bytes_received: 200,
            requests_sent: 6,
            retransmissions: 2,
            duplicate_events: 3,
            stale_events: 1,
            unknown_datagrams: 4,
            timeouts: 0,
        };
        let display = stats.to_string();
        assert!(display.starts_with("NetworkStats {"));
        assert!(display.contains("sent: 10 (120 bytes)"));
        assert!(display.contains("received: 8 (200 bytes)"));
        assert!(display.contains("retransmissions: 2"));
        assert!(display.contains("duplicates: 3"));
        assert!(display.contains("stale: 1"));
        assert!(display.contains("unknown: 4"));
        assert!(display.ends_with('}'));
    }
}
