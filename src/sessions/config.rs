//! Configuration types for netplay sessions.
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `SyncConfig` | Input request retry and timeout | `lan()`, `high_latency()`, `debug()` |
//! | `ProtocolConfig` | Checksum cadence and event buffering | `debug()` |
//!
//! # Example
//!
//! ```
//! use fortress_netplay::{ProtocolConfig, SessionBuilder, SyncConfig};
//!
//! let builder = SessionBuilder::new()
//!     .with_sync_config(SyncConfig::high_latency())
//!     .with_protocol_config(ProtocolConfig::default());
//! # let _ = builder;
//! ```

use web_time::Duration;

use crate::NetplayError;

/// Configuration for the input request loop.
///
/// Every poll, the session asks the relay for each needed slot's next event and
/// waits for it. These settings control how often the request is repeated and
/// how long the session waits before declaring the connection lost.
///
/// # Forward Compatibility
///
/// New fields may be added to this struct in future versions. Construct
/// instances with the `..SyncConfig::default()` pattern.
///
/// # Example
///
/// ```
/// use fortress_netplay::SyncConfig;
/// use web_time::Duration;
///
/// let patient = SyncConfig {
///     request_timeout: Duration::from_secs(30),
///     ..SyncConfig::default()
/// };
/// assert!(patient.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "SyncConfig has no effect unless passed to SessionBuilder::with_sync_config()"]
pub struct SyncConfig {
    /// Time between request-input retransmissions while an event is missing.
    ///
    /// Default: 5ms
    pub request_retry_interval: Duration,

    /// Maximum time to wait for one event. Exceeding it breaks the datagram
    /// route for the rest of the session.
    ///
    /// Default: 10s
    pub request_timeout: Duration,

    /// How long the wait loop sleeps between drains.
    ///
    /// Default: 1ms
    pub poll_slice: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_retry_interval: Duration::from_millis(5),
            request_timeout: Duration::from_secs(10),
            poll_slice: Duration::from_millis(1),
        }
    }
}

impl SyncConfig {
    /// Creates a new `SyncConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration preset for local network play.
    ///
    /// Retries as fast as the default but gives up sooner.
    pub fn lan() -> Self {
        Self {
            request_retry_interval: Duration::from_millis(5),
            request_timeout: Duration::from_secs(5),
            poll_slice: Duration::from_millis(1),
        }
    }

    /// Configuration preset for relays 100ms or more away.
    ///
    /// Retransmitting every 5ms at that distance only adds duplicate answers.
    pub fn high_latency() -> Self {
        Self {
            request_retry_interval: Duration::from_millis(20),
            request_timeout: Duration::from_secs(20),
            poll_slice: Duration::from_millis(2),
        }
    }

    /// Configuration preset for stepping through a session in a debugger.
    ///
    /// **Not for production use.** A stalled relay takes two minutes to be noticed.
    pub fn debug() -> Self {
        Self {
            request_retry_interval: Duration::from_millis(50),
            request_timeout: Duration::from_secs(120),
            poll_slice: Duration::from_millis(5),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if the retry interval or the poll
    /// slice is zero, or if the timeout is not longer than the retry interval.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.request_retry_interval.is_zero() {
            return Err(NetplayError::InvalidRequest {
                info: "request_retry_interval must be greater than zero".to_owned(),
            });
        }
        if self.poll_slice.is_zero() {
            return Err(NetplayError::InvalidRequest {
                info: "poll_slice must be greater than zero".to_owned(),
            });
        }
        if self.request_timeout <= self.request_retry_interval {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "request_timeout ({}ms) must exceed request_retry_interval ({}ms)",
                    self.request_timeout.as_millis(),
                    self.request_retry_interval.as_millis()
                ),
            });
        }
        Ok(())
    }
}

/// Configuration for protocol behavior outside the request loop.
///
/// # Forward Compatibility
///
/// New fields may be added to this struct in future versions. Construct
/// instances with the `..ProtocolConfig::default()` pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "ProtocolConfig has no effect unless passed to SessionBuilder::with_protocol_config()"]
pub struct ProtocolConfig {
    /// Emulated frames between two checksum datagrams.
    ///
    /// Default: 600
    pub checksum_interval: u32,

    /// Maximum number of undrained [`NetplayEvent`](crate::NetplayEvent)s.
    /// When full, the oldest event is dropped.
    ///
    /// Default: 64
    pub event_queue_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            checksum_interval: 600,
            event_queue_size: 64,
        }
    }
}

impl ProtocolConfig {
    /// Creates a new `ProtocolConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration preset for chasing desyncs: a checksum every second at 60 fps.
    pub fn debug() -> Self {
        Self {
            checksum_interval: 60,
            event_queue_size: 256,
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if either field is zero.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.checksum_interval == 0 {
            return Err(NetplayError::InvalidRequest {
                info: "checksum_interval must be at least 1".to_owned(),
            });
        }
        if self.event_queue_size == 0 {
            return Err(NetplayError::InvalidRequest {
                info: "event_queue_size must be at least 1".to_owned(),
            });
        }
        Ok(())
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
    fn test_sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.request_retry_interval, Duration::from_millis(5));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(SyncConfig::new(), config);
    }

    #[test]
    fn test_sync_presets_are_valid() {
        for config in [
            SyncConfig::default(),
            SyncConfig::lan(),
            SyncConfig::high_latency(),
            SyncConfig::debug(),
        ] {
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_zero_retry_interval_is_rejected() {
        let config = SyncConfig {
            request_retry_interval: Duration::ZERO,
            ..SyncConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_timeout_must_exceed_retry_interval() {
        let config = SyncConfig {
            request_retry_interval: Duration::from_millis(50),
            request_timeout: Duration::from_millis(50),
            ..SyncConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("request_timeout"));
    }

    #[test]
    fn test_protocol_config_defaults_and_validation() {
        let config = ProtocolConfig::default();
        assert_eq!(config.checksum_interval, 600);
        config.validate().unwrap();
        ProtocolConfig::debug().validate().unwrap();

        let zero = ProtocolConfig {
            checksum_interval: 0,
            ..ProtocolConfig::default()
        };
        assert!(zero.validate().is_err());

        let no_queue = ProtocolConfig {
            event_queue_size: 0,
            ..ProtocolConfig::default()
        };
        assert!(no_queue.validate().is_err());
    }
}
