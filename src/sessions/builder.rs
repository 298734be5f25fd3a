use std::sync::Arc;

use tracing::{debug, info};

use crate::network::transport::{DatagramSocket, Endpoint, Transport};
use crate::report_violation_to;
use crate::sessions::netplay_session::NetplaySession;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::NetplayError;

// Re-export config types for code that imports from builder
pub use crate::sessions::config::{ProtocolConfig, SyncConfig};

/// The [`SessionBuilder`] builds netplay sessions.
///
/// After setting all appropriate values, use [`SessionBuilder::start`] to consume
/// the builder, connect to the relay and create a [`NetplaySession`].
///
/// # Example
///
/// ```no_run
/// use fortress_netplay::{NativeTransport, SessionBuilder, SyncConfig};
///
/// # fn main() -> Result<(), fortress_netplay::NetplayError> {
/// let session = SessionBuilder::new()
///     .with_sync_config(SyncConfig::lan())
///     .start(NativeTransport::new(), "192.168.1.20", 45000)?;
/// # let _ = session;
/// # Ok(())
/// # }
/// ```
#[must_use = "SessionBuilder must be consumed by calling start()"]
#[derive(Default)]
pub struct SessionBuilder {
    /// Configuration for the input request loop.
    sync_config: SyncConfig,
    /// Configuration for checksums and event buffering.
    protocol_config: ProtocolConfig,
    /// Optional observer for protocol violations.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            sync_config,
            protocol_config,
            violation_observer,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("sync_config", sync_config)
            .field("protocol_config", protocol_config)
            .field("violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl SessionBuilder {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the input request retry and timeout behavior.
    pub fn with_sync_config(mut self, sync_config: SyncConfig) -> Self {
        self.sync_config = sync_config;
        self
    }

    /// Sets the checksum cadence and event queue size.
    pub fn with_protocol_config(mut self, protocol_config: ProtocolConfig) -> Self {
        self.protocol_config = protocol_config;
        self
    }

    /// Sets a custom observer for protocol violations.
    ///
    /// Without one, violations are logged through `tracing`.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use fortress_netplay::SessionBuilder;
    /// use fortress_netplay::telemetry::CollectingObserver;
    ///
    /// let observer = Arc::new(CollectingObserver::new());
    /// let builder = SessionBuilder::new().with_violation_observer(observer.clone());
    /// # let _ = builder;
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Consumes the builder, connects both channels to the relay and returns the session.
    ///
    /// The reliable stream connects to `host:port`; the datagram socket is opened
    /// on an ephemeral local port and routed to the same address.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] if a configuration does not validate, and
    /// [`NetplayError::TransportFailure`] if either channel cannot be opened.
    pub fn start<T: Transport>(
        self,
        mut transport: T,
        host: &str,
        port: u16,
    ) -> Result<NetplaySession<T>, NetplayError> {
        self.sync_config.validate()?;
        self.protocol_config.validate()?;
        if self.sync_config.poll_slice > self.sync_config.request_retry_interval {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Configuration,
                "poll_slice {:?} exceeds request_retry_interval {:?}, requests will be retried once per slice",
                self.sync_config.poll_slice,
                self.sync_config.request_retry_interval
            );
        }
        let endpoint = Endpoint::new(host, port);

        let stream = transport.open_reliable(&endpoint)?;
        debug!("Control channel connected to {}", endpoint);
        let mut datagram = transport.open_datagram(0)?;
        let route = match datagram.bind_route(&endpoint) {
            Ok(route) => route,
            Err(err) => {
                datagram.close();
                return Err(err);
            },
        };
        info!("Netplay session started with relay {}", endpoint);

        Ok(NetplaySession::new(
            stream,
            datagram,
            route,
            self.sync_config,
            self.protocol_config,
            self.violation_observer,
        ))
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
    use crate::network::transport::{ReliableStream, RouteId};
    use crate::telemetry::CollectingObserver;
    use web_time::Duration;

    struct Unreachable;

    impl ReliableStream for Unreachable {
        fn send(&mut self, _bytes: &[u8]) -> Result<usize, NetplayError> {
            unreachable!()
        }
        fn recv(&mut self, _buf: &mut [u8]) -> Result<usize, NetplayError> {
            unreachable!()
        }
        fn close(&mut self) {}
    }

    impl DatagramSocket for Unreachable {
        fn bind_route(&mut self, _endpoint: &Endpoint) -> Result<RouteId, NetplayError> {
            Err(NetplayError::TransportFailure {
                context: "no route".to_owned(),
            })
        }
        fn send(&mut self, _route: RouteId, _bytes: &[u8]) -> Result<usize, NetplayError> {
            unreachable!()
        }
        fn recv(&mut self) -> Result<Option<Vec<u8>>, NetplayError> {
            Ok(None)
        }
        fn close(&mut self) {}
    }

    struct UnreachableTransport;

    impl Transport for UnreachableTransport {
        type Stream = Unreachable;
        type Datagram = Unreachable;

        fn open_reliable(&mut self, endpoint: &Endpoint) -> Result<Unreachable, NetplayError> {
            assert_eq!(endpoint, &Endpoint::new("relay", 7));
            Ok(Unreachable)
        }

        fn open_datagram(&mut self, port: u16) -> Result<Unreachable, NetplayError> {
            assert_eq!(port, 0);
            Ok(Unreachable)
        }
    }

    #[test]
    fn test_invalid_config_is_rejected_before_connecting() {
        let builder = SessionBuilder::new().with_sync_config(SyncConfig {
            poll_slice: Duration::ZERO,
            ..SyncConfig::default()
        });
        let err = builder
            .start(UnreachableTransport, "relay", 7)
            .unwrap_err();
        assert!(matches!(err, NetplayError::InvalidRequest { .. }));
    }

    #[test]
    fn test_route_failure_is_reported() {
        let err = SessionBuilder::new()
            .start(UnreachableTransport, "relay", 7)
            .unwrap_err();
        assert!(matches!(err, NetplayError::TransportFailure { .. }));
    }

    #[test]
    fn test_poll_slice_longer_than_retry_interval_is_flagged() {
        let observer = Arc::new(CollectingObserver::new());
        let builder = SessionBuilder::new()
            .with_sync_config(SyncConfig {
                request_retry_interval: Duration::from_millis(2),
                poll_slice: Duration::from_millis(20),
                ..SyncConfig::default()
            })
            .with_violation_observer(observer.clone());
        let _ = builder.start(UnreachableTransport, "relay", 7);
        let flagged = observer.violations_of_kind(ViolationKind::Configuration);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].severity, ViolationSeverity::Warning);
    }

    #[test]
    fn test_default_config_raises_no_configuration_warning() {
        let observer = Arc::new(CollectingObserver::new());
        let _ = SessionBuilder::new()
            .with_violation_observer(observer.clone())
            .start(UnreachableTransport, "relay", 7);
        assert!(!observer.has_violation(ViolationKind::Configuration));
    }

    #[test]
    fn test_builder_debug_hides_observer() {
        let builder = SessionBuilder::new();
        let debug = format!("{builder:?}");
        assert!(debug.contains("violation_observer: false"));
    }
}
