//! A [`Transport`] whose sockets live outside the session.
//!
//! Some embeddings cannot hand the session real sockets: the frontend owns
//! its own event loop, or traffic is tunnelled through another runtime. The
//! bridge splits every channel in two. The session side ([`BridgeTransport`])
//! behaves like a blocking stream and a non-blocking datagram socket, while the
//! host side ([`BridgeHandle`]) moves bytes between those queues and whatever
//! actually talks to the relay.
//!
//! ```
//! use fortress_netplay::{BridgeConfig, BridgeTransport, Endpoint, ReliableStream, Transport};
//!
//! # fn main() -> Result<(), fortress_netplay::NetplayError> {
//! let (mut transport, handle) = BridgeTransport::new(BridgeConfig::default());
//! let mut stream = transport.open_reliable(&Endpoint::new("relay", 45000))?;
//!
//! stream.send(&[0x05, 0x01])?;
//! assert_eq!(handle.pop_outgoing_reliable(), vec![0x05, 0x01]);
//!
//! handle.push_incoming_reliable(&[1, 0]);
//! let mut reply = [0u8; 2];
//! assert_eq!(stream.recv(&mut reply)?, 2);
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;
use web_time::{Duration, Instant};

use crate::network::transport::{DatagramSocket, Endpoint, ReliableStream, RouteId, Transport};
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::NetplayError;

/// Limits for a [`BridgeTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "BridgeConfig has no effect unless passed to BridgeTransport::new()"]
pub struct BridgeConfig {
    /// How long a control-channel read waits for the host to push bytes.
    ///
    /// Default: 10 seconds
    pub recv_timeout: Duration,
    /// Incoming datagrams buffered before the oldest one is dropped.
    ///
    /// Default: 256
    pub datagram_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_secs(10),
            datagram_capacity: 256,
        }
    }
}

impl BridgeConfig {
    /// Creates a new `BridgeConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Default)]
struct BridgeState {
    reliable_endpoint: Option<Endpoint>,
    reliable_in: VecDeque<u8>,
    reliable_out: Vec<u8>,
    /// The relay side of the control channel hung up.
    peer_closed: bool,
    /// The session closed its control channel.
    session_closed: bool,
    datagram_port: Option<u16>,
    routes: Vec<Endpoint>,
    datagrams_in: VecDeque<Vec<u8>>,
    datagrams_out: VecDeque<(Endpoint, Vec<u8>)>,
    datagram_closed: bool,
    dropped_datagrams: u64,
}

#[derive(Debug, Default)]
struct BridgeShared {
    state: Mutex<BridgeState>,
    readable: Condvar,
}

/// Session side of the bridge. Pass it to [`SessionBuilder::start`].
///
/// [`SessionBuilder::start`]: crate::SessionBuilder::start
#[derive(Debug)]
pub struct BridgeTransport {
    shared: Arc<BridgeShared>,
    config: BridgeConfig,
}

/// Host side of the bridge.
///
/// Cheap to clone; every clone drives the same queues.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    shared: Arc<BridgeShared>,
    datagram_capacity: usize,
}

impl BridgeTransport {
    /// Creates a connected transport and handle pair.
    #[must_use]
    pub fn new(config: BridgeConfig) -> (Self, BridgeHandle) {
        let shared = Arc::new(BridgeShared::default());
        let handle = BridgeHandle {
            shared: Arc::clone(&shared),
            datagram_capacity: config.datagram_capacity.max(1),
        };
        (Self { shared, config }, handle)
    }
}

impl Transport for BridgeTransport {
    type Stream = BridgeStream;
    type Datagram = BridgeDatagram;

    fn open_reliable(&mut self, endpoint: &Endpoint) -> Result<BridgeStream, NetplayError> {
        let mut state = self.shared.state.lock();
        state.reliable_endpoint = Some(endpoint.clone());
        state.reliable_in.clear();
        state.reliable_out.clear();
        state.peer_closed = false;
        state.session_closed = false;
        debug!("Bridge control channel opened for {}", endpoint);
        Ok(BridgeStream {
            shared: Arc::clone(&self.shared),
            recv_timeout: self.config.recv_timeout,
        })
    }

    fn open_datagram(&mut self, port: u16) -> Result<BridgeDatagram, NetplayError> {
        let mut state = self.shared.state.lock();
        state.datagram_port = Some(port);
        state.routes.clear();
        state.datagrams_in.clear();
        state.datagrams_out.clear();
        state.datagram_closed = false;
        Ok(BridgeDatagram {
            shared: Arc::clone(&self.shared),
        })
    }
}

/// Control channel half handed to the session.
#[derive(Debug)]
pub struct BridgeStream {
    shared: Arc<BridgeShared>,
    recv_timeout: Duration,
}

impl ReliableStream for BridgeStream {
    fn send(&mut self, bytes: &[u8]) -> Result<usize, NetplayError> {
        let mut state = self.shared.state.lock();
        if state.session_closed || state.peer_closed {
            return Err(NetplayError::TransportFailure {
                context: "bridge control channel is closed".to_owned(),
            });
        }
        state.reliable_out.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, NetplayError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + self.recv_timeout;
        let mut state = self.shared.state.lock();
        loop {
            if state.session_closed {
                return Err(NetplayError::TransportFailure {
                    context: "bridge control channel is closed".to_owned(),
                });
            }
            if !state.reliable_in.is_empty() {
                let count = buf.len().min(state.reliable_in.len());
                for (slot, byte) in buf.iter_mut().zip(state.reliable_in.drain(..count)) {
                    *slot = byte;
                }
                return Ok(count);
            }
            if state.peer_closed {
                return Ok(0);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(NetplayError::TransportFailure {
                    context: format!(
                        "bridge control channel read timed out after {}ms",
                        self.recv_timeout.as_millis()
                    ),
                });
            }
            // spurious wakeups loop back through the checks above
            let _ = self.shared.readable.wait_for(&mut state, deadline - now);
        }
    }

    fn close(&mut self) {
        let mut state = self.shared.state.lock();
        state.session_closed = true;
        self.shared.readable.notify_all();
    }
}

/// Datagram half handed to the session.
#[derive(Debug)]
pub struct BridgeDatagram {
    shared: Arc<BridgeShared>,
}

impl DatagramSocket for BridgeDatagram {
    fn bind_route(&mut self, endpoint: &Endpoint) -> Result<RouteId, NetplayError> {
        let mut state = self.shared.state.lock();
        let id = u32::try_from(state.routes.len()).map_err(|_| NetplayError::InternalError {
            context: "too many datagram routes".to_owned(),
        })?;
        state.routes.push(endpoint.clone());
        Ok(RouteId(id))
    }

    fn send(&mut self, route: RouteId, bytes: &[u8]) -> Result<usize, NetplayError> {
        let mut state = self.shared.state.lock();
        if state.datagram_closed {
            return Err(NetplayError::TransportFailure {
                context: "bridge datagram socket is closed".to_owned(),
            });
        }
        let endpoint = state.routes.get(route.0 as usize).cloned().ok_or_else(|| {
            NetplayError::InvalidRequest {
                info: format!("datagram route {} was never bound", route.0),
            }
        })?;
        state.datagrams_out.push_back((endpoint, bytes.to_vec()));
        Ok(bytes.len())
    }

    fn recv(&mut self) -> Result<Option<Vec<u8>>, NetplayError> {
        let mut state = self.shared.state.lock();
        if state.datagram_closed {
            return Err(NetplayError::TransportFailure {
                context: "bridge datagram socket is closed".to_owned(),
            });
        }
        Ok(state.datagrams_in.pop_front())
    }

    fn close(&mut self) {
        let mut state = self.shared.state.lock();
        state.datagram_closed = true;
        state.datagrams_in.clear();
    }
}

impl BridgeHandle {
    /// Where the session asked its control channel to connect, once it has.
    #[must_use]
    pub fn reliable_endpoint(&self) -> Option<Endpoint> {
        self.shared.state.lock().reliable_endpoint.clone()
    }

    /// The local port the session asked the datagram socket to bind, once it has.
    #[must_use]
    pub fn datagram_port(&self) -> Option<u16> {
        self.shared.state.lock().datagram_port
    }

    /// Delivers bytes the relay sent on the control channel.
    pub fn push_incoming_reliable(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut state = self.shared.state.lock();
        state.reliable_in.extend(bytes.iter().copied());
        self.shared.readable.notify_all();
    }

    /// Takes everything the session wrote to the control channel so far.
    #[must_use]
    pub fn pop_outgoing_reliable(&self) -> Vec<u8> {
        std::mem::take(&mut self.shared.state.lock().reliable_out)
    }

    /// Signals that the relay hung up the control channel.
    ///
    /// Buffered bytes are still delivered; reads after them return 0.
    pub fn close_reliable(&self) {
        let mut state = self.shared.state.lock();
        state.peer_closed = true;
        self.shared.readable.notify_all();
    }

    /// `true` once the session closed its control channel.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().session_closed
    }

    /// Delivers a datagram from the relay.
    ///
    /// When the buffer is full the oldest datagram is dropped.
    pub fn push_incoming_datagram(&self, bytes: Vec<u8>) {
        let mut state = self.shared.state.lock();
        if state.datagram_closed {
            return;
        }
        if state.datagrams_in.len() >= self.datagram_capacity {
            state.datagrams_in.pop_front();
            state.dropped_datagrams += 1;
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Bridge datagram buffer full ({}), dropped the oldest datagram",
                self.datagram_capacity
            );
        }
        state.datagrams_in.push_back(bytes);
    }

    /// Takes the next datagram the session sent, with its destination.
    #[must_use]
    pub fn pop_outgoing_datagram(&self) -> Option<(Endpoint, Vec<u8>)> {
        self.shared.state.lock().datagrams_out.pop_front()
    }

    /// Incoming datagrams discarded because the buffer was full.
    #[must_use]
    pub fn dropped_datagrams(&self) -> u64 {
        self.shared.state.lock().dropped_datagrams
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
    use crate::network::transport::recv_exact;
    use std::thread;

    fn endpoint() -> Endpoint {
        Endpoint::new("relay", 45000)
    }

    fn quick_config() -> BridgeConfig {
        BridgeConfig {
            recv_timeout: Duration::from_millis(30),
            datagram_capacity: 2,
        }
    }

    #[test]
    fn test_open_records_endpoint_and_port() {
        let (mut transport, handle) = BridgeTransport::new(BridgeConfig::new());
        assert_eq!(handle.reliable_endpoint(), None);
        let _stream = transport.open_reliable(&endpoint()).unwrap();
        let _socket = transport.open_datagram(0).unwrap();
        assert_eq!(handle.reliable_endpoint(), Some(endpoint()));
        assert_eq!(handle.datagram_port(), Some(0));
    }

    #[test]
    fn test_recv_wakes_when_host_pushes() {
        let (mut transport, handle) = BridgeTransport::new(BridgeConfig::default());
        let mut stream = transport.open_reliable(&endpoint()).unwrap();

        let pusher = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(10));
            handle.push_incoming_reliable(&[1, 2]);
            thread::sleep(std::time::Duration::from_millis(10));
            handle.push_incoming_reliable(&[3]);
        });

        let mut buf = [0u8; 3];
        recv_exact(&mut stream, &mut buf, "settings").unwrap();
        assert_eq!(buf, [1, 2, 3]);
        pusher.join().unwrap();
    }

    #[test]
    fn test_recv_times_out() {
        let (mut transport, _handle) = BridgeTransport::new(quick_config());
        let mut stream = transport.open_reliable(&endpoint()).unwrap();
        let mut buf = [0u8; 1];
        let err = stream.recv(&mut buf).unwrap_err();
        assert!(matches!(err, NetplayError::TransportFailure { .. }));
    }

    #[test]
    fn test_peer_close_drains_then_reports_eof() {
        let (mut transport, handle) = BridgeTransport::new(quick_config());
        let mut stream = transport.open_reliable(&endpoint()).unwrap();
        handle.push_incoming_reliable(&[9]);
        handle.close_reliable();

        let mut buf = [0u8; 4];
        assert_eq!(stream.recv(&mut buf).unwrap(), 1);
        assert_eq!(stream.recv(&mut buf).unwrap(), 0);
        assert!(stream.send(&[1]).is_err());
    }

    #[test]
    fn test_session_close_is_visible_to_host() {
        let (mut transport, handle) = BridgeTransport::new(quick_config());
        let mut stream = transport.open_reliable(&endpoint()).unwrap();
        stream.send(&[4, 0, 0, 0, 1]).unwrap();
        stream.close();
        assert!(handle.is_closed());
        assert_eq!(handle.pop_outgoing_reliable(), vec![4, 0, 0, 0, 1]);
        assert!(handle.pop_outgoing_reliable().is_empty());
    }

    #[test]
    fn test_datagrams_route_to_bound_endpoint() {
        let (mut transport, handle) = BridgeTransport::new(quick_config());
        let mut socket = transport.open_datagram(0).unwrap();
        let route = socket.bind_route(&endpoint()).unwrap();
        assert_eq!(route, RouteId(0));

        socket.send(route, &[2, 0, 1]).unwrap();
        assert_eq!(
            handle.pop_outgoing_datagram(),
            Some((endpoint(), vec![2, 0, 1]))
        );
        assert_eq!(handle.pop_outgoing_datagram(), None);
        assert!(matches!(
            socket.send(RouteId(5), &[1]),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_full_datagram_buffer_drops_oldest() {
        let (mut transport, handle) = BridgeTransport::new(quick_config());
        let mut socket = transport.open_datagram(0).unwrap();

        handle.push_incoming_datagram(vec![1]);
        handle.push_incoming_datagram(vec![2]);
        handle.push_incoming_datagram(vec![3]);

        assert_eq!(handle.dropped_datagrams(), 1);
        assert_eq!(socket.recv().unwrap(), Some(vec![2]));
        assert_eq!(socket.recv().unwrap(), Some(vec![3]));
        assert_eq!(socket.recv().unwrap(), None);
    }

    #[test]
    fn test_closed_datagram_socket_fails() {
        let (mut transport, handle) = BridgeTransport::new(quick_config());
        let mut socket = transport.open_datagram(0).unwrap();
        socket.close();
        handle.push_incoming_datagram(vec![1]);
        assert!(socket.recv().is_err());
    }
}
