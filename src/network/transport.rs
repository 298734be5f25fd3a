//! The byte-transport boundary.
//!
//! The engine talks to the relay over two channels: an ordered, reliable byte
//! stream for the session handshake and an unordered, unreliable datagram socket
//! for per-frame input. Implement [`Transport`] to run the engine over something
//! other than the bundled [`NativeTransport`](crate::NativeTransport) and
//! [`BridgeTransport`](crate::BridgeTransport).

use crate::NetplayError;

/// A relay address as the host configured it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    /// Host name or IP literal.
    pub host: String,
    /// Port number.
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Handle for a destination bound on a [`DatagramSocket`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(pub u32);

/// Ordered, reliable byte stream (TCP or equivalent).
pub trait ReliableStream {
    /// Writes `bytes`, returning how many were accepted.
    fn send(&mut self, bytes: &[u8]) -> Result<usize, NetplayError>;

    /// Reads into `buf`, blocking until at least one byte is available.
    ///
    /// Returns `Ok(0)` once the peer has closed the stream.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, NetplayError>;

    /// Closes the stream. Further calls fail.
    fn close(&mut self);
}

/// Unordered, unreliable datagram socket (UDP or equivalent).
pub trait DatagramSocket {
    /// Registers a destination and returns the handle used to send to it.
    fn bind_route(&mut self, endpoint: &Endpoint) -> Result<RouteId, NetplayError>;

    /// Sends one datagram to a bound route.
    fn send(&mut self, route: RouteId, bytes: &[u8]) -> Result<usize, NetplayError>;

    /// Returns the next received datagram, or `None` if none is waiting. Never blocks.
    fn recv(&mut self) -> Result<Option<Vec<u8>>, NetplayError>;

    /// Closes the socket. Further calls fail.
    fn close(&mut self);
}

/// Opens both channels to a relay.
pub trait Transport {
    /// The reliable stream type.
    type Stream: ReliableStream;
    /// The datagram socket type.
    type Datagram: DatagramSocket;

    /// Connects the reliable stream to `endpoint`.
    fn open_reliable(&mut self, endpoint: &Endpoint) -> Result<Self::Stream, NetplayError>;

    /// Opens a datagram socket on a local port (0 for any).
    fn open_datagram(&mut self, port: u16) -> Result<Self::Datagram, NetplayError>;
}

/// Reads exactly `buf.len()` bytes.
///
/// A stream that closes early yields [`NetplayError::TruncatedPacket`] naming `kind`.
pub fn recv_exact<S: ReliableStream + ?Sized>(
    stream: &mut S,
    buf: &mut [u8],
    kind: &'static str,
) -> Result<(), NetplayError> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = stream.recv(&mut buf[filled..])?;
        if read == 0 {
            return Err(NetplayError::TruncatedPacket {
                kind,
                expected: buf.len(),
                actual: filled,
            });
        }
        filled += read;
    }
    Ok(())
}

/// Writes all of `bytes`.
///
/// A stream that stops accepting bytes yields [`NetplayError::TransportFailure`].
pub fn send_all<S: ReliableStream + ?Sized>(
    stream: &mut S,
    bytes: &[u8],
) -> Result<(), NetplayError> {
    let mut sent = 0;
    while sent < bytes.len() {
        let written = stream.send(&bytes[sent..])?;
        if written == 0 {
            return Err(NetplayError::TransportFailure {
                context: format!("stream accepted {} of {} bytes", sent, bytes.len()),
            });
        }
        sent += written;
    }
    Ok(())
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
    use std::collections::VecDeque;

    // Hands out its bytes a few at a time, then reports closed.
    struct Trickle {
        data: VecDeque<u8>,
        chunk: usize,
        accepted: usize,
    }

    impl ReliableStream for Trickle {
        fn send(&mut self, bytes: &[u8]) -> Result<usize, NetplayError> {
            let n = bytes.len().min(self.accepted);
            self.accepted -= n;
            Ok(n)
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<usize, NetplayError> {
            let n = buf.len().min(self.chunk).min(self.data.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.data.pop_front().unwrap();
            }
            Ok(n)
        }

        fn close(&mut self) {}
    }

    #[test]
    fn test_recv_exact_reassembles_chunks() {
        let mut stream = Trickle {
            data: (0..10).collect(),
            chunk: 3,
            accepted: 0,
        };
        let mut buf = [0u8; 10];
        recv_exact(&mut stream, &mut buf, "test").unwrap();
        assert_eq!(buf, [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_recv_exact_on_early_close_is_truncated() {
        let mut stream = Trickle {
            data: (0..4).collect(),
            chunk: 8,
            accepted: 0,
        };
        let mut buf = [0u8; 24];
        assert_eq!(
            recv_exact(&mut stream, &mut buf, "registration table").unwrap_err(),
            NetplayError::TruncatedPacket {
                kind: "registration table",
                expected: 24,
                actual: 4,
            }
        );
    }

    #[test]
    fn test_send_all_reports_stalled_stream() {
        let mut stream = Trickle {
            data: VecDeque::new(),
            chunk: 0,
            accepted: 3,
        };
        let err = send_all(&mut stream, &[1, 2, 3, 4, 5]).unwrap_err();
        assert!(matches!(err, NetplayError::TransportFailure { .. }));
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("relay.local", 45000).to_string(), "relay.local:45000");
    }
}
