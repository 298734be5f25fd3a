use std::{
    io::{ErrorKind, Read, Write},
    net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket},
};

use tracing::debug;
use web_time::Duration;

use crate::network::transport::{DatagramSocket, Endpoint, ReliableStream, RouteId, Transport};
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::NetplayError;

const RECV_BUFFER_SIZE: usize = 4096;
/// A packet larger than this may be fragmented, so ideally we wouldn't send packets larger than
/// this.
/// Source: <https://stackoverflow.com/a/35697810/775982>
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

fn closed(channel: &str) -> NetplayError {
    NetplayError::TransportFailure {
        context: format!("{channel} is closed"),
    }
}

/// [`Transport`] over the operating system's TCP and UDP sockets.
///
/// # Example
///
/// ```no_run
/// use fortress_netplay::{NativeTransport, SessionBuilder};
/// use web_time::Duration;
///
/// # fn main() -> Result<(), fortress_netplay::NetplayError> {
/// let transport = NativeTransport::new().with_read_timeout(Duration::from_secs(30));
/// let session = SessionBuilder::new().start(transport, "relay.example", 45000)?;
/// # let _ = session;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeTransport {
    read_timeout: Option<Duration>,
}

impl NativeTransport {
    /// A transport whose control-channel reads block until the relay answers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails control-channel reads that wait longer than `timeout`.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

impl Transport for NativeTransport {
    type Stream = NativeStream;
    type Datagram = NativeDatagram;

    fn open_reliable(&mut self, endpoint: &Endpoint) -> Result<NativeStream, NetplayError> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(self.read_timeout)?;
        debug!("TCP connected to {}", endpoint);
        Ok(NativeStream {
            stream: Some(stream),
        })
    }

    fn open_datagram(&mut self, port: u16) -> Result<NativeDatagram, NetplayError> {
        NativeDatagram::bind_to_port(port)
    }
}

/// Control channel over a [`TcpStream`].
#[derive(Debug)]
pub struct NativeStream {
    stream: Option<TcpStream>,
}

impl ReliableStream for NativeStream {
    fn send(&mut self, bytes: &[u8]) -> Result<usize, NetplayError> {
        let stream = self.stream.as_mut().ok_or_else(|| closed("control stream"))?;
        loop {
            match stream.write(bytes) {
                Ok(written) => return Ok(written),
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, NetplayError> {
        let stream = self.stream.as_mut().ok_or_else(|| closed("control stream"))?;
        loop {
            match stream.read(buf) {
                Ok(read) => return Ok(read),
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                // the read timeout surfaces as either kind depending on the platform
                Err(ref err)
                    if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
                {
                    return Err(NetplayError::TransportFailure {
                        context: "control stream read timed out".to_owned(),
                    });
                },
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            // the peer may already be gone
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// A non-blocking UDP socket. Listens to 0.0.0.0 on a given port.
///
/// # Performance
///
/// The receive buffer is reused across calls to [`recv`] and sized well above
/// the largest datagram the relay sends.
///
/// [`recv`]: DatagramSocket::recv
#[derive(Debug)]
pub struct NativeDatagram {
    socket: Option<UdpSocket>,
    routes: Vec<SocketAddr>,
    /// Receive buffer - reused across recv calls
    recv_buffer: [u8; RECV_BUFFER_SIZE],
}

impl NativeDatagram {
    /// Binds an UDP Socket to 0.0.0.0:port and set it to non-blocking mode.
    pub fn bind_to_port(port: u16) -> Result<Self, NetplayError> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: Some(socket),
            routes: Vec::new(),
            recv_buffer: [0; RECV_BUFFER_SIZE],
        })
    }

    /// The local address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, NetplayError> {
        let socket = self.socket.as_ref().ok_or_else(|| closed("datagram socket"))?;
        Ok(socket.local_addr()?)
    }
}

impl DatagramSocket for NativeDatagram {
    fn bind_route(&mut self, endpoint: &Endpoint) -> Result<RouteId, NetplayError> {
        let candidates: Vec<SocketAddr> = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()?
            .collect();
        // the socket is bound to an IPv4 wildcard
        let addr = candidates
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| candidates.first())
            .copied()
            .ok_or_else(|| NetplayError::TransportFailure {
                context: format!("{endpoint} did not resolve to any address"),
            })?;
        let id = u32::try_from(self.routes.len()).map_err(|_| NetplayError::InternalError {
            context: "too many datagram routes".to_owned(),
        })?;
        self.routes.push(addr);
        debug!("Datagram route {} bound to {}", id, addr);
        Ok(RouteId(id))
    }

    fn send(&mut self, route: RouteId, bytes: &[u8]) -> Result<usize, NetplayError> {
        let socket = self.socket.as_ref().ok_or_else(|| closed("datagram socket"))?;
        let addr = self
            .routes
            .get(route.0 as usize)
            .ok_or_else(|| NetplayError::InvalidRequest {
                info: format!("datagram route {} was never bound", route.0),
            })?;
        // Overly large packets risk being fragmented, and any lost fragment loses the
        // whole datagram. Relay traffic is tiny unless the register set is huge.
        if bytes.len() > IDEAL_MAX_UDP_PACKET_SIZE {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Sending UDP packet of size {} bytes, which is larger than ideal ({})",
                bytes.len(),
                IDEAL_MAX_UDP_PACKET_SIZE
            );
        }
        Ok(socket.send_to(bytes, addr)?)
    }

    fn recv(&mut self) -> Result<Option<Vec<u8>>, NetplayError> {
        let socket = self.socket.as_ref().ok_or_else(|| closed("datagram socket"))?;
        loop {
            match socket.recv_from(&mut self.recv_buffer) {
                Ok((number_of_bytes, _src_addr)) => {
                    let Some(buf_slice) = self.recv_buffer.get(..number_of_bytes) else {
                        report_violation!(
                            ViolationSeverity::Error,
                            ViolationKind::NetworkProtocol,
                            "Received {} bytes but buffer is only {} bytes",
                            number_of_bytes,
                            RECV_BUFFER_SIZE
                        );
                        continue;
                    };
                    return Ok(Some(buf_slice.to_vec()));
                },
                // there are no more messages
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
                // datagram socket sometimes get this error as a result of calling the send_to method
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn close(&mut self) {
        self.socket = None;
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
    #[cfg(not(miri))]
    use crate::network::transport::recv_exact;
    #[cfg(not(miri))]
    use std::net::TcpListener;

    // Helper function to wait for a datagram with retry logic
    // This is necessary because UDP packet delivery timing can vary across platforms
    #[cfg(not(miri))]
    #[track_caller]
    fn wait_for_datagram(socket: &mut NativeDatagram, max_retries: u32) -> Option<Vec<u8>> {
        for _ in 0..max_retries {
            if let Some(bytes) = socket.recv().unwrap() {
                return Some(bytes);
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        None
    }

    // Sockets bind to 0.0.0.0:port, but on Windows you cannot send to 0.0.0.0.
    #[cfg(not(miri))]
    #[track_caller]
    fn loopback_endpoint(socket: &NativeDatagram) -> Endpoint {
        Endpoint::new("127.0.0.1", socket.local_addr().unwrap().port())
    }

    #[test]
    #[cfg(not(miri))] // Miri cannot execute foreign functions like socket()
    fn test_datagram_recv_is_non_blocking() {
        let mut socket = NativeDatagram::bind_to_port(0).unwrap();
        assert_eq!(socket.recv().unwrap(), None);
        assert_eq!(socket.recv().unwrap(), None);
    }

    #[test]
    #[cfg(not(miri))] // Miri cannot execute foreign functions like socket()
    fn test_datagram_send_and_receive() {
        let mut sender = NativeDatagram::bind_to_port(0).unwrap();
        let mut receiver = NativeDatagram::bind_to_port(0).unwrap();
        let route = sender.bind_route(&loopback_endpoint(&receiver)).unwrap();

        assert_eq!(sender.send(route, &[2, 0, 1, 2, 3]).unwrap(), 5);
        let received = wait_for_datagram(&mut receiver, 20);
        assert_eq!(received, Some(vec![2, 0, 1, 2, 3]));
    }

    #[test]
    #[cfg(not(miri))]
    fn test_unbound_route_is_rejected() {
        let mut socket = NativeDatagram::bind_to_port(0).unwrap();
        assert!(matches!(
            socket.send(RouteId(3), &[1]),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    #[cfg(not(miri))]
    fn test_closed_datagram_socket_fails() {
        let mut socket = NativeDatagram::bind_to_port(0).unwrap();
        socket.close();
        assert!(matches!(
            socket.recv(),
            Err(NetplayError::TransportFailure { .. })
        ));
    }

    #[test]
    #[cfg(not(miri))]
    fn test_stream_reads_what_the_peer_wrote() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut stream = NativeTransport::new()
            .open_reliable(&Endpoint::new("127.0.0.1", port))
            .unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        peer.write_all(&[1, 3]).unwrap();
        let mut reply = [0u8; 2];
        recv_exact(&mut stream, &mut reply, "register reply").unwrap();
        assert_eq!(reply, [1, 3]);

        assert_eq!(stream.send(&[6]).unwrap(), 1);
        let mut tag = [0u8; 1];
        peer.read_exact(&mut tag).unwrap();
        assert_eq!(tag, [6]);

        drop(peer);
        assert_eq!(stream.recv(&mut reply).unwrap(), 0);
        stream.close();
        assert!(stream.send(&[7]).is_err());
    }

    #[test]
    #[cfg(not(miri))]
    fn test_stream_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut stream = NativeTransport::new()
            .with_read_timeout(Duration::from_millis(20))
            .open_reliable(&Endpoint::new("127.0.0.1", port))
            .unwrap();
        let (_peer, _) = listener.accept().unwrap();

        let mut buf = [0u8; 4];
        let err = stream.recv(&mut buf).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_ideal_max_udp_packet_size_constant() {
        // 508 bytes is the safe payload size to avoid fragmentation
        assert_eq!(IDEAL_MAX_UDP_PACKET_SIZE, 508);
        const _: () = assert!(RECV_BUFFER_SIZE > IDEAL_MAX_UDP_PACKET_SIZE);
    }
}
