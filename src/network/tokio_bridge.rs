//! Tokio pump for a [`BridgeHandle`].
//!
//! [`TokioBridgeDriver`] owns the real sockets of a [`BridgeTransport`]
//! session: it connects to the relay the session asked for, moves control
//! bytes and datagrams between the bridge queues and the network, and stops
//! once the session closes its control channel.
//!
//! The session itself stays synchronous. Run it on its own thread (or in
//! `spawn_blocking`) while the driver runs on the runtime.
//!
//! ```no_run
//! use fortress_netplay::{BridgeConfig, BridgeTransport, SessionBuilder, TokioBridgeDriver};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (transport, handle) = BridgeTransport::new(BridgeConfig::default());
//!     let driver = tokio::spawn(TokioBridgeDriver::new(handle).run());
//!
//!     let host = tokio::task::spawn_blocking(move || -> Result<(), fortress_netplay::NetplayError> {
//!         let session = SessionBuilder::new().start(transport, "relay.example", 45000)?;
//!         // handshake and input polling run here, on a blocking thread
//!         session.stop();
//!         Ok(())
//!     });
//!
//!     host.await??;
//!     driver.await??;
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flag
//!
//! This module requires the `tokio` feature flag:
//!
//! ```toml
//! [dependencies]
//! fortress-netplay = { version = "0.1", features = ["tokio"] }
//! ```
//!
//! [`BridgeTransport`]: crate::BridgeTransport

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use web_time::Duration;

use crate::network::bridge::BridgeHandle;
use crate::NetplayError;

/// Size of the receive buffers. Same as the native datagram socket.
const RECV_BUFFER_SIZE: usize = 4096;

/// Moves bytes between a [`BridgeHandle`] and tokio sockets.
#[derive(Debug)]
pub struct TokioBridgeDriver {
    handle: BridgeHandle,
    flush_interval: Duration,
}

impl TokioBridgeDriver {
    /// Creates a driver that flushes outgoing traffic every millisecond.
    #[must_use]
    pub fn new(handle: BridgeHandle) -> Self {
        Self {
            handle,
            flush_interval: Duration::from_millis(1),
        }
    }

    /// Sets how often queued outgoing traffic is written to the sockets.
    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval.max(Duration::from_micros(100));
        self
    }

    /// Pumps traffic until the session closes its control channel.
    ///
    /// # Errors
    ///
    /// [`NetplayError::TransportFailure`] if a socket cannot be opened or fails
    /// mid-session. The bridge's control channel is marked closed first, so a
    /// session blocked on a read wakes up.
    pub async fn run(self) -> Result<(), NetplayError> {
        let result = self.pump().await;
        if let Err(err) = &result {
            warn!("Bridge driver stopped: {}", err);
            self.handle.close_reliable();
        }
        result
    }

    async fn pump(&self) -> Result<(), NetplayError> {
        let handle = &self.handle;
        let (endpoint, port) = loop {
            if handle.is_closed() {
                return Ok(());
            }
            if let (Some(endpoint), Some(port)) = (handle.reliable_endpoint(), handle.datagram_port())
            {
                break (endpoint, port);
            }
            tokio::time::sleep(self.flush_interval).await;
        };

        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        tcp.set_nodelay(true)?;
        let (mut reader, mut writer) = tcp.into_split();
        let udp = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
        info!("Bridge driver connected to {}", endpoint);

        let mut tcp_buffer = [0u8; RECV_BUFFER_SIZE];
        let mut udp_buffer = [0u8; RECV_BUFFER_SIZE];
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tcp_open = true;

        loop {
            tokio::select! {
                read = reader.read(&mut tcp_buffer), if tcp_open => match read {
                    Ok(0) => {
                        debug!("Relay closed the control channel");
                        tcp_open = false;
                        handle.close_reliable();
                    },
                    Ok(n) => handle.push_incoming_reliable(&tcp_buffer[..n]),
                    Err(err) => {
                        warn!("Control channel read failed: {}", err);
                        tcp_open = false;
                        handle.close_reliable();
                    },
                },
                received = udp.recv_from(&mut udp_buffer) => match received {
                    Ok((n, _from)) => handle.push_incoming_datagram(udp_buffer[..n].to_vec()),
                    // a previous send_to hit a closed port
                    Err(ref err) if err.kind() == ErrorKind::ConnectionReset => {},
                    Err(err) => return Err(err.into()),
                },
                _ = ticker.tick() => {
                    let outgoing = handle.pop_outgoing_reliable();
                    if tcp_open && !outgoing.is_empty() {
                        writer.write_all(&outgoing).await?;
                    }
                    while let Some((destination, bytes)) = handle.pop_outgoing_datagram() {
                        udp.send_to(&bytes, (destination.host.as_str(), destination.port))
                            .await?;
                    }
                    if handle.is_closed() {
                        // the relay may already have hung up
                        let _ = writer.shutdown().await;
                        debug!("Bridge driver finished");
                        return Ok(());
                    }
                },
            }
        }
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
    use crate::network::bridge::{BridgeConfig, BridgeTransport};
    use crate::network::transport::{recv_exact, DatagramSocket, Endpoint, ReliableStream, Transport};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_driver_exits_when_session_already_closed() {
        let (mut transport, handle) = BridgeTransport::new(BridgeConfig::default());
        let mut stream = transport
            .open_reliable(&Endpoint::new("127.0.0.1", 1))
            .unwrap();
        stream.close();
        let driver = TokioBridgeDriver::new(handle).with_flush_interval(Duration::from_millis(2));
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), driver.run())
            .await
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    #[cfg(not(miri))]
    async fn test_connect_failure_wakes_the_session() {
        // bind then drop to find a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (mut transport, handle) = BridgeTransport::new(BridgeConfig::default());
        let mut stream = transport
            .open_reliable(&Endpoint::new("127.0.0.1", port))
            .unwrap();
        let _socket = transport.open_datagram(0).unwrap();

        let result = TokioBridgeDriver::new(handle.clone()).run().await;
        assert!(matches!(
            result,
            Err(NetplayError::TransportFailure { .. })
        ));
        let mut buf = [0u8; 1];
        assert_eq!(stream.recv(&mut buf).unwrap(), 0);
    }

    #[tokio::test]
    #[cfg(not(miri))]
    async fn test_driver_pumps_both_channels() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_port = listener.local_addr().unwrap().port();
        let relay_udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_port = relay_udp.local_addr().unwrap().port();

        let (mut transport, handle) = BridgeTransport::new(BridgeConfig {
            recv_timeout: Duration::from_secs(5),
            ..BridgeConfig::default()
        });
        let mut stream = transport
            .open_reliable(&Endpoint::new("127.0.0.1", tcp_port))
            .unwrap();
        let mut socket = transport.open_datagram(0).unwrap();
        let route = socket
            .bind_route(&Endpoint::new("127.0.0.1", udp_port))
            .unwrap();

        let driver = tokio::spawn(TokioBridgeDriver::new(handle).run());
        let (mut peer, _) = listener.accept().await.unwrap();

        // session -> relay over the control channel
        stream.send(&[7, 7]).unwrap();
        let mut tag = [0u8; 2];
        peer.read_exact(&mut tag).await.unwrap();
        assert_eq!(tag, [7, 7]);

        // relay -> session; the read blocks, so it runs off the runtime thread
        peer.write_all(&[1, 2, 3]).await.unwrap();
        let (mut stream, reply) = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 3];
            recv_exact(&mut stream, &mut buf, "reply").unwrap();
            (stream, buf)
        })
        .await
        .unwrap();
        assert_eq!(reply, [1, 2, 3]);

        // datagrams both ways
        socket.send(route, &[2, 0, 1]).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = relay_udp.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[2, 0, 1]);
        relay_udp.send_to(&[3, 9], from).await.unwrap();

        let mut received = None;
        for _ in 0..200 {
            if let Some(bytes) = socket.recv().unwrap() {
                received = Some(bytes);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(received, Some(vec![3, 9]));

        stream.close();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), driver)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
