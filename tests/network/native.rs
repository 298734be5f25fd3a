//! A full session over [`NativeTransport`] against a loopback relay.
//!
//! The relay listens for the control channel on a TCP port and takes
//! datagrams on the UDP port with the same number, the way the real relay
//! shares one port between both channels.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, UdpSocket};
use std::thread;
use std::time::Instant;

use super::script::{play_owner_session, ScriptedRelay, PLAYED_BUTTONS};
use fortress_netplay::{NativeTransport, NetplayError};
use serial_test::serial;
use web_time::Duration;

/// Binds a TCP listener and a UDP socket sharing one loopback port.
fn bind_relay() -> (TcpListener, UdpSocket) {
    for _ in 0..20 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        if let Ok(udp) = UdpSocket::bind(("127.0.0.1", port)) {
            return (listener, udp);
        }
    }
    panic!("no loopback port free for both TCP and UDP");
}

/// Serves one client until it hangs up the control channel.
fn serve(listener: &TcpListener, udp: &UdpSocket) -> ScriptedRelay {
    let (mut stream, _) = listener.accept().unwrap();
    stream.set_nonblocking(true).unwrap();
    udp.set_nonblocking(true).unwrap();

    let mut relay = ScriptedRelay::new();
    let mut control = [0u8; 1024];
    let mut datagram = [0u8; 1024];
    let deadline = Instant::now() + std::time::Duration::from_secs(20);
    while Instant::now() < deadline {
        match stream.read(&mut control) {
            Ok(0) => return relay,
            Ok(n) => {
                let reply = relay.on_control(&control[..n]);
                stream.write_all(&reply).unwrap();
            },
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {},
            Err(err) => panic!("relay control read failed: {err}"),
        }
        loop {
            match udp.recv_from(&mut datagram) {
                Ok((n, from)) => {
                    if let Some(answer) = relay.on_datagram(&datagram[..n]) {
                        udp.send_to(&answer, from).unwrap();
                    }
                },
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => panic!("relay datagram read failed: {err}"),
            }
        }
        thread::sleep(std::time::Duration::from_millis(1));
    }
    panic!("client never hung up");
}

#[test]
#[serial]
#[cfg(not(miri))]
fn session_runs_end_to_end_over_native_sockets() {
    let (listener, udp) = bind_relay();
    let port = listener.local_addr().unwrap().port();
    let relay = thread::spawn(move || serve(&listener, &udp));

    let transport = NativeTransport::new().with_read_timeout(Duration::from_secs(5));
    let played = play_owner_session(transport, "127.0.0.1", port).unwrap();
    let relay = relay.join().unwrap();

    assert_eq!(played, PLAYED_BUTTONS.to_vec());
    assert!(relay.saw_disconnect());
    assert_eq!(relay.received.len(), 4);
}

#[test]
#[serial]
#[cfg(not(miri))]
fn silent_control_channel_times_out() {
    let (listener, _udp) = bind_relay();
    let port = listener.local_addr().unwrap().port();
    // accepts and then never answers
    let relay = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        thread::sleep(std::time::Duration::from_millis(500));
        drop(stream);
    });

    let transport = NativeTransport::new().with_read_timeout(Duration::from_millis(50));
    let err = play_owner_session(transport, "127.0.0.1", port).unwrap_err();
    relay.join().unwrap();
    assert!(
        matches!(err, NetplayError::TransportFailure { .. }),
        "unexpected error: {err}"
    );
}

#[test]
#[serial]
#[cfg(not(miri))]
fn refused_connection_fails_start() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let err = play_owner_session(NativeTransport::new(), "127.0.0.1", port).unwrap_err();
    assert!(matches!(err, NetplayError::TransportFailure { .. }));
}
