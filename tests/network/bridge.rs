//! A full session over [`BridgeTransport`], with a relay thread standing in
//! for the host that owns the sockets.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::thread;
use std::time::Instant;

use super::script::{play_owner_session, ScriptedRelay, PLAYED_BUTTONS};
use fortress_netplay::__internal::ControlMessage;
use fortress_netplay::{BridgeConfig, BridgeHandle, BridgeTransport, Endpoint};
use web_time::Duration;

/// Serves the bridge until the session closes it, then returns what it saw.
fn serve(handle: BridgeHandle) -> ScriptedRelay {
    let mut relay = ScriptedRelay::new();
    let deadline = Instant::now() + std::time::Duration::from_secs(20);
    while Instant::now() < deadline {
        // sampled first so bytes written right before the close are still read
        let closed = handle.is_closed();

        let reply = relay.on_control(&handle.pop_outgoing_reliable());
        if !reply.is_empty() {
            handle.push_incoming_reliable(&reply);
        }
        while let Some((destination, bytes)) = handle.pop_outgoing_datagram() {
            assert_eq!(destination, Endpoint::new("relay.bridge", 45000));
            if let Some(answer) = relay.on_datagram(&bytes) {
                handle.push_incoming_datagram(answer);
            }
        }

        if closed {
            return relay;
        }
        thread::sleep(std::time::Duration::from_millis(1));
    }
    panic!("session never closed the bridge");
}

#[test]
fn session_runs_end_to_end_over_the_bridge() {
    let (transport, handle) = BridgeTransport::new(BridgeConfig {
        recv_timeout: Duration::from_secs(5),
        ..BridgeConfig::default()
    });
    let relay = {
        let handle = handle.clone();
        thread::spawn(move || serve(handle))
    };

    let played = play_owner_session(transport, "relay.bridge", 45000).unwrap();
    let relay = relay.join().unwrap();

    assert_eq!(played, PLAYED_BUTTONS.to_vec());
    assert_eq!(
        handle.reliable_endpoint(),
        Some(Endpoint::new("relay.bridge", 45000))
    );
    assert_eq!(handle.datagram_port(), Some(0));
    assert_eq!(handle.dropped_datagrams(), 0);

    let kinds: Vec<&str> = relay.received.iter().map(ControlMessage::kind).collect();
    assert_eq!(
        kinds,
        vec![
            "register_player",
            "get_registration",
            "send_settings",
            "disconnect_notice"
        ]
    );
    assert!(relay.saw_disconnect());
}

#[test]
fn relay_hanging_up_fails_the_handshake() {
    let (transport, handle) = BridgeTransport::new(BridgeConfig {
        recv_timeout: Duration::from_secs(5),
        ..BridgeConfig::default()
    });
    let hang_up = {
        let handle = handle.clone();
        thread::spawn(move || {
            let deadline = Instant::now() + std::time::Duration::from_secs(5);
            while handle.pop_outgoing_reliable().is_empty() {
                assert!(Instant::now() < deadline, "register never sent");
                thread::sleep(std::time::Duration::from_millis(1));
            }
            handle.close_reliable();
        })
    };

    let err = play_owner_session(transport, "relay.bridge", 45000).unwrap_err();
    hang_up.join().unwrap();
    assert!(
        matches!(
            err,
            fortress_netplay::NetplayError::TruncatedPacket { actual: 0, .. }
        ),
        "unexpected error: {err}"
    );
}
