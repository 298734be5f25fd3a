//! Per-poll input exchange through a full session.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::Arc;

use crate::common::stubs::StubRelay;
use crate::common::{
    active_session, active_session_with, fast_sync_config, start_session, table_with,
    REGISTRATION_ID,
};
use fortress_netplay::__internal::DatagramMessage;
use fortress_netplay::telemetry::{CollectingObserver, ViolationKind};
use fortress_netplay::{
    ControlState, JoybusCommand, NetplayError, NetplayEvent, NetplayRequest, PeripheralKind,
    PollChannel, ProtocolConfig, Sequence, SessionBuilder, Slot, SlotAssignment,
};

const NORMAL_SPEED: [NetplayRequest; 2] = [
    NetplayRequest::SetSpeedLimiter { enabled: true },
    NetplayRequest::SetFastForward {
        enabled: false,
        inhibit_toggle: true,
    },
];

fn reads() -> [PollChannel; 4] {
    [PollChannel::controller_read(0); 4]
}

#[test]
fn remote_slot_consumes_relay_input_in_order() {
    let relay = StubRelay::new();
    for sequence in 0..5 {
        relay.script_input(Slot::P2, sequence, sequence + 1);
    }
    relay.script_input(Slot::P2, 5, 0x0080);
    let mut session = active_session(&relay, None, table_with(&[Slot::P2]));
    assert!(session.is_spectator());

    for expected in 1..=5u32 {
        let mut channels = reads();
        session.update_input(&mut channels).unwrap();
        assert_eq!(channels[Slot::P2.index()].buttons(), expected);
    }
    assert_eq!(session.next_sequence(Slot::P2), Sequence::new(5));

    let mut channels = reads();
    session.update_input(&mut channels).unwrap();
    assert_eq!(channels[Slot::P2.index()].buttons(), 0x0080);
    assert_eq!(session.next_sequence(Slot::P2), Sequence::new(6));
    assert_eq!(session.pending_events(Slot::P2), 0);
    assert_eq!(session.state(), ControlState::Active);
}

#[test]
fn first_poll_asks_for_normal_speed_once() {
    let relay = StubRelay::new();
    for sequence in 0..3 {
        relay.script_input(Slot::P2, sequence, 0);
    }
    let mut session = active_session(&relay, None, table_with(&[Slot::P2]));

    let requests = session.update_input(&mut reads()).unwrap();
    assert_eq!(requests, NORMAL_SPEED.to_vec());
    let requests = session.update_input(&mut reads()).unwrap();
    assert!(requests.is_empty());
}

#[test]
fn spectator_requests_carry_the_spectator_flag() {
    let relay = StubRelay::new();
    relay.script_input(Slot::P3, 0, 7);
    let mut session = active_session(&relay, None, table_with(&[Slot::P3]));
    session.update_input(&mut reads()).unwrap();

    let request = relay
        .sent()
        .into_iter()
        .find(|message| matches!(message, DatagramMessage::RequestInput { .. }))
        .unwrap();
    assert_eq!(
        request,
        DatagramMessage::RequestInput {
            slot: Slot::P3,
            registration_id: 0,
            sequence: Sequence::ZERO,
            spectator: true,
            pending: 0,
        }
    );
}

#[test]
fn local_slot_delivers_then_reads_back_its_input() {
    let relay = StubRelay::new();
    let mut session = active_session(&relay, Some(Slot::P1), table_with(&[Slot::P1]));
    assert_eq!(
        session.slot_assignment(Slot::P1),
        SlotAssignment::Local { controller: 0 }
    );

    let mut channels = reads();
    channels[0].set_buttons(0x1234);
    session.update_input(&mut channels).unwrap();
    assert_eq!(channels[0].buttons(), 0x1234);

    let mut channels = reads();
    channels[0].set_buttons(0x0001);
    session.update_input(&mut channels).unwrap();
    assert_eq!(channels[0].buttons(), 0x0001);

    let delivered: Vec<(u32, u32)> = relay
        .sent()
        .into_iter()
        .filter_map(|message| match message {
            DatagramMessage::DeliverInput {
                slot: Slot::P1,
                sequence,
                buttons,
                ..
            } => Some((sequence.as_u32(), buttons)),
            _ => None,
        })
        .collect();
    assert_eq!(delivered, vec![(0, 0x1234), (1, 0x0001)]);

    let request = relay
        .sent()
        .into_iter()
        .find_map(|message| match message {
            DatagramMessage::RequestInput {
                registration_id,
                spectator,
                ..
            } => Some((registration_id, spectator)),
            _ => None,
        })
        .unwrap();
    assert_eq!(request, (REGISTRATION_ID, false));
}

#[test]
fn deep_buffer_while_lagging_turns_fast_forward_on_then_off() {
    let relay = StubRelay::new();
    for sequence in 0..5 {
        relay.script_input(Slot::P2, sequence, sequence);
    }
    relay.set_lag(Slot::P2, 3);
    // register for P1 to learn the lag buffer target (2), but leave it unclaimed
    let mut session = start_session(&relay);
    relay.reply_register(1, 2);
    assert!(session
        .register_player(Slot::P1, PeripheralKind::None, false, REGISTRATION_ID)
        .unwrap());
    assert_eq!(session.lag_buffer_target(), 2);
    relay.reply_table(table_with(&[Slot::P1, Slot::P2]));
    session.read_registration().unwrap();
    relay.reply_settings(Default::default());
    session.sync_settings(&mut Default::default()).unwrap();

    let mut channels = [PollChannel::default(); 4];
    channels[Slot::P2.index()] = PollChannel::controller_read(0);

    // nothing known about lag yet
    let requests = session.update_input(&mut channels).unwrap();
    assert_eq!(requests, NORMAL_SPEED.to_vec());
    assert_eq!(session.pending_events(Slot::P2), 4);

    // lag 3 with 4 buffered events
    let requests = session.update_input(&mut channels).unwrap();
    assert_eq!(
        requests,
        vec![
            NetplayRequest::SetSpeedLimiter { enabled: false },
            NetplayRequest::SetFastForward {
                enabled: true,
                inhibit_toggle: true,
            },
        ]
    );
    assert!(session.is_fast_forwarding());
    assert_eq!(session.slots()[Slot::P2.index()].lag, 3);

    // still 3 buffered: no change, no request
    let requests = session.update_input(&mut channels).unwrap();
    assert!(requests.is_empty());

    // down to the target: back to normal speed
    let requests = session.update_input(&mut channels).unwrap();
    assert_eq!(requests, NORMAL_SPEED.to_vec());
    assert!(!session.is_fast_forwarding());
    assert!(session.network_stats().duplicate_events > 0);
}

#[test]
fn gratuitous_update_answers_a_poll_without_touching_lag() {
    let relay = StubRelay::new();
    relay.set_lag(Slot::P2, 9);
    let mut session = active_session(&relay, None, table_with(&[Slot::P2]));
    relay.go_silent();
    relay.push_gratuitous(Slot::P2, &[(0, 0x0042)]);

    let mut channels = reads();
    session.update_input(&mut channels).unwrap();
    assert_eq!(channels[Slot::P2.index()].buttons(), 0x0042);
    assert_eq!(session.slots()[Slot::P2.index()].lag, 0);
}

#[test]
fn silent_relay_halts_emulation_once_and_zeroes_input() {
    let relay = StubRelay::new();
    let mut session = active_session(&relay, None, table_with(&[Slot::P2]));
    relay.go_silent();

    let mut channels = [PollChannel::controller_read(0xFFFF); 4];
    let requests = session.update_input(&mut channels).unwrap();
    assert!(requests.contains(&NetplayRequest::HaltEmulation));
    assert_eq!(channels[Slot::P2.index()].buttons(), 0);
    assert!(session.is_connection_lost());
    assert_eq!(
        session.events().collect::<Vec<_>>(),
        vec![NetplayEvent::ConnectionLost {
            slot: Slot::P2,
            sequence: Sequence::ZERO,
        }]
    );
    let stats = session.network_stats();
    assert_eq!(stats.timeouts, 1);
    assert!(stats.retransmissions > 0);

    // later polls keep halting without new events or traffic
    let sent_before = relay.sent().len();
    let mut channels = [PollChannel::controller_read(0xFFFF); 4];
    let requests = session.update_input(&mut channels).unwrap();
    assert_eq!(requests, vec![NetplayRequest::HaltEmulation]);
    assert_eq!(channels[Slot::P2.index()].buttons(), 0);
    assert_eq!(session.events().len(), 0);

    session.check_sync(&[1, 2, 3]).unwrap();
    assert_eq!(relay.sent().len(), sent_before);
}

#[test]
fn timeout_respects_configured_budget() {
    let relay = StubRelay::new();
    let mut session = active_session(&relay, None, table_with(&[Slot::P4]));
    relay.go_silent();

    let started = std::time::Instant::now();
    session.update_input(&mut reads()).unwrap();
    let waited = started.elapsed();
    assert!(waited >= fast_sync_config().request_timeout);
    assert!(waited < std::time::Duration::from_secs(5));
}

#[test]
fn status_flips_become_events_at_the_current_frame() {
    let relay = StubRelay::new();
    for sequence in 0..4 {
        relay.script_input(Slot::P2, sequence, 0);
    }
    let mut session = active_session(&relay, None, table_with(&[Slot::P2]));
    session.update_input(&mut reads()).unwrap();
    assert_eq!(session.events().len(), 0);

    for _ in 0..3 {
        session.check_sync(&[0; 4]).unwrap();
    }
    assert_eq!(session.frame_counter(), 3);

    relay.set_status(0b0000_0101);
    session.update_input(&mut reads()).unwrap();
    assert_eq!(
        session.events().collect::<Vec<_>>(),
        vec![
            NetplayEvent::DesyncDetected { frame: 3 },
            NetplayEvent::PlayerDisconnected { slot: Slot::P2 },
        ]
    );

    // unchanged mask: nothing new
    session.update_input(&mut reads()).unwrap();
    assert_eq!(session.events().len(), 0);

    // only the desync bit clears
    relay.set_status(0b0000_0100);
    session.update_input(&mut reads()).unwrap();
    assert_eq!(
        session.events().collect::<Vec<_>>(),
        vec![NetplayEvent::DesyncDetected { frame: 3 }]
    );
}

#[test]
fn relay_desync_is_reported_to_the_observer() {
    let relay = StubRelay::new();
    for sequence in 0..2 {
        relay.script_input(Slot::P2, sequence, 0);
    }
    let observer = Arc::new(CollectingObserver::new());
    let builder = SessionBuilder::new()
        .with_sync_config(fast_sync_config())
        .with_violation_observer(observer.clone());
    let mut session = active_session_with(&relay, builder, None, table_with(&[Slot::P2]));
    session.update_input(&mut reads()).unwrap();
    assert!(!observer.has_violation(ViolationKind::Synchronization));

    relay.set_status(0b0000_0001);
    session.update_input(&mut reads()).unwrap();
    assert_eq!(
        observer
            .violations_of_kind(ViolationKind::Synchronization)
            .len(),
        1
    );
}

#[test]
fn full_event_queue_drops_the_oldest_event() {
    let relay = StubRelay::new();
    for sequence in 0..4 {
        relay.script_input(Slot::P2, sequence, 0);
    }
    let observer = Arc::new(CollectingObserver::new());
    let builder = SessionBuilder::new()
        .with_sync_config(fast_sync_config())
        .with_protocol_config(ProtocolConfig {
            event_queue_size: 2,
            ..ProtocolConfig::default()
        })
        .with_violation_observer(observer.clone());
    let mut session = active_session_with(&relay, builder, None, table_with(&[Slot::P2]));

    for frame in 0..3 {
        relay.set_status(if frame % 2 == 0 { 1 } else { 0 });
        session.check_sync(&[]).unwrap();
        session.update_input(&mut reads()).unwrap();
    }

    let frames: Vec<_> = session
        .events()
        .map(|event| match event {
            NetplayEvent::DesyncDetected { frame } => frame,
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(frames, vec![2, 3]);
    assert!(observer.has_violation(ViolationKind::SessionControl));
}

#[test]
fn raw_slots_get_canned_answers_for_non_read_commands() {
    let relay = StubRelay::new();
    let mut table = table_with(&[Slot::P2, Slot::P3]);
    table[Slot::P2.index()].2 = 1;
    let mut session = active_session(&relay, None, table);

    let mut channels = [PollChannel::default(); 4];
    channels[Slot::P2.index()] = PollChannel::with_command(JoybusCommand::Status);
    channels[Slot::P2.index()].rx_status = 0xC0;
    channels[Slot::P3.index()] = PollChannel::with_command(JoybusCommand::PakRead);
    channels[Slot::P3.index()].rx_status = 0xC0;
    let requests = session.update_input(&mut channels).unwrap();
    assert!(requests.is_empty());

    let raw = channels[Slot::P2.index()];
    assert_eq!(raw.rx_status, 0);
    assert_eq!(&raw.rx_buf[..3], &[0x05, 0x00, 0x00]);

    // present but not raw: the device answers, the buffer is left alone
    let plain = channels[Slot::P3.index()];
    assert_eq!(plain.rx_status, 0);
    assert_eq!(plain.rx_buf[32], 0);

    assert!(relay.requested_sequences(Slot::P2).is_empty());
    assert!(relay.requested_sequences(Slot::P3).is_empty());
}

#[test]
fn absent_slots_are_left_untouched() {
    let relay = StubRelay::new();
    relay.script_input(Slot::P1, 0, 3);
    let mut session = active_session(&relay, None, table_with(&[Slot::P1]));

    let mut channels = reads();
    channels[Slot::P4.index()].rx_status = 0xC0;
    channels[Slot::P4.index()].set_buttons(0xAAAA);
    session.update_input(&mut channels).unwrap();

    assert_eq!(channels[Slot::P4.index()].rx_status, 0xC0);
    assert_eq!(channels[Slot::P4.index()].buttons(), 0xAAAA);
    assert!(relay.requested_sequences(Slot::P4).is_empty());
    assert_eq!(session.slot_assignment(Slot::P4), SlotAssignment::Unassigned);
    assert_eq!(session.slot_assignment(Slot::P1), SlotAssignment::Remote);
}

#[test]
fn unknown_datagrams_are_skipped() {
    let relay = StubRelay::new();
    relay.script_input(Slot::P2, 0, 5);
    let observer = Arc::new(CollectingObserver::new());
    let builder = SessionBuilder::new()
        .with_sync_config(fast_sync_config())
        .with_violation_observer(observer.clone());
    let mut session = active_session_with(&relay, builder, None, table_with(&[Slot::P2]));
    relay.push_datagram(vec![0x7F, 1, 2, 3]);

    let mut channels = reads();
    session.update_input(&mut channels).unwrap();
    assert_eq!(channels[Slot::P2.index()].buttons(), 5);
    assert_eq!(session.network_stats().unknown_datagrams, 1);
    assert!(observer.has_violation(ViolationKind::NetworkProtocol));
}

#[test]
fn truncated_update_is_a_fatal_error() {
    let relay = StubRelay::new();
    let mut session = active_session(&relay, None, table_with(&[Slot::P2]));
    relay.go_silent();
    // update header claims two events, carries none
    relay.push_datagram(vec![1, 1, 0, 0, 2]);

    let err = session.update_input(&mut reads()).unwrap_err();
    assert!(matches!(err, NetplayError::TruncatedPacket { .. }));
}

#[test]
fn fatal_decode_error_ends_the_session() {
    let relay = StubRelay::new();
    for sequence in 0..4 {
        relay.script_input(Slot::P2, sequence, 0x10 + sequence);
    }
    let mut session = active_session(&relay, None, table_with(&[Slot::P2]));
    let mut channels = reads();
    session.update_input(&mut channels).unwrap();
    assert_eq!(channels[Slot::P2.index()].buttons(), 0x10);
    session.events().for_each(drop);

    // update header claims three events, carries none
    relay.push_datagram(vec![1, 1, 0, 0, 3]);
    let err = session.update_input(&mut reads()).unwrap_err();
    assert!(matches!(err, NetplayError::TruncatedPacket { .. }));
    assert!(session.is_connection_lost());
    assert_eq!(
        session.events().collect::<Vec<_>>(),
        vec![NetplayEvent::ConnectionLost {
            slot: Slot::P2,
            sequence: Sequence::new(1),
        }]
    );

    // buffered input is never consumed once the channel failed
    let sent_before = relay.sent().len();
    for _ in 0..2 {
        let mut channels = [PollChannel::controller_read(0xFFFF); 4];
        let requests = session.update_input(&mut channels).unwrap();
        assert_eq!(requests, vec![NetplayRequest::HaltEmulation]);
        assert_eq!(channels[Slot::P2.index()].buttons(), 0);
    }
    assert_eq!(session.next_sequence(Slot::P2), Sequence::new(1));
    assert_eq!(session.events().len(), 0);
    assert_eq!(relay.sent().len(), sent_before);
}

#[test]
fn checksums_follow_the_configured_interval() {
    let relay = StubRelay::new();
    let builder = SessionBuilder::new()
        .with_sync_config(fast_sync_config())
        .with_protocol_config(ProtocolConfig {
            checksum_interval: 2,
            ..ProtocolConfig::default()
        });
    let mut session = active_session_with(&relay, builder, None, table_with(&[Slot::P2]));

    for _ in 0..5 {
        session.check_sync(&[0xDEAD, 0xBEEF]).unwrap();
    }
    assert_eq!(relay.checksum_frames(), vec![0, 2, 4]);
    assert_eq!(session.frame_counter(), 5);

    let registers = relay
        .sent()
        .into_iter()
        .find_map(|message| match message {
            DatagramMessage::Checksum { registers, .. } => Some(registers),
            _ => None,
        })
        .unwrap();
    assert_eq!(registers, vec![0xDEAD, 0xBEEF]);
}

#[test]
fn per_frame_calls_require_a_finished_handshake() {
    let relay = StubRelay::new();
    let mut session = start_session(&relay);
    assert!(matches!(
        session.update_input(&mut reads()),
        Err(NetplayError::InvalidState {
            operation: "update_input",
            current: ControlState::Idle,
        })
    ));
    assert!(matches!(
        session.check_sync(&[]),
        Err(NetplayError::InvalidState { .. })
    ));
}

#[test]
fn stop_announces_disconnect_and_closes_both_channels() {
    let relay = StubRelay::new();
    let session = active_session(&relay, Some(Slot::P1), table_with(&[Slot::P1]));
    session.stop();

    assert!(matches!(
        relay.control_messages().last(),
        Some(fortress_netplay::__internal::ControlMessage::DisconnectNotice {
            registration_id: REGISTRATION_ID
        })
    ));
    assert!(relay.control_closed());
    assert!(relay.datagram_closed());
}
