//! Relay logic and a client run shared by the transport tests.
//!
//! [`ScriptedRelay`] answers the way a relay would for a session where the
//! client owns slot 0 and nobody else is connected: registration succeeds,
//! the table lists slot 0 only, and every input request is answered with the
//! input the client delivered for that sequence.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;

use fortress_netplay::__internal::{
    ControlMessage, DatagramMessage, InputUpdate, RegisterReply, RegistrationTable,
};
use fortress_netplay::{
    ControlState, EmulationSettings, InputEvent, NetplayError, PeripheralKind, PollChannel,
    RegistrationEntry, SessionBuilder, Slot, SyncConfig, Transport,
};
use smallvec::smallvec;
use web_time::Duration;

/// Registration id the client registers with.
pub const CLIENT_ID: u32 = 77;

/// Button words the client plays, one per poll.
pub const PLAYED_BUTTONS: [u32; 3] = [0x0001, 0x8000, 0x0240];

#[derive(Debug, Default)]
pub struct ScriptedRelay {
    control_pending: Vec<u8>,
    /// Control messages received so far, in order.
    pub received: Vec<ControlMessage>,
    inputs: BTreeMap<u32, u32>,
}

impl ScriptedRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds control-channel bytes and returns the bytes to answer with.
    pub fn on_control(&mut self, bytes: &[u8]) -> Vec<u8> {
        self.control_pending.extend_from_slice(bytes);
        let mut reply = Vec::new();
        while let Ok((message, used)) = ControlMessage::decode(&self.control_pending) {
            self.control_pending.drain(..used);
            match &message {
                ControlMessage::RegisterPlayer { .. } => reply.extend(
                    RegisterReply {
                        status: 1,
                        lag_buffer_target: 2,
                    }
                    .encode()
                    .unwrap(),
                ),
                ControlMessage::GetRegistration => {
                    let mut table = RegistrationTable::default();
                    table.0[0] = RegistrationEntry {
                        registration_id: CLIENT_ID,
                        peripheral: PeripheralKind::None.to_byte(),
                        raw_data: 0,
                    };
                    reply.extend(table.encode().unwrap());
                },
                _ => {},
            }
            self.received.push(message);
        }
        reply
    }

    /// Feeds one datagram and returns the answer, if any.
    pub fn on_datagram(&mut self, bytes: &[u8]) -> Option<Vec<u8>> {
        match DatagramMessage::decode(bytes).expect("client datagram") {
            DatagramMessage::DeliverInput {
                sequence, buttons, ..
            } => {
                self.inputs.insert(sequence.as_u32(), buttons);
                None
            },
            DatagramMessage::RequestInput { slot, sequence, .. } => {
                let buttons = *self.inputs.get(&sequence.as_u32())?;
                let update = DatagramMessage::InputUpdate(InputUpdate {
                    slot,
                    status: 0,
                    lag: 0,
                    gratuitous: false,
                    events: smallvec![InputEvent {
                        sequence,
                        buttons,
                        peripheral: PeripheralKind::None,
                    }],
                });
                Some(update.encode().unwrap())
            },
            DatagramMessage::InputUpdate(_) | DatagramMessage::Checksum { .. } => None,
        }
    }

    /// `true` once the client announced it is leaving.
    pub fn saw_disconnect(&self) -> bool {
        self.received.contains(&ControlMessage::DisconnectNotice {
            registration_id: CLIENT_ID,
        })
    }
}

/// Generous timings for sockets and threads.
pub fn network_sync_config() -> SyncConfig {
    SyncConfig {
        request_retry_interval: Duration::from_millis(20),
        request_timeout: Duration::from_secs(5),
        poll_slice: Duration::from_millis(1),
    }
}

/// Runs a client through the handshake, plays [`PLAYED_BUTTONS`] on slot 0
/// and stops. Returns the button words the session handed back.
pub fn play_owner_session<T: Transport>(
    transport: T,
    host: &str,
    port: u16,
) -> Result<Vec<u32>, NetplayError> {
    let mut session = SessionBuilder::new()
        .with_sync_config(network_sync_config())
        .start(transport, host, port)?;

    assert!(session.register_player(Slot::P1, PeripheralKind::None, false, CLIENT_ID)?);
    session.claim_slot(Slot::P1)?;
    let slots = session.read_registration()?;
    assert!(slots[0].present);
    assert!(!slots[1].present);
    session.sync_settings(&mut EmulationSettings::default())?;
    assert_eq!(session.state(), ControlState::SyncingSaveData);

    let mut played = Vec::new();
    for buttons in PLAYED_BUTTONS {
        let mut channels = [PollChannel::default(); 4];
        channels[0] = PollChannel::controller_read(buttons);
        let requests = session.update_input(&mut channels)?;
        assert!(!session.is_connection_lost(), "requests: {requests:?}");
        played.push(channels[0].buttons());
    }
    assert_eq!(session.state(), ControlState::Active);
    assert_eq!(session.frame_counter(), 0);
    session.stop();
    Ok(played)
}
