//! Packet layouts for both relay channels.
//!
//! Datagrams carry per-frame input traffic; the reliable control channel carries
//! the one-off handshake. Tags come from two disjoint namespaces, see [`tags`].

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::ledger::InputEvent;
use crate::network::codec::{self, CodecError, CodecResult};
use crate::{PeripheralKind, Sequence, Slot};

/// Message tags and fixed packet sizes.
pub mod tags {
    /// Datagram channel tags.
    pub mod datagram {
        /// Client -> relay: local input for one slot.
        pub const DELIVER_INPUT: u8 = 0;
        /// Relay -> client: buffered events, answer to a request.
        pub const INPUT_UPDATE: u8 = 1;
        /// Client -> relay: ask for a slot's next event.
        pub const REQUEST_INPUT: u8 = 2;
        /// Relay -> client: unsolicited events. Does not carry lag.
        pub const GRATUITOUS_UPDATE: u8 = 3;
        /// Client -> relay: emulator register checksum.
        pub const CHECKSUM: u8 = 4;
    }

    /// Reliable control channel tags.
    pub mod control {
        /// Push a save region to the relay.
        pub const SEND_SAVE: u8 = 1;
        /// Pull a save region from the relay.
        pub const RECEIVE_SAVE: u8 = 2;
        /// Push emulation settings.
        pub const SEND_SETTINGS: u8 = 3;
        /// Pull emulation settings.
        pub const RECEIVE_SETTINGS: u8 = 4;
        /// Claim a slot.
        pub const REGISTER_PLAYER: u8 = 5;
        /// Read the slot table.
        pub const GET_REGISTRATION: u8 = 6;
        /// Announce teardown.
        pub const DISCONNECT_NOTICE: u8 = 7;
    }

    /// Bytes in a deliver-input datagram, tag included.
    pub const DELIVER_INPUT_LEN: usize = 11;
    /// Bytes in a request-input datagram, tag included.
    pub const REQUEST_INPUT_LEN: usize = 12;
    /// Bytes before the first event of an input update, tag included.
    pub const UPDATE_HEADER_LEN: usize = 5;
    /// Bytes per event in an input update.
    pub const UPDATE_EVENT_LEN: usize = 9;
    /// Bytes before the register words of a checksum datagram, tag included.
    pub const CHECKSUM_HEADER_LEN: usize = 5;
    /// Bytes in a register-player message, tag included.
    pub const REGISTER_LEN: usize = 8;
    /// Bytes in the relay's answer to register-player.
    pub const REGISTER_REPLY_LEN: usize = 2;
    /// Bytes in the relay's registration table.
    pub const REGISTRATION_TABLE_LEN: usize = 24;
    /// Bytes in an emulation settings block.
    pub const SETTINGS_LEN: usize = 24;
    /// Bytes in a disconnect notice, tag included.
    pub const DISCONNECT_LEN: usize = 5;
}

#[derive(Serialize, Deserialize)]
struct DeliverInputBody {
    slot: u8,
    sequence: u32,
    buttons: u32,
    peripheral: u8,
}

#[derive(Serialize, Deserialize)]
struct UpdateHeader {
    slot: u8,
    status: u8,
    lag: u8,
    count: u8,
}

#[derive(Serialize, Deserialize)]
struct WireEvent {
    sequence: u32,
    buttons: u32,
    peripheral: u8,
}

#[derive(Serialize, Deserialize)]
struct RequestInputBody {
    slot: u8,
    registration_id: u32,
    sequence: u32,
    spectator: u8,
    pending: u8,
}

#[derive(Serialize, Deserialize)]
struct RegisterBody {
    player: u8,
    peripheral: u8,
    raw_data: u8,
    registration_id: u32,
}

/// Emulation settings the slot-0 owner imposes on every peer.
///
/// Encoded as six big-endian 32-bit words in field order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EmulationSettings {
    /// CPU cycles per emulated instruction.
    pub count_per_op: u32,
    /// Power-of-two denominator applied to `count_per_op`.
    pub count_per_op_denom_pot: u32,
    /// Non-zero to disable the memory expansion.
    pub disable_extra_mem: u32,
    /// Serial DMA duration override, negative for the core default.
    pub si_dma_duration: i32,
    /// CPU emulation mode.
    pub emumode: u32,
    /// Non-zero to disable compiled jumps in the recompiler.
    pub no_compiled_jump: i32,
}

impl EmulationSettings {
    /// Encodes the 24-byte settings block (no tag).
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        codec::encode(self)
    }

    /// Decodes a 24-byte settings block.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        codec::decode_fixed(bytes, tags::SETTINGS_LEN, "emulation settings")
    }
}

/// One row of the relay's registration table, as sent on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RegistrationEntry {
    /// Registration id of the client owning the slot, 0 if unassigned.
    pub registration_id: u32,
    /// Peripheral byte announced by the owner.
    pub peripheral: u8,
    /// Non-zero if the owner forwards raw joybus traffic.
    pub raw_data: u8,
}

impl RegistrationEntry {
    /// Returns `true` if a client owns the slot.
    #[must_use]
    pub const fn is_assigned(&self) -> bool {
        self.registration_id != 0
    }
}

/// The relay's four-row registration table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RegistrationTable(pub [RegistrationEntry; crate::MAX_PLAYERS]);

impl RegistrationTable {
    /// Encodes the 24-byte table.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        codec::encode(self)
    }

    /// Decodes the 24-byte table.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        codec::decode_fixed(bytes, tags::REGISTRATION_TABLE_LEN, "registration table")
    }
}

/// The relay's answer to a registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RegisterReply {
    /// Relay-defined status byte (1 on success).
    pub status: u8,
    /// Buffered events per slot above which the client should fast-forward.
    pub lag_buffer_target: u8,
}

impl RegisterReply {
    /// Encodes the 2-byte reply.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        codec::encode(self)
    }

    /// Decodes the 2-byte reply.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        codec::decode_fixed(bytes, tags::REGISTER_REPLY_LEN, "register reply")
    }
}

/// Events the relay hands back for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputUpdate {
    /// The slot the events belong to.
    pub slot: Slot,
    /// Relay status bitmask (bit 0 desync, bits 1..=4 player disconnected).
    pub status: u8,
    /// How far the slot is behind the relay. Meaningful only when not gratuitous.
    pub lag: u8,
    /// `true` for unsolicited updates, which leave the lag indicator alone.
    pub gratuitous: bool,
    /// The events, in wire order.
    pub events: SmallVec<[InputEvent; 8]>,
}

/// A datagram-channel packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramMessage {
    /// Local input for a slot this client controls.
    DeliverInput {
        /// The controlled slot.
        slot: Slot,
        /// The slot's current sequence.
        sequence: Sequence,
        /// Button word.
        buttons: u32,
        /// The slot's registered peripheral.
        peripheral: PeripheralKind,
    },
    /// Relay-sent events.
    InputUpdate(InputUpdate),
    /// Ask the relay for a slot's event at `sequence`.
    RequestInput {
        /// The slot being fetched.
        slot: Slot,
        /// This client's registration id.
        registration_id: u32,
        /// The slot's next expected sequence.
        sequence: Sequence,
        /// `true` while no slot is controlled locally.
        spectator: bool,
        /// Events already buffered for the slot.
        pending: u8,
    },
    /// Emulator register checksum.
    Checksum {
        /// Emulated frame counter the registers were sampled at.
        frame: u32,
        /// Register words.
        registers: Vec<u32>,
    },
}

impl DatagramMessage {
    /// Returns a string representation suitable for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::DeliverInput { .. } => "deliver_input",
            Self::InputUpdate(update) if update.gratuitous => "gratuitous_update",
            Self::InputUpdate(_) => "input_update",
            Self::RequestInput { .. } => "request_input",
            Self::Checksum { .. } => "checksum",
        }
    }

    /// Encodes the datagram.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let mut out = Vec::with_capacity(tags::REQUEST_INPUT_LEN);
        match self {
            Self::DeliverInput {
                slot,
                sequence,
                buttons,
                peripheral,
            } => {
                out.push(tags::datagram::DELIVER_INPUT);
                codec::encode_append(
                    &DeliverInputBody {
                        slot: slot.as_u8(),
                        sequence: sequence.as_u32(),
                        buttons: *buttons,
                        peripheral: peripheral.to_byte(),
                    },
                    &mut out,
                )?;
            },
            Self::InputUpdate(update) => {
                let count = u8::try_from(update.events.len()).map_err(|_| {
                    CodecError::malformed(format!(
                        "{} events do not fit one update",
                        update.events.len()
                    ))
                })?;
                out.push(if update.gratuitous {
                    tags::datagram::GRATUITOUS_UPDATE
                } else {
                    tags::datagram::INPUT_UPDATE
                });
                codec::encode_append(
                    &UpdateHeader {
                        slot: update.slot.as_u8(),
                        status: update.status,
                        lag: update.lag,
                        count,
                    },
                    &mut out,
                )?;
                for event in &update.events {
                    codec::encode_append(
                        &WireEvent {
                            sequence: event.sequence.as_u32(),
                            buttons: event.buttons,
                            peripheral: event.peripheral.to_byte(),
                        },
                        &mut out,
                    )?;
                }
            },
            Self::RequestInput {
                slot,
                registration_id,
                sequence,
                spectator,
                pending,
            } => {
                out.push(tags::datagram::REQUEST_INPUT);
                codec::encode_append(
                    &RequestInputBody {
                        slot: slot.as_u8(),
                        registration_id: *registration_id,
                        sequence: sequence.as_u32(),
                        spectator: u8::from(*spectator),
                        pending: *pending,
                    },
                    &mut out,
                )?;
            },
            Self::Checksum { frame, registers } => {
                out.push(tags::datagram::CHECKSUM);
                codec::encode_append(frame, &mut out)?;
                for register in registers {
                    codec::encode_append(register, &mut out)?;
                }
            },
        }
        Ok(out)
    }

    /// Decodes a datagram.
    ///
    /// # Errors
    ///
    /// [`CodecError::Truncated`] if the packet is shorter than its layout,
    /// [`CodecError::UnknownTag`] for tags outside the datagram namespace and
    /// [`CodecError::Malformed`] for out-of-range slots or ragged checksums.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let Some((&tag, body)) = bytes.split_first() else {
            return Err(CodecError::Truncated {
                kind: "datagram",
                expected: 1,
                actual: 0,
            });
        };
        match tag {
            tags::datagram::DELIVER_INPUT => {
                let raw: DeliverInputBody = codec::decode_fixed(
                    body,
                    tags::DELIVER_INPUT_LEN - 1,
                    "deliver-input",
                )?;
                Ok(Self::DeliverInput {
                    slot: wire_slot(raw.slot)?,
                    sequence: Sequence::new(raw.sequence),
                    buttons: raw.buttons,
                    peripheral: PeripheralKind::from_byte(raw.peripheral),
                })
            },
            tags::datagram::INPUT_UPDATE | tags::datagram::GRATUITOUS_UPDATE => {
                let header: UpdateHeader =
                    codec::decode_fixed(body, tags::UPDATE_HEADER_LEN - 1, "input-update")?;
                let slot = wire_slot(header.slot)?;
                let count = header.count as usize;
                let expected = tags::UPDATE_HEADER_LEN + count * tags::UPDATE_EVENT_LEN;
                if bytes.len() < expected {
                    return Err(CodecError::Truncated {
                        kind: "input-update",
                        expected,
                        actual: bytes.len(),
                    });
                }
                let mut events = SmallVec::with_capacity(count);
                for chunk in bytes[tags::UPDATE_HEADER_LEN..expected].chunks_exact(tags::UPDATE_EVENT_LEN)
                {
                    let raw: WireEvent =
                        codec::decode_fixed(chunk, tags::UPDATE_EVENT_LEN, "input-update event")?;
                    events.push(InputEvent {
                        sequence: Sequence::new(raw.sequence),
                        buttons: raw.buttons,
                        peripheral: PeripheralKind::from_byte(raw.peripheral),
                    });
                }
                Ok(Self::InputUpdate(InputUpdate {
                    slot,
                    status: header.status,
                    lag: header.lag,
                    gratuitous: tag == tags::datagram::GRATUITOUS_UPDATE,
                    events,
                }))
            },
            tags::datagram::REQUEST_INPUT => {
                let raw: RequestInputBody = codec::decode_fixed(
                    body,
                    tags::REQUEST_INPUT_LEN - 1,
                    "request-input",
                )?;
                Ok(Self::RequestInput {
                    slot: wire_slot(raw.slot)?,
                    registration_id: raw.registration_id,
                    sequence: Sequence::new(raw.sequence),
                    spectator: raw.spectator != 0,
                    pending: raw.pending,
                })
            },
            tags::datagram::CHECKSUM => {
                let frame: u32 =
                    codec::decode_fixed(body, tags::CHECKSUM_HEADER_LEN - 1, "checksum")?;
                let words = &bytes[tags::CHECKSUM_HEADER_LEN..];
                if words.len() % 4 != 0 {
                    return Err(CodecError::malformed(format!(
                        "checksum body of {} bytes is not whole registers",
                        words.len()
                    )));
                }
                let registers = words
                    .chunks_exact(4)
                    .map(|chunk| codec::decode_fixed::<u32>(chunk, 4, "checksum register"))
                    .collect::<CodecResult<Vec<_>>>()?;
                Ok(Self::Checksum { frame, registers })
            },
            other => Err(CodecError::UnknownTag {
                namespace: "datagram",
                tag: other,
            }),
        }
    }
}

/// A reliable control-channel message sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Upload a save region.
    SendSave {
        /// File extension identifying the region, without the dot.
        extension: String,
        /// Region contents.
        data: Vec<u8>,
    },
    /// Download a save region. The relay answers with exactly the region's size in bytes.
    ReceiveSave {
        /// File extension identifying the region, without the dot.
        extension: String,
    },
    /// Upload emulation settings.
    SendSettings(EmulationSettings),
    /// Download emulation settings. The relay answers with 24 bytes.
    ReceiveSettings,
    /// Claim a slot. The relay answers with a [`RegisterReply`].
    RegisterPlayer {
        /// The slot being claimed.
        player: Slot,
        /// Peripheral plugged into the local controller.
        peripheral: PeripheralKind,
        /// `true` if the frontend forwards raw joybus traffic.
        raw_data: bool,
        /// This client's registration id.
        registration_id: u32,
    },
    /// Read the slot table. The relay answers with a [`RegistrationTable`].
    GetRegistration,
    /// Announce teardown.
    DisconnectNotice {
        /// This client's registration id.
        registration_id: u32,
    },
}

impl ControlMessage {
    /// Returns a string representation suitable for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SendSave { .. } => "send_save",
            Self::ReceiveSave { .. } => "receive_save",
            Self::SendSettings(_) => "send_settings",
            Self::ReceiveSettings => "receive_settings",
            Self::RegisterPlayer { .. } => "register_player",
            Self::GetRegistration => "get_registration",
            Self::DisconnectNotice { .. } => "disconnect_notice",
        }
    }

    /// Encodes the message.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Self::SendSave { extension, data } => {
                let size = u32::try_from(data.len()).map_err(|_| {
                    CodecError::malformed(format!("save region of {} bytes", data.len()))
                })?;
                out.push(tags::control::SEND_SAVE);
                push_extension(extension, &mut out)?;
                codec::encode_append(&size, &mut out)?;
                out.extend_from_slice(data);
            },
            Self::ReceiveSave { extension } => {
                out.push(tags::control::RECEIVE_SAVE);
                push_extension(extension, &mut out)?;
            },
            Self::SendSettings(settings) => {
                out.push(tags::control::SEND_SETTINGS);
                codec::encode_append(settings, &mut out)?;
            },
            Self::ReceiveSettings => out.push(tags::control::RECEIVE_SETTINGS),
            Self::RegisterPlayer {
                player,
                peripheral,
                raw_data,
                registration_id,
            } => {
                out.push(tags::control::REGISTER_PLAYER);
                codec::encode_append(
                    &RegisterBody {
                        player: player.as_u8(),
                        peripheral: peripheral.to_byte(),
                        raw_data: u8::from(*raw_data),
                        registration_id: *registration_id,
                    },
                    &mut out,
                )?;
            },
            Self::GetRegistration => out.push(tags::control::GET_REGISTRATION),
            Self::DisconnectNotice { registration_id } => {
                out.push(tags::control::DISCONNECT_NOTICE);
                codec::encode_append(registration_id, &mut out)?;
            },
        }
        Ok(out)
    }

    /// Decodes one message from the front of `bytes`, returning it and the bytes consumed.
    ///
    /// Used by relay-side code and test doubles that read the client's stream.
    pub fn decode(bytes: &[u8]) -> CodecResult<(Self, usize)> {
        let Some((&tag, body)) = bytes.split_first() else {
            return Err(CodecError::Truncated {
                kind: "control message",
                expected: 1,
                actual: 0,
            });
        };
        match tag {
            tags::control::SEND_SAVE => {
                let (extension, ext_len) = read_extension(body)?;
                let rest = &body[ext_len..];
                let size: u32 = codec::decode_fixed(rest, 4, "send-save size")?;
                let end = usize::try_from(size)
                    .ok()
                    .and_then(|size| size.checked_add(4));
                let used = end.and_then(|end| end.checked_add(1 + ext_len));
                let (Some(end), Some(used)) = (end, used) else {
                    return Err(CodecError::malformed(format!(
                        "send-save size {size} does not fit in memory"
                    )));
                };
                let data = rest.get(4..end).ok_or(CodecError::Truncated {
                    kind: "send-save",
                    expected: used,
                    actual: bytes.len(),
                })?;
                Ok((
                    Self::SendSave {
                        extension,
                        data: data.to_vec(),
                    },
                    used,
                ))
            },
            tags::control::RECEIVE_SAVE => {
                let (extension, ext_len) = read_extension(body)?;
                Ok((Self::ReceiveSave { extension }, 1 + ext_len))
            },
            tags::control::SEND_SETTINGS => Ok((
                Self::SendSettings(EmulationSettings::decode(body)?),
                1 + tags::SETTINGS_LEN,
            )),
            tags::control::RECEIVE_SETTINGS => Ok((Self::ReceiveSettings, 1)),
            tags::control::REGISTER_PLAYER => {
                let raw: RegisterBody =
                    codec::decode_fixed(body, tags::REGISTER_LEN - 1, "register-player")?;
                Ok((
                    Self::RegisterPlayer {
                        player: wire_slot(raw.player)?,
                        peripheral: PeripheralKind::from_byte(raw.peripheral),
                        raw_data: raw.raw_data != 0,
                        registration_id: raw.registration_id,
                    },
                    tags::REGISTER_LEN,
                ))
            },
            tags::control::GET_REGISTRATION => Ok((Self::GetRegistration, 1)),
            tags::control::DISCONNECT_NOTICE => {
                let registration_id: u32 =
                    codec::decode_fixed(body, tags::DISCONNECT_LEN - 1, "disconnect-notice")?;
                Ok((
                    Self::DisconnectNotice { registration_id },
                    tags::DISCONNECT_LEN,
                ))
            },
            other => Err(CodecError::UnknownTag {
                namespace: "control",
                tag: other,
            }),
        }
    }
}

fn wire_slot(value: u8) -> CodecResult<Slot> {
    Slot::new(value as usize)
        .ok_or_else(|| CodecError::malformed(format!("slot {value} out of range")))
}

fn push_extension(extension: &str, out: &mut Vec<u8>) -> CodecResult<()> {
    if extension.as_bytes().contains(&0) {
        return Err(CodecError::malformed("file extension contains NUL"));
    }
    out.extend_from_slice(extension.as_bytes());
    out.push(0);
    Ok(())
}

// Returns the extension and the bytes it occupied, terminator included.
fn read_extension(body: &[u8]) -> CodecResult<(String, usize)> {
    let nul = body
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| CodecError::malformed("file extension is not NUL-terminated"))?;
    let extension = std::str::from_utf8(&body[..nul])
        .map_err(|e| CodecError::malformed(format!("file extension is not UTF-8: {e}")))?;
    Ok((extension.to_owned(), nul + 1))
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
    use smallvec::smallvec;

    #[test]
    fn test_deliver_input_layout() {
        let msg = DatagramMessage::DeliverInput {
            slot: Slot::P2,
            sequence: Sequence::new(5),
            buttons: 0x0000_0080,
            peripheral: PeripheralKind::MemPak,
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes, [0, 1, 0, 0, 0, 5, 0, 0, 0, 0x80, 2]);
        assert_eq!(bytes.len(), tags::DELIVER_INPUT_LEN);
        assert_eq!(DatagramMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_request_input_layout() {
        let msg = DatagramMessage::RequestInput {
            slot: Slot::P1,
            registration_id: 0x0A0B_0C0D,
            sequence: Sequence::new(0x100),
            spectator: true,
            pending: 3,
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes, [2, 0, 0x0A, 0x0B, 0x0C, 0x0D, 0, 0, 1, 0, 1, 3]);
        assert_eq!(DatagramMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_input_update_decodes_events_in_order() {
        let bytes = [
            1, 0, 0b10, 2, 2, // tag, slot, status, lag, count
            0, 0, 0, 5, 0, 0, 0, 0x80, 1, // seq 5
            0, 0, 0, 6, 0, 0, 0, 0x40, 3, // seq 6
        ];
        let DatagramMessage::InputUpdate(update) = DatagramMessage::decode(&bytes).unwrap() else {
            panic!("expected an input update");
        };
        assert_eq!(update.slot, Slot::P1);
        assert_eq!(update.status, 0b10);
        assert_eq!(update.lag, 2);
        assert!(!update.gratuitous);
        assert_eq!(update.events.len(), 2);
        assert_eq!(update.events[0].sequence, Sequence::new(5));
        assert_eq!(update.events[0].buttons, 0x80);
        assert_eq!(update.events[1].peripheral, PeripheralKind::RumblePak);
    }

    #[test]
    fn test_gratuitous_update_uses_its_own_tag() {
        let update = InputUpdate {
            slot: Slot::P3,
            status: 0,
            lag: 0,
            gratuitous: true,
            events: smallvec![InputEvent {
                sequence: Sequence::new(1),
                buttons: 2,
                peripheral: PeripheralKind::None,
            }],
        };
        let bytes = DatagramMessage::InputUpdate(update.clone()).encode().unwrap();
        assert_eq!(bytes[0], tags::datagram::GRATUITOUS_UPDATE);
        assert_eq!(bytes.len(), tags::UPDATE_HEADER_LEN + tags::UPDATE_EVENT_LEN);
        assert_eq!(
            DatagramMessage::decode(&bytes).unwrap(),
            DatagramMessage::InputUpdate(update)
        );
    }

    #[test]
    fn test_input_update_with_missing_events_is_truncated() {
        let bytes = [1, 0, 0, 0, 2, 0, 0, 0, 5, 0, 0, 0, 0x80, 1];
        let err = DatagramMessage::decode(&bytes).unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                kind: "input-update",
                expected: 23,
                actual: 14,
            }
        );
    }

    #[test]
    fn test_short_request_is_truncated() {
        let err = DatagramMessage::decode(&[2, 0, 0]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { expected: 11, actual: 2, .. }));
    }

    #[test]
    fn test_empty_datagram_is_truncated() {
        assert!(matches!(
            DatagramMessage::decode(&[]),
            Err(CodecError::Truncated { expected: 1, actual: 0, .. })
        ));
    }

    #[test]
    fn test_unknown_datagram_tag() {
        assert_eq!(
            DatagramMessage::decode(&[9, 1, 2]).unwrap_err(),
            CodecError::UnknownTag {
                namespace: "datagram",
                tag: 9,
            }
        );
    }

    #[test]
    fn test_out_of_range_slot_is_malformed() {
        let err = DatagramMessage::decode(&[1, 7, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn test_checksum_layout() {
        let msg = DatagramMessage::Checksum {
            frame: 600,
            registers: vec![1, 0xFFFF_FFFF],
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(
            bytes,
            [4, 0, 0, 2, 0x58, 0, 0, 0, 1, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(DatagramMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_ragged_checksum_is_malformed() {
        let err = DatagramMessage::decode(&[4, 0, 0, 0, 1, 0xAA]).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn test_register_player_layout() {
        let msg = ControlMessage::RegisterPlayer {
            player: Slot::P2,
            peripheral: PeripheralKind::MemPak,
            raw_data: true,
            registration_id: 0xBEEF,
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes, [5, 1, 2, 1, 0, 0, 0xBE, 0xEF]);
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), (msg, 8));
    }

    #[test]
    fn test_save_messages_frame_extension_with_nul() {
        let push = ControlMessage::SendSave {
            extension: "sra".to_owned(),
            data: vec![9, 8, 7],
        };
        let bytes = push.encode().unwrap();
        assert_eq!(bytes, [1, b's', b'r', b'a', 0, 0, 0, 0, 3, 9, 8, 7]);
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), (push, 12));

        let pull = ControlMessage::ReceiveSave {
            extension: String::new(),
        };
        assert_eq!(pull.encode().unwrap(), [2, 0]);
    }

    #[test]
    fn test_send_save_with_short_payload_is_truncated() {
        let bytes = [1, b'e', b'e', b'p', 0, 0, 0, 0, 4, 1, 2];
        assert!(matches!(
            ControlMessage::decode(&bytes),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_send_save_with_huge_declared_size_is_rejected() {
        let bytes = [1, b's', b'r', b'a', 0, 0xFF, 0xFF, 0xFF, 0xFF, 1, 2];
        let err = ControlMessage::decode(&bytes).unwrap_err();
        #[cfg(target_pointer_width = "64")]
        assert_eq!(
            err,
            CodecError::Truncated {
                kind: "send-save",
                expected: 1 + 4 + 4 + 0xFFFF_FFFF,
                actual: bytes.len(),
            }
        );
        #[cfg(not(target_pointer_width = "64"))]
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn test_extension_without_nul_is_malformed() {
        assert!(matches!(
            ControlMessage::decode(&[2, b'm', b'p', b'k']),
            Err(CodecError::Malformed { .. })
        ));
    }

    #[test]
    fn test_settings_block_is_24_bytes() {
        let settings = EmulationSettings {
            count_per_op: 2,
            count_per_op_denom_pot: 0,
            disable_extra_mem: 1,
            si_dma_duration: -1,
            emumode: 2,
            no_compiled_jump: 0,
        };
        let bytes = settings.encode().unwrap();
        assert_eq!(bytes.len(), tags::SETTINGS_LEN);
        assert_eq!(&bytes[12..16], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(EmulationSettings::decode(&bytes).unwrap(), settings);
    }

    #[test]
    fn test_registration_table_layout() {
        let mut bytes = vec![0u8; 24];
        bytes[0..4].copy_from_slice(&[0, 0, 0, 7]);
        bytes[4] = 2;
        bytes[5] = 1;
        let table = RegistrationTable::decode(&bytes).unwrap();
        assert!(table.0[0].is_assigned());
        assert_eq!(table.0[0].peripheral, 2);
        assert_eq!(table.0[0].raw_data, 1);
        assert!(!table.0[1].is_assigned());
        assert_eq!(table.encode().unwrap(), bytes);
    }

    #[test]
    fn test_short_registration_table_is_truncated() {
        assert!(matches!(
            RegistrationTable::decode(&[0u8; 10]),
            Err(CodecError::Truncated {
                expected: 24,
                actual: 10,
                ..
            })
        ));
    }

    #[test]
    fn test_disconnect_notice_layout() {
        let msg = ControlMessage::DisconnectNotice {
            registration_id: 0x0102_0304,
        };
        assert_eq!(msg.encode().unwrap(), [7, 1, 2, 3, 4]);
    }
}
