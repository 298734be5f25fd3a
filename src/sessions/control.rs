//! The reliable control channel: registration, settings and save data.
//!
//! Every exchange is strictly sequential. A request is written in full and its
//! answer read in full before the next request is allowed, so the channel never
//! has two outstanding requests.

use std::fmt;

use tracing::{debug, info};

use crate::network::messages::{tags, ControlMessage, RegisterReply, RegistrationTable};
use crate::network::transport::{recv_exact, send_all, ReliableStream};
use crate::sessions::netplay_session::PlayerSlot;
use crate::{NetplayError, PeripheralKind, Slot, MAX_PLAYERS};

pub use crate::network::messages::{EmulationSettings, RegistrationEntry};

/// Where the control channel is in the session handshake.
///
/// ```text
/// Idle -> Registering -> AwaitingRegistrationTable -> SyncingSettings
///      -> SyncingSaveData -> Active -> Disconnecting -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ControlState {
    /// Connected, nothing exchanged yet.
    #[default]
    Idle,
    /// At least one slot registered.
    Registering,
    /// Waiting for the registration table.
    AwaitingRegistrationTable,
    /// Table read, settings not yet exchanged.
    SyncingSettings,
    /// Settings exchanged, save regions may be synced.
    SyncingSaveData,
    /// Input is flowing.
    Active,
    /// Teardown in progress.
    Disconnecting,
    /// Both channels closed.
    Closed,
}

impl ControlState {
    /// Returns a string representation suitable for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Registering => "registering",
            Self::AwaitingRegistrationTable => "awaiting_registration_table",
            Self::SyncingSettings => "syncing_settings",
            Self::SyncingSaveData => "syncing_save_data",
            Self::Active => "active",
            Self::Disconnecting => "disconnecting",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peripheral a slot is allowed to use over netplay.
///
/// Transfer paks are never shared; memory paks only on the first slot.
pub(crate) fn shared_peripheral(slot: Slot, announced: PeripheralKind) -> PeripheralKind {
    match announced {
        PeripheralKind::TransferPak => PeripheralKind::None,
        PeripheralKind::MemPak if slot != Slot::P1 => PeripheralKind::None,
        other => other,
    }
}

/// Text after the last `.` of a file name, or nothing.
fn save_extension(file_name: &str) -> &str {
    file_name.rsplit_once('.').map_or("", |(_, ext)| ext)
}

/// Reliable half of a session.
pub(crate) struct ControlChannel<S: ReliableStream> {
    stream: S,
    state: ControlState,
    registered: [bool; MAX_PLAYERS],
}

impl<S: ReliableStream> ControlChannel<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            state: ControlState::Idle,
            registered: [false; MAX_PLAYERS],
        }
    }

    pub(crate) fn state(&self) -> ControlState {
        self.state
    }

    fn require(
        &self,
        operation: &'static str,
        allowed: &[ControlState],
    ) -> Result<(), NetplayError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(NetplayError::InvalidState {
                operation,
                current: self.state,
            })
        }
    }

    fn send(&mut self, message: &ControlMessage) -> Result<(), NetplayError> {
        let bytes = message.encode()?;
        debug!("Sending {} ({} bytes)", message.kind(), bytes.len());
        send_all(&mut self.stream, &bytes)
    }

    /// Claims a slot on the relay.
    pub(crate) fn register_player(
        &mut self,
        player: Slot,
        peripheral: PeripheralKind,
        raw_data: bool,
        registration_id: u32,
    ) -> Result<RegisterReply, NetplayError> {
        const OPERATION: &str = "register_player";
        self.require(OPERATION, &[ControlState::Idle, ControlState::Registering])?;
        if self.registered[player.index()] {
            return Err(NetplayError::InvalidState {
                operation: OPERATION,
                current: self.state,
            });
        }
        self.state = ControlState::Registering;
        self.send(&ControlMessage::RegisterPlayer {
            player,
            peripheral,
            raw_data,
            registration_id,
        })?;
        let mut reply = [0u8; tags::REGISTER_REPLY_LEN];
        recv_exact(&mut self.stream, &mut reply, "register reply")?;
        let reply = RegisterReply::decode(&reply)?;
        self.registered[player.index()] = true;
        info!(
            "Registered slot {} (status {}, lag buffer target {})",
            player, reply.status, reply.lag_buffer_target
        );
        Ok(reply)
    }

    /// Reads the relay's slot table and applies the peripheral sharing policy.
    pub(crate) fn read_registration(&mut self) -> Result<[PlayerSlot; MAX_PLAYERS], NetplayError> {
        self.require(
            "read_registration",
            &[ControlState::Idle, ControlState::Registering],
        )?;
        self.state = ControlState::AwaitingRegistrationTable;
        self.send(&ControlMessage::GetRegistration)?;
        let mut raw = [0u8; tags::REGISTRATION_TABLE_LEN];
        recv_exact(&mut self.stream, &mut raw, "registration table")?;
        let table = RegistrationTable::decode(&raw)?;

        let mut slots = [PlayerSlot::default(); MAX_PLAYERS];
        for (slot, (entry, out)) in Slot::ALL.into_iter().zip(table.0.iter().zip(&mut slots)) {
            if !entry.is_assigned() {
                continue;
            }
            let peripheral = shared_peripheral(slot, PeripheralKind::from_byte(entry.peripheral));
            *out = PlayerSlot {
                present: true,
                peripheral,
                active_peripheral: peripheral,
                raw_data: entry.raw_data != 0,
                lag: 0,
            };
        }
        self.state = ControlState::SyncingSettings;
        Ok(slots)
    }

    /// Pushes the settings when `owner`, otherwise overwrites them with the relay's copy.
    pub(crate) fn sync_settings(
        &mut self,
        owner: bool,
        settings: &mut EmulationSettings,
    ) -> Result<(), NetplayError> {
        self.require("sync_settings", &[ControlState::SyncingSettings])?;
        if owner {
            self.send(&ControlMessage::SendSettings(*settings))?;
        } else {
            self.send(&ControlMessage::ReceiveSettings)?;
            let mut raw = [0u8; tags::SETTINGS_LEN];
            recv_exact(&mut self.stream, &mut raw, "emulation settings")?;
            *settings = EmulationSettings::decode(&raw)?;
        }
        self.state = ControlState::SyncingSaveData;
        Ok(())
    }

    /// Pushes a save region when `owner`, otherwise fills `data` from the relay.
    ///
    /// # Errors
    ///
    /// [`NetplayError::OpenError`] if the relay's copy is all zeros. `data` is
    /// left zeroed and the session stays usable.
    pub(crate) fn sync_save(
        &mut self,
        owner: bool,
        file_name: &str,
        data: &mut [u8],
    ) -> Result<(), NetplayError> {
        self.require("sync_save", &[ControlState::SyncingSaveData])?;
        let extension = save_extension(file_name).to_owned();
        if owner {
            return self.send(&ControlMessage::SendSave {
                extension,
                data: data.to_vec(),
            });
        }
        self.send(&ControlMessage::ReceiveSave { extension })?;
        recv_exact(&mut self.stream, data, "save region")?;
        if data.iter().all(|&b| b == 0) {
            return Err(NetplayError::OpenError {
                region: file_name.to_owned(),
            });
        }
        Ok(())
    }

    /// Writes an opaque frontend configuration blob.
    pub(crate) fn send_config(&mut self, owner: bool, bytes: &[u8]) -> Result<(), NetplayError> {
        const OPERATION: &str = "send_config";
        self.require_open(OPERATION)?;
        if !owner && bytes.len() != 1 {
            return Err(NetplayError::InvalidState {
                operation: OPERATION,
                current: self.state,
            });
        }
        send_all(&mut self.stream, bytes)
    }

    /// Reads an opaque frontend configuration blob of exactly `buf.len()` bytes.
    pub(crate) fn receive_config(&mut self, owner: bool, buf: &mut [u8]) -> Result<(), NetplayError> {
        const OPERATION: &str = "receive_config";
        self.require_open(OPERATION)?;
        if owner {
            return Err(NetplayError::InvalidState {
                operation: OPERATION,
                current: self.state,
            });
        }
        recv_exact(&mut self.stream, buf, "frontend config")
    }

    fn require_open(&self, operation: &'static str) -> Result<(), NetplayError> {
        if matches!(self.state, ControlState::Disconnecting | ControlState::Closed) {
            return Err(NetplayError::InvalidState {
                operation,
                current: self.state,
            });
        }
        Ok(())
    }

    /// Moves to `Active` on the first per-frame call after the handshake.
    pub(crate) fn enter_active(&mut self, operation: &'static str) -> Result<(), NetplayError> {
        self.require(
            operation,
            &[ControlState::SyncingSaveData, ControlState::Active],
        )?;
        if self.state == ControlState::SyncingSaveData {
            info!("Handshake complete, session active");
            self.state = ControlState::Active;
        }
        Ok(())
    }

    /// Starts teardown and sends the disconnect notice.
    ///
    /// The caller decides what to do with a failed send; teardown continues either way.
    pub(crate) fn send_disconnect(&mut self, registration_id: u32) -> Result<(), NetplayError> {
        self.state = ControlState::Disconnecting;
        self.send(&ControlMessage::DisconnectNotice { registration_id })
    }

    pub(crate) fn close(&mut self) {
        self.stream.close();
        self.state = ControlState::Closed;
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
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Recorded {
        written: Vec<u8>,
        replies: VecDeque<u8>,
        closed: bool,
    }

    impl ReliableStream for Recorded {
        fn send(&mut self, bytes: &[u8]) -> Result<usize, NetplayError> {
            if self.closed {
                return Err(NetplayError::TransportFailure {
                    context: "closed".to_owned(),
                });
            }
            self.written.extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<usize, NetplayError> {
            let n = buf.len().min(self.replies.len());
            for b in buf.iter_mut().take(n) {
                *b = self.replies.pop_front().unwrap();
            }
            Ok(n)
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    fn channel(replies: &[u8]) -> ControlChannel<Recorded> {
        ControlChannel::new(Recorded {
            replies: replies.iter().copied().collect(),
            ..Recorded::default()
        })
    }

    fn table(entries: [(u32, u8, u8); 4]) -> Vec<u8> {
        entries
            .iter()
            .flat_map(|&(id, peripheral, raw)| {
                let mut row = id.to_be_bytes().to_vec();
                row.push(peripheral);
                row.push(raw);
                row
            })
            .collect()
    }

    #[test]
    fn test_control_state_display() {
        assert_eq!(ControlState::Active.to_string(), "active");
        assert_eq!(
            ControlState::AwaitingRegistrationTable.to_string(),
            "awaiting_registration_table"
        );
        assert_eq!(ControlState::default(), ControlState::Idle);
    }

    #[test]
    fn test_register_player_exchange() {
        let mut control = channel(&[1, 3]);
        let reply = control
            .register_player(Slot::P1, PeripheralKind::MemPak, false, 0xBEEF)
            .unwrap();
        assert_eq!(reply.lag_buffer_target, 3);
        assert_eq!(control.stream.written, [5, 0, 2, 0, 0, 0, 0xBE, 0xEF]);
        assert_eq!(control.state(), ControlState::Registering);
    }

    #[test]
    fn test_registering_same_slot_twice_is_invalid() {
        let mut control = channel(&[1, 3, 1, 3]);
        control
            .register_player(Slot::P2, PeripheralKind::None, false, 1)
            .unwrap();
        let err = control
            .register_player(Slot::P2, PeripheralKind::None, false, 1)
            .unwrap_err();
        assert!(matches!(
            err,
            NetplayError::InvalidState {
                operation: "register_player",
                ..
            }
        ));
    }

    #[test]
    fn test_short_register_reply_is_truncated() {
        let mut control = channel(&[1]);
        assert!(matches!(
            control.register_player(Slot::P1, PeripheralKind::None, false, 1),
            Err(NetplayError::TruncatedPacket { expected: 2, actual: 1, .. })
        ));
    }

    #[test]
    fn test_registration_table_masks_peripherals() {
        let raw = table([(7, 2, 0), (8, 2, 1), (0, 3, 1), (9, 4, 0)]);
        let mut control = channel(&raw);
        let slots = control.read_registration().unwrap();
        assert_eq!(control.stream.written, [tags::control::GET_REGISTRATION]);

        assert!(slots[0].present);
        assert_eq!(slots[0].peripheral, PeripheralKind::MemPak);
        assert!(slots[1].present);
        assert_eq!(slots[1].peripheral, PeripheralKind::None);
        assert!(slots[1].raw_data);
        assert!(!slots[2].present);
        assert_eq!(slots[2].peripheral, PeripheralKind::None);
        assert!(!slots[2].raw_data);
        assert_eq!(slots[3].peripheral, PeripheralKind::None);
        assert_eq!(control.state(), ControlState::SyncingSettings);
    }

    #[test]
    fn test_register_after_table_is_invalid() {
        let mut control = channel(&table([(0, 0, 0); 4]));
        control.read_registration().unwrap();
        assert!(matches!(
            control.register_player(Slot::P1, PeripheralKind::None, false, 1),
            Err(NetplayError::InvalidState {
                current: ControlState::SyncingSettings,
                ..
            })
        ));
    }

    #[test]
    fn test_pull_settings_decodes_big_endian() {
        let mut raw = Vec::new();
        for word in [2u32, 1, 0, 0xFFFF_FFFF, 2, 1] {
            raw.extend_from_slice(&word.to_be_bytes());
        }
        let mut control = channel(&raw);
        control.state = ControlState::SyncingSettings;
        let mut settings = EmulationSettings::default();
        control.sync_settings(false, &mut settings).unwrap();
        assert_eq!(control.stream.written, [tags::control::RECEIVE_SETTINGS]);
        assert_eq!(settings.count_per_op, 2);
        assert_eq!(settings.count_per_op_denom_pot, 1);
        assert_eq!(settings.si_dma_duration, -1);
        assert_eq!(settings.no_compiled_jump, 1);
        assert_eq!(control.state(), ControlState::SyncingSaveData);
    }

    #[test]
    fn test_push_settings_writes_25_bytes() {
        let mut control = channel(&[]);
        control.state = ControlState::SyncingSettings;
        let mut settings = EmulationSettings {
            emumode: 2,
            ..EmulationSettings::default()
        };
        control.sync_settings(true, &mut settings).unwrap();
        assert_eq!(control.stream.written.len(), 1 + tags::SETTINGS_LEN);
        assert_eq!(control.stream.written[0], tags::control::SEND_SETTINGS);
        assert_eq!(&control.stream.written[17..21], &[0, 0, 0, 2]);
    }

    #[test]
    fn test_all_zero_save_is_open_error() {
        let mut control = channel(&[0u8; 64]);
        control.state = ControlState::SyncingSaveData;
        let mut data = [0xAAu8; 64];
        let err = control.sync_save(false, "GAME.eep", &mut data).unwrap_err();
        assert_eq!(
            err,
            NetplayError::OpenError {
                region: "GAME.eep".to_owned()
            }
        );
        assert!(data.iter().all(|&b| b == 0));
        assert_eq!(control.stream.written, [2, b'e', b'e', b'p', 0]);
    }

    #[test]
    fn test_owner_pushes_save_region() {
        let mut control = channel(&[]);
        control.state = ControlState::SyncingSaveData;
        let mut data = [1u8, 2, 3];
        control.sync_save(true, "noext", &mut data).unwrap();
        assert_eq!(control.stream.written, [1, 0, 0, 0, 0, 3, 1, 2, 3]);
    }

    #[test]
    fn test_save_extension() {
        assert_eq!(save_extension("a.b.sra"), "sra");
        assert_eq!(save_extension("plain"), "");
        assert_eq!(save_extension("trailing."), "");
    }

    #[test]
    fn test_config_pass_through_permissions() {
        let mut control = channel(&[4, 5]);
        assert!(control.send_config(false, &[1, 2]).is_err());
        control.send_config(false, &[9]).unwrap();
        control.send_config(true, &[1, 2]).unwrap();
        assert_eq!(control.stream.written, [9, 1, 2]);

        assert!(control.receive_config(true, &mut [0u8; 2]).is_err());
        let mut buf = [0u8; 2];
        control.receive_config(false, &mut buf).unwrap();
        assert_eq!(buf, [4, 5]);
    }

    #[test]
    fn test_enter_active_requires_handshake() {
        let mut control = channel(&[]);
        assert!(control.enter_active("update_input").is_err());
        control.state = ControlState::SyncingSaveData;
        control.enter_active("update_input").unwrap();
        assert_eq!(control.state(), ControlState::Active);
        control.enter_active("check_sync").unwrap();
    }

    #[test]
    fn test_teardown_states() {
        let mut control = channel(&[]);
        control.send_disconnect(0x0102_0304).unwrap();
        assert_eq!(control.state(), ControlState::Disconnecting);
        assert_eq!(control.stream.written, [7, 1, 2, 3, 4]);
        control.close();
        assert_eq!(control.state(), ControlState::Closed);
        assert!(control.send_config(true, &[1]).is_err());
    }
}
