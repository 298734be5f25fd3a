//! Control-channel handshake: registration, settings, save data and config blobs.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::stubs::StubRelay;
use crate::common::{active_session, start_session, table_with, REGISTRATION_ID};
use fortress_netplay::__internal::ControlMessage;
use fortress_netplay::{
    ControlState, EmulationSettings, NetplayError, PeripheralKind, Slot, SlotAssignment,
};

fn sample_settings() -> EmulationSettings {
    EmulationSettings {
        count_per_op: 2,
        count_per_op_denom_pot: 0,
        disable_extra_mem: 0,
        si_dma_duration: -1,
        emumode: 2,
        no_compiled_jump: 1,
    }
}

#[test]
fn register_reports_relay_status_and_lag_target() {
    let relay = StubRelay::new();
    let mut session = start_session(&relay);

    relay.reply_register(0, 3);
    let accepted = session
        .register_player(Slot::P2, PeripheralKind::RumblePak, true, REGISTRATION_ID)
        .unwrap();
    assert!(!accepted);
    assert_eq!(session.lag_buffer_target(), 3);
    assert_eq!(session.registration_id(), REGISTRATION_ID);
    assert_eq!(session.state(), ControlState::Registering);
    assert_eq!(
        relay.control_messages(),
        vec![ControlMessage::RegisterPlayer {
            player: Slot::P2,
            peripheral: PeripheralKind::RumblePak,
            raw_data: true,
            registration_id: REGISTRATION_ID,
        }]
    );
    // 8 bytes on the wire, registration id big-endian
    assert_eq!(
        relay.control_bytes(),
        vec![5, 1, 3, 1, 0x00, 0xC0, 0xFF, 0xEE]
    );
}

#[test]
fn registering_a_slot_twice_is_rejected() {
    let relay = StubRelay::new();
    let mut session = start_session(&relay);
    relay.reply_register(1, 2);
    session
        .register_player(Slot::P1, PeripheralKind::None, false, 1)
        .unwrap();
    let err = session
        .register_player(Slot::P1, PeripheralKind::None, false, 1)
        .unwrap_err();
    assert!(matches!(err, NetplayError::InvalidState { .. }));
}

#[test]
fn short_register_reply_is_truncated() {
    let relay = StubRelay::new();
    let mut session = start_session(&relay);
    relay.reply_bytes(&[1]);
    let err = session
        .register_player(Slot::P1, PeripheralKind::None, false, 1)
        .unwrap_err();
    assert!(matches!(
        err,
        NetplayError::TruncatedPacket {
            expected: 2,
            actual: 1,
            ..
        }
    ));
}

#[test]
fn registration_table_applies_peripheral_sharing() {
    let relay = StubRelay::new();
    let mut session = start_session(&relay);
    relay.reply_register(1, 2);
    session
        .register_player(Slot::P1, PeripheralKind::MemPak, false, 11)
        .unwrap();
    session.claim_slot(Slot::P1).unwrap();

    relay.reply_table([
        (11, PeripheralKind::MemPak.to_byte(), 0),
        (12, PeripheralKind::MemPak.to_byte(), 0),
        (13, PeripheralKind::TransferPak.to_byte(), 1),
        (0, PeripheralKind::RumblePak.to_byte(), 0),
    ]);
    let slots = session.read_registration().unwrap();

    assert!(slots[0].present);
    assert_eq!(slots[0].peripheral, PeripheralKind::MemPak);
    assert_eq!(slots[1].peripheral, PeripheralKind::None);
    assert_eq!(slots[2].peripheral, PeripheralKind::None);
    assert!(slots[2].raw_data);
    assert!(!slots[3].present);
    assert_eq!(slots[3].peripheral, PeripheralKind::None);

    assert_eq!(
        session.slot_assignment(Slot::P1),
        SlotAssignment::Local { controller: 0 }
    );
    assert_eq!(session.slot_assignment(Slot::P2), SlotAssignment::Remote);
    assert_eq!(session.slot_assignment(Slot::P4), SlotAssignment::Unassigned);
    assert_eq!(session.state(), ControlState::SyncingSettings);
}

#[test]
fn non_owner_pulls_settings() {
    let relay = StubRelay::new();
    let mut session = start_session(&relay);
    relay.reply_table(table_with(&[Slot::P1, Slot::P2]));
    session.read_registration().unwrap();

    relay.reply_settings(sample_settings());
    let mut settings = EmulationSettings::default();
    session.sync_settings(&mut settings).unwrap();

    assert_eq!(settings, sample_settings());
    assert_eq!(
        relay.control_messages().last(),
        Some(&ControlMessage::ReceiveSettings)
    );
    assert_eq!(session.state(), ControlState::SyncingSaveData);
}

#[test]
fn owner_pushes_settings() {
    let relay = StubRelay::new();
    let mut session = start_session(&relay);
    relay.reply_register(1, 2);
    session
        .register_player(Slot::P1, PeripheralKind::None, false, 1)
        .unwrap();
    session.claim_slot(Slot::P1).unwrap();
    assert!(session.is_authority());
    relay.reply_table(table_with(&[Slot::P1]));
    session.read_registration().unwrap();

    let mut settings = sample_settings();
    session.sync_settings(&mut settings).unwrap();
    assert_eq!(settings, sample_settings());
    assert_eq!(
        relay.control_messages().last(),
        Some(&ControlMessage::SendSettings(sample_settings()))
    );
}

#[test]
fn empty_save_region_is_an_open_error_and_the_session_continues() {
    let relay = StubRelay::new();
    let mut session = active_session(&relay, None, table_with(&[Slot::P1]));

    relay.reply_bytes(&[0; 64]);
    let mut eeprom = [0xAAu8; 64];
    let err = session.sync_save("GAME.eep", &mut eeprom).unwrap_err();
    assert!(matches!(
        err,
        NetplayError::OpenError { ref region } if region == "GAME.eep"
    ));
    assert!(eeprom.iter().all(|&b| b == 0));

    relay.reply_bytes(&[1, 2, 3, 4]);
    let mut sram = [0u8; 4];
    session.sync_save("GAME.sra", &mut sram).unwrap();
    assert_eq!(sram, [1, 2, 3, 4]);

    let requested: Vec<_> = relay
        .control_messages()
        .into_iter()
        .filter_map(|message| match message {
            ControlMessage::ReceiveSave { extension } => Some(extension),
            _ => None,
        })
        .collect();
    assert_eq!(requested, vec!["eep".to_owned(), "sra".to_owned()]);
}

#[test]
fn owner_pushes_save_regions() {
    let relay = StubRelay::new();
    let mut session = active_session(&relay, Some(Slot::P1), table_with(&[Slot::P1]));

    let mut mempak = [7u8; 16];
    session.sync_save("GAME.mpk", &mut mempak).unwrap();
    assert_eq!(
        relay.control_messages().last(),
        Some(&ControlMessage::SendSave {
            extension: "mpk".to_owned(),
            data: vec![7; 16],
        })
    );
}

#[test]
fn claim_slot_binds_controllers_in_order() {
    let relay = StubRelay::new();
    let mut session = start_session(&relay);
    assert!(session.is_spectator());
    assert_eq!(session.claim_slot(Slot::P3).unwrap(), 0);
    assert_eq!(session.claim_slot(Slot::P1).unwrap(), 1);
    assert_eq!(session.next_controller(), 2);
    assert_eq!(session.controller_for(Slot::P1), Some(1));
    assert_eq!(session.controller_for(Slot::P2), None);
    assert!(!session.is_spectator());

    assert!(matches!(
        session.claim_slot(Slot::P3),
        Err(NetplayError::InvalidRequest { .. })
    ));
}

#[test]
fn claim_slot_is_closed_once_settings_are_synced() {
    let relay = StubRelay::new();
    let mut session = active_session(&relay, None, table_with(&[Slot::P1]));
    assert!(matches!(
        session.claim_slot(Slot::P2),
        Err(NetplayError::InvalidState {
            operation: "claim_slot",
            current: ControlState::SyncingSaveData,
        })
    ));
}

#[test]
fn handshake_steps_cannot_run_out_of_order() {
    let relay = StubRelay::new();
    let mut session = start_session(&relay);
    assert!(matches!(
        session.sync_settings(&mut EmulationSettings::default()),
        Err(NetplayError::InvalidState { .. })
    ));
    assert!(matches!(
        session.sync_save("x.eep", &mut [0; 4]),
        Err(NetplayError::InvalidState { .. })
    ));

    relay.reply_table(table_with(&[Slot::P1]));
    session.read_registration().unwrap();
    assert!(matches!(
        session.register_player(Slot::P2, PeripheralKind::None, false, 1),
        Err(NetplayError::InvalidState { .. })
    ));
}

#[test]
fn config_blobs_respect_ownership() {
    let relay = StubRelay::new();
    let mut owner = active_session(&relay, Some(Slot::P1), table_with(&[Slot::P1]));
    let before = relay.control_bytes().len();
    owner.send_config(&[1, 2, 3]).unwrap();
    assert_eq!(&relay.control_bytes()[before..], &[1, 2, 3]);
    assert!(matches!(
        owner.receive_config(&mut [0; 3]),
        Err(NetplayError::InvalidState { .. })
    ));

    let relay = StubRelay::new();
    let mut peer = active_session(&relay, None, table_with(&[Slot::P1]));
    peer.send_config(&[9]).unwrap();
    assert!(matches!(
        peer.send_config(&[1, 2]),
        Err(NetplayError::InvalidState { .. })
    ));
    relay.reply_bytes(&[4, 5, 6]);
    let mut blob = [0u8; 3];
    peer.receive_config(&mut blob).unwrap();
    assert_eq!(blob, [4, 5, 6]);
}
