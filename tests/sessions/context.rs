//! The single-session context.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::stubs::{StubRelay, StubTransport};
use crate::common::{fast_sync_config, table_with};
use fortress_netplay::{
    ControlState, EmulationSettings, NetplayContext, NetplayError, PeripheralKind, PollChannel,
    SessionBuilder, Slot,
};

fn builder() -> SessionBuilder {
    SessionBuilder::new().with_sync_config(fast_sync_config())
}

fn not_initialized<T: std::fmt::Debug>(result: Result<T, NetplayError>) -> bool {
    matches!(result, Err(NetplayError::NotInitialized))
}

#[test]
fn every_call_without_a_session_is_not_initialized() {
    let mut context: NetplayContext<StubTransport> = NetplayContext::new();
    assert!(!context.is_initialized());

    assert!(not_initialized(context.register_player(
        Slot::P1,
        PeripheralKind::None,
        false,
        1
    )));
    assert!(not_initialized(context.claim_slot(Slot::P1)));
    assert!(not_initialized(context.read_registration()));
    assert!(not_initialized(
        context.sync_settings(&mut EmulationSettings::default())
    ));
    assert!(not_initialized(context.sync_save("a.eep", &mut [0; 4])));
    assert!(not_initialized(context.send_config(&[1])));
    assert!(not_initialized(context.receive_config(&mut [0; 1])));
    assert!(not_initialized(
        context.update_input(&mut [PollChannel::default(); 4])
    ));
    assert!(not_initialized(context.check_sync(&[])));
    assert!(not_initialized(context.controller_for(Slot::P1)));
    assert!(not_initialized(context.state()));
    assert!(not_initialized(context.stop()));
    assert_eq!(context.events().count(), 0);
}

#[test]
fn context_runs_one_session_at_a_time() {
    let relay = StubRelay::new();
    let mut context = NetplayContext::new();
    context
        .start(builder(), relay.transport(), "relay", 45000)
        .unwrap();
    assert!(context.is_initialized());

    let err = context
        .start(builder(), relay.transport(), "relay", 45000)
        .unwrap_err();
    assert!(matches!(
        err,
        NetplayError::InvalidState {
            operation: "start",
            current: ControlState::Idle,
        }
    ));

    relay.reply_register(1, 2);
    assert!(context
        .register_player(Slot::P1, PeripheralKind::None, false, 5)
        .unwrap());
    assert_eq!(context.claim_slot(Slot::P1).unwrap(), 0);
    assert_eq!(context.controller_for(Slot::P1).unwrap(), Some(0));
    relay.reply_table(table_with(&[Slot::P1]));
    context.read_registration().unwrap();
    context
        .sync_settings(&mut EmulationSettings::default())
        .unwrap();
    assert_eq!(context.state().unwrap(), ControlState::SyncingSaveData);

    context.stop().unwrap();
    assert!(!context.is_initialized());
    assert!(relay.control_closed());
    assert!(not_initialized(context.state()));

    // a fresh session may start after the old one stopped
    let relay = StubRelay::new();
    context
        .start(builder(), relay.transport(), "relay", 45000)
        .unwrap();
    assert_eq!(context.session().unwrap().registration_id(), 0);
}

#[test]
fn invalid_configuration_leaves_the_context_empty() {
    let relay = StubRelay::new();
    let mut context = NetplayContext::new();
    let mut config = fast_sync_config();
    config.request_timeout = config.request_retry_interval;
    let err = context
        .start(
            SessionBuilder::new().with_sync_config(config),
            relay.transport(),
            "relay",
            45000,
        )
        .unwrap_err();
    assert!(matches!(err, NetplayError::InvalidRequest { .. }));
    assert!(!context.is_initialized());
}
