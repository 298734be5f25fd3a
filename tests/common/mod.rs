//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: an in-process relay ([`stubs::StubRelay`]) and the transport that talks to it
//! - helpers that walk a session through the handshake
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::stubs::{StubRelay, StubTransport};
//! use common::{fast_sync_config, active_session};
//! ```

#![allow(clippy::expect_used)]

pub mod stubs;

use fortress_netplay::{
    EmulationSettings, NetplaySession, PeripheralKind, SessionBuilder, Slot, SyncConfig,
};
use stubs::{StubRelay, StubTransport};
use web_time::Duration;

/// Registration id every helper session registers with.
#[allow(dead_code)]
pub const REGISTRATION_ID: u32 = 0x00C0_FFEE;

/// Retry and timeout values small enough that a silent relay fails a test quickly.
#[allow(dead_code)]
pub fn fast_sync_config() -> SyncConfig {
    SyncConfig {
        request_retry_interval: Duration::from_millis(2),
        request_timeout: Duration::from_millis(60),
        poll_slice: Duration::from_millis(1),
    }
}

/// Starts a session against `relay` with [`fast_sync_config`].
#[allow(dead_code)]
#[track_caller]
pub fn start_session(relay: &StubRelay) -> NetplaySession<StubTransport> {
    SessionBuilder::new()
        .with_sync_config(fast_sync_config())
        .start(relay.transport(), "relay", 45000)
        .expect("stub transport always connects")
}

/// Runs the whole handshake and returns a session ready for [`NetplaySession::update_input`].
///
/// `local` is registered and claimed by this client; `table` is what the relay
/// answers to the registration read, as `(registration id, peripheral, raw)` rows.
/// Settings are pushed when `local` is slot 0 and pulled otherwise.
#[allow(dead_code)]
#[track_caller]
pub fn active_session(
    relay: &StubRelay,
    local: Option<Slot>,
    table: [(u32, u8, u8); 4],
) -> NetplaySession<StubTransport> {
    let builder = SessionBuilder::new().with_sync_config(fast_sync_config());
    active_session_with(relay, builder, local, table)
}

/// [`active_session`] with a caller-supplied builder.
#[allow(dead_code)]
#[track_caller]
pub fn active_session_with(
    relay: &StubRelay,
    builder: SessionBuilder,
    local: Option<Slot>,
    table: [(u32, u8, u8); 4],
) -> NetplaySession<StubTransport> {
    let mut session = builder
        .start(relay.transport(), "relay", 45000)
        .expect("stub transport always connects");
    if let Some(slot) = local {
        relay.reply_register(1, 2);
        session
            .register_player(slot, PeripheralKind::None, false, REGISTRATION_ID)
            .expect("register");
        session.claim_slot(slot).expect("claim");
    }
    relay.reply_table(table);
    session.read_registration().expect("registration table");

    let mut settings = EmulationSettings::default();
    if local != Some(Slot::P1) {
        relay.reply_settings(EmulationSettings::default());
    }
    session.sync_settings(&mut settings).expect("settings");
    session
}

/// A table where only `slots` are owned, each by a distinct client.
#[allow(dead_code)]
pub fn table_with(slots: &[Slot]) -> [(u32, u8, u8); 4] {
    let mut table = [(0, 0, 0); 4];
    for slot in slots {
        table[slot.index()] = (slot.index() as u32 + 1, PeripheralKind::None.to_byte(), 0);
    }
    table
}
