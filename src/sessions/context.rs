//! A slot that holds at most one live session.
//!
//! Hosts that keep netplay state in one long-lived place (a frontend core
//! object, a plugin handle) store a [`NetplayContext`] there. Every call made
//! while no session is live fails with [`NetplayError::NotInitialized`].

use crate::controller::PollChannel;
use crate::network::transport::Transport;
use crate::sessions::builder::SessionBuilder;
use crate::sessions::control::{ControlState, EmulationSettings};
use crate::sessions::event_drain::EventDrain;
use crate::sessions::netplay_session::{NetplaySession, PlayerSlot};
use crate::{NetplayError, NetplayRequest, PeripheralKind, Slot, MAX_PLAYERS};

/// Owner of the (single) live [`NetplaySession`].
pub struct NetplayContext<T: Transport> {
    session: Option<NetplaySession<T>>,
}

impl<T: Transport> Default for NetplayContext<T> {
    fn default() -> Self {
        Self { session: None }
    }
}

impl<T: Transport> std::fmt::Debug for NetplayContext<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetplayContext")
            .field("session", &self.session)
            .finish()
    }
}

impl<T: Transport> NetplayContext<T> {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a session with `builder`'s configuration.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidState`] if a session is already live, otherwise
    /// whatever [`SessionBuilder::start`] reports.
    pub fn start(
        &mut self,
        builder: SessionBuilder,
        transport: T,
        host: &str,
        port: u16,
    ) -> Result<(), NetplayError> {
        if let Some(session) = &self.session {
            return Err(NetplayError::InvalidState {
                operation: "start",
                current: session.state(),
            });
        }
        self.session = Some(builder.start(transport, host, port)?);
        Ok(())
    }

    /// Stops the live session.
    pub fn stop(&mut self) -> Result<(), NetplayError> {
        let session = self.session.take().ok_or(NetplayError::NotInitialized)?;
        session.stop();
        Ok(())
    }

    /// `true` while a session is live.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    /// The live session.
    pub fn session(&self) -> Result<&NetplaySession<T>, NetplayError> {
        self.session.as_ref().ok_or(NetplayError::NotInitialized)
    }

    /// The live session, mutably.
    pub fn session_mut(&mut self) -> Result<&mut NetplaySession<T>, NetplayError> {
        self.session.as_mut().ok_or(NetplayError::NotInitialized)
    }

    /// See [`NetplaySession::register_player`].
    pub fn register_player(
        &mut self,
        player: Slot,
        peripheral: PeripheralKind,
        raw_data: bool,
        registration_id: u32,
    ) -> Result<bool, NetplayError> {
        self.session_mut()?
            .register_player(player, peripheral, raw_data, registration_id)
    }

    /// See [`NetplaySession::claim_slot`].
    pub fn claim_slot(&mut self, slot: Slot) -> Result<usize, NetplayError> {
        self.session_mut()?.claim_slot(slot)
    }

    /// See [`NetplaySession::read_registration`].
    pub fn read_registration(&mut self) -> Result<[PlayerSlot; MAX_PLAYERS], NetplayError> {
        self.session_mut()?.read_registration()
    }

    /// See [`NetplaySession::sync_settings`].
    pub fn sync_settings(&mut self, settings: &mut EmulationSettings) -> Result<(), NetplayError> {
        self.session_mut()?.sync_settings(settings)
    }

    /// See [`NetplaySession::sync_save`].
    pub fn sync_save(&mut self, file_name: &str, data: &mut [u8]) -> Result<(), NetplayError> {
        self.session_mut()?.sync_save(file_name, data)
    }

    /// See [`NetplaySession::send_config`].
    pub fn send_config(&mut self, bytes: &[u8]) -> Result<(), NetplayError> {
        self.session_mut()?.send_config(bytes)
    }

    /// See [`NetplaySession::receive_config`].
    pub fn receive_config(&mut self, buf: &mut [u8]) -> Result<(), NetplayError> {
        self.session_mut()?.receive_config(buf)
    }

    /// See [`NetplaySession::update_input`].
    pub fn update_input(
        &mut self,
        channels: &mut [PollChannel; MAX_PLAYERS],
    ) -> Result<Vec<NetplayRequest>, NetplayError> {
        self.session_mut()?.update_input(channels)
    }

    /// See [`NetplaySession::check_sync`].
    pub fn check_sync(&mut self, registers: &[u32]) -> Result<(), NetplayError> {
        self.session_mut()?.check_sync(registers)
    }

    /// See [`NetplaySession::controller_for`].
    pub fn controller_for(&self, slot: Slot) -> Result<Option<usize>, NetplayError> {
        Ok(self.session()?.controller_for(slot))
    }

    /// The live session's handshake state.
    pub fn state(&self) -> Result<ControlState, NetplayError> {
        Ok(self.session()?.state())
    }

    /// Drains the live session's events. Empty while no session is live.
    pub fn events(&mut self) -> EventDrain<'_> {
        match self.session.as_mut() {
            Some(session) => session.events(),
            None => EventDrain::empty(),
        }
    }
}
