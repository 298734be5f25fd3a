//! The lockstep session: handshake, per-poll input exchange and teardown.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{error, info, trace, warn};

use crate::controller::{JoybusCommand, PollChannel, NO_DEVICE_BITS};
use crate::network::network_stats::NetworkStats;
use crate::network::transport::{RouteId, Transport};
use crate::report_violation_to;
use crate::sessions::config::{ProtocolConfig, SyncConfig};
use crate::sessions::control::{ControlChannel, ControlState, EmulationSettings};
use crate::sessions::desync_probe::{DesyncProbe, StatusChange};
use crate::sessions::event_drain::EventDrain;
use crate::sessions::input_sync::InputSync;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    NetplayError, NetplayEvent, NetplayRequest, PeripheralKind, Sequence, Slot, MAX_PLAYERS,
};

/// One row of the session's slot table, as the relay announced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PlayerSlot {
    /// A client owns this slot.
    pub present: bool,
    /// The peripheral the slot is registered with, after the sharing policy.
    pub peripheral: PeripheralKind,
    /// The peripheral reported with the slot's most recently consumed input.
    pub active_peripheral: PeripheralKind,
    /// The owner's frontend forwards raw joybus traffic.
    pub raw_data: bool,
    /// How far behind the relay the slot was at its last solicited update.
    pub lag: u8,
}

/// Who drives a slot from this client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SlotAssignment {
    /// Nobody owns the slot.
    #[default]
    Unassigned,
    /// This client feeds the slot from one of its own controllers.
    Local {
        /// Index of the local controller bound to the slot.
        controller: usize,
    },
    /// Another client owns the slot.
    Remote,
}

/// A [`NetplaySession`] keeps several emulator instances in lockstep through a relay.
///
/// Create one with [`SessionBuilder::start`]. Drive the handshake with
/// [`register_player`], [`read_registration`], [`sync_settings`] and
/// [`sync_save`], then call [`update_input`] once per input poll and
/// [`check_sync`] once per emulated frame. End the session with [`stop`].
///
/// [`SessionBuilder::start`]: crate::SessionBuilder::start
/// [`register_player`]: Self::register_player
/// [`read_registration`]: Self::read_registration
/// [`sync_settings`]: Self::sync_settings
/// [`sync_save`]: Self::sync_save
/// [`update_input`]: Self::update_input
/// [`check_sync`]: Self::check_sync
/// [`stop`]: Self::stop
pub struct NetplaySession<T: Transport> {
    control: ControlChannel<T::Stream>,
    sync: InputSync<T::Datagram>,
    registration_id: u32,
    slots: [PlayerSlot; MAX_PLAYERS],
    controllers: [Option<usize>; MAX_PLAYERS],
    next_controller: usize,
    probe: DesyncProbe,
    event_queue: VecDeque<NetplayEvent>,
    event_queue_size: usize,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<T: Transport> std::fmt::Debug for NetplaySession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetplaySession")
            .field("state", &self.control.state())
            .field("registration_id", &self.registration_id)
            .field("slots", &self.slots)
            .field("controllers", &self.controllers)
            .field("frame", &self.probe.frame_counter())
            .field("queued_events", &self.event_queue.len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> NetplaySession<T> {
    pub(crate) fn new(
        stream: T::Stream,
        datagram: T::Datagram,
        route: RouteId,
        sync_config: SyncConfig,
        protocol_config: ProtocolConfig,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        Self {
            control: ControlChannel::new(stream),
            sync: InputSync::new(datagram, route, sync_config, violation_observer.clone()),
            registration_id: 0,
            slots: [PlayerSlot::default(); MAX_PLAYERS],
            controllers: [None; MAX_PLAYERS],
            next_controller: 0,
            probe: DesyncProbe::new(protocol_config.checksum_interval),
            event_queue: VecDeque::with_capacity(protocol_config.event_queue_size),
            event_queue_size: protocol_config.event_queue_size,
            violation_observer,
        }
    }

    /// Claims `player` on the relay for this client.
    ///
    /// `registration_id` identifies this client in every later request. The relay's
    /// lag-buffer target from the answer drives the fast-forward policy. Returns
    /// whether the relay accepted the registration.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidState`] if the slot was already registered or the
    /// registration table was already read.
    pub fn register_player(
        &mut self,
        player: Slot,
        peripheral: PeripheralKind,
        raw_data: bool,
        registration_id: u32,
    ) -> Result<bool, NetplayError> {
        let reply = self
            .control
            .register_player(player, peripheral, raw_data, registration_id)?;
        self.registration_id = registration_id;
        self.sync.set_registration_id(registration_id);
        self.sync.set_lag_buffer_target(reply.lag_buffer_target);
        Ok(reply.status != 0)
    }

    /// Binds `slot` to the next local controller and leaves spectator mode.
    ///
    /// Returns the controller index the host should read for this slot.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] if the slot is already bound, and
    /// [`NetplayError::InvalidState`] once settings have been synced.
    pub fn claim_slot(&mut self, slot: Slot) -> Result<usize, NetplayError> {
        let state = self.control.state();
        if state > ControlState::SyncingSettings {
            return Err(NetplayError::InvalidState {
                operation: "claim_slot",
                current: state,
            });
        }
        if let Some(controller) = self.controllers[slot.index()] {
            return Err(NetplayError::InvalidRequest {
                info: format!("slot {slot} is already bound to controller {controller}"),
            });
        }
        let controller = self.next_controller;
        self.controllers[slot.index()] = Some(controller);
        self.next_controller += 1;
        self.sync.set_spectator(false);
        info!("Slot {} bound to local controller {}", slot, controller);
        Ok(controller)
    }

    /// Reads the relay's slot table. See [`slots`](Self::slots).
    pub fn read_registration(&mut self) -> Result<[PlayerSlot; MAX_PLAYERS], NetplayError> {
        self.slots = self.control.read_registration()?;
        Ok(self.slots())
    }

    /// Makes every peer use the slot-0 owner's emulation settings.
    ///
    /// The owner pushes `settings`; everybody else has them overwritten.
    pub fn sync_settings(&mut self, settings: &mut EmulationSettings) -> Result<(), NetplayError> {
        let owner = self.is_authority();
        self.control.sync_settings(owner, settings)
    }

    /// Makes every peer use the slot-0 owner's copy of one save region.
    ///
    /// The region is identified by the extension of `file_name`. Call once per region.
    ///
    /// # Errors
    ///
    /// [`NetplayError::OpenError`] if the relay has no data for the region. `data`
    /// is left zeroed and the session continues.
    pub fn sync_save(&mut self, file_name: &str, data: &mut [u8]) -> Result<(), NetplayError> {
        let owner = self.is_authority();
        self.control.sync_save(owner, file_name, data)
    }

    /// Writes an opaque frontend configuration blob to the relay.
    ///
    /// Only the slot-0 owner may send more than one byte.
    pub fn send_config(&mut self, bytes: &[u8]) -> Result<(), NetplayError> {
        let owner = self.is_authority();
        self.control.send_config(owner, bytes)
    }

    /// Reads an opaque frontend configuration blob of exactly `buf.len()` bytes.
    ///
    /// Not available to the slot-0 owner, who is the one sending it.
    pub fn receive_config(&mut self, buf: &mut [u8]) -> Result<(), NetplayError> {
        let owner = self.is_authority();
        self.control.receive_config(owner, buf)
    }

    /// Exchanges this poll's input with the relay.
    ///
    /// Call once per input poll, after the host wrote the local controllers' button
    /// words into the channels of the slots this client claimed. On return, every
    /// present slot's channel holds the relay-authoritative answer.
    ///
    /// When the relay stops answering, the affected channels read zero buttons,
    /// [`NetplayEvent::ConnectionLost`] is queued and the returned requests contain
    /// [`NetplayRequest::HaltEmulation`]. This is not an error.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidState`] before [`sync_settings`](Self::sync_settings),
    /// and any fatal transport or decode failure. A fatal failure is returned once
    /// and queues [`NetplayEvent::ConnectionLost`]; every later call halts the way
    /// an unanswered fetch does.
    pub fn update_input(
        &mut self,
        channels: &mut [PollChannel; MAX_PLAYERS],
    ) -> Result<Vec<NetplayRequest>, NetplayError> {
        self.control.enter_active("update_input")?;
        let mut requests = Vec::new();

        self.send_local_input(channels)?;
        for slot in Slot::ALL {
            let channel = &mut channels[slot.index()];
            let Some(command) = channel.command else {
                continue;
            };
            let entry = &mut self.slots[slot.index()];
            if !entry.present {
                continue;
            }
            channel.rx_status &= !NO_DEVICE_BITS;
            if command != JoybusCommand::ControllerRead {
                if entry.raw_data {
                    channel.answer_raw_command();
                }
                continue;
            }
            let sequence = self.sync.ledger().next_sequence(slot);
            match self.sync.fetch_input(slot, &mut requests) {
                Ok(event) => {
                    channel.set_buttons(event.buttons);
                    entry.active_peripheral = event.peripheral;
                },
                Err(err @ (NetplayError::Timeout { .. } | NetplayError::ConnectionLost)) => {
                    if matches!(err, NetplayError::Timeout { .. }) {
                        error!("Lost connection to the relay: {}", err);
                        self.push_event(NetplayEvent::ConnectionLost { slot, sequence });
                    }
                    channel.set_buttons(0);
                    if !requests.contains(&NetplayRequest::HaltEmulation) {
                        requests.push(NetplayRequest::HaltEmulation);
                    }
                },
                Err(err) => {
                    error!("Input exchange failed for slot {}: {}", slot, err);
                    self.push_event(NetplayEvent::ConnectionLost { slot, sequence });
                    return Err(err);
                },
            }
        }

        self.flush_status_changes();
        Ok(requests)
    }

    fn send_local_input(&mut self, channels: &[PollChannel; MAX_PLAYERS]) -> Result<(), NetplayError> {
        if self.sync.is_broken() {
            return Ok(());
        }
        for slot in Slot::ALL {
            if self.controllers[slot.index()].is_none() {
                continue;
            }
            let channel = &channels[slot.index()];
            if channel.command == Some(JoybusCommand::ControllerRead) {
                self.sync.send_local_input(
                    slot,
                    channel.buttons(),
                    self.slots[slot.index()].peripheral,
                )?;
            }
        }
        Ok(())
    }

    fn flush_status_changes(&mut self) {
        let frame = self.probe.frame_counter();
        for change in self.sync.take_status_changes() {
            let event = match change {
                StatusChange::Desync => {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::Synchronization,
                        "relay reported a desynchronization at frame {}",
                        frame
                    );
                    NetplayEvent::DesyncDetected { frame }
                },
                StatusChange::PlayerDisconnected(slot) => {
                    warn!("Player in slot {} has disconnected", slot);
                    NetplayEvent::PlayerDisconnected { slot }
                },
            };
            self.push_event(event);
        }
    }

    fn push_event(&mut self, event: NetplayEvent) {
        if self.event_queue.len() >= self.event_queue_size {
            if let Some(dropped) = self.event_queue.pop_front() {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::SessionControl,
                    "event queue full, dropping {:?}",
                    dropped
                );
            }
        }
        self.event_queue.push_back(event);
    }

    /// Advances the emulated frame counter and sends a checksum when one is due.
    ///
    /// Call once per emulated frame with the registers that must match across peers.
    /// Checksums are fire-and-forget: after the connection is lost they are skipped.
    pub fn check_sync(&mut self, registers: &[u32]) -> Result<(), NetplayError> {
        self.control.enter_active("check_sync")?;
        let Some(frame) = self.probe.tick() else {
            return Ok(());
        };
        if self.sync.is_broken() {
            trace!("Skipping checksum for frame {}, connection lost", frame);
            return Ok(());
        }
        trace!("Sending checksum for frame {}", frame);
        self.sync.send_checksum(frame, registers)
    }

    /// Returns all events that happened since last queried for events.
    /// If the number of stored events exceeds the configured queue size, the oldest
    /// events were discarded.
    pub fn events(&mut self) -> EventDrain<'_> {
        EventDrain::from_drain(self.event_queue.drain(..))
    }

    /// The slot table with current lag indicators.
    #[must_use]
    pub fn slots(&self) -> [PlayerSlot; MAX_PLAYERS] {
        let mut slots = self.slots;
        for slot in Slot::ALL {
            slots[slot.index()].lag = self.sync.lag(slot);
        }
        slots
    }

    /// How this client relates to `slot`.
    #[must_use]
    pub fn slot_assignment(&self, slot: Slot) -> SlotAssignment {
        match self.controllers[slot.index()] {
            Some(controller) => SlotAssignment::Local { controller },
            None if self.slots[slot.index()].present => SlotAssignment::Remote,
            None => SlotAssignment::Unassigned,
        }
    }

    /// The local controller bound to `slot`, if any.
    #[must_use]
    pub fn controller_for(&self, slot: Slot) -> Option<usize> {
        self.controllers[slot.index()]
    }

    /// The controller index the next [`claim_slot`](Self::claim_slot) will bind.
    #[must_use]
    pub fn next_controller(&self) -> usize {
        self.next_controller
    }

    /// `true` while no slot is bound locally.
    #[must_use]
    pub fn is_spectator(&self) -> bool {
        self.controllers.iter().all(Option::is_none)
    }

    /// `true` if this client owns slot 0 and therefore pushes settings and saves.
    #[must_use]
    pub fn is_authority(&self) -> bool {
        self.controllers[Slot::P1.index()].is_some()
    }

    /// `true` while the session has asked the host to run unthrottled.
    #[must_use]
    pub fn is_fast_forwarding(&self) -> bool {
        self.sync.is_fast_forwarding()
    }

    /// `true` once the relay failed to answer in time or the datagram channel hit a
    /// fatal error. The session cannot recover.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        self.sync.is_broken()
    }

    /// The control channel's handshake state.
    #[must_use]
    pub fn state(&self) -> ControlState {
        self.control.state()
    }

    /// The registration id passed to [`register_player`](Self::register_player), or 0.
    #[must_use]
    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    /// The relay's lag-buffer target, 0 until a registration was answered.
    #[must_use]
    pub fn lag_buffer_target(&self) -> u8 {
        self.sync.lag_buffer_target()
    }

    /// Emulated frames counted by [`check_sync`](Self::check_sync).
    #[must_use]
    pub fn frame_counter(&self) -> u32 {
        self.probe.frame_counter()
    }

    /// The sequence `slot` will consume next.
    #[must_use]
    pub fn next_sequence(&self, slot: Slot) -> Sequence {
        self.sync.ledger().next_sequence(slot)
    }

    /// Events buffered for `slot` and not consumed yet.
    #[must_use]
    pub fn pending_events(&self, slot: Slot) -> u8 {
        self.sync.ledger().pending_count(slot)
    }

    /// Datagram traffic counters.
    #[must_use]
    pub fn network_stats(&self) -> NetworkStats {
        self.sync.stats()
    }

    /// Ends the session.
    ///
    /// Sends a disconnect notice and closes both channels. A notice that cannot be
    /// delivered is reported to the violation observer and otherwise ignored.
    pub fn stop(mut self) {
        if let Err(err) = self.control.send_disconnect(self.registration_id) {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::SessionControl,
                "disconnect notice not delivered: {}",
                err
            );
        }
        self.sync.close();
        self.control.close();
        info!(
            "Netplay session closed after {} frames",
            self.probe.frame_counter()
        );
    }
}
