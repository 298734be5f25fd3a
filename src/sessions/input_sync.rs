//! Request/response input fetching over the datagram channel.
//!
//! For every slot the host polls, the engine drains whatever the relay has
//! already pushed, asks for the slot's next sequence, then waits for it. The
//! wait is a cooperative loop on the caller's thread: drain, retransmit once the
//! retry interval has elapsed, give up at the deadline.

use std::sync::Arc;

use tracing::{debug, trace, warn};
use web_time::Instant;

use crate::ledger::{EventLedger, InputEvent, InsertOutcome};
use crate::network::codec::CodecError;
use crate::network::messages::{DatagramMessage, InputUpdate};
use crate::network::network_stats::NetworkStats;
use crate::network::transport::{DatagramSocket, RouteId};
use crate::report_violation_to;
use crate::sessions::config::SyncConfig;
use crate::sessions::desync_probe::{StatusChange, StatusTracker};
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{NetplayError, NetplayRequest, PeripheralKind, Sequence, Slot, MAX_PLAYERS};

/// Where request and deliver datagrams go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// The relay's datagram address.
    Bound(RouteId),
    /// A fetch timed out or the channel hit a fatal error. Nothing is sent or
    /// fetched any more.
    Broken,
}

/// Datagram half of a session.
pub(crate) struct InputSync<D: DatagramSocket> {
    socket: D,
    route: Route,
    ledger: EventLedger,
    lag: [u8; MAX_PLAYERS],
    status: StatusTracker,
    pending_changes: Vec<StatusChange>,
    registration_id: u32,
    spectator: bool,
    lag_buffer_target: u8,
    // None until the first policy decision so the host always hears the initial state
    fast_forward: Option<bool>,
    config: SyncConfig,
    stats: NetworkStats,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<D: DatagramSocket> InputSync<D> {
    pub(crate) fn new(
        socket: D,
        route: RouteId,
        config: SyncConfig,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        Self {
            socket,
            route: Route::Bound(route),
            ledger: EventLedger::new(),
            lag: [0; MAX_PLAYERS],
            status: StatusTracker::new(),
            pending_changes: Vec::new(),
            registration_id: 0,
            spectator: true,
            lag_buffer_target: 0,
            fast_forward: None,
            config,
            stats: NetworkStats::new(),
            violation_observer,
        }
    }

    pub(crate) fn set_registration_id(&mut self, registration_id: u32) {
        self.registration_id = registration_id;
    }

    pub(crate) fn set_spectator(&mut self, spectator: bool) {
        self.spectator = spectator;
    }

    pub(crate) fn set_lag_buffer_target(&mut self, target: u8) {
        self.lag_buffer_target = target;
    }

    pub(crate) fn lag_buffer_target(&self) -> u8 {
        self.lag_buffer_target
    }

    pub(crate) fn ledger(&self) -> &EventLedger {
        &self.ledger
    }

    pub(crate) fn stats(&self) -> NetworkStats {
        self.stats
    }

    pub(crate) fn lag(&self, slot: Slot) -> u8 {
        self.lag[slot.index()]
    }

    pub(crate) fn is_fast_forwarding(&self) -> bool {
        self.fast_forward == Some(true)
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.route == Route::Broken
    }

    /// Status flips seen since the last call, oldest first.
    pub(crate) fn take_status_changes(&mut self) -> Vec<StatusChange> {
        std::mem::take(&mut self.pending_changes)
    }

    /// Pulls every waiting datagram into the ledger.
    ///
    /// # Errors
    ///
    /// A truncated or malformed relay update, or a transport receive failure.
    /// Either one breaks the route.
    pub(crate) fn drain(&mut self) -> Result<(), NetplayError> {
        let result = self.drain_pending();
        if let Err(err) = &result {
            self.break_route(err);
        }
        result
    }

    fn drain_pending(&mut self) -> Result<(), NetplayError> {
        while let Some(bytes) = self.socket.recv()? {
            self.stats.datagrams_received += 1;
            self.stats.bytes_received += bytes.len() as u64;
            self.handle_datagram(&bytes)?;
        }
        Ok(())
    }

    fn break_route(&mut self, err: &NetplayError) {
        if self.route == Route::Broken {
            return;
        }
        self.route = Route::Broken;
        warn!("Datagram channel failed, input exchange stopped: {}", err);
    }

    fn handle_datagram(&mut self, bytes: &[u8]) -> Result<(), NetplayError> {
        let message = match DatagramMessage::decode(bytes) {
            Ok(message) => message,
            Err(CodecError::UnknownTag { tag, .. }) => {
                self.skip_unknown(tag);
                return Ok(());
            },
            Err(err) => return Err(err.into()),
        };
        match message {
            DatagramMessage::InputUpdate(update) => {
                self.apply_update(update);
                Ok(())
            },
            // client-bound traffic only carries updates
            other => {
                self.skip_unknown(bytes.first().copied().unwrap_or_default());
                trace!("Ignoring {} datagram from relay", other.kind());
                Ok(())
            },
        }
    }

    fn skip_unknown(&mut self, tag: u8) {
        self.stats.unknown_datagrams += 1;
        report_violation_to!(
            self.violation_observer,
            ViolationSeverity::Warning,
            ViolationKind::NetworkProtocol,
            "received unknown message with tag {}",
            tag
        );
    }

    fn apply_update(&mut self, update: InputUpdate) {
        let slot = update.slot;
        if !update.gratuitous {
            self.lag[slot.index()] = update.lag;
        }
        self.pending_changes.extend(self.status.observe(update.status));
        for event in update.events {
            match self
                .ledger
                .insert(slot, event.sequence, event.buttons, event.peripheral)
            {
                InsertOutcome::Inserted => {},
                InsertOutcome::Duplicate => self.stats.duplicate_events += 1,
                InsertOutcome::Stale => self.stats.stale_events += 1,
            }
        }
        crate::debug_check_invariants!(self.ledger, "after applying input update");
    }

    fn send(&mut self, message: &DatagramMessage) -> Result<(), NetplayError> {
        let Route::Bound(route) = self.route else {
            return Err(NetplayError::ConnectionLost);
        };
        let bytes = message.encode()?;
        if let Err(err) = self.socket.send(route, &bytes) {
            self.break_route(&err);
            return Err(err);
        }
        self.stats.datagrams_sent += 1;
        self.stats.bytes_sent += bytes.len() as u64;
        Ok(())
    }

    /// Asks the relay for the slot's next event.
    pub(crate) fn request_input(&mut self, slot: Slot) -> Result<(), NetplayError> {
        let message = DatagramMessage::RequestInput {
            slot,
            registration_id: self.registration_id,
            sequence: self.ledger.next_sequence(slot),
            spectator: self.spectator,
            pending: self.ledger.pending_count(slot),
        };
        self.send(&message)?;
        self.stats.requests_sent += 1;
        Ok(())
    }

    /// Pushes the local controller's buttons for a slot this client owns.
    pub(crate) fn send_local_input(
        &mut self,
        slot: Slot,
        buttons: u32,
        peripheral: PeripheralKind,
    ) -> Result<(), NetplayError> {
        let message = DatagramMessage::DeliverInput {
            slot,
            sequence: self.ledger.next_sequence(slot),
            buttons,
            peripheral,
        };
        self.send(&message)
    }

    /// Sends an emulator register checksum.
    pub(crate) fn send_checksum(&mut self, frame: u32, registers: &[u32]) -> Result<(), NetplayError> {
        self.send(&DatagramMessage::Checksum {
            frame,
            registers: registers.to_vec(),
        })
    }

    /// Fetches and consumes the slot's next event.
    ///
    /// Speed requests are appended to `requests` when the fast-forward decision flips.
    ///
    /// # Errors
    ///
    /// [`NetplayError::Timeout`] the first time the relay fails to answer in time,
    /// [`NetplayError::ConnectionLost`] on every call after that. A fatal transport
    /// or decode error is returned once and also breaks the route.
    pub(crate) fn fetch_input(
        &mut self,
        slot: Slot,
        requests: &mut Vec<NetplayRequest>,
    ) -> Result<InputEvent, NetplayError> {
        if self.is_broken() {
            return Err(NetplayError::ConnectionLost);
        }
        self.drain()?;
        self.request_input(slot)?;
        self.apply_speed_policy(slot, requests);

        let sequence = self.ledger.next_sequence(slot);
        self.wait_for(slot, sequence)?;
        self.ledger.take_oldest_matching(slot)
    }

    fn apply_speed_policy(&mut self, slot: Slot, requests: &mut Vec<NetplayRequest>) {
        let behind = self.lag[slot.index()] > 0
            && self.ledger.pending_count(slot) > self.lag_buffer_target;
        if self.fast_forward == Some(behind) {
            return;
        }
        debug!(
            "Slot {} lag {} with {} buffered events, fast-forward {}",
            slot,
            self.lag[slot.index()],
            self.ledger.pending_count(slot),
            if behind { "on" } else { "off" }
        );
        self.fast_forward = Some(behind);
        requests.push(NetplayRequest::SetSpeedLimiter { enabled: !behind });
        requests.push(NetplayRequest::SetFastForward {
            enabled: behind,
            inhibit_toggle: true,
        });
    }

    fn wait_for(&mut self, slot: Slot, sequence: Sequence) -> Result<(), NetplayError> {
        let started = Instant::now();
        let mut last_request = started;
        let mut retries: u32 = 0;
        let mut stalled = false;
        while !self.ledger.contains(slot, sequence) {
            let now = Instant::now();
            let waited = now.duration_since(started);
            if !stalled && waited >= self.config.request_timeout / 2 {
                stalled = true;
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Synchronization,
                    "slot {} still waiting for sequence {} after {}ms and {} retries",
                    slot,
                    sequence,
                    waited.as_millis(),
                    retries
                );
            }
            if waited >= self.config.request_timeout {
                self.route = Route::Broken;
                self.stats.timeouts += 1;
                warn!(
                    "No input for slot {} at sequence {} after {}ms, giving up",
                    slot,
                    sequence,
                    waited.as_millis()
                );
                return Err(NetplayError::Timeout {
                    slot,
                    sequence,
                    waited_ms: waited.as_millis(),
                });
            }
            if now.duration_since(last_request) >= self.config.request_retry_interval {
                self.request_input(slot)?;
                self.stats.retransmissions += 1;
                retries += 1;
                last_request = now;
            }
            std::thread::sleep(self.config.poll_slice);
            self.drain()?;
        }
        Ok(())
    }

    /// Closes the socket.
    pub(crate) fn close(&mut self) {
        self.socket.close();
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
    use crate::network::transport::Endpoint;
    use crate::telemetry::CollectingObserver;
    use std::collections::VecDeque;
    use web_time::Duration;

    // Answers every request-input with whatever `reply` builds for it.
    #[derive(Default)]
    struct ScriptedSocket {
        inbox: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
        reply: Option<fn(&DatagramMessage) -> Option<Vec<u8>>>,
        refuse_sends: bool,
    }

    impl DatagramSocket for ScriptedSocket {
        fn bind_route(&mut self, _endpoint: &Endpoint) -> Result<RouteId, NetplayError> {
            Ok(RouteId(0))
        }

        fn send(&mut self, _route: RouteId, bytes: &[u8]) -> Result<usize, NetplayError> {
            if self.refuse_sends {
                return Err(NetplayError::TransportFailure {
                    context: "network unreachable".to_owned(),
                });
            }
            self.sent.push(bytes.to_vec());
            if let Some(reply) = self.reply {
                let message = DatagramMessage::decode(bytes).unwrap();
                if let Some(answer) = reply(&message) {
                    self.inbox.push_back(answer);
                }
            }
            Ok(bytes.len())
        }

        fn recv(&mut self) -> Result<Option<Vec<u8>>, NetplayError> {
            Ok(self.inbox.pop_front())
        }

        fn close(&mut self) {}
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            request_retry_interval: Duration::from_millis(2),
            request_timeout: Duration::from_millis(40),
            poll_slice: Duration::from_millis(1),
        }
    }

    fn update(slot: u8, status: u8, lag: u8, events: &[(u32, u32)]) -> Vec<u8> {
        let mut bytes = vec![1, slot, status, lag, events.len() as u8];
        for &(sequence, buttons) in events {
            bytes.extend_from_slice(&sequence.to_be_bytes());
            bytes.extend_from_slice(&buttons.to_be_bytes());
            bytes.push(1);
        }
        bytes
    }

    fn echo_request(message: &DatagramMessage) -> Option<Vec<u8>> {
        match message {
            DatagramMessage::RequestInput { slot, sequence, .. } => Some(update(
                slot.as_u8(),
                0,
                0,
                &[(sequence.as_u32(), 0x100 + sequence.as_u32())],
            )),
            _ => None,
        }
    }

    fn sync_with(socket: ScriptedSocket) -> InputSync<ScriptedSocket> {
        InputSync::new(socket, RouteId(0), fast_config(), None)
    }

    #[test]
    fn test_fetch_consumes_answered_event() {
        let mut sync = sync_with(ScriptedSocket {
            reply: Some(echo_request),
            ..ScriptedSocket::default()
        });
        let mut requests = Vec::new();
        let event = sync.fetch_input(Slot::P1, &mut requests).unwrap();
        assert_eq!(event.buttons, 0x100);
        assert_eq!(sync.ledger().next_sequence(Slot::P1), Sequence::new(1));
        let event = sync.fetch_input(Slot::P1, &mut requests).unwrap();
        assert_eq!(event.buttons, 0x101);
    }

    #[test]
    fn test_first_fetch_reports_normal_speed_once() {
        let mut sync = sync_with(ScriptedSocket {
            reply: Some(echo_request),
            ..ScriptedSocket::default()
        });
        let mut requests = Vec::new();
        sync.fetch_input(Slot::P1, &mut requests).unwrap();
        assert_eq!(
            requests,
            vec![
                NetplayRequest::SetSpeedLimiter { enabled: true },
                NetplayRequest::SetFastForward {
                    enabled: false,
                    inhibit_toggle: true
                },
            ]
        );
        requests.clear();
        sync.fetch_input(Slot::P1, &mut requests).unwrap();
        assert!(requests.is_empty());
    }

    #[test]
    fn test_lagging_slot_with_deep_buffer_fast_forwards() {
        let mut socket = ScriptedSocket::default();
        socket
            .inbox
            .push_back(update(0, 0, 2, &[(0, 1), (1, 2), (2, 3), (3, 4)]));
        let mut sync = sync_with(socket);
        sync.set_lag_buffer_target(2);
        let mut requests = Vec::new();
        sync.fetch_input(Slot::P1, &mut requests).unwrap();
        assert!(sync.is_fast_forwarding());
        assert_eq!(
            requests,
            vec![
                NetplayRequest::SetSpeedLimiter { enabled: false },
                NetplayRequest::SetFastForward {
                    enabled: true,
                    inhibit_toggle: true
                },
            ]
        );
    }

    #[test]
    fn test_gratuitous_update_keeps_lag() {
        let mut socket = ScriptedSocket::default();
        socket.inbox.push_back(update(2, 0, 3, &[]));
        let mut gratuitous = update(2, 0, 9, &[(0, 7)]);
        gratuitous[0] = 3;
        socket.inbox.push_back(gratuitous);
        let mut sync = sync_with(socket);
        sync.drain().unwrap();
        assert_eq!(sync.lag(Slot::P3), 3);
        assert!(sync.ledger().contains(Slot::P3, Sequence::ZERO));
    }

    #[test]
    fn test_duplicates_and_stale_events_are_counted() {
        let mut socket = ScriptedSocket::default();
        socket.inbox.push_back(update(0, 0, 0, &[(0, 1)]));
        let mut sync = sync_with(socket);
        let mut requests = Vec::new();
        sync.fetch_input(Slot::P1, &mut requests).unwrap();

        sync.socket.inbox.push_back(update(0, 0, 0, &[(0, 1), (1, 2), (1, 3)]));
        sync.drain().unwrap();
        let stats = sync.stats();
        assert_eq!(stats.stale_events, 1);
        assert_eq!(stats.duplicate_events, 1);
        assert_eq!(sync.ledger().pending_count(Slot::P1), 1);
    }

    #[test]
    fn test_timeout_breaks_route() {
        let mut sync = sync_with(ScriptedSocket::default());
        let mut requests = Vec::new();
        let err = sync.fetch_input(Slot::P2, &mut requests).unwrap_err();
        assert!(matches!(
            err,
            NetplayError::Timeout {
                slot: Slot::P2,
                sequence: Sequence::ZERO,
                ..
            }
        ));
        assert!(sync.is_broken());
        assert!(sync.stats().retransmissions > 0);
        assert_eq!(sync.stats().timeouts, 1);

        assert_eq!(
            sync.fetch_input(Slot::P2, &mut requests).unwrap_err(),
            NetplayError::ConnectionLost
        );
        assert_eq!(
            sync.send_checksum(0, &[1]).unwrap_err(),
            NetplayError::ConnectionLost
        );
    }

    #[test]
    fn test_long_wait_is_reported_once_before_timing_out() {
        let observer = Arc::new(CollectingObserver::new());
        let mut sync = InputSync::new(
            ScriptedSocket::default(),
            RouteId(0),
            fast_config(),
            Some(observer.clone() as Arc<dyn ViolationObserver>),
        );
        let mut requests = Vec::new();
        assert!(sync.fetch_input(Slot::P1, &mut requests).is_err());
        assert_eq!(
            observer
                .violations_of_kind(ViolationKind::Synchronization)
                .len(),
            1
        );
    }

    #[test]
    fn test_prompt_answer_raises_no_synchronization_warning() {
        let observer = Arc::new(CollectingObserver::new());
        let mut sync = InputSync::new(
            ScriptedSocket {
                reply: Some(echo_request),
                ..ScriptedSocket::default()
            },
            RouteId(0),
            fast_config(),
            Some(observer.clone() as Arc<dyn ViolationObserver>),
        );
        let mut requests = Vec::new();
        sync.fetch_input(Slot::P1, &mut requests).unwrap();
        assert!(!observer.has_violation(ViolationKind::Synchronization));
    }

    #[test]
    fn test_unknown_tag_is_skipped_with_violation() {
        let observer = Arc::new(CollectingObserver::new());
        let mut socket = ScriptedSocket::default();
        socket.inbox.push_back(vec![0x42, 1, 2, 3]);
        socket.inbox.push_back(update(0, 0, 0, &[(0, 5)]));
        let mut sync = InputSync::new(
            socket,
            RouteId(0),
            fast_config(),
            Some(observer.clone() as Arc<dyn ViolationObserver>),
        );
        sync.drain().unwrap();
        assert!(sync.ledger().contains(Slot::P1, Sequence::ZERO));
        assert_eq!(sync.stats().unknown_datagrams, 1);
        assert!(observer.has_violation(ViolationKind::NetworkProtocol));
    }

    #[test]
    fn test_truncated_update_is_fatal() {
        let mut socket = ScriptedSocket::default();
        socket.inbox.push_back(vec![1, 0, 0, 0, 3, 0, 0]);
        socket.inbox.push_back(update(0, 0, 0, &[(0, 5)]));
        let mut sync = sync_with(socket);
        assert!(matches!(
            sync.drain(),
            Err(NetplayError::TruncatedPacket { .. })
        ));
        assert!(sync.is_broken());

        let mut requests = Vec::new();
        assert_eq!(
            sync.fetch_input(Slot::P1, &mut requests).unwrap_err(),
            NetplayError::ConnectionLost
        );
        assert!(!sync.ledger().contains(Slot::P1, Sequence::ZERO));
        assert!(sync.socket.sent.is_empty());
    }

    #[test]
    fn test_send_failure_breaks_route() {
        let mut sync = sync_with(ScriptedSocket {
            refuse_sends: true,
            ..ScriptedSocket::default()
        });
        assert!(matches!(
            sync.send_local_input(Slot::P1, 0x20, PeripheralKind::None),
            Err(NetplayError::TransportFailure { .. })
        ));
        assert!(sync.is_broken());
        assert_eq!(
            sync.send_checksum(0, &[1]).unwrap_err(),
            NetplayError::ConnectionLost
        );
    }

    #[test]
    fn test_status_changes_are_collected() {
        let mut socket = ScriptedSocket::default();
        socket.inbox.push_back(update(0, 0b11, 0, &[]));
        let mut sync = sync_with(socket);
        sync.drain().unwrap();
        assert_eq!(
            sync.take_status_changes(),
            vec![
                StatusChange::Desync,
                StatusChange::PlayerDisconnected(Slot::P1)
            ]
        );
        assert!(sync.take_status_changes().is_empty());
    }

    #[test]
    fn test_request_carries_spectator_and_pending() {
        let mut socket = ScriptedSocket::default();
        socket.inbox.push_back(update(1, 0, 0, &[(1, 0), (2, 0)]));
        let mut sync = sync_with(socket);
        sync.set_registration_id(77);
        sync.set_spectator(false);
        sync.drain().unwrap();
        sync.request_input(Slot::P2).unwrap();
        assert_eq!(
            DatagramMessage::decode(&sync.socket.sent[0]).unwrap(),
            DatagramMessage::RequestInput {
                slot: Slot::P2,
                registration_id: 77,
                sequence: Sequence::ZERO,
                spectator: false,
                pending: 2,
            }
        );
    }
}
