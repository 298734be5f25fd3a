//! An in-process relay for driving sessions without sockets.
//!
//! [`StubRelay`] plays the server half of both channels. Control-channel
//! answers are scripted up front with the `reply_*` helpers; datagram traffic
//! is answered live: delivered input is buffered per slot and every input
//! request is answered with whatever the slot's buffer holds from the
//! requested sequence on.

#![allow(clippy::expect_used, clippy::indexing_slicing)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use fortress_netplay::__internal::{
    ControlMessage, DatagramMessage, InputUpdate, RegisterReply, RegistrationTable,
};
use fortress_netplay::{
    DatagramSocket, EmulationSettings, Endpoint, InputEvent, NetplayError, PeripheralKind,
    RegistrationEntry, ReliableStream, RouteId, Sequence, Slot, Transport, MAX_PLAYERS,
};
use parking_lot::Mutex;
use smallvec::SmallVec;

/// Most events the stub puts in one update.
const MAX_EVENTS_PER_UPDATE: usize = 8;

#[derive(Debug, Default)]
struct RelayState {
    control_written: Vec<u8>,
    control_replies: VecDeque<u8>,
    control_closed: bool,
    datagram_closed: bool,
    routes: Vec<Endpoint>,
    sent: Vec<DatagramMessage>,
    inbox: VecDeque<Vec<u8>>,
    buffers: [BTreeMap<u32, (u32, PeripheralKind)>; MAX_PLAYERS],
    silent: bool,
    lag: [u8; MAX_PLAYERS],
    status: u8,
}

/// Shared handle to the stub relay. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct StubRelay {
    state: Arc<Mutex<RelayState>>,
}

#[allow(dead_code)]
impl StubRelay {
    /// A relay that answers every input request.
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose channels lead to this relay.
    pub fn transport(&self) -> StubTransport {
        StubTransport {
            relay: self.clone(),
        }
    }

    // ---- control channel scripting ----

    /// Queues raw bytes on the control channel.
    pub fn reply_bytes(&self, bytes: &[u8]) {
        self.state.lock().control_replies.extend(bytes.iter().copied());
    }

    /// Queues a register-player answer.
    pub fn reply_register(&self, status: u8, lag_buffer_target: u8) {
        let reply = RegisterReply {
            status,
            lag_buffer_target,
        };
        self.reply_bytes(&reply.encode().expect("encode register reply"));
    }

    /// Queues a registration table given as `(registration id, peripheral, raw)` rows.
    pub fn reply_table(&self, rows: [(u32, u8, u8); 4]) {
        let table = RegistrationTable(rows.map(|(registration_id, peripheral, raw_data)| {
            RegistrationEntry {
                registration_id,
                peripheral,
                raw_data,
            }
        }));
        self.reply_bytes(&table.encode().expect("encode table"));
    }

    /// Queues an emulation settings block.
    pub fn reply_settings(&self, settings: EmulationSettings) {
        self.reply_bytes(&settings.encode().expect("encode settings"));
    }

    /// Everything the client wrote on the control channel, as raw bytes.
    pub fn control_bytes(&self) -> Vec<u8> {
        self.state.lock().control_written.clone()
    }

    /// Control messages the client wrote, up to the first bytes that do not parse.
    pub fn control_messages(&self) -> Vec<ControlMessage> {
        let bytes = self.control_bytes();
        let mut messages = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            match ControlMessage::decode(&bytes[offset..]) {
                Ok((message, used)) => {
                    messages.push(message);
                    offset += used;
                },
                Err(_) => break,
            }
        }
        messages
    }

    /// `true` once the client closed the control channel.
    pub fn control_closed(&self) -> bool {
        self.state.lock().control_closed
    }

    // ---- datagram channel ----

    /// Stops answering input requests.
    pub fn go_silent(&self) {
        self.state.lock().silent = true;
    }

    /// Puts an event in a slot's relay buffer.
    pub fn script_input(&self, slot: Slot, sequence: u32, buttons: u32) {
        self.state.lock().buffers[slot.index()].insert(sequence, (buttons, PeripheralKind::None));
    }

    /// Sets the lag the relay reports for a slot in solicited updates.
    pub fn set_lag(&self, slot: Slot, lag: u8) {
        self.state.lock().lag[slot.index()] = lag;
    }

    /// Sets the status mask carried by every later update.
    pub fn set_status(&self, status: u8) {
        self.state.lock().status = status;
    }

    /// Queues an arbitrary datagram for the client.
    pub fn push_datagram(&self, bytes: Vec<u8>) {
        self.state.lock().inbox.push_back(bytes);
    }

    /// Queues an unsolicited update for a slot. It carries the slot's lag like any other.
    pub fn push_gratuitous(&self, slot: Slot, events: &[(u32, u32)]) {
        let mut state = self.state.lock();
        let (status, lag) = (state.status, state.lag[slot.index()]);
        let update = build_update(slot, status, lag, true, events.iter().copied());
        state.inbox.push_back(update);
    }

    /// Every datagram the client sent, decoded.
    pub fn sent(&self) -> Vec<DatagramMessage> {
        self.state.lock().sent.clone()
    }

    /// Sequences the client requested for `slot`, in order, retransmissions included.
    pub fn requested_sequences(&self, slot: Slot) -> Vec<u32> {
        self.sent()
            .into_iter()
            .filter_map(|message| match message {
                DatagramMessage::RequestInput {
                    slot: requested,
                    sequence,
                    ..
                } if requested == slot => Some(sequence.as_u32()),
                _ => None,
            })
            .collect()
    }

    /// Checksum frames the client sent, in order.
    pub fn checksum_frames(&self) -> Vec<u32> {
        self.sent()
            .into_iter()
            .filter_map(|message| match message {
                DatagramMessage::Checksum { frame, .. } => Some(frame),
                _ => None,
            })
            .collect()
    }

    /// `true` once the client closed the datagram socket.
    pub fn datagram_closed(&self) -> bool {
        self.state.lock().datagram_closed
    }

    fn on_datagram(&self, bytes: &[u8]) {
        let message = DatagramMessage::decode(bytes).expect("client sent a malformed datagram");
        let mut state = self.state.lock();
        match &message {
            DatagramMessage::DeliverInput {
                slot,
                sequence,
                buttons,
                peripheral,
            } => {
                state.buffers[slot.index()].insert(sequence.as_u32(), (*buttons, *peripheral));
            },
            DatagramMessage::RequestInput { slot, sequence, .. } if !state.silent => {
                let events: Vec<(u32, u32)> = state.buffers[slot.index()]
                    .range(sequence.as_u32()..)
                    .take(MAX_EVENTS_PER_UPDATE)
                    .map(|(&seq, &(buttons, _))| (seq, buttons))
                    .collect();
                let update = build_update(
                    *slot,
                    state.status,
                    state.lag[slot.index()],
                    false,
                    events.into_iter(),
                );
                state.inbox.push_back(update);
            },
            _ => {},
        }
        state.sent.push(message);
    }
}

fn build_update(
    slot: Slot,
    status: u8,
    lag: u8,
    gratuitous: bool,
    events: impl Iterator<Item = (u32, u32)>,
) -> Vec<u8> {
    let events: SmallVec<[InputEvent; 8]> = events
        .map(|(sequence, buttons)| InputEvent {
            sequence: Sequence::new(sequence),
            buttons,
            peripheral: PeripheralKind::None,
        })
        .collect();
    DatagramMessage::InputUpdate(InputUpdate {
        slot,
        status,
        lag,
        gratuitous,
        events,
    })
    .encode()
    .expect("encode update")
}

/// [`Transport`] leading to a [`StubRelay`].
#[derive(Debug)]
pub struct StubTransport {
    relay: StubRelay,
}

impl Transport for StubTransport {
    type Stream = StubStream;
    type Datagram = StubDatagram;

    fn open_reliable(&mut self, _endpoint: &Endpoint) -> Result<StubStream, NetplayError> {
        Ok(StubStream {
            relay: self.relay.clone(),
        })
    }

    fn open_datagram(&mut self, _port: u16) -> Result<StubDatagram, NetplayError> {
        Ok(StubDatagram {
            relay: self.relay.clone(),
        })
    }
}

/// Client end of the stub control channel.
#[derive(Debug)]
pub struct StubStream {
    relay: StubRelay,
}

impl ReliableStream for StubStream {
    fn send(&mut self, bytes: &[u8]) -> Result<usize, NetplayError> {
        let mut state = self.relay.state.lock();
        if state.control_closed {
            return Err(NetplayError::TransportFailure {
                context: "stub control channel closed".to_owned(),
            });
        }
        state.control_written.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    /// Hands out scripted bytes; an empty script reads as the relay hanging up.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, NetplayError> {
        let mut state = self.relay.state.lock();
        let count = buf.len().min(state.control_replies.len());
        for (slot, byte) in buf.iter_mut().zip(state.control_replies.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn close(&mut self) {
        self.relay.state.lock().control_closed = true;
    }
}

/// Client end of the stub datagram channel.
#[derive(Debug)]
pub struct StubDatagram {
    relay: StubRelay,
}

impl DatagramSocket for StubDatagram {
    fn bind_route(&mut self, endpoint: &Endpoint) -> Result<RouteId, NetplayError> {
        let mut state = self.relay.state.lock();
        state.routes.push(endpoint.clone());
        Ok(RouteId(state.routes.len() as u32 - 1))
    }

    fn send(&mut self, _route: RouteId, bytes: &[u8]) -> Result<usize, NetplayError> {
        if self.relay.state.lock().datagram_closed {
            return Err(NetplayError::TransportFailure {
                context: "stub datagram socket closed".to_owned(),
            });
        }
        self.relay.on_datagram(bytes);
        Ok(bytes.len())
    }

    fn recv(&mut self) -> Result<Option<Vec<u8>>, NetplayError> {
        Ok(self.relay.state.lock().inbox.pop_front())
    }

    fn close(&mut self) {
        self.relay.state.lock().datagram_closed = true;
    }
}
