//! # Fortress Netplay
//!
//! Fortress Netplay is a client-side lockstep netplay engine for frame-driven console emulators,
//! written in 100% safe Rust. Several emulator instances stay byte-identical by consuming the
//! exact same controller input on the exact same poll: a relay server collects every player's
//! input and hands it back out, and this crate is the client half of that conversation.
//!
//! Like the rest of the Fortress family, the engine never calls back into the host. Each poll
//! returns a list of [`NetplayRequest`]s (speed limiter, fast-forward override, halt) for the host
//! to fulfill, and notable occurrences are queued as [`NetplayEvent`]s.
//!
//! # Session lifecycle
//!
//! ```no_run
//! use fortress_netplay::{
//!     EmulationSettings, NativeTransport, PeripheralKind, PollChannel, SessionBuilder, Slot,
//! };
//!
//! # fn main() -> Result<(), fortress_netplay::NetplayError> {
//! let mut session = SessionBuilder::new().start(NativeTransport::new(), "relay.example", 45000)?;
//!
//! session.register_player(Slot::P1, PeripheralKind::MemPak, false, 0xBEEF)?;
//! session.claim_slot(Slot::P1)?;
//! session.read_registration()?;
//!
//! let mut settings = EmulationSettings::default();
//! session.sync_settings(&mut settings)?;
//!
//! let mut channels = [PollChannel::default(); 4];
//! // once per input poll, after the host filled the local controller's channel:
//! let requests = session.update_input(&mut channels)?;
//! # let _ = requests;
//! // once per emulated frame:
//! session.check_sync(&[0u32; 32])?;
//!
//! session.stop();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)] // let us try
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use controller::{JoybusCommand, PollChannel};
pub use error::NetplayError;
pub use ledger::{EventLedger, InputEvent, InsertOutcome};
pub use network::bridge::{BridgeConfig, BridgeHandle, BridgeTransport};
pub use network::network_stats::NetworkStats;
pub use network::transport::{DatagramSocket, Endpoint, ReliableStream, RouteId, Transport};
#[cfg(feature = "tokio")]
pub use network::tokio_bridge::TokioBridgeDriver;
pub use network::udp_socket::NativeTransport;
pub use sessions::builder::SessionBuilder;
pub use sessions::config::{ProtocolConfig, SyncConfig};
pub use sessions::context::NetplayContext;
pub use sessions::control::{ControlState, EmulationSettings, RegistrationEntry};
pub use sessions::event_drain::EventDrain;
pub use sessions::netplay_session::{NetplaySession, PlayerSlot, SlotAssignment};

// Internal modules - made pub for re-export in __internal, but doc(hidden) for API cleanliness
#[doc(hidden)]
pub mod error;
pub mod controller;
#[doc(hidden)]
pub mod ledger;
pub mod telemetry;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    pub mod config;
    #[doc(hidden)]
    pub mod context;
    #[doc(hidden)]
    pub mod control;
    #[doc(hidden)]
    pub mod desync_probe;
    #[doc(hidden)]
    pub mod event_drain;
    #[doc(hidden)]
    pub mod input_sync;
    #[doc(hidden)]
    pub mod netplay_session;
}
#[doc(hidden)]
pub mod network {
    /// Host-driven transport for embeddings that own the real sockets.
    pub mod bridge;
    /// Binary codec for wire serialization.
    ///
    /// Encodes fixed-width field groups big-endian through bincode, so every
    /// packet layout is deterministic and matches the relay byte for byte.
    pub mod codec;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod network_stats;
    #[cfg(feature = "tokio")]
    pub mod tokio_bridge;
    pub mod transport;
    #[doc(hidden)]
    pub mod udp_socket;
}

/// Internal module exposing implementation details for testing and benchmarking.
///
/// # ⚠️ WARNING: No Stability Guarantees
///
/// **This module is NOT part of the public API.** Everything here is:
/// - Subject to change without notice
/// - Not covered by semver compatibility guarantees
/// - Intended ONLY for property-based tests, benchmarks and relay test doubles
///
/// **DO NOT** depend on anything in this module for production code.
#[doc(hidden)]
pub mod __internal {
    pub use crate::ledger::{EventLedger, InputEvent, InsertOutcome};
    pub use crate::network::codec::{CodecError, CodecOperation};
    pub use crate::network::messages::{
        tags, ControlMessage, DatagramMessage, InputUpdate, RegisterReply, RegistrationTable,
    };
    pub use crate::sessions::desync_probe::{DesyncProbe, StatusChange, StatusTracker};
}

// #############
// # CONSTANTS #
// #############

/// Number of controller slots a session multiplexes.
pub const MAX_PLAYERS: usize = 4;

/// One of the [`MAX_PLAYERS`] controller positions.
///
/// Slots are zero-based on the wire and in this API. Construct them with
/// [`Slot::new`] (checked) or one of the `P1..P4` constants.
///
/// # Examples
///
/// ```
/// use fortress_netplay::Slot;
///
/// assert_eq!(Slot::new(2), Some(Slot::P3));
/// assert_eq!(Slot::new(4), None);
/// assert_eq!(Slot::P2.index(), 1);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(try_from = "u8")]
pub struct Slot(u8);

impl Slot {
    /// First controller slot (the settings and save-data authority when claimed locally).
    pub const P1: Slot = Slot(0);
    /// Second controller slot.
    pub const P2: Slot = Slot(1);
    /// Third controller slot.
    pub const P3: Slot = Slot(2);
    /// Fourth controller slot.
    pub const P4: Slot = Slot(3);
    /// All slots in ascending order.
    pub const ALL: [Slot; MAX_PLAYERS] = [Slot::P1, Slot::P2, Slot::P3, Slot::P4];

    /// Creates a slot from a zero-based index, or `None` if it is out of range.
    #[inline]
    #[must_use]
    pub const fn new(index: usize) -> Option<Self> {
        if index < MAX_PLAYERS {
            Some(Slot(index as u8))
        } else {
            None
        }
    }

    /// Returns the zero-based index, suitable for indexing per-slot arrays.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the wire representation.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Slot {
    type Error = NetplayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Slot::new(value as usize).ok_or(NetplayError::InvalidSlot {
            slot: value as usize,
        })
    }
}

impl TryFrom<usize> for Slot {
    type Error = NetplayError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Slot::new(value).ok_or(NetplayError::InvalidSlot { slot: value })
    }
}

impl From<Slot> for usize {
    #[inline]
    fn from(slot: Slot) -> Self {
        slot.index()
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-slot input sequence number.
///
/// Sequences start at 0 and advance by exactly one per consumed input. They are
/// 32-bit and wrap around, so ordering is modular: a sequence is "older" than a
/// counter when the forward distance from the counter to it exceeds half the
/// sequence space.
///
/// # Examples
///
/// ```
/// use fortress_netplay::Sequence;
///
/// let counter = Sequence::new(10);
/// assert!(Sequence::new(9).is_older_than(counter));
/// assert!(!Sequence::new(10).is_older_than(counter));
/// assert!(!Sequence::new(11).is_older_than(counter));
///
/// // wraparound: u32::MAX is one step behind 0
/// assert!(Sequence::new(u32::MAX).is_older_than(Sequence::new(0)));
/// assert_eq!(Sequence::new(u32::MAX).next(), Sequence::new(0));
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Sequence(u32);

impl Sequence {
    /// The first sequence of every slot.
    pub const ZERO: Sequence = Sequence(0);

    /// Creates a sequence from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Sequence(value)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the following sequence, wrapping at `u32::MAX`.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Sequence(self.0.wrapping_add(1))
    }

    /// Returns `true` if `self` lies behind `counter` in modular sequence order.
    #[inline]
    #[must_use]
    pub const fn is_older_than(self, counter: Sequence) -> bool {
        self.0.wrapping_sub(counter.0) > u32::MAX / 2
    }
}

impl From<u32> for Sequence {
    #[inline]
    fn from(value: u32) -> Self {
        Sequence(value)
    }
}

impl From<Sequence> for u32 {
    #[inline]
    fn from(sequence: Sequence) -> Self {
        sequence.0
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Accessory plugged into a controller, as the relay and the emulator core number them.
///
/// Unknown values are preserved so they round-trip through the wire unchanged.
/// Every byte maps to exactly one variant: a known value can never be carried
/// as [`PeripheralKind::Unknown`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum PeripheralKind {
    /// Nothing plugged in.
    #[default]
    None,
    /// Controller memory card.
    MemPak,
    /// Force-feedback pak.
    RumblePak,
    /// Handheld cartridge adapter. Never shared over netplay.
    TransferPak,
    /// The frontend handles joybus traffic itself.
    Raw,
    /// Heart-rate sensor pak.
    BioPak,
    /// A value this crate does not know about.
    Unknown(UnknownPeripheral),
}

/// A peripheral byte outside the known range. Only built by [`PeripheralKind::from_byte`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct UnknownPeripheral(u8);

impl UnknownPeripheral {
    /// The raw wire byte.
    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl PeripheralKind {
    /// Returns the wire representation.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::None => 1,
            Self::MemPak => 2,
            Self::RumblePak => 3,
            Self::TransferPak => 4,
            Self::Raw => 5,
            Self::BioPak => 6,
            Self::Unknown(value) => value.0,
        }
    }

    /// Parses the wire representation.
    #[must_use]
    pub const fn from_byte(value: u8) -> Self {
        match value {
            1 => Self::None,
            2 => Self::MemPak,
            3 => Self::RumblePak,
            4 => Self::TransferPak,
            5 => Self::Raw,
            6 => Self::BioPak,
            other => Self::Unknown(UnknownPeripheral(other)),
        }
    }

    /// Returns a string representation suitable for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::MemPak => "mem_pak",
            Self::RumblePak => "rumble_pak",
            Self::TransferPak => "transfer_pak",
            Self::Raw => "raw",
            Self::BioPak => "bio_pak",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<u8> for PeripheralKind {
    #[inline]
    fn from(value: u8) -> Self {
        Self::from_byte(value)
    }
}

impl From<PeripheralKind> for u8 {
    #[inline]
    fn from(kind: PeripheralKind) -> Self {
        kind.to_byte()
    }
}

impl std::fmt::Display for PeripheralKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(value) => write!(f, "unknown({})", value.value()),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Instructions the host must carry out after [`NetplaySession::update_input`].
///
/// Requests are only emitted when something changes: a session that stays out of
/// fast-forward does not repeat `SetSpeedLimiter { enabled: true }` every poll.
///
/// [`NetplaySession::update_input`]: crate::NetplaySession::update_input
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[must_use = "NetplayRequests must be handled by the host"]
pub enum NetplayRequest {
    /// Turn the frame-rate limiter on or off.
    SetSpeedLimiter {
        /// `true` to run at native speed.
        enabled: bool,
    },
    /// Override the frontend's fast-forward state.
    SetFastForward {
        /// `true` to run unthrottled.
        enabled: bool,
        /// `true` to keep the user from toggling fast-forward manually.
        inhibit_toggle: bool,
    },
    /// The relay connection is lost. Stop emulation.
    HaltEmulation,
}

/// Notifications drained through [`NetplaySession::events`].
///
/// # Forward Compatibility
///
/// This enum is marked `#[non_exhaustive]` because new event types may be added
/// in future versions. Always include a wildcard arm when matching.
///
/// [`NetplaySession::events`]: crate::NetplaySession::events
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum NetplayEvent {
    /// The relay flagged that peers' checksums diverged (or converged again).
    DesyncDetected {
        /// The local frame counter when the flag changed.
        frame: u32,
    },
    /// The relay flagged a change in a player's connection.
    PlayerDisconnected {
        /// The slot whose connection flag flipped.
        slot: Slot,
    },
    /// The relay stopped answering input requests.
    ConnectionLost {
        /// The slot that was waiting.
        slot: Slot,
        /// The sequence that never arrived.
        sequence: Sequence,
    },
}

// ###################
// # UNIT TESTS      #
// ###################

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_bounds() {
        assert_eq!(Slot::new(0), Some(Slot::P1));
        assert_eq!(Slot::new(3), Some(Slot::P4));
        assert_eq!(Slot::new(4), None);
        assert!(matches!(
            Slot::try_from(9u8),
            Err(NetplayError::InvalidSlot { slot: 9 })
        ));
        assert_eq!(Slot::try_from(1usize).unwrap(), Slot::P2);
    }

    #[test]
    fn test_slot_all_is_ordered() {
        let indices: Vec<usize> = Slot::ALL.iter().map(|s| s.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_sequence_older_comparison() {
        let counter = Sequence::new(100);
        assert!(Sequence::new(99).is_older_than(counter));
        assert!(Sequence::new(0).is_older_than(counter));
        assert!(!Sequence::new(100).is_older_than(counter));
        assert!(!Sequence::new(101).is_older_than(counter));
    }

    #[test]
    fn test_sequence_older_across_wraparound() {
        let counter = Sequence::new(u32::MAX - 1);
        assert!(!Sequence::new(0).is_older_than(counter));
        assert!(!Sequence::new(5).is_older_than(counter));
        assert!(Sequence::new(u32::MAX - 2).is_older_than(counter));
    }

    #[test]
    fn test_sequence_half_space_boundary() {
        let counter = Sequence::ZERO;
        assert!(!Sequence::new(u32::MAX / 2).is_older_than(counter));
        assert!(Sequence::new(u32::MAX / 2 + 1).is_older_than(counter));
    }

    #[test]
    fn test_slot_deserialization_rejects_out_of_range() {
        assert_eq!(serde_json::from_str::<Slot>("2").unwrap(), Slot::P3);
        assert!(serde_json::from_str::<Slot>("4").is_err());
        assert!(serde_json::from_str::<Slot>("7").is_err());
        assert_eq!(serde_json::to_string(&Slot::P4).unwrap(), "3");
    }

    #[test]
    fn test_peripheral_round_trip_preserves_unknown() {
        for byte in 0..=u8::MAX {
            assert_eq!(PeripheralKind::from_byte(byte).to_byte(), byte);
        }
        assert_eq!(PeripheralKind::from(2), PeripheralKind::MemPak);
        assert_eq!(
            PeripheralKind::from(0),
            PeripheralKind::Unknown(UnknownPeripheral(0))
        );
    }

    #[test]
    fn test_every_peripheral_kind_survives_the_wire() {
        for byte in 0..=u8::MAX {
            let kind = PeripheralKind::from_byte(byte);
            assert_eq!(PeripheralKind::from_byte(kind.to_byte()), kind);
            if (1..=6).contains(&byte) {
                assert!(!matches!(kind, PeripheralKind::Unknown(_)));
            }
        }
    }

    #[test]
    fn test_peripheral_display() {
        assert_eq!(PeripheralKind::RumblePak.to_string(), "rumble_pak");
        assert_eq!(PeripheralKind::from_byte(42).to_string(), "unknown(42)");
    }
}
