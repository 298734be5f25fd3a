use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::codec::CodecError;
use crate::sessions::control::ControlState;
use crate::{Sequence, Slot};

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), NetplayError>`].
///
/// Errors fall into three groups:
/// - fatal faults ([`TransportFailure`], [`TruncatedPacket`], [`MalformedPacket`], [`Timeout`],
///   [`ConnectionLost`]): the session cannot continue and should be stopped,
/// - programming errors ([`InvalidState`], [`InvalidSlot`], [`InvalidRequest`], [`NotInitialized`]),
/// - recoverable outcomes ([`OpenError`]): reported to the caller, the session continues.
///
/// [`Result<(), NetplayError>`]: std::result::Result
/// [`TransportFailure`]: NetplayError::TransportFailure
/// [`TruncatedPacket`]: NetplayError::TruncatedPacket
/// [`MalformedPacket`]: NetplayError::MalformedPacket
/// [`Timeout`]: NetplayError::Timeout
/// [`ConnectionLost`]: NetplayError::ConnectionLost
/// [`InvalidState`]: NetplayError::InvalidState
/// [`InvalidSlot`]: NetplayError::InvalidSlot
/// [`InvalidRequest`]: NetplayError::InvalidRequest
/// [`NotInitialized`]: NetplayError::NotInitialized
/// [`OpenError`]: NetplayError::OpenError
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetplayError {
    /// No session is live. Start one before calling session operations.
    NotInitialized,
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// A slot index outside `0..MAX_PLAYERS` was provided.
    InvalidSlot {
        /// The offending slot index.
        slot: usize,
    },
    /// An operation was invoked outside the session phase it requires.
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The control-channel state at the time of the call.
        current: ControlState,
    },
    /// The transport reported a send or receive failure.
    TransportFailure {
        /// A description of the transport error.
        context: String,
    },
    /// A packet was shorter than its declared fixed layout.
    TruncatedPacket {
        /// The packet kind being decoded.
        kind: &'static str,
        /// The number of bytes the layout requires.
        expected: usize,
        /// The number of bytes actually available.
        actual: usize,
    },
    /// A packet did not follow the wire layout.
    MalformedPacket {
        /// What was wrong with it.
        context: String,
    },
    /// The relay did not deliver an input event within the request deadline.
    Timeout {
        /// The slot whose input was being waited for.
        slot: Slot,
        /// The sequence that never arrived.
        sequence: Sequence,
        /// How long the engine waited, in milliseconds.
        waited_ms: u128,
    },
    /// The datagram route was broken by an earlier timeout. No further input can be fetched.
    ConnectionLost,
    /// A save-data pull returned an all-zero region.
    OpenError {
        /// The file name of the region that could not be obtained.
        region: String,
    },
    /// An internal error occurred that should not happen under normal operation.
    /// If you encounter this error, please report it as a bug.
    InternalError {
        /// A description of the internal error.
        context: String,
    },
}

impl NetplayError {
    /// Returns `true` if the session cannot continue after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::TransportFailure { .. }
                | Self::TruncatedPacket { .. }
                | Self::MalformedPacket { .. }
                | Self::Timeout { .. }
                | Self::ConnectionLost
        )
    }
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetplayError::NotInitialized => {
                write!(f, "Netplay is not initialized, start a session first.")
            },
            NetplayError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            },
            NetplayError::InvalidSlot { slot } => {
                write!(
                    f,
                    "Invalid slot {}: must be less than {}",
                    slot,
                    crate::MAX_PLAYERS
                )
            },
            NetplayError::InvalidState { operation, current } => {
                write!(
                    f,
                    "Operation '{}' is not allowed while the control channel is {}",
                    operation, current
                )
            },
            NetplayError::TransportFailure { context } => {
                write!(f, "Transport failure: {}", context)
            },
            NetplayError::TruncatedPacket {
                kind,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Truncated {} packet: expected {} bytes, got {}",
                    kind, expected, actual
                )
            },
            NetplayError::MalformedPacket { context } => {
                write!(f, "Malformed packet: {}", context)
            },
            NetplayError::Timeout {
                slot,
                sequence,
                waited_ms,
            } => {
                write!(
                    f,
                    "No input for slot {} at sequence {} after {}ms, connection to the relay is lost",
                    slot, sequence, waited_ms
                )
            },
            NetplayError::ConnectionLost => {
                write!(f, "Lost connection to the relay.")
            },
            NetplayError::OpenError { region } => {
                write!(f, "Relay returned no data for save region '{}'", region)
            },
            NetplayError::InternalError { context } => {
                write!(f, "Internal error (please report as bug): {}", context)
            },
        }
    }
}

impl Error for NetplayError {}

impl From<std::io::Error> for NetplayError {
    fn from(err: std::io::Error) -> Self {
        NetplayError::TransportFailure {
            context: format!("{:?}: {}", err.kind(), err),
        }
    }
}

impl From<CodecError> for NetplayError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Truncated {
                kind,
                expected,
                actual,
            } => NetplayError::TruncatedPacket {
                kind,
                expected,
                actual,
            },
            other => NetplayError::MalformedPacket {
                context: other.to_string(),
            },
        }
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
    use crate::network::codec::CodecOperation;

    #[test]
    fn test_fatal_classification() {
        assert!(NetplayError::ConnectionLost.is_fatal());
        assert!(NetplayError::TransportFailure {
            context: "reset".to_owned()
        }
        .is_fatal());
        assert!(!NetplayError::OpenError {
            region: "game.sra".to_owned()
        }
        .is_fatal());
        assert!(!NetplayError::NotInitialized.is_fatal());
        assert!(!NetplayError::InvalidState {
            operation: "register_player",
            current: ControlState::Active,
        }
        .is_fatal());
    }

    #[test]
    fn test_truncated_codec_error_maps_to_truncated_packet() {
        let err: NetplayError = CodecError::Truncated {
            kind: "registration table",
            expected: 24,
            actual: 10,
        }
        .into();
        assert_eq!(
            err,
            NetplayError::TruncatedPacket {
                kind: "registration table",
                expected: 24,
                actual: 10,
            }
        );
    }

    #[test]
    fn test_decode_error_maps_to_malformed_packet() {
        let err: NetplayError = CodecError::decode("bad", CodecOperation::Decode).into();
        assert!(matches!(err, NetplayError::MalformedPacket { .. }));
    }

    #[test]
    fn test_io_error_maps_to_transport_failure() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err: NetplayError = io.into();
        match err {
            NetplayError::TransportFailure { context } => assert!(context.contains("peer reset")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_display_mentions_operation_and_state() {
        let err = NetplayError::InvalidState {
            operation: "read_registration",
            current: ControlState::Active,
        };
        let msg = err.to_string();
        assert!(msg.contains("read_registration"));
        assert!(msg.contains("active"));
    }

    #[test]
    fn test_timeout_display() {
        let err = NetplayError::Timeout {
            slot: Slot::P1,
            sequence: Sequence::new(7),
            waited_ms: 10_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("slot 0"));
        assert!(msg.contains("sequence 7"));
    }
}
