//! Binary codec for wire serialization.
//!
//! Every packet the relay understands is a one-byte tag followed by fixed-width
//! big-endian integers. Field groups are plain serde structs, encoded here with a
//! single bincode configuration so the byte layout is defined in exactly one place.
//!
//! # Examples
//!
//! ```
//! use fortress_netplay::network::codec::{decode_fixed, encode};
//!
//! let bytes = encode(&(7u8, 0x0102_0304u32)).expect("encoding should succeed");
//! assert_eq!(bytes, [7, 1, 2, 3, 4]);
//!
//! let (tag, word): (u8, u32) = decode_fixed(&bytes, 5, "example").expect("decoding should succeed");
//! assert_eq!((tag, word), (7, 0x0102_0304));
//!
//! assert!(decode_fixed::<(u8, u32)>(&bytes[..3], 5, "example").is_err());
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

// Big-endian fixed-width integers: a u32 is always 4 bytes, most significant first,
// which is what the relay reads and writes. Sequences and arrays carry no length
// prefix, so structs map one-to-one onto packet layouts.
fn config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Represents what operation was being performed when a codec error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Appending to a buffer.
    AppendToBuffer,
    /// A generic encoding operation.
    Encode,
    /// A generic decoding operation.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AppendToBuffer => write!(f, "appending to buffer"),
            Self::Encode => write!(f, "encoding"),
            Self::Decode => write!(f, "decoding"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Bincode errors are opaque, so their text is kept as a `String`. Layout
/// errors detected before bincode runs are structured.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// Fewer bytes than the fixed layout declares.
    Truncated {
        /// The packet kind being decoded.
        kind: &'static str,
        /// Bytes the layout requires.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },
    /// The leading tag is not a known message kind.
    UnknownTag {
        /// `"datagram"` or `"control"`.
        namespace: &'static str,
        /// The tag byte.
        tag: u8,
    },
    /// The bytes violate the layout in some other way.
    Malformed {
        /// What was wrong.
        context: String,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a malformed-layout error.
    pub fn malformed(context: impl Into<String>) -> Self {
        Self::Malformed {
            context: context.into(),
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::Truncated {
                kind,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "truncated {kind}: expected {expected} bytes, got {actual}"
                )
            },
            Self::UnknownTag { namespace, tag } => {
                write!(f, "unknown {namespace} tag {tag}")
            },
            Self::Malformed { context } => write!(f, "malformed packet: {context}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Encodes a value by appending to an existing `Vec<u8>`.
///
/// Returns the number of bytes appended. Packets are built by pushing the tag
/// byte and then appending each field group.
///
/// # Examples
///
/// ```
/// use fortress_netplay::network::codec::encode_append;
///
/// let mut packet = vec![4u8];
/// encode_append(&600u32, &mut packet).expect("encoding should succeed");
/// assert_eq!(packet, [4, 0, 0, 2, 88]);
/// ```
pub fn encode_append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<usize> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::AppendToBuffer))
}

/// Decodes a value from a byte slice.
///
/// Returns the decoded value and the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Decodes a value whose encoding is exactly `size` bytes from the front of `bytes`.
///
/// The length is checked before bincode runs, so short input is reported as
/// [`CodecError::Truncated`] with the layout's real size instead of an opaque
/// "unexpected end" message.
pub fn decode_fixed<T: DeserializeOwned>(
    bytes: &[u8],
    size: usize,
    kind: &'static str,
) -> CodecResult<T> {
    let Some(window) = bytes.get(..size) else {
        return Err(CodecError::Truncated {
            kind,
            expected: size,
            actual: bytes.len(),
        });
    };
    let (value, read) = decode::<T>(window)?;
    if read != size {
        return Err(CodecError::malformed(format!(
            "{kind} layout is {size} bytes but decoded {read}"
        )));
    }
    Ok(value)
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

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Header {
        slot: u8,
        sequence: u32,
        signed: i32,
    }

    #[test]
    fn test_integers_are_big_endian_and_fixed_width() {
        assert_eq!(encode(&1u32).unwrap(), [0, 0, 0, 1]);
        assert_eq!(encode(&0xDEAD_BEEFu32).unwrap(), [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(encode(&-2i32).unwrap(), [0xFF, 0xFF, 0xFF, 0xFE]);
        assert_eq!(encode(&5u8).unwrap(), [5]);
    }

    #[test]
    fn test_struct_layout_has_no_padding_or_prefix() {
        let header = Header {
            slot: 2,
            sequence: 0x0000_0100,
            signed: 1,
        };
        assert_eq!(encode(&header).unwrap(), [2, 0, 0, 1, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_arrays_carry_no_length_prefix() {
        let words = [1u32, 2u32];
        assert_eq!(encode(&words).unwrap(), [0, 0, 0, 1, 0, 0, 0, 2]);
    }

    #[test]
    fn test_decode_fixed_reports_truncation() {
        let err = decode_fixed::<Header>(&[1, 2, 3], 9, "header").unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                kind: "header",
                expected: 9,
                actual: 3,
            }
        );
    }

    #[test]
    fn test_decode_fixed_ignores_trailing_bytes() {
        let mut bytes = encode(&Header {
            slot: 1,
            sequence: 9,
            signed: -1,
        })
        .unwrap();
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        let header: Header = decode_fixed(&bytes, 9, "header").unwrap();
        assert_eq!(header.sequence, 9);
        assert_eq!(header.signed, -1);
    }

    #[test]
    fn test_decode_fixed_rejects_wrong_declared_size() {
        let bytes = encode(&7u32).unwrap();
        let mut padded = bytes.clone();
        padded.push(0);
        let err = decode_fixed::<u32>(&padded, 5, "word").unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn test_encode_append_returns_appended_len() {
        let mut buffer = vec![9u8];
        let len = encode_append(&(1u32, 2u8), &mut buffer).unwrap();
        assert_eq!(len, 5);
        assert_eq!(buffer, [9, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::UnknownTag {
            namespace: "datagram",
            tag: 9,
        };
        assert_eq!(err.to_string(), "unknown datagram tag 9");

        let err = CodecError::decode("eof", CodecOperation::Decode);
        assert_eq!(err.to_string(), "decoding failed while decoding: eof");

        let err = CodecError::encode("full", CodecOperation::AppendToBuffer);
        assert!(err.to_string().contains("appending to buffer"));
    }
}
