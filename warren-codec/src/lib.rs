//! Data structures and converter functions for dealing with AMQP 0-9-1 frames.
//!
//! All the data types are in the `frame` module. The `method` module is the pure payload codec
//! (encode, decode, required size), `wire` holds the field encoding rules shared by methods,
//! field tables and content headers, and `codec` implements the frame envelope on top of them
//! as a `tokio_util` codec.
pub mod codec;
pub mod frame;
pub mod method;
pub mod wire;


#[macro_use]
extern crate bitflags;

use std::fmt;

/// Reply code of a malformed frame envelope.
pub const FRAME_ERROR: u16 = 501;
/// Reply code of a frame with invalid field values.
pub const SYNTAX_ERROR: u16 = 502;
/// Reply code of a frame which is not expected at that point.
pub const UNEXPECTED_FRAME: u16 = 505;
/// Reply code of a method the codec doesn't know.
pub const NOT_IMPLEMENTED: u16 = 540;

/// Type alias for a simplified Result with a decode error.
pub type Result<T> = std::result::Result<T, ProtocolDecodeError>;

/// Error of decoding a frame or a method payload.
///
/// Decoding never reads out of the buffer bounds, if the data is not consistent, one of these
/// variants comes back.
#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolDecodeError {
    /// The buffer ended before a field could be read.
    Truncated { needed: usize, remaining: usize },
    /// The class id, method id pair is not known.
    UnknownMethod(u32),
    /// Frame type byte is not method, header, body or heartbeat.
    UnknownFrameType(u8),
    /// Field table value has an unknown type tag.
    UnknownFieldType(u8),
    /// A short or long string is not valid UTF-8.
    InvalidUtf8,
    /// The frame end octet is not `0xCE`.
    FrameEndMismatch(u8),
    /// The frame payload is bigger than the negotiated frame max.
    FrameTooLarge { size: usize, max: usize },
    /// The server sent back a protocol header, which means it doesn't support our version.
    BadProtocolHeader([u8; 8]),
}

impl ProtocolDecodeError {
    /// The AMQP reply code with which the connection should be closed because of this error.
    pub fn reply_code(&self) -> u16 {
        match self {
            ProtocolDecodeError::Truncated { .. } => SYNTAX_ERROR,
            ProtocolDecodeError::UnknownMethod(_) => NOT_IMPLEMENTED,
            ProtocolDecodeError::UnknownFrameType(_) => FRAME_ERROR,
            ProtocolDecodeError::UnknownFieldType(_) => SYNTAX_ERROR,
            ProtocolDecodeError::InvalidUtf8 => SYNTAX_ERROR,
            ProtocolDecodeError::FrameEndMismatch(_) => FRAME_ERROR,
            ProtocolDecodeError::FrameTooLarge { .. } => FRAME_ERROR,
            ProtocolDecodeError::BadProtocolHeader(_) => UNEXPECTED_FRAME,
        }
    }
}

impl fmt::Display for ProtocolDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolDecodeError::Truncated { needed, remaining } => {
                write!(f, "truncated buffer: needed {needed} bytes, {remaining} remaining")
            }
            ProtocolDecodeError::UnknownMethod(cm) => write!(f, "unknown method {cm:08X}"),
            ProtocolDecodeError::UnknownFrameType(t) => write!(f, "unknown frame type {t}"),
            ProtocolDecodeError::UnknownFieldType(t) => write!(f, "unknown field value type {:?}", *t as char),
            ProtocolDecodeError::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            ProtocolDecodeError::FrameEndMismatch(b) => write!(f, "frame end marker is {b:02X} instead of CE"),
            ProtocolDecodeError::FrameTooLarge { size, max } => {
                write!(f, "frame size {size} exceeds frame max {max}")
            }
            ProtocolDecodeError::BadProtocolHeader(h) => write!(f, "server protocol header {:?}", h),
        }
    }
}

impl std::error::Error for ProtocolDecodeError {}

/// Shorthand for making truncation errors.
///
/// ```
/// use warren_codec::truncated;
/// use warren_codec::ProtocolDecodeError;
///
/// fn need_two(buf: &[u8]) -> Result<(), ProtocolDecodeError> {
///     if buf.len() < 2 {
///         return truncated!(2, buf.len());
///     }
///
///     Ok(())
/// }
///
/// assert!(need_two(&[1]).is_err());
/// ```
#[macro_export]
macro_rules! truncated {
    ($needed:expr, $remaining:expr) => {
        ::std::result::Result::Err($crate::ProtocolDecodeError::Truncated {
            needed: $needed,
            remaining: $remaining,
        })
    };
}
