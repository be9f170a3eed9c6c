use std::fmt;

/// Errors produced while decoding a frame off the wire.
///
/// Every variant here maps to the "malformed frame" bucket of the error
/// taxonomy: the only valid response is to close the connection that sent
/// the offending bytes.
#[derive(Debug)]
pub enum DecodeError {
    /// The declared `length` field didn't match the number of bytes handed
    /// to the decoder.
    InvalidSize { expected: u16, actual: usize },
    /// The `type` byte was outside the valid range for this plane, or named
    /// a type this dispatcher doesn't receive (e.g. a server-bound reply
    /// arriving as if it were a client request).
    InvalidType(u8),
    /// A field's value was outside the bounds the protocol allows (bad
    /// protocol version, unknown enum ordinal, ...).
    InvalidData(String),
    /// The frame had fewer bytes left than the field being read requires.
    Truncated,
    /// Bytes remained after every field in the packet was parsed.
    TrailingBytes(usize),
    /// A string field wasn't valid UTF-8 or wasn't null-terminated.
    InvalidString,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSize { expected, actual } => {
                write!(f, "invalid frame size: expected {expected}, got {actual}")
            }
            Self::InvalidType(t) => write!(f, "invalid or unexpected packet type: {t}"),
            Self::InvalidData(msg) => write!(f, "invalid packet data: {msg}"),
            Self::Truncated => write!(f, "frame ended before all fields were read"),
            Self::TrailingBytes(n) => write!(f, "{n} unexpected trailing bytes"),
            Self::InvalidString => write!(f, "malformed string field"),
        }
    }
}

impl std::error::Error for DecodeError {}
