//! Error types for the wire codecs.

use thiserror::Error;

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while decoding or encoding the relay's wire formats.
#[derive(Debug, Error)]
pub enum Error {
    /// Buffer ends before the structure it should contain.
    #[error("buffer too short: got {actual} bytes, need {required}")]
    ShortBuffer { required: usize, actual: usize },

    /// First two bytes do not hold a STUN message type.
    #[error("invalid stun message type: 0x{0:04x}")]
    BadType(u16),

    /// Declared message length is not a multiple of 4 or disagrees with the buffer.
    #[error("invalid stun message length: {0}")]
    BadLength(u16),

    /// Magic cookie required but absent.
    #[error("invalid stun magic cookie: 0x{0:08x}")]
    BadMagic(u32),

    /// Transaction id is neither 12 (RFC 5389) nor 16 (RFC 3489) bytes.
    #[error("invalid stun transaction id length: {0}")]
    BadTransactionId(usize),

    /// An attribute body could not be decoded.
    #[error("failed to decode stun attribute 0x{attr_type:04x}: {reason}")]
    AttributeDecode { attr_type: u16, reason: &'static str },

    /// Payload exceeds the 2-byte length prefix of ICE-over-TCP.
    #[error("payload of {0} bytes exceeds the ice-tcp frame limit")]
    TooLarge(usize),

    /// SDP text did not contain what the relay needs.
    #[error("invalid sdp: {0}")]
    BadSdp(&'static str),

    /// An `a=candidate:` line did not parse.
    #[error("invalid candidate line: {0}")]
    BadCandidate(String),

    /// Underlying socket failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
